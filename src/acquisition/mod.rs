//! Acquisition core: sequence control, status polling and buffer ownership.

pub mod buffer;
pub mod cancel;
pub mod controller;
pub mod poller;

pub use buffer::{BufferStats, FrameBuffer, FrameBufferManager};
pub use cancel::CancelToken;
pub use controller::{Frame, SequenceController};
pub use poller::{poll_until_terminal, PollError, PollPolicy, PolledStatus};
