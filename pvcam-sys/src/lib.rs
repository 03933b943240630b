//! Raw FFI bindings for the PVCAM C SDK.
//!
//! The bindings are generated by `build.rs` with bindgen when the `pvcam-sdk`
//! feature is enabled. Without the feature an empty module is generated so that
//! dependent crates still build on machines without the SDK installed.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
