use std::env;
use std::path::PathBuf;

// These helper functions are only used when pvcam-sdk feature is enabled
#[allow(dead_code)]
/// Print a boxed error message for visibility in cargo output
fn print_env_error(title: &str, details: &[&str], fixes: &[&str]) {
    eprintln!();
    eprintln!("+--------------------------------------------------------------------+");
    eprintln!("| PVCAM BUILD ERROR: {:<48} |", title);
    eprintln!("+--------------------------------------------------------------------+");
    for detail in details {
        eprintln!("| {:<66} |", detail);
    }
    eprintln!("| HOW TO FIX:                                                        |");
    for fix in fixes {
        eprintln!("|   {:<64} |", fix);
    }
    eprintln!("+--------------------------------------------------------------------+");
    eprintln!();
}

#[allow(dead_code)]
/// Check for common PVCAM installation paths
fn find_pvcam_sdk() -> Option<PathBuf> {
    let candidates = [
        "/opt/pvcam/sdk",
        "/usr/local/pvcam/sdk",
        "/opt/PrincetonInstruments/pvcam/sdk",
    ];

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.join("include").exists())
}

#[allow(dead_code)]
/// Check for PVCAM library paths
fn find_pvcam_lib() -> Option<PathBuf> {
    let candidates = [
        "/opt/pvcam/library/x86_64",
        "/opt/pvcam/lib",
        "/usr/local/lib",
        "/usr/lib/x86_64-linux-gnu",
    ];

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.join("libpvcam.so").exists())
}

fn main() {
    // Only run bindgen and linking logic if the `pvcam-sdk` feature is enabled.
    #[cfg(feature = "pvcam-sdk")]
    {
        println!("cargo:rerun-if-env-changed=PVCAM_SDK_DIR");
        println!("cargo:rerun-if-env-changed=PVCAM_LIB_DIR");
        println!("cargo:rerun-if-changed=wrapper.h");

        let sdk_dir = match env::var("PVCAM_SDK_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => match find_pvcam_sdk() {
                Some(found) => {
                    println!(
                        "cargo:warning=PVCAM_SDK_DIR not set, auto-detected: {}",
                        found.display()
                    );
                    found
                }
                None => {
                    print_env_error(
                        "PVCAM_SDK_DIR not set",
                        &["The pvcam-sdk feature requires the PVCAM SDK headers."],
                        &["export PVCAM_SDK_DIR=/opt/pvcam/sdk"],
                    );
                    panic!("PVCAM_SDK_DIR environment variable must be set when `pvcam-sdk` feature is enabled.");
                }
            },
        };

        let sdk_include_path = sdk_dir.join("include");
        let sdk_lib_path = match env::var("PVCAM_LIB_DIR") {
            Ok(lib_dir) => PathBuf::from(lib_dir),
            Err(_) => find_pvcam_lib().unwrap_or_else(|| sdk_dir.join("lib")),
        };

        if !sdk_include_path.exists() {
            print_env_error(
                "SDK include path not found",
                &[&format!("Expected headers at: {}", sdk_include_path.display())],
                &["Set correct path: export PVCAM_SDK_DIR=/path/to/sdk"],
            );
            panic!(
                "PVCAM SDK include path does not exist: {:?}",
                sdk_include_path
            );
        }

        if !sdk_lib_path.exists() {
            println!(
                "cargo:warning=PVCAM SDK lib path does not exist: {}",
                sdk_lib_path.display()
            );
        }

        let bindings = bindgen::Builder::default()
            .header("wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .clang_arg(format!("-I{}", sdk_include_path.display()))
            .allowlist_function("pl_.*")
            .allowlist_type("rs_bool")
            .allowlist_type("uns8|uns16|uns32|uns64")
            .allowlist_type("int8|int16|int32|int64")
            .allowlist_type("rgn_type")
            .allowlist_var("CAM_NAME_LEN")
            .allowlist_var("ERROR_MSG_LEN")
            // Exposure modes, abort modes, open modes and image statuses are C enums.
            // Plain constants keep them usable as the integer arguments the pl_* calls take.
            .allowlist_type("PL_EXPOSURE_MODES|PL_CCS_ABORT_MODES|PL_OPEN_MODES|PL_IMAGE_STATUSES")
            .default_enum_style(bindgen::EnumVariation::Consts)
            .prepend_enum_name(false)
            .generate()
            .expect("Unable to generate bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("Couldn't write bindings!");

        println!("cargo:rustc-link-search=native={}", sdk_lib_path.display());

        #[cfg(target_os = "windows")]
        {
            println!("cargo:rustc-link-lib=pvcam64");
        }
        #[cfg(not(target_os = "windows"))]
        {
            println!("cargo:rustc-link-lib=pvcam");
        }
    }
    #[cfg(not(feature = "pvcam-sdk"))]
    {
        let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
        std::fs::write(
            out_path.join("bindings.rs"),
            "// Dummy bindings when pvcam-sdk feature is not enabled\n",
        )
        .expect("Couldn't write dummy bindings!");
    }
}
