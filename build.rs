//! Build script for gpustore.
//!
//! The default build simulates GPU devices in host memory. With the `cuda`
//! feature, device discovery goes through cudarc, which loads the driver
//! library at runtime, so nothing has to be linked here.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    if std::env::var_os("CARGO_FEATURE_CUDA").is_some() {
        println!("cargo:warning=CUDA feature enabled; the CUDA driver must be installed at runtime");
    }
}
