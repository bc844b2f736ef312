// build.rs
// Exposes the Cargo build profile to the binary for its startup log line.

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let profile = env::var("PROFILE").unwrap_or_else(|_| {
        println!("cargo:warning=PROFILE environment variable not found, assuming 'debug'.");
        "debug".to_string()
    });
    println!("cargo:rustc-env=PHENOCLUSTER_BUILD_PROFILE={}", profile);
}
