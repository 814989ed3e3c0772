use std::env;
use std::path::PathBuf;

/// Generate `maphttp_ffi.h` into `OUT_DIR`. A failure is reported as a cargo
/// warning and never breaks the build.
fn main() {
    println!("cargo:rerun-if-changed=src");

    let (Ok(crate_dir), Ok(out_dir)) = (env::var("CARGO_MANIFEST_DIR"), env::var("OUT_DIR")) else {
        return;
    };
    let header = PathBuf::from(out_dir).join("maphttp_ffi.h");

    match cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("MAPHTTP_FFI_H")
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(&header);
        }
        Err(e) => println!("cargo:warning=failed to generate {}: {e}", header.display()),
    }
}
