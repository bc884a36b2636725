use std::io::Result;
use std::path::PathBuf;

fn main() -> Result<()> {
    // Get the path to the proto file in the same directory.
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("vsrpc");
    let proto_path = manifest_dir.join("vsrpc.proto");

    println!("cargo:rerun-if-changed={}", proto_path.display());

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }

    prost_build::Config::new()
        .compile_protos(&[proto_path], &[&manifest_dir])?;

    Ok(())
}
