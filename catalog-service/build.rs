use std::env::var;
use std::io::Result;

fn main() -> Result<()> {
    let proto_files = &["proto/catalog.proto"];

    let proto_folder = "proto";
    let out_dir = var("OUT_DIR").expect("Missing OUT_DIR environment variable");
    let descriptors_path = format!("{}/descriptors.bin", out_dir);

    // Only the descriptor set is needed: gantry works with dynamic messages.
    tonic_prost_build::configure()
        .file_descriptor_set_path(descriptors_path)
        .build_client(false)
        .build_server(false)
        .compile_protos(proto_files, &[proto_folder])?;

    Ok(())
}
