fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Server stubs serve kubelet; client stubs register with it and probe our own socket.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/api.proto");
    Ok(())
}
