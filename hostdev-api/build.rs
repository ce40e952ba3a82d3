// Code generation for the kubelet device plugin protobuf definitions

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/deviceplugin.proto");
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/deviceplugin.proto"], &["proto"])?;
    Ok(())
}
