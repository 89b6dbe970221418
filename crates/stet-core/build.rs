const PROTOS: &[&str] = &["src/proto/kms.proto", "src/proto/ekm.proto"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The KMS and EKM stubs must build on hosts without a protoc install;
    // point tonic at the vendored binary.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    // Client stubs only: STET consumes both services, it never serves them.
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(false)
        .compile_protos(PROTOS, &["src/proto"])?;

    for proto in PROTOS {
        println!("cargo:rerun-if-changed={proto}");
    }
    Ok(())
}
