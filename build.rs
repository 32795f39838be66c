fn main() -> Result<(), anyhow::Error> {
    println!("cargo:rerun-if-changed=proto/workload.proto");

    // protox keeps the build free of a system `protoc`.
    let file_descriptors = protox::compile(["workload.proto"], ["proto"])?;
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(false)
        .compile_fds_with_config(file_descriptors, prost_build::Config::new())?;

    Ok(())
}
