//! ---
//! br_section: "02-cluster-rpc"
//! br_subsection: "module"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Compiles the machine protocol definitions."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("failed to locate protoc");
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/machine.proto");
    println!("cargo:rerun-if-changed=proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/machine.proto"], &["proto"])
        .expect("failed to compile machine protocol definitions");
}
