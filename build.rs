fn main() {
    unsafe {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }
    println!("cargo:rerun-if-changed=proto/update_metadata.proto");
    prost_build::compile_protos(&["proto/update_metadata.proto"], &["proto/"])
        .expect("failed to compile update_metadata.proto");
}
