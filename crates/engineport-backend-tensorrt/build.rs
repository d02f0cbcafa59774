fn main() {
    #[cfg(feature = "tensorrt")]
    shim::build();
}

#[cfg(feature = "tensorrt")]
mod shim {
    use std::env;
    use std::path::PathBuf;

    pub fn build() {
        println!("cargo:rerun-if-changed=csrc/trt_shim.cpp");
        println!("cargo:rerun-if-env-changed=CUDA_HOME");
        println!("cargo:rerun-if-env-changed=TENSORRT_ROOT");

        let cuda = env::var_os("CUDA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/usr/local/cuda"));

        let mut build = cc::Build::new();
        build
            .cpp(true)
            .file("csrc/trt_shim.cpp")
            .flag_if_supported("-std=c++17")
            .include(cuda.join("include"));
        println!("cargo:rustc-link-search=native={}", cuda.join("lib64").display());

        if let Some(root) = env::var_os("TENSORRT_ROOT").map(PathBuf::from) {
            build.include(root.join("include"));
            println!("cargo:rustc-link-search=native={}", root.join("lib").display());
        }

        build.compile("trt_shim");
        println!("cargo:rustc-link-lib=dylib=nvinfer");
        println!("cargo:rustc-link-lib=dylib=cudart");
    }
}
