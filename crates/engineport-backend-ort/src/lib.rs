#[cfg(feature = "onnxruntime")]
mod runtime;

#[cfg(feature = "onnxruntime")]
pub use runtime::{OrtContext, OrtEngine, OrtRuntime};

/// Whether this build can run interchange graphs through ONNX Runtime.
pub fn is_available() -> bool {
    cfg!(feature = "onnxruntime")
}

#[cfg(test)]
mod tests {
    #[test]
    fn availability_follows_feature() {
        assert_eq!(super::is_available(), cfg!(feature = "onnxruntime"));
    }
}
