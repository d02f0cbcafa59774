#[cfg(feature = "tensorrt")]
mod cuda;
#[cfg(feature = "tensorrt")]
mod ffi;
#[cfg(feature = "tensorrt")]
mod runtime;

#[cfg(feature = "tensorrt")]
pub use runtime::{CudaBuffer, TensorRtContext, TensorRtEngine, TensorRtRuntime};

use engineport_core::DType;

/// Whether this build links TensorRT and CUDA.
pub fn is_available() -> bool {
    cfg!(feature = "tensorrt")
}

/// Element type for a TensorRT `nvinfer1::DataType` discriminant.
pub fn dtype_from_trt(code: i32) -> Option<DType> {
    match code {
        0 => Some(DType::F32),
        1 => Some(DType::F16),
        3 => Some(DType::I32),
        5 => Some(DType::U8),
        8 => Some(DType::I64),
        _ => None,
    }
}
