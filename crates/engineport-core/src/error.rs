use thiserror::Error;

use crate::{DType, Device, DeviceOwner, Shape};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session config: {0}")]
    InvalidConfig(String),

    #[error("invalid precision plan: {0}")]
    PrecisionPlan(String),

    #[error("engine deserialization failed: {0}")]
    Deserialize(String),

    #[error("engine does not match session config: {0}")]
    EngineMismatch(String),

    #[error("device allocation of {requested} bytes failed ({available} bytes available)")]
    Allocation { requested: usize, available: usize },

    #[error("input batch is {actual} bytes, expected exactly {expected}")]
    InputSize { expected: usize, actual: usize },

    #[error("input shape {actual} does not match {expected}")]
    InputShape { expected: Shape, actual: Shape },

    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DTypeMismatch { expected: DType, actual: DType },

    #[error("dtype {0} is not supported here")]
    UnsupportedDType(DType),

    #[error("session is closed")]
    Closed,

    #[error("device {device} is held by {holder}; cannot acquire it for {requested}")]
    DeviceBusy {
        device: Device,
        holder: DeviceOwner,
        requested: DeviceOwner,
    },

    #[error("device error during {op}: {message}")]
    Device { op: &'static str, message: String },

    #[error("engine manifest error: {0}")]
    Manifest(String),

    #[error("invalid interchange artifact: {0}")]
    Interchange(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
