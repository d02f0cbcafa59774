use anyhow::{bail, Result};
use clap::ValueEnum;
use engineport_backend_reference::HostRuntime;
use engineport_core::{Device, EngineBlob, InferenceSession, SessionConfig};
use engineport_runtime::Predict;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum RuntimeKind {
    #[serde(rename = "reference")]
    #[value(name = "reference")]
    Reference,
    #[serde(rename = "tensorrt", alias = "trt")]
    #[value(name = "tensorrt", alias = "trt")]
    TensorRt,
    #[serde(rename = "onnxruntime", alias = "ort")]
    #[value(name = "onnxruntime", alias = "ort")]
    OnnxRuntime,
}

impl RuntimeKind {
    pub fn is_available(self) -> bool {
        match self {
            RuntimeKind::Reference => true,
            RuntimeKind::TensorRt => engineport_backend_tensorrt::is_available(),
            RuntimeKind::OnnxRuntime => engineport_backend_ort::is_available(),
        }
    }

    fn feature(self) -> &'static str {
        match self {
            RuntimeKind::Reference => "",
            RuntimeKind::TensorRt => "tensorrt",
            RuntimeKind::OnnxRuntime => "onnxruntime",
        }
    }
}

/// Creates a ready session for `kind`, type-erased so the harness can time any runtime.
pub fn open_session(
    kind: RuntimeKind,
    runtime: &RuntimeConfig,
    blob: &EngineBlob,
    config: SessionConfig,
) -> Result<Box<dyn Predict>> {
    if !kind.is_available() {
        bail!(
            "engineport was built without the `{}` feature; rebuild with --features {}",
            kind.feature(),
            kind.feature()
        );
    }

    match kind {
        RuntimeKind::Reference => {
            let host = match runtime.arena_capacity {
                Some(bytes) => HostRuntime::with_capacity(bytes),
                None => HostRuntime::new(),
            };
            Ok(Box::new(InferenceSession::new(&host, blob, config)?))
        }
        RuntimeKind::TensorRt => open_tensorrt(runtime.device, blob, config),
        RuntimeKind::OnnxRuntime => open_onnxruntime(runtime.device, blob, config),
    }
}

#[cfg(feature = "tensorrt")]
fn open_tensorrt(
    device: Device,
    blob: &EngineBlob,
    config: SessionConfig,
) -> Result<Box<dyn Predict>> {
    use engineport_backend_tensorrt::TensorRtRuntime;

    let device_id = match device {
        Device::Cuda { device_id } => device_id,
        Device::Host => {
            tracing::info!("tensorrt needs a GPU; using cuda:0");
            0
        }
    };
    let runtime = TensorRtRuntime::new(device_id);
    Ok(Box::new(InferenceSession::new(&runtime, blob, config)?))
}

#[cfg(not(feature = "tensorrt"))]
fn open_tensorrt(
    device: Device,
    _blob: &EngineBlob,
    _config: SessionConfig,
) -> Result<Box<dyn Predict>> {
    bail!("tensorrt runtime unavailable for {device}")
}

#[cfg(feature = "onnxruntime")]
fn open_onnxruntime(
    device: Device,
    blob: &EngineBlob,
    config: SessionConfig,
) -> Result<Box<dyn Predict>> {
    use engineport_backend_ort::OrtRuntime;

    tracing::info!(%device, "running the interchange graph through onnxruntime");
    let runtime = OrtRuntime::new()
        .on_device(device)
        .with_batch_size(config.batch_size());
    Ok(Box::new(InferenceSession::new(&runtime, blob, config)?))
}

#[cfg(not(feature = "onnxruntime"))]
fn open_onnxruntime(
    device: Device,
    _blob: &EngineBlob,
    _config: SessionConfig,
) -> Result<Box<dyn Predict>> {
    bail!("onnxruntime unavailable for {device}")
}

#[cfg(test)]
mod tests {
    use engineport_backend_reference::ReferenceEngineBuilder;
    use engineport_core::{Precision, Tensor};

    use super::*;

    #[test]
    fn reference_is_always_available() {
        assert!(RuntimeKind::Reference.is_available());
        assert_eq!(
            RuntimeKind::TensorRt.is_available(),
            cfg!(feature = "tensorrt")
        );
    }

    #[test]
    fn opens_a_reference_session() {
        let config = SessionConfig::new(2, Precision::Reduced, &[3, 4, 4], &[5]).unwrap();
        let blob = ReferenceEngineBuilder::new(config.clone()).build().unwrap();
        let mut session =
            open_session(RuntimeKind::Reference, &RuntimeConfig::default(), &blob, config.clone())
                .unwrap();

        assert_eq!(session.name(), "reference");
        assert_eq!(session.batch_size(), 2);
        let out = session
            .predict(&Tensor::zeros(config.precision().dtype(), config.input_dims()))
            .unwrap();
        assert_eq!(out.shape().dims(), &[2, 5]);
    }

    #[test]
    fn arena_capacity_bounds_reference_sessions() {
        let config = SessionConfig::new(1, Precision::Full, &[3, 8, 8], &[10]).unwrap();
        let blob = ReferenceEngineBuilder::new(config.clone()).build().unwrap();
        let runtime = RuntimeConfig {
            arena_capacity: Some(64),
            ..RuntimeConfig::default()
        };
        assert!(open_session(RuntimeKind::Reference, &runtime, &blob, config).is_err());
    }

    #[test]
    #[cfg(not(feature = "tensorrt"))]
    fn missing_feature_is_reported() {
        let config = SessionConfig::new(1, Precision::Full, &[3], &[3]).unwrap();
        let blob = EngineBlob::from_bytes(vec![1u8; 8]);
        let err = open_session(RuntimeKind::TensorRt, &RuntimeConfig::default(), &blob, config)
            .err()
            .unwrap();
        assert!(err.to_string().contains("--features tensorrt"), "{err}");
    }
}
