pub mod builder;
pub mod format;

use std::sync::Arc;

use engineport_core::host::{HostArena, HostBuffer};
use engineport_core::{
    decode_f32, encode_f32, Bindings, Device, DeviceBuffer, Engine, EngineBlob, EngineSpec,
    ExecutionContext, IOName, Runtime, RuntimeCapabilities, SessionError, SessionResult,
    TensorSpec,
};
use tracing::{debug, trace};

pub use builder::ReferenceEngineBuilder;
pub use format::{is_reference_blob, ReferencePlan};

/// Runs reference engines in host memory. Sessions created from one runtime share its arena.
pub struct HostRuntime {
    arena: HostArena,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self {
            arena: HostArena::new(),
        }
    }

    /// Limits the simulated device memory to `bytes`.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            arena: HostArena::with_capacity(bytes),
        }
    }

    pub fn arena(&self) -> &HostArena {
        &self.arena
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReferenceEngine {
    spec: EngineSpec,
    plan: Arc<ReferencePlan>,
    arena: HostArena,
}

pub struct ReferenceContext {
    plan: Arc<ReferencePlan>,
    arena: HostArena,
    in_flight: usize,
}

impl Runtime for HostRuntime {
    type Engine = ReferenceEngine;

    fn name(&self) -> &'static str {
        "reference"
    }

    fn device(&self) -> Device {
        Device::Host
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            reduced_precision: true,
            device_resident: false,
        }
    }

    fn deserialize(&self, blob: &EngineBlob) -> SessionResult<Self::Engine> {
        let plan = ReferencePlan::decode(blob.bytes())?;
        let dtype = plan.precision.dtype();
        let spec = EngineSpec {
            batch_size: plan.batch_size,
            inputs: vec![TensorSpec {
                name: IOName("input".to_string()),
                dtype,
                dims: plan.input_shape.with_batch(plan.batch_size),
            }],
            outputs: vec![TensorSpec {
                name: IOName("output".to_string()),
                dtype,
                dims: plan.output_shape.with_batch(plan.batch_size),
            }],
        };
        debug!(
            batch = plan.batch_size,
            precision = %plan.precision,
            input = %plan.input_shape,
            output = %plan.output_shape,
            "reference engine deserialized"
        );

        Ok(ReferenceEngine {
            spec,
            plan: Arc::new(plan),
            arena: self.arena.clone(),
        })
    }
}

impl Engine for ReferenceEngine {
    type Context = ReferenceContext;

    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn create_context(&self) -> SessionResult<Self::Context> {
        Ok(ReferenceContext {
            plan: self.plan.clone(),
            arena: self.arena.clone(),
            in_flight: 0,
        })
    }
}

impl ExecutionContext for ReferenceContext {
    type Buffer = HostBuffer;

    fn allocate(&mut self, byte_len: usize) -> SessionResult<Self::Buffer> {
        self.arena.allocate(byte_len)
    }

    fn copy_to_device(&mut self, dst: &mut Self::Buffer, src: &[u8]) -> SessionResult<()> {
        self.in_flight += 1;
        self.arena.write(dst.address(), src)
    }

    fn enqueue(&mut self, bindings: &Bindings) -> SessionResult<()> {
        let (&[input], &[output]) = (bindings.inputs(), bindings.outputs()) else {
            return Err(SessionError::Device {
                op: "enqueue",
                message: "reference engines take exactly one input and one output binding"
                    .to_string(),
            });
        };
        self.in_flight += 1;
        let plan = &self.plan;
        self.arena
            .with_slots(input, output, |src, dst| run_plan(plan, src, dst))?
    }

    fn copy_to_host(&mut self, src: &Self::Buffer, dst: &mut [u8]) -> SessionResult<()> {
        self.in_flight += 1;
        self.arena.read(src.address(), dst)
    }

    fn synchronize(&mut self) -> SessionResult<()> {
        trace!(drained = self.in_flight, "reference stream synchronized");
        self.in_flight = 0;
        Ok(())
    }
}

/// Global-average-pools each channel of every sample, then applies the dense head.
fn run_plan(plan: &ReferencePlan, src: &[u8], dst: &mut [u8]) -> SessionResult<()> {
    let dtype = plan.precision.dtype();
    let input = decode_f32(dtype, src)?;

    let channels = plan.channels();
    let classes = plan.classes();
    let features = plan.input_shape.numel();
    let spatial = features / channels;
    if input.len() != plan.batch_size * features {
        return Err(SessionError::InputSize {
            expected: plan.batch_size * features * dtype.byte_size(),
            actual: src.len(),
        });
    }

    let mut logits = Vec::with_capacity(plan.batch_size * classes);
    let mut pooled = vec![0f32; channels];
    for sample in input.chunks_exact(features) {
        for (c, plane) in sample.chunks_exact(spatial).enumerate() {
            pooled[c] = plane.iter().sum::<f32>() / spatial as f32;
        }
        for (row, bias) in plan.weights.chunks_exact(channels).zip(&plan.bias) {
            let dot: f32 = row.iter().zip(&pooled).map(|(w, x)| w * x).sum();
            logits.push(bias + dot);
        }
    }

    let encoded = encode_f32(dtype, &logits)?;
    if encoded.len() != dst.len() {
        return Err(SessionError::Device {
            op: "enqueue",
            message: format!(
                "output binding is {} bytes, engine produced {}",
                dst.len(),
                encoded.len()
            ),
        });
    }
    dst.copy_from_slice(&encoded);
    Ok(())
}

#[cfg(test)]
mod tests {
    use engineport_core::{DType, InferenceSession, Precision, SessionConfig, Shape, Tensor};

    use super::*;

    #[test]
    fn pools_channels_then_applies_dense_head() {
        let plan = ReferencePlan {
            precision: Precision::Full,
            batch_size: 2,
            input_shape: Shape::from_slice(&[2, 2]),
            output_shape: Shape::from_slice(&[2]),
            weights: vec![1.0, 2.0, -1.0, 0.0],
            bias: vec![0.5, 0.0],
        };
        let blob = EngineBlob::from_bytes(plan.encode());
        let config = SessionConfig::new(2, Precision::Full, &[2, 2], &[2]).unwrap();
        let mut session = InferenceSession::new(&HostRuntime::new(), &blob, config).unwrap();

        let input = Tensor::from_f32(
            DType::F32,
            Shape::from_slice(&[2, 2, 2]),
            &[1.0, 3.0, 5.0, 7.0, 0.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
        let out = session.predict(&input).unwrap().to_f32_vec().unwrap();
        // Sample 0 pools to [2, 6]; sample 1 pools to zeros.
        assert_eq!(out, vec![14.5, -2.0, 0.5, 0.0]);
    }

    #[test]
    fn aliased_bindings_are_rejected() {
        let config = SessionConfig::new(1, Precision::Full, &[1, 2], &[1]).unwrap();
        let blob = ReferenceEngineBuilder::new(config).build().unwrap();
        let runtime = HostRuntime::new();
        let engine = runtime.deserialize(&blob).unwrap();
        let mut context = engine.create_context().unwrap();
        let a = context.allocate(8).unwrap();

        let bindings = Bindings::pair(a.address(), a.address());
        assert!(context.enqueue(&bindings).is_err());
    }
}
