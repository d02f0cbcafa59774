use bytes::Bytes;
use tracing::{info, trace};

use crate::{
    Bindings, Device, DeviceBuffer, DeviceClaim, DeviceOwner, Engine, EngineBlob, EngineSpec,
    ExecutionContext, Precision, Runtime, SessionConfig, SessionError, SessionResult, Tensor,
};

type ContextOf<R> = <<R as Runtime>::Engine as Engine>::Context;
type BufferOf<R> = <ContextOf<R> as ExecutionContext>::Buffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Closed,
}

// Field order is drop order: buffers, then the context, then the engine, then the claim.
struct Resources<R: Runtime> {
    input: BufferOf<R>,
    output: BufferOf<R>,
    context: ContextOf<R>,
    _engine: R::Engine,
    _claim: DeviceClaim,
}

/// Owns one execution context and one input/output device buffer pair.
///
/// Buffers are allocated once at construction and reused by every call. `predict`
/// takes `&mut self`, so calls on one session never overlap.
pub struct InferenceSession<R: Runtime> {
    runtime: &'static str,
    device: Device,
    config: SessionConfig,
    engine_spec: EngineSpec,
    bindings: Bindings,
    device_resident: bool,
    resources: Option<Resources<R>>,
    calls: u64,
}

impl<R: Runtime> InferenceSession<R> {
    /// Deserializes `blob` and allocates the buffer pair described by `config`.
    ///
    /// Either a ready session is returned or nothing is left allocated.
    pub fn new(runtime: &R, blob: &EngineBlob, config: SessionConfig) -> SessionResult<Self> {
        if config.precision() == Precision::Reduced && !runtime.capabilities().reduced_precision
        {
            return Err(SessionError::InvalidConfig(format!(
                "runtime '{}' does not support fp16 buffers",
                runtime.name()
            )));
        }
        if let Some(manifest) = blob.manifest() {
            manifest.check_compatible(&config)?;
        }

        let device = runtime.device();
        let claim = DeviceClaim::acquire(device, DeviceOwner::InferenceRuntime)?;

        let engine = runtime.deserialize(blob).map_err(|e| match (e, blob.origin()) {
            (SessionError::Deserialize(message), Some(path)) => {
                SessionError::Deserialize(format!("{}: {message}", path.display()))
            }
            (e, _) => e,
        })?;
        let engine_spec = engine.spec().clone();
        engine_spec.check_compatible(&config)?;

        let mut context = engine.create_context()?;
        let input = context.allocate(config.input_byte_len())?;
        let output = context.allocate(config.output_byte_len())?;
        let bindings = Bindings::pair(input.address(), output.address());

        let device_resident = runtime.capabilities().device_resident;
        info!(
            runtime = runtime.name(),
            %device,
            device_resident,
            batch = config.batch_size(),
            precision = %config.precision(),
            input_bytes = input.byte_len(),
            output_bytes = output.byte_len(),
            "inference session ready"
        );

        Ok(Self {
            runtime: runtime.name(),
            device,
            config,
            engine_spec,
            bindings,
            device_resident,
            resources: Some(Resources {
                input,
                output,
                context,
                _engine: engine,
                _claim: claim,
            }),
            calls: 0,
        })
    }

    /// Runs one batch: copy in, execute, copy out, synchronize.
    pub fn predict(&mut self, input: &Tensor) -> SessionResult<Tensor> {
        if self.resources.is_none() {
            return Err(SessionError::Closed);
        }
        let expected_dtype = self.config.precision().dtype();
        if input.dtype() != expected_dtype {
            return Err(SessionError::DTypeMismatch {
                expected: expected_dtype,
                actual: input.dtype(),
            });
        }
        let expected_shape = self.config.input_dims();
        if *input.shape() != expected_shape {
            return Err(SessionError::InputShape {
                expected: expected_shape,
                actual: input.shape().clone(),
            });
        }

        let bytes = self.predict_bytes(&input.bytes)?;
        Ok(Tensor::from_host_bytes(
            expected_dtype,
            self.config.output_dims(),
            bytes,
        ))
    }

    /// Byte-level [`predict`](Self::predict); `input` must match the input buffer exactly.
    pub fn predict_bytes(&mut self, input: &[u8]) -> SessionResult<Bytes> {
        let Resources {
            input: d_input,
            output: d_output,
            context,
            ..
        } = self.resources.as_mut().ok_or(SessionError::Closed)?;

        if input.len() != d_input.byte_len() {
            return Err(SessionError::InputSize {
                expected: d_input.byte_len(),
                actual: input.len(),
            });
        }

        let mut host_output = vec![0u8; d_output.byte_len()];
        context.copy_to_device(d_input, input)?;
        context.enqueue(&self.bindings)?;
        context.copy_to_host(d_output, &mut host_output)?;
        context.synchronize()?;

        self.calls += 1;
        trace!(call = self.calls, "predict complete");
        Ok(Bytes::from(host_output))
    }

    /// Releases buffers, context and engine. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(resources) = self.resources.take() {
            drop(resources);
            info!(
                runtime = self.runtime,
                device = %self.device,
                calls = self.calls,
                "inference session closed"
            );
        }
    }

    pub fn state(&self) -> SessionState {
        if self.resources.is_some() {
            SessionState::Ready
        } else {
            SessionState::Closed
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn engine_spec(&self) -> &EngineSpec {
        &self.engine_spec
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// False when the runtime's "device" buffers live in host memory.
    pub fn is_device_resident(&self) -> bool {
        self.device_resident
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{DType, DeviceAddress, IOName, RuntimeCapabilities, Shape, TensorSpec};

    #[derive(Default)]
    struct Journal {
        ops: Vec<&'static str>,
        allocations: usize,
    }

    /// Test double whose "device" echoes the first output-sized prefix of the input.
    struct EchoRuntime {
        spec: EngineSpec,
        journal: Arc<Mutex<Journal>>,
        device: Device,
    }

    struct EchoEngine {
        spec: EngineSpec,
        journal: Arc<Mutex<Journal>>,
    }

    struct EchoContext {
        journal: Arc<Mutex<Journal>>,
        staged: Vec<u8>,
        next_address: u64,
    }

    struct EchoBuffer {
        data: Vec<u8>,
        address: DeviceAddress,
    }

    impl DeviceBuffer for EchoBuffer {
        fn byte_len(&self) -> usize {
            self.data.len()
        }
        fn address(&self) -> DeviceAddress {
            self.address
        }
    }

    impl Runtime for EchoRuntime {
        type Engine = EchoEngine;

        fn name(&self) -> &'static str {
            "echo"
        }
        fn device(&self) -> Device {
            self.device
        }
        fn capabilities(&self) -> RuntimeCapabilities {
            RuntimeCapabilities {
                reduced_precision: true,
                device_resident: false,
            }
        }
        fn deserialize(&self, blob: &EngineBlob) -> SessionResult<EchoEngine> {
            if blob.bytes().as_ref() != b"echo" {
                return Err(SessionError::Deserialize("not an echo engine".to_string()));
            }
            Ok(EchoEngine {
                spec: self.spec.clone(),
                journal: self.journal.clone(),
            })
        }
    }

    impl Engine for EchoEngine {
        type Context = EchoContext;

        fn spec(&self) -> &EngineSpec {
            &self.spec
        }
        fn create_context(&self) -> SessionResult<EchoContext> {
            Ok(EchoContext {
                journal: self.journal.clone(),
                staged: Vec::new(),
                next_address: 0x1000,
            })
        }
    }

    impl EchoContext {
        fn log(&self, op: &'static str) {
            self.journal.lock().unwrap().ops.push(op);
        }
    }

    impl ExecutionContext for EchoContext {
        type Buffer = EchoBuffer;

        fn allocate(&mut self, byte_len: usize) -> SessionResult<EchoBuffer> {
            self.journal.lock().unwrap().allocations += 1;
            let address = DeviceAddress(self.next_address);
            self.next_address += byte_len as u64;
            Ok(EchoBuffer {
                data: vec![0; byte_len],
                address,
            })
        }
        fn copy_to_device(&mut self, dst: &mut EchoBuffer, src: &[u8]) -> SessionResult<()> {
            self.log("h2d");
            dst.data.copy_from_slice(src);
            self.staged = src.to_vec();
            Ok(())
        }
        fn enqueue(&mut self, bindings: &Bindings) -> SessionResult<()> {
            assert_eq!(bindings.as_slice().len(), 2);
            self.log("enqueue");
            Ok(())
        }
        fn copy_to_host(&mut self, src: &EchoBuffer, dst: &mut [u8]) -> SessionResult<()> {
            self.log("d2h");
            let n = src.byte_len().min(self.staged.len());
            dst[..n].copy_from_slice(&self.staged[..n]);
            Ok(())
        }
        fn synchronize(&mut self) -> SessionResult<()> {
            self.log("sync");
            Ok(())
        }
    }

    fn echo_runtime(batch: usize, dtype: DType, device: Device) -> EchoRuntime {
        EchoRuntime {
            spec: EngineSpec {
                batch_size: batch,
                inputs: vec![TensorSpec {
                    name: IOName("input".to_string()),
                    dtype,
                    dims: Shape::from_slice(&[batch, 4]),
                }],
                outputs: vec![TensorSpec {
                    name: IOName("output".to_string()),
                    dtype,
                    dims: Shape::from_slice(&[batch, 2]),
                }],
            },
            journal: Arc::default(),
            device,
        }
    }

    fn config(batch: usize, precision: Precision) -> SessionConfig {
        SessionConfig::new(batch, precision, &[4], &[2]).unwrap()
    }

    #[test]
    fn predict_runs_four_steps_in_order_without_reallocating() {
        let runtime = echo_runtime(2, DType::F32, Device::Host);
        let blob = EngineBlob::from_bytes(&b"echo"[..]);
        let mut session =
            InferenceSession::new(&runtime, &blob, config(2, Precision::Full)).unwrap();

        let input = Tensor::from_f32(
            DType::F32,
            Shape::from_slice(&[2, 4]),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        )
        .unwrap();
        for _ in 0..3 {
            let out = session.predict(&input).unwrap();
            assert_eq!(out.shape().dims(), &[2, 2]);
            assert_eq!(out.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        }

        let journal = runtime.journal.lock().unwrap();
        assert_eq!(journal.allocations, 2);
        assert_eq!(&journal.ops[..4], &["h2d", "enqueue", "d2h", "sync"]);
        assert_eq!(journal.ops.len(), 12);
        assert_eq!(session.calls(), 3);
        assert!(!session.is_device_resident());
    }

    #[test]
    fn wrong_batch_size_fails_before_any_copy() {
        let runtime = echo_runtime(2, DType::F32, Device::Host);
        let blob = EngineBlob::from_bytes(&b"echo"[..]);
        let mut session =
            InferenceSession::new(&runtime, &blob, config(2, Precision::Full)).unwrap();

        let small = Tensor::zeros(DType::F32, Shape::from_slice(&[1, 4]));
        assert!(matches!(
            session.predict(&small),
            Err(SessionError::InputShape { .. })
        ));
        assert!(matches!(
            session.predict_bytes(&[0u8; 12]),
            Err(SessionError::InputSize {
                expected: 32,
                actual: 12
            })
        ));
        assert!(runtime.journal.lock().unwrap().ops.is_empty());
    }

    #[test]
    fn wrong_dtype_is_rejected() {
        let runtime = echo_runtime(1, DType::F16, Device::Host);
        let blob = EngineBlob::from_bytes(&b"echo"[..]);
        let mut session =
            InferenceSession::new(&runtime, &blob, config(1, Precision::Reduced)).unwrap();

        let full = Tensor::zeros(DType::F32, Shape::from_slice(&[1, 4]));
        assert!(matches!(
            session.predict(&full),
            Err(SessionError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn closed_session_refuses_predict() {
        let runtime = echo_runtime(1, DType::F32, Device::Host);
        let blob = EngineBlob::from_bytes(&b"echo"[..]);
        let mut session =
            InferenceSession::new(&runtime, &blob, config(1, Precision::Full)).unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        let input = Tensor::zeros(DType::F32, Shape::from_slice(&[1, 4]));
        assert!(matches!(session.predict(&input), Err(SessionError::Closed)));

        let wrong = Tensor::zeros(DType::F16, Shape::from_slice(&[3, 4]));
        assert!(matches!(session.predict(&wrong), Err(SessionError::Closed)));
    }

    #[test]
    fn corrupt_blob_yields_no_session() {
        let runtime = echo_runtime(1, DType::F32, Device::Host);
        let blob = EngineBlob::from_bytes(&b"ech"[..]);
        let err = InferenceSession::new(&runtime, &blob, config(1, Precision::Full))
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Deserialize(_)));
    }

    #[test]
    fn deserialize_errors_name_the_engine_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.engine");
        std::fs::write(&path, b"ech").unwrap();

        let runtime = echo_runtime(1, DType::F32, Device::Host);
        let blob = EngineBlob::read(&path).unwrap();
        let err = InferenceSession::new(&runtime, &blob, config(1, Precision::Full))
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Deserialize(_)));
        assert!(err.to_string().contains("broken.engine"), "{err}");
    }

    #[test]
    fn session_waits_for_framework_to_release_device() {
        let device = Device::Cuda { device_id: 911 };
        let runtime = echo_runtime(1, DType::F32, device);
        let blob = EngineBlob::from_bytes(&b"echo"[..]);

        let framework = DeviceClaim::acquire(device, DeviceOwner::Framework).unwrap();
        let err = InferenceSession::new(&runtime, &blob, config(1, Precision::Full))
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::DeviceBusy { .. }));

        drop(framework);
        let mut first = InferenceSession::new(&runtime, &blob, config(1, Precision::Full)).unwrap();
        let second = InferenceSession::new(&runtime, &blob, config(1, Precision::Full)).unwrap();
        drop(second);
        first.close();
        assert_eq!(DeviceClaim::holder(device), None);
    }
}
