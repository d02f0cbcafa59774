use std::sync::{Arc, Mutex, PoisonError};

use engineport_core::host::{HostArena, HostBuffer};
use engineport_core::{
    decode_f32, encode_f32, Bindings, DType, Device, DeviceBuffer, Engine, EngineBlob,
    EngineSpec, ExecutionContext, IOName, Runtime, RuntimeCapabilities, SessionError,
    SessionResult, Shape, TensorSpec,
};
use half::f16;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::ValueType;
use tracing::debug;

/// Runs the exported interchange graph directly. The engine blob is the interchange file.
pub struct OrtRuntime {
    arena: HostArena,
    device: Device,
    batch_size: Option<usize>,
}

impl OrtRuntime {
    pub fn new() -> Self {
        Self {
            arena: HostArena::new(),
            device: Device::Host,
            batch_size: None,
        }
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Batch size substituted for a dynamic leading axis.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

impl Default for OrtRuntime {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrtEngine {
    spec: EngineSpec,
    session: Arc<Mutex<Session>>,
    arena: HostArena,
}

pub struct OrtContext {
    session: Arc<Mutex<Session>>,
    arena: HostArena,
    input: TensorSpec,
    output: TensorSpec,
}

impl Runtime for OrtRuntime {
    type Engine = OrtEngine;

    fn name(&self) -> &'static str {
        "onnxruntime"
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

    fn deserialize(&self, blob: &EngineBlob) -> SessionResult<Self::Engine> {
        let builder = Session::builder()
            .map_err(ort_error("builder"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_error("builder"))?;
        let builder = configure_device(builder, self.device)?;

        let session = builder
            .commit_from_memory(blob.bytes())
            .map_err(|e| SessionError::Deserialize(format!("onnxruntime rejected graph: {e}")))?;

        let inputs = session
            .inputs
            .iter()
            .map(|input| tensor_spec(&input.name, &input.input_type, self.batch_size))
            .collect::<SessionResult<Vec<_>>>()?;
        let outputs = session
            .outputs
            .iter()
            .map(|output| tensor_spec(&output.name, &output.output_type, self.batch_size))
            .collect::<SessionResult<Vec<_>>>()?;
        let batch_size = inputs
            .first()
            .and_then(|spec| spec.dims.dims().first().copied())
            .unwrap_or(1);

        debug!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            batch = batch_size,
            device = %self.device,
            "onnxruntime session committed"
        );

        Ok(OrtEngine {
            spec: EngineSpec {
                batch_size,
                inputs,
                outputs,
            },
            session: Arc::new(Mutex::new(session)),
            arena: self.arena.clone(),
        })
    }
}

impl Engine for OrtEngine {
    type Context = OrtContext;

    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn create_context(&self) -> SessionResult<Self::Context> {
        let (Some(input), Some(output)) = (self.spec.inputs.first(), self.spec.outputs.first())
        else {
            return Err(SessionError::EngineMismatch(
                "graph has no inputs or no outputs".to_string(),
            ));
        };
        Ok(OrtContext {
            session: self.session.clone(),
            arena: self.arena.clone(),
            input: input.clone(),
            output: output.clone(),
        })
    }
}

impl ExecutionContext for OrtContext {
    type Buffer = HostBuffer;

    fn allocate(&mut self, byte_len: usize) -> SessionResult<Self::Buffer> {
        self.arena.allocate(byte_len)
    }

    fn copy_to_device(&mut self, dst: &mut Self::Buffer, src: &[u8]) -> SessionResult<()> {
        self.arena.write(dst.address(), src)
    }

    fn enqueue(&mut self, bindings: &Bindings) -> SessionResult<()> {
        let (&[input], &[output]) = (bindings.inputs(), bindings.outputs()) else {
            return Err(SessionError::Device {
                op: "enqueue",
                message: "expected one input and one output binding".to_string(),
            });
        };
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let (input_spec, output_spec) = (&self.input, &self.output);
        self.arena.with_slots(input, output, |src, dst| {
            run(&mut session, input_spec, output_spec, src, dst)
        })?
    }

    fn copy_to_host(&mut self, src: &Self::Buffer, dst: &mut [u8]) -> SessionResult<()> {
        self.arena.read(src.address(), dst)
    }

    fn synchronize(&mut self) -> SessionResult<()> {
        Ok(())
    }
}

fn run(
    session: &mut Session,
    input: &TensorSpec,
    output: &TensorSpec,
    src: &[u8],
    dst: &mut [u8],
) -> SessionResult<()> {
    let shape: Vec<usize> = input.dims.dims().to_vec();
    let value = match input.dtype {
        DType::F32 => ort::value::Tensor::from_array((shape, decode_f32(DType::F32, src)?))
            .map_err(ort_error("bind"))?
            .into_dyn(),
        DType::F16 => ort::value::Tensor::from_array((shape, decode_f16(src)))
            .map_err(ort_error("bind"))?
            .into_dyn(),
        other => return Err(SessionError::UnsupportedDType(other)),
    };

    let ort_inputs = vec![(input.name.0.clone(), SessionInputValue::from(value))];
    let outputs = session.run(ort_inputs).map_err(ort_error("enqueue"))?;
    let value = outputs
        .iter()
        .find(|(name, _)| *name == output.name.0)
        .map(|(_, value)| value)
        .ok_or_else(|| SessionError::Device {
            op: "enqueue",
            message: format!("graph produced no output named {}", output.name.0),
        })?;

    let bytes: Vec<u8> = match output.dtype {
        DType::F32 => {
            let array = value.try_extract_array::<f32>().map_err(ort_error("extract"))?;
            let slice = array.as_slice().ok_or_else(non_contiguous)?;
            encode_f32(DType::F32, slice)?.to_vec()
        }
        DType::F16 => {
            let array = value.try_extract_array::<f16>().map_err(ort_error("extract"))?;
            let slice = array.as_slice().ok_or_else(non_contiguous)?;
            slice.iter().flat_map(|v| v.to_le_bytes()).collect()
        }
        other => return Err(SessionError::UnsupportedDType(other)),
    };

    if bytes.len() != dst.len() {
        return Err(SessionError::Device {
            op: "enqueue",
            message: format!(
                "output binding is {} bytes, graph produced {}",
                dst.len(),
                bytes.len()
            ),
        });
    }
    dst.copy_from_slice(&bytes);
    Ok(())
}

fn decode_f16(bytes: &[u8]) -> Vec<f16> {
    bytes
        .chunks_exact(2)
        .map(|b| f16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn non_contiguous() -> SessionError {
    SessionError::Device {
        op: "extract",
        message: "non-contiguous output tensor".to_string(),
    }
}

fn ort_error(op: &'static str) -> impl FnOnce(ort::Error) -> SessionError {
    move |e| SessionError::Device {
        op,
        message: e.to_string(),
    }
}

fn configure_device(builder: SessionBuilder, device: Device) -> SessionResult<SessionBuilder> {
    match device {
        Device::Host => Ok(builder),
        Device::Cuda { device_id } => configure_cuda(builder, device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> SessionResult<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder
            .with_execution_providers([ep])
            .map_err(ort_error("cuda"))
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = builder;
        Err(SessionError::Device {
            op: "cuda",
            message: format!(
                "cuda:{device_id} requested but engineport-backend-ort was built without the `cuda` feature"
            ),
        })
    }
}

fn tensor_spec(
    name: &str,
    value_type: &ValueType,
    batch: Option<usize>,
) -> SessionResult<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        return Err(SessionError::Deserialize(format!(
            "{name} is not a tensor"
        )));
    };

    let dtype = element_dtype(*ty)?;
    let mut dims = Vec::with_capacity(shape.len());
    for (axis, &d) in shape.iter().enumerate() {
        match (d, axis, batch) {
            (d, _, _) if d > 0 => dims.push(d as usize),
            (_, 0, Some(batch)) => dims.push(batch),
            _ => {
                return Err(SessionError::Deserialize(format!(
                    "{name} has dynamic axis {axis}; only a dynamic batch axis can be resolved"
                )))
            }
        }
    }

    Ok(TensorSpec {
        name: IOName(name.to_string()),
        dtype,
        dims: Shape::from_slice(&dims),
    })
}

fn element_dtype(ty: TensorElementType) -> SessionResult<DType> {
    match ty {
        TensorElementType::Float32 => Ok(DType::F32),
        TensorElementType::Float16 => Ok(DType::F16),
        TensorElementType::Int64 => Ok(DType::I64),
        TensorElementType::Int32 => Ok(DType::I32),
        TensorElementType::Uint8 => Ok(DType::U8),
        _ => Err(SessionError::Deserialize(format!(
            "unsupported tensor element type: {ty}"
        ))),
    }
}
