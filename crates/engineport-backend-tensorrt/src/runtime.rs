use std::ffi::{c_void, CStr, CString};
use std::ptr::NonNull;
use std::sync::Arc;

use engineport_core::{
    Bindings, Device, DeviceAddress, DeviceBuffer, Engine, EngineBlob, EngineSpec,
    ExecutionContext, IOName, Runtime, RuntimeCapabilities, SessionError, SessionResult, Shape,
    TensorSpec,
};
use tracing::{debug, info};

use crate::cuda::{self, Stream};
use crate::{dtype_from_trt, ffi};

const MAX_DIMS: usize = 8;

/// Deserializes TensorRT engines onto one CUDA device.
pub struct TensorRtRuntime {
    device_id: u32,
}

impl TensorRtRuntime {
    pub fn new(device_id: u32) -> Self {
        Self { device_id }
    }
}

impl Default for TensorRtRuntime {
    fn default() -> Self {
        Self::new(0)
    }
}

struct EngineHandle(NonNull<c_void>);

// SAFETY: ICudaEngine is immutable after deserialization and safe to share
// between threads; contexts are created from it one at a time.
unsafe impl Send for EngineHandle {}
unsafe impl Sync for EngineHandle {}

impl EngineHandle {
    fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        unsafe { ffi::trt_destroy_engine(self.0.as_ptr()) };
    }
}

pub struct TensorRtEngine {
    spec: EngineSpec,
    input_names: Vec<CString>,
    output_names: Vec<CString>,
    device_id: u32,
    handle: Arc<EngineHandle>,
}

/// Execution context plus its own CUDA stream.
///
/// The context is destroyed before the engine handle it keeps alive.
pub struct TensorRtContext {
    context: NonNull<c_void>,
    stream: Stream,
    input_names: Vec<CString>,
    output_names: Vec<CString>,
    device_id: u32,
    _engine: Arc<EngineHandle>,
}

// SAFETY: IExecutionContext is used by one thread at a time through `&mut self`.
unsafe impl Send for TensorRtContext {}

impl Drop for TensorRtContext {
    fn drop(&mut self) {
        unsafe { ffi::trt_destroy_context(self.context.as_ptr()) };
    }
}

/// Device allocation, freed with `cudaFree` on drop.
pub struct CudaBuffer {
    ptr: NonNull<c_void>,
    byte_len: usize,
}

// SAFETY: the pointer names device memory, not host memory; the owning session
// serializes every copy into or out of it.
unsafe impl Send for CudaBuffer {}

impl DeviceBuffer for CudaBuffer {
    fn byte_len(&self) -> usize {
        self.byte_len
    }

    fn address(&self) -> DeviceAddress {
        DeviceAddress(self.ptr.as_ptr() as u64)
    }
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        unsafe { cuda::free(self.ptr.as_ptr()) };
    }
}

impl Runtime for TensorRtRuntime {
    type Engine = TensorRtEngine;

    fn name(&self) -> &'static str {
        "tensorrt"
    }

    fn device(&self) -> Device {
        Device::Cuda {
            device_id: self.device_id,
        }
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            reduced_precision: true,
            device_resident: true,
        }
    }

    fn deserialize(&self, blob: &EngineBlob) -> SessionResult<Self::Engine> {
        cuda::set_device(self.device_id)?;
        let bytes = blob.bytes();
        let raw = unsafe { ffi::trt_deserialize_engine(bytes.as_ptr().cast(), bytes.len()) };
        let handle = NonNull::new(raw).map(EngineHandle).ok_or_else(|| {
            SessionError::Deserialize(
                "TensorRT rejected the engine (corrupt, or built by a different TensorRT version or GPU)"
                    .to_string(),
            )
        })?;

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let count = unsafe { ffi::trt_get_nb_io_tensors(handle.as_ptr()) };
        for index in 0..count {
            let (spec, name, is_input) = io_tensor(&handle, index)?;
            if is_input {
                inputs.push((spec, name));
            } else {
                outputs.push((spec, name));
            }
        }

        let batch_size = inputs
            .first()
            .and_then(|(spec, _)| spec.dims.dims().first().copied())
            .unwrap_or(1);
        let (inputs, input_names): (Vec<_>, Vec<_>) = inputs.into_iter().unzip();
        let (outputs, output_names): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();

        info!(
            device = self.device_id,
            bytes = bytes.len(),
            batch = batch_size,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "tensorrt engine deserialized"
        );

        Ok(TensorRtEngine {
            spec: EngineSpec {
                batch_size,
                inputs,
                outputs,
            },
            input_names,
            output_names,
            device_id: self.device_id,
            handle: Arc::new(handle),
        })
    }
}

fn io_tensor(handle: &EngineHandle, index: i32) -> SessionResult<(TensorSpec, CString, bool)> {
    let raw = unsafe { ffi::trt_get_tensor_name(handle.as_ptr(), index) };
    if raw.is_null() {
        return Err(SessionError::Deserialize(format!(
            "IO tensor {index} has no name"
        )));
    }
    let name = unsafe { CStr::from_ptr(raw) }.to_owned();
    let label = name.to_string_lossy().into_owned();

    let code = unsafe { ffi::trt_get_tensor_dtype(handle.as_ptr(), name.as_ptr()) };
    let dtype = dtype_from_trt(code).ok_or_else(|| {
        SessionError::Deserialize(format!("{label} has unsupported TensorRT data type {code}"))
    })?;

    let mut dims = [0i64; MAX_DIMS];
    let rank = unsafe {
        ffi::trt_get_tensor_shape(
            handle.as_ptr(),
            name.as_ptr(),
            dims.as_mut_ptr(),
            MAX_DIMS as i32,
        )
    };
    if rank < 0 {
        return Err(SessionError::Deserialize(format!(
            "{label} has more than {MAX_DIMS} dimensions"
        )));
    }
    let dims = &dims[..rank as usize];
    if dims.iter().any(|&d| d <= 0) {
        return Err(SessionError::Deserialize(format!(
            "{label} has dynamic shape {dims:?}; rebuild the engine with a fixed batch"
        )));
    }

    let is_input = unsafe { ffi::trt_is_input(handle.as_ptr(), name.as_ptr()) } != 0;
    let spec = TensorSpec {
        name: IOName(label),
        dtype,
        dims: Shape(dims.iter().map(|&d| d as usize).collect()),
    };
    Ok((spec, name, is_input))
}

impl Engine for TensorRtEngine {
    type Context = TensorRtContext;

    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn create_context(&self) -> SessionResult<Self::Context> {
        cuda::set_device(self.device_id)?;
        let raw = unsafe { ffi::trt_create_context(self.handle.as_ptr()) };
        let context = NonNull::new(raw).ok_or_else(|| SessionError::Device {
            op: "createExecutionContext",
            message: "TensorRT could not create an execution context".to_string(),
        })?;
        let stream = match Stream::new() {
            Ok(stream) => stream,
            Err(e) => {
                unsafe { ffi::trt_destroy_context(context.as_ptr()) };
                return Err(e);
            }
        };
        debug!(device = self.device_id, "tensorrt execution context created");

        Ok(TensorRtContext {
            context,
            stream,
            input_names: self.input_names.clone(),
            output_names: self.output_names.clone(),
            device_id: self.device_id,
            _engine: self.handle.clone(),
        })
    }
}

impl TensorRtContext {
    fn bind(&self, name: &CString, address: DeviceAddress) -> SessionResult<()> {
        let rc = unsafe {
            ffi::trt_set_tensor_address(
                self.context.as_ptr(),
                name.as_ptr(),
                address.0 as usize as *mut c_void,
            )
        };
        if rc != 0 {
            return Err(SessionError::Device {
                op: "setTensorAddress",
                message: format!("cannot bind {}", name.to_string_lossy()),
            });
        }
        Ok(())
    }
}

impl ExecutionContext for TensorRtContext {
    type Buffer = CudaBuffer;

    fn allocate(&mut self, byte_len: usize) -> SessionResult<Self::Buffer> {
        cuda::set_device(self.device_id)?;
        let raw = cuda::malloc(byte_len)?;
        let ptr = NonNull::new(raw).ok_or(SessionError::Allocation {
            requested: byte_len,
            available: 0,
        })?;
        Ok(CudaBuffer { ptr, byte_len })
    }

    fn copy_to_device(&mut self, dst: &mut Self::Buffer, src: &[u8]) -> SessionResult<()> {
        if src.len() != dst.byte_len {
            return Err(SessionError::InputSize {
                expected: dst.byte_len,
                actual: src.len(),
            });
        }
        cuda::set_device(self.device_id)?;
        unsafe { cuda::copy_h2d(dst.ptr.as_ptr(), src, &self.stream) }
    }

    fn enqueue(&mut self, bindings: &Bindings) -> SessionResult<()> {
        if bindings.inputs().len() != self.input_names.len()
            || bindings.outputs().len() != self.output_names.len()
        {
            return Err(SessionError::Device {
                op: "enqueue",
                message: format!(
                    "engine has {} inputs and {} outputs, got {} and {} bindings",
                    self.input_names.len(),
                    self.output_names.len(),
                    bindings.inputs().len(),
                    bindings.outputs().len()
                ),
            });
        }

        let names = self.input_names.iter().chain(&self.output_names);
        for (name, &address) in names.zip(bindings.as_slice()) {
            self.bind(name, address)?;
        }

        let rc = unsafe { ffi::trt_enqueue_v3(self.context.as_ptr(), self.stream.as_ptr()) };
        if rc != 0 {
            return Err(SessionError::Device {
                op: "enqueueV3",
                message: "TensorRT failed to enqueue inference".to_string(),
            });
        }
        Ok(())
    }

    fn copy_to_host(&mut self, src: &Self::Buffer, dst: &mut [u8]) -> SessionResult<()> {
        if dst.len() != src.byte_len {
            return Err(SessionError::Device {
                op: "copy_to_host",
                message: format!(
                    "host buffer is {} bytes, device buffer is {}",
                    dst.len(),
                    src.byte_len
                ),
            });
        }
        unsafe { cuda::copy_d2h(dst, src.ptr.as_ptr(), &self.stream)? };
        self.stream.synchronize()
    }

    fn synchronize(&mut self) -> SessionResult<()> {
        self.stream.synchronize()
    }
}
