use smallvec::SmallVec;

use crate::{Device, EngineBlob, EngineSpec, SessionResult};

#[derive(Clone, Copy, Debug)]
pub struct RuntimeCapabilities {
    pub reduced_precision: bool,
    /// Buffers live in accelerator memory rather than host memory.
    pub device_resident: bool,
}

pub trait Runtime: Send + Sync + 'static {
    type Engine: Engine;

    fn name(&self) -> &'static str;
    fn device(&self) -> Device;
    fn capabilities(&self) -> RuntimeCapabilities;
    fn deserialize(&self, blob: &EngineBlob) -> SessionResult<Self::Engine>;
}

pub trait Engine: Send + 'static {
    type Context: ExecutionContext;

    fn spec(&self) -> &EngineSpec;
    fn create_context(&self) -> SessionResult<Self::Context>;
}

/// Stateful handle that runs one inference at a time on its own queue.
///
/// Work may be issued asynchronously; `synchronize` is the barrier after which
/// every previously issued copy and execution has completed.
pub trait ExecutionContext: Send + 'static {
    type Buffer: DeviceBuffer;

    fn allocate(&mut self, byte_len: usize) -> SessionResult<Self::Buffer>;
    fn copy_to_device(&mut self, dst: &mut Self::Buffer, src: &[u8]) -> SessionResult<()>;
    fn enqueue(&mut self, bindings: &Bindings) -> SessionResult<()>;
    /// Returns once `dst` holds the buffer contents.
    fn copy_to_host(&mut self, src: &Self::Buffer, dst: &mut [u8]) -> SessionResult<()>;
    fn synchronize(&mut self) -> SessionResult<()>;
}

pub trait DeviceBuffer: Send + 'static {
    fn byte_len(&self) -> usize;
    fn address(&self) -> DeviceAddress;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub u64);

/// Device addresses in the positional order the engine expects: inputs first, then outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bindings {
    addresses: SmallVec<[DeviceAddress; 4]>,
    inputs: usize,
}

impl Bindings {
    pub fn pair(input: DeviceAddress, output: DeviceAddress) -> Self {
        let mut addresses = SmallVec::new();
        addresses.push(input);
        addresses.push(output);
        Self {
            addresses,
            inputs: 1,
        }
    }

    pub fn inputs(&self) -> &[DeviceAddress] {
        &self.addresses[..self.inputs]
    }

    pub fn outputs(&self) -> &[DeviceAddress] {
        &self.addresses[self.inputs..]
    }

    pub fn as_slice(&self) -> &[DeviceAddress] {
        &self.addresses
    }
}
