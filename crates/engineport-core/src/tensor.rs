use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use half::f16;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{SessionError, SessionResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    Host,
    Cuda { device_id: u32 },
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = SessionError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => f.write_str("host"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

impl FromStr for Device {
    type Err = SessionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.eq_ignore_ascii_case("host") || raw.eq_ignore_ascii_case("cpu") {
            return Ok(Device::Host);
        }

        if let Some(rest) = raw.strip_prefix("cuda:") {
            let device_id = rest.parse::<u32>().map_err(|_| {
                SessionError::InvalidConfig(format!("invalid cuda device id: {rest}"))
            })?;
            return Ok(Device::Cuda { device_id });
        }

        Err(SessionError::InvalidConfig(format!(
            "unsupported device: {raw} (expected host or cuda:N)"
        )))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Numeric precision of a graph, an engine build, or a set of IO buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "fp32", alias = "f32", alias = "full")]
    Full,
    #[serde(rename = "fp16", alias = "f16", alias = "reduced")]
    Reduced,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Full => DType::F32,
            Precision::Reduced => DType::F16,
        }
    }

    /// Format token understood by `trtexec` IO format flags.
    pub fn format_token(self) -> &'static str {
        match self {
            Precision::Full => "fp32",
            Precision::Reduced => "fp16",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.format_token())
    }
}

impl FromStr for Precision {
    type Err = SessionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "fp32" | "f32" | "full" => Ok(Precision::Full),
            "fp16" | "f16" | "reduced" => Ok(Precision::Reduced),
            other => Err(SessionError::InvalidConfig(format!(
                "unknown precision: {other} (expected fp32 or fp16)"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Prepends a leading batch dimension.
    pub fn with_batch(&self, batch: usize) -> Self {
        let mut dims = SmallVec::with_capacity(self.rank() + 1);
        dims.push(batch);
        dims.extend(self.0.iter().copied());
        Self(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
}

/// A host-resident tensor. Device memory is owned by execution contexts, never by tensors.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub bytes: Bytes,
}

impl Tensor {
    pub fn from_host_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        Self {
            desc: TensorDesc { dtype, shape },
            bytes,
        }
    }

    pub fn zeros(dtype: DType, shape: Shape) -> Self {
        let byte_len = shape.numel() * dtype.byte_size();
        Self::from_host_bytes(dtype, shape, Bytes::from(vec![0u8; byte_len]))
    }

    pub fn from_f32(dtype: DType, shape: Shape, values: &[f32]) -> SessionResult<Self> {
        if values.len() != shape.numel() {
            return Err(SessionError::InputShape {
                expected: shape,
                actual: Shape::from_slice(&[values.len()]),
            });
        }
        let bytes = encode_f32(dtype, values)?;
        Ok(Self::from_host_bytes(dtype, shape, bytes))
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn to_f32_vec(&self) -> SessionResult<Vec<f32>> {
        decode_f32(self.desc.dtype, &self.bytes)
    }

    /// True when no element is NaN or infinite. Integer tensors are always finite.
    pub fn is_finite(&self) -> bool {
        if !self.desc.dtype.is_float() {
            return true;
        }
        match self.to_f32_vec() {
            Ok(values) => values.iter().all(|v| v.is_finite()),
            Err(_) => false,
        }
    }
}

/// Encodes `values` as little-endian `dtype` elements.
pub fn encode_f32(dtype: DType, values: &[f32]) -> SessionResult<Bytes> {
    let mut out = Vec::with_capacity(values.len() * dtype.byte_size());
    match dtype {
        DType::F32 => {
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        DType::F16 => {
            for v in values {
                out.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
            }
        }
        other => return Err(SessionError::UnsupportedDType(other)),
    }
    Ok(Bytes::from(out))
}

/// Decodes little-endian `dtype` elements into `f32`.
pub fn decode_f32(dtype: DType, bytes: &[u8]) -> SessionResult<Vec<f32>> {
    let width = dtype.byte_size();
    if bytes.len() % width != 0 {
        return Err(SessionError::InputSize {
            expected: bytes.len() / width * width,
            actual: bytes.len(),
        });
    }
    match dtype {
        DType::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        DType::F16 => Ok(bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        other => Err(SessionError::UnsupportedDType(other)),
    }
}
