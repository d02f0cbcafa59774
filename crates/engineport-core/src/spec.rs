use serde::{Deserialize, Serialize};

use crate::{DType, Precision, SessionError, SessionResult, Shape};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IOName(pub String);

/// One IO tensor as declared by a deserialized engine. Dims include the batch dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub dims: Shape,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSpec {
    pub batch_size: usize,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl EngineSpec {
    /// Checks that the engine can serve `config` with a single input/output binding pair.
    pub fn check_compatible(&self, config: &SessionConfig) -> SessionResult<()> {
        let (input, output) = match (self.inputs.as_slice(), self.outputs.as_slice()) {
            ([input], [output]) => (input, output),
            _ => {
                return Err(SessionError::EngineMismatch(format!(
                    "expected one input and one output tensor, engine declares {} inputs and {} outputs",
                    self.inputs.len(),
                    self.outputs.len()
                )))
            }
        };

        if self.batch_size != config.batch_size() {
            return Err(SessionError::EngineMismatch(format!(
                "engine was built for batch size {}, session requests {}",
                self.batch_size,
                config.batch_size()
            )));
        }

        let expected_dtype = config.precision().dtype();
        for tensor in [input, output] {
            if tensor.dtype != expected_dtype {
                return Err(SessionError::DTypeMismatch {
                    expected: expected_dtype,
                    actual: tensor.dtype,
                });
            }
        }

        if input.dims != config.input_dims() {
            return Err(SessionError::EngineMismatch(format!(
                "input '{}' is {} in the engine, session expects {}",
                input.name.0,
                input.dims,
                config.input_dims()
            )));
        }
        if output.dims != config.output_dims() {
            return Err(SessionError::EngineMismatch(format!(
                "output '{}' is {} in the engine, session expects {}",
                output.name.0,
                output.dims,
                config.output_dims()
            )));
        }

        Ok(())
    }
}

/// Immutable description of the buffers an inference session allocates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    batch_size: usize,
    precision: Precision,
    input_shape: Shape,
    output_shape: Shape,
    #[serde(skip)]
    input_byte_len: usize,
    #[serde(skip)]
    output_byte_len: usize,
}

impl SessionConfig {
    /// `input_shape` and `output_shape` exclude the batch dimension.
    pub fn new(
        batch_size: usize,
        precision: Precision,
        input_shape: &[usize],
        output_shape: &[usize],
    ) -> SessionResult<Self> {
        if batch_size == 0 {
            return Err(SessionError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        for (what, dims) in [("input", input_shape), ("output", output_shape)] {
            if dims.is_empty() || dims.contains(&0) {
                return Err(SessionError::InvalidConfig(format!(
                    "{what} shape {dims:?} must be non-empty with non-zero dims"
                )));
            }
        }

        let element = precision.dtype().byte_size();
        let byte_len = |what: &str, dims: &[usize]| {
            dims.iter()
                .try_fold(batch_size, |acc, &d| acc.checked_mul(d))
                .and_then(|n| n.checked_mul(element))
                .ok_or_else(|| {
                    SessionError::InvalidConfig(format!(
                        "{what} buffer for batch {batch_size} x {dims:?} overflows usize"
                    ))
                })
        };
        let input_byte_len = byte_len("input", input_shape)?;
        let output_byte_len = byte_len("output", output_shape)?;

        Ok(Self {
            batch_size,
            precision,
            input_shape: Shape::from_slice(input_shape),
            output_shape: Shape::from_slice(output_shape),
            input_byte_len,
            output_byte_len,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn input_shape(&self) -> &Shape {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    pub fn input_dims(&self) -> Shape {
        self.input_shape.with_batch(self.batch_size)
    }

    pub fn output_dims(&self) -> Shape {
        self.output_shape.with_batch(self.batch_size)
    }

    pub fn input_byte_len(&self) -> usize {
        self.input_byte_len
    }

    pub fn output_byte_len(&self) -> usize {
        self.output_byte_len
    }
}

/// Precisions of the exported graph, the engine build and the IO buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionPlan {
    pub export: Precision,
    pub build: Precision,
    pub io: Precision,
}

impl PrecisionPlan {
    pub fn uniform(precision: Precision) -> Self {
        Self {
            export: precision,
            build: precision,
            io: precision,
        }
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.build == Precision::Full && self.io == Precision::Reduced {
            return Err(SessionError::PrecisionPlan(
                "fp16 IO buffers require an fp16 engine build".to_string(),
            ));
        }
        if self.build == Precision::Full && self.export == Precision::Reduced {
            return Err(SessionError::PrecisionPlan(
                "an fp16 export cannot be built as an fp32 engine".to_string(),
            ));
        }
        Ok(())
    }

    /// Precision of the host and device buffers a session uses.
    pub fn runtime(&self) -> Precision {
        self.io
    }
}

impl Default for PrecisionPlan {
    fn default() -> Self {
        Self::uniform(Precision::Full)
    }
}
