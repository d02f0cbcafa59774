use std::fs;
use std::path::{Path, PathBuf};

use engineport_core::{Device, Precision, PrecisionPlan, SessionConfig, SessionError};
use engineport_runtime::BenchPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtimes::RuntimeKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] SessionError),
}

/// Contents of `engineport.toml`. Every field has a default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub precision: PrecisionPlan,
    pub compiler: CompilerConfig,
    pub bench: BenchConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub interchange: Option<PathBuf>,
    pub engine: Option<PathBuf>,
    pub batch_size: usize,
    /// Per-sample input dims, e.g. `[3, 224, 224]`.
    pub input_shape: Vec<usize>,
    /// Per-sample output dims, e.g. `[1000]`.
    pub output_shape: Vec<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            interchange: None,
            engine: None,
            batch_size: 32,
            input_shape: vec![3, 224, 224],
            output_shape: vec![1000],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    pub executable: PathBuf,
    pub launcher: Vec<String>,
    pub workspace_mb: Option<u64>,
    pub extra_args: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("trtexec"),
            launcher: Vec::new(),
            workspace_mb: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub warmup: usize,
    pub iterations: usize,
    pub check_outputs: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        let policy = BenchPolicy::default();
        Self {
            warmup: policy.warmup,
            iterations: policy.iterations,
            check_outputs: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub device: Device,
    /// Byte limit for host-memory runtimes; unlimited when unset.
    pub arena_capacity: Option<usize>,
    pub seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Reference,
            device: Device::Host,
            arena_capacity: None,
            seed: 0,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    fn parse(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.precision.validate()?;
        if self.bench.iterations == 0 {
            return Err(SessionError::InvalidConfig(
                "bench.iterations must be at least 1".to_string(),
            )
            .into());
        }
        self.session_config()?;
        Ok(())
    }

    /// Session buffers follow the IO precision of the plan.
    pub fn session_config(&self) -> Result<SessionConfig, SessionError> {
        SessionConfig::new(
            self.model.batch_size,
            self.precision.runtime(),
            &self.model.input_shape,
            &self.model.output_shape,
        )
    }

    pub fn bench_policy(&self) -> BenchPolicy {
        BenchPolicy {
            warmup: self.bench.warmup,
            iterations: self.bench.iterations,
        }
    }

    /// Sets every stage of the plan to `precision`.
    pub fn set_uniform_precision(&mut self, precision: Precision) {
        self.precision = PrecisionPlan::uniform(precision);
    }
}
