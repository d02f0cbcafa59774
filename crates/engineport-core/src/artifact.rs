use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Precision, PrecisionPlan, SessionConfig, SessionError, SessionResult, Shape};

const MANIFEST_SUFFIX: &str = ".manifest.json";

/// An exported computation graph with the input shape and batch baked in at export time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterchangeArtifact {
    pub path: PathBuf,
    pub batch_size: usize,
    pub input_shape: Shape,
    pub precision: Precision,
}

impl InterchangeArtifact {
    pub fn open(
        path: impl Into<PathBuf>,
        batch_size: usize,
        input_shape: &[usize],
        precision: Precision,
    ) -> SessionResult<Self> {
        let path = path.into();
        let meta = fs::metadata(&path).map_err(|e| {
            SessionError::Interchange(format!("cannot read {}: {e}", path.display()))
        })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(SessionError::Interchange(format!(
                "{} is not a non-empty file",
                path.display()
            )));
        }
        if batch_size == 0 {
            return Err(SessionError::Interchange(
                "batch size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            path,
            batch_size,
            input_shape: Shape::from_slice(input_shape),
            precision,
        })
    }
}

/// Sidecar written next to a compiled engine describing how it was built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineManifest {
    pub engine: String,
    pub sha256: String,
    pub batch_size: usize,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub precision: PrecisionPlan,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub created_at: u64,
}

impl EngineManifest {
    pub fn describe(
        engine_path: &Path,
        engine_bytes: &[u8],
        config: &SessionConfig,
        precision: PrecisionPlan,
        command: Vec<String>,
    ) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            engine: engine_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            sha256: sha256_hex(engine_bytes),
            batch_size: config.batch_size(),
            input_shape: config.input_shape().dims().to_vec(),
            output_shape: config.output_shape().dims().to_vec(),
            precision,
            command,
            created_at,
        }
    }

    pub fn read(path: &Path) -> SessionResult<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| SessionError::Manifest(format!("{}: {e}", path.display())))
    }

    /// Writes the manifest next to `engine_path` and returns the manifest path.
    pub fn write_beside(&self, engine_path: &Path) -> SessionResult<PathBuf> {
        let path = manifest_path_for(engine_path);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SessionError::Manifest(e.to_string()))?;
        fs::write(&path, json)?;
        Ok(path)
    }

    pub fn session_config(&self) -> SessionResult<SessionConfig> {
        SessionConfig::new(
            self.batch_size,
            self.precision.runtime(),
            &self.input_shape,
            &self.output_shape,
        )
    }

    /// Rejects sessions whose buffers disagree with how the engine was built.
    pub fn check_compatible(&self, config: &SessionConfig) -> SessionResult<()> {
        let built = self.session_config()?;
        if built != *config {
            return Err(SessionError::EngineMismatch(format!(
                "engine '{}' was built for batch {} {} -> {} at {} IO precision, session requests batch {} {} -> {} at {}",
                self.engine,
                built.batch_size(),
                built.input_shape(),
                built.output_shape(),
                built.precision(),
                config.batch_size(),
                config.input_shape(),
                config.output_shape(),
                config.precision(),
            )));
        }
        Ok(())
    }
}

pub fn manifest_path_for(engine_path: &Path) -> PathBuf {
    let mut name = engine_path.as_os_str().to_owned();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Serialized engine bytes, read once and held for the lifetime of the engine.
#[derive(Clone, Debug)]
pub struct EngineBlob {
    bytes: Bytes,
    origin: Option<PathBuf>,
    manifest: Option<EngineManifest>,
}

impl EngineBlob {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            origin: None,
            manifest: None,
        }
    }

    /// Reads an engine file and, if present, verifies it against its manifest sidecar.
    pub fn read(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Err(SessionError::Deserialize(format!(
                "{} is empty",
                path.display()
            )));
        }

        let manifest_path = manifest_path_for(path);
        let manifest = if manifest_path.is_file() {
            let manifest = EngineManifest::read(&manifest_path)?;
            let digest = sha256_hex(&bytes);
            if manifest.sha256 != digest {
                return Err(SessionError::Manifest(format!(
                    "{} does not match its manifest (sha256 {digest}, manifest {})",
                    path.display(),
                    manifest.sha256
                )));
            }
            debug!(engine = %path.display(), "engine manifest verified");
            Some(manifest)
        } else {
            None
        };

        Ok(Self {
            bytes: Bytes::from(bytes),
            origin: Some(path.to_path_buf()),
            manifest,
        })
    }

    pub fn with_manifest(mut self, manifest: EngineManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    pub fn manifest(&self) -> Option<&EngineManifest> {
        self.manifest.as_ref()
    }

    pub fn write(&self, path: &Path) -> SessionResult<()> {
        fs::write(path, &self.bytes)?;
        if let Some(manifest) = &self.manifest {
            manifest.write_beside(path)?;
        }
        Ok(())
    }
}
