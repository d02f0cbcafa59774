use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use engineport_core::{
    manifest_path_for, EngineManifest, InterchangeArtifact, Precision, PrecisionPlan,
    SessionConfig, SessionError,
};
use thiserror::Error;
use tracing::{debug, info, warn};

const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Invalid(#[from] SessionError),

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}\n{log_tail}")]
    BuildFailed {
        program: String,
        status: String,
        code: Option<i32>,
        log_tail: String,
    },

    #[error("{program} exited successfully but {} is missing or empty", path.display())]
    MissingEngine { program: String, path: PathBuf },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One engine build: which interchange file, where the engine goes, and at which precisions.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub interchange: InterchangeArtifact,
    pub engine_out: PathBuf,
    /// Output dims excluding the batch dimension.
    pub output_shape: Vec<usize>,
    pub precision: PrecisionPlan,
    pub workspace_mb: Option<u64>,
    pub extra_args: Vec<String>,
}

impl BuildRequest {
    pub fn new(
        interchange: InterchangeArtifact,
        engine_out: impl Into<PathBuf>,
        output_shape: &[usize],
        precision: PrecisionPlan,
    ) -> Self {
        Self {
            interchange,
            engine_out: engine_out.into(),
            output_shape: output_shape.to_vec(),
            precision,
            workspace_mb: None,
            extra_args: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        self.precision.validate()?;
        if self.interchange.precision != self.precision.export {
            return Err(SessionError::PrecisionPlan(format!(
                "{} was exported at {} but the plan declares {} export precision",
                self.interchange.path.display(),
                self.interchange.precision,
                self.precision.export
            ))
            .into());
        }
        self.session_config()?;
        Ok(())
    }

    /// Buffers a session needs to run the engine this request produces.
    pub fn session_config(&self) -> Result<SessionConfig, SessionError> {
        SessionConfig::new(
            self.interchange.batch_size,
            self.precision.runtime(),
            self.interchange.input_shape.dims(),
            &self.output_shape,
        )
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--onnx={}", self.interchange.path.display()),
            format!("--saveEngine={}", self.engine_out.display()),
            "--explicitBatch".to_string(),
        ];
        if self.precision.build == Precision::Reduced {
            args.push("--fp16".to_string());
        }
        if self.precision.io == Precision::Reduced {
            let format = self.precision.io.format_token();
            args.push(format!("--inputIOFormats={format}:chw"));
            args.push(format!("--outputIOFormats={format}:chw"));
        }
        if let Some(mb) = self.workspace_mb {
            args.push(format!("--memPoolSize=workspace:{mb}M"));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[derive(Clone, Debug)]
pub struct BuildReport {
    pub engine: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: EngineManifest,
    pub elapsed: Duration,
}

/// Invokes the external compiler. Exit code 0 plus a non-empty engine file is success.
#[derive(Clone, Debug)]
pub struct EngineCompiler {
    executable: PathBuf,
    launcher: Vec<OsString>,
}

impl Default for EngineCompiler {
    fn default() -> Self {
        Self::new("trtexec")
    }
}

impl EngineCompiler {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            launcher: Vec::new(),
        }
    }

    /// Runs the compiler through a wrapper command, e.g. `["docker", "exec", "trt"]`.
    pub fn with_launcher<I, S>(mut self, launcher: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.launcher = launcher.into_iter().map(Into::into).collect();
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Full command line for `request`, launcher first.
    pub fn command_line(&self, request: &BuildRequest) -> Vec<String> {
        self.launcher
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .chain(std::iter::once(self.executable.display().to_string()))
            .chain(request.args())
            .collect()
    }

    pub fn compile(&self, request: &BuildRequest) -> Result<BuildReport, CompileError> {
        request.validate()?;

        let engine = &request.engine_out;
        for stale in [engine.clone(), manifest_path_for(engine)] {
            match fs::remove_file(&stale) {
                Ok(()) => debug!(path = %stale.display(), "removed stale build output"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(CompileError::Io { path: stale, source }),
            }
        }

        let command_line = self.command_line(request);
        let program = command_line[0].clone();
        let mut command = Command::new(&command_line[0]);
        command.args(&command_line[1..]);

        info!(
            command = %command_line.join(" "),
            batch = request.interchange.batch_size,
            build = %request.precision.build,
            io = %request.precision.io,
            "building engine"
        );
        let t0 = Instant::now();
        let output = command.output().map_err(|source| CompileError::Spawn {
            program: program.clone(),
            source,
        })?;
        let elapsed = t0.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines().chain(stderr.lines()) {
            debug!(target: "engineport::trtexec", "{line}");
        }

        if !output.status.success() {
            let log_tail = tail(&stdout, &stderr, LOG_TAIL_LINES);
            warn!(status = %output.status, "engine build failed");
            return Err(CompileError::BuildFailed {
                program,
                status: output.status.to_string(),
                code: output.status.code(),
                log_tail,
            });
        }

        let bytes = match fs::read(engine) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                return Err(CompileError::MissingEngine {
                    program,
                    path: engine.clone(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CompileError::MissingEngine {
                    program,
                    path: engine.clone(),
                })
            }
            Err(source) => {
                return Err(CompileError::Io {
                    path: engine.clone(),
                    source,
                })
            }
        };

        let config = request.session_config()?;
        let manifest =
            EngineManifest::describe(engine, &bytes, &config, request.precision, command_line);
        let manifest_path = manifest.write_beside(engine)?;

        info!(
            engine = %engine.display(),
            bytes = bytes.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "engine built"
        );
        Ok(BuildReport {
            engine: engine.clone(),
            manifest_path,
            manifest,
            elapsed,
        })
    }
}

fn tail(stdout: &str, stderr: &str, n: usize) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, precision: PrecisionPlan) -> BuildRequest {
        let onnx = dir.join("resnet50.onnx");
        fs::write(&onnx, b"graph").unwrap();
        let interchange =
            InterchangeArtifact::open(&onnx, 32, &[3, 224, 224], precision.export).unwrap();
        BuildRequest::new(interchange, dir.join("resnet50.engine"), &[1000], precision)
    }

    #[test]
    fn reduced_precision_adds_fp16_and_io_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), PrecisionPlan::uniform(Precision::Reduced));
        req.workspace_mb = Some(1024);
        let args = req.args();

        assert!(args[0].starts_with("--onnx=") && args[0].ends_with("resnet50.onnx"));
        assert!(args[1].starts_with("--saveEngine="));
        assert_eq!(
            &args[2..],
            &[
                "--explicitBatch",
                "--fp16",
                "--inputIOFormats=fp16:chw",
                "--outputIOFormats=fp16:chw",
                "--memPoolSize=workspace:1024M",
            ]
        );
    }

    #[test]
    fn fp16_build_with_fp32_io_keeps_default_formats() {
        let dir = tempfile::tempdir().unwrap();
        let plan = PrecisionPlan {
            export: Precision::Full,
            build: Precision::Reduced,
            io: Precision::Full,
        };
        let args = request(dir.path(), plan).args();
        assert!(args.contains(&"--fp16".to_string()));
        assert!(!args.iter().any(|a| a.contains("IOFormats")));
    }

    #[test]
    fn full_precision_has_no_precision_flags() {
        let dir = tempfile::tempdir().unwrap();
        let args = request(dir.path(), PrecisionPlan::uniform(Precision::Full)).args();
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn export_precision_must_match_interchange() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), PrecisionPlan::uniform(Precision::Reduced));
        req.interchange.precision = Precision::Full;
        assert!(matches!(req.validate(), Err(CompileError::Invalid(_))));
    }

    #[test]
    fn launcher_precedes_executable() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), PrecisionPlan::uniform(Precision::Full));
        let line = EngineCompiler::new("/opt/tensorrt/bin/trtexec")
            .with_launcher(["nsys", "profile"])
            .command_line(&req);
        assert_eq!(&line[..3], &["nsys", "profile", "/opt/tensorrt/bin/trtexec"]);
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", "d", 2), "c\nd");
        assert_eq!(tail("", "", 5), "");
    }
}
