use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use engineport_core::{Device, Precision};

use crate::runtimes::RuntimeKind;

#[derive(Parser, Debug)]
#[command(
    name = "engineport",
    version,
    about = "Compile interchange graphs into inference engines and benchmark them"
)]
pub struct Cli {
    /// Pipeline config (TOML); flags override its values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter (RUST_LOG syntax)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Model and precision overrides shared by every subcommand.
#[derive(Args, Debug, Default)]
pub struct ModelArgs {
    /// Fixed batch size
    #[arg(long)]
    pub batch: Option<usize>,

    /// Per-sample input dims, comma separated (e.g. 3,224,224)
    #[arg(long, value_delimiter = ',')]
    pub input_shape: Option<Vec<usize>>,

    /// Per-sample output dims, comma separated (e.g. 1000)
    #[arg(long, value_delimiter = ',')]
    pub output_shape: Option<Vec<usize>>,

    /// Use one precision (fp32 or fp16) for export, build and IO
    #[arg(long)]
    pub precision: Option<Precision>,
}

impl ModelArgs {
    pub fn is_empty(&self) -> bool {
        self.batch.is_none()
            && self.input_shape.is_none()
            && self.output_shape.is_none()
            && self.precision.is_none()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile an interchange (ONNX) file into an engine with trtexec
    Build {
        /// Interchange file to compile
        #[arg(long)]
        onnx: Option<PathBuf>,

        /// Where to write the engine
        #[arg(long)]
        engine: Option<PathBuf>,

        #[command(flatten)]
        model: ModelArgs,

        /// Engine build precision, overriding --precision
        #[arg(long)]
        build_precision: Option<Precision>,

        /// IO buffer precision, overriding --precision
        #[arg(long)]
        io_precision: Option<Precision>,

        /// Path to the trtexec executable
        #[arg(long)]
        trtexec: Option<PathBuf>,

        /// Builder workspace limit in MiB
        #[arg(long)]
        workspace_mb: Option<u64>,

        /// Extra arguments passed through to trtexec
        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Time repeated inference on a fixed zero batch
    Bench {
        /// Engine file (or interchange file for onnxruntime)
        #[arg(long)]
        engine: Option<PathBuf>,

        /// Runtime that executes the engine
        #[arg(long, value_enum)]
        runtime: Option<RuntimeKind>,

        /// Device to run on (host or cuda:N)
        #[arg(long)]
        device: Option<Device>,

        #[command(flatten)]
        model: ModelArgs,

        /// Untimed calls before measurement
        #[arg(long)]
        warmup: Option<usize>,

        /// Timed calls
        #[arg(long)]
        iterations: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a reference engine (and its manifest) for the host runtime
    ReferenceEngine {
        /// Output engine path
        #[arg(long)]
        out: PathBuf,

        #[command(flatten)]
        model: ModelArgs,

        /// Seed for the generated parameters
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show an engine's manifest and header
    Inspect {
        /// Engine file
        engine: PathBuf,
    },
}
