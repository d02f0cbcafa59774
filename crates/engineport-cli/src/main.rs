mod cli;
mod config;
mod runtimes;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use engineport_backend_reference::{is_reference_blob, ReferenceEngineBuilder, ReferencePlan};
use engineport_compiler::{BuildRequest, EngineCompiler};
use engineport_core::{EngineBlob, EngineManifest, InterchangeArtifact, Tensor};
use engineport_runtime::Benchmark;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ModelArgs};
use config::PipelineConfig;
use runtimes::RuntimeKind;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid --log filter")?)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Command::Build {
            onnx,
            engine,
            model,
            build_precision,
            io_precision,
            trtexec,
            workspace_mb,
            extra,
        } => {
            apply_model_args(&mut config, &model);
            if onnx.is_some() {
                config.model.interchange = onnx;
            }
            if engine.is_some() {
                config.model.engine = engine;
            }
            if let Some(precision) = build_precision {
                config.precision.build = precision;
            }
            if let Some(precision) = io_precision {
                config.precision.io = precision;
            }
            if let Some(trtexec) = trtexec {
                config.compiler.executable = trtexec;
            }
            if workspace_mb.is_some() {
                config.compiler.workspace_mb = workspace_mb;
            }
            config.compiler.extra_args.extend(extra);
            config.validate()?;
            build(&config)
        }
        Command::Bench {
            engine,
            runtime,
            device,
            model,
            warmup,
            iterations,
            json,
        } => {
            apply_model_args(&mut config, &model);
            if engine.is_some() {
                config.model.engine = engine;
            }
            if let Some(kind) = runtime {
                config.runtime.kind = kind;
            }
            if let Some(device) = device {
                config.runtime.device = device;
            }
            if let Some(warmup) = warmup {
                config.bench.warmup = warmup;
            }
            if let Some(iterations) = iterations {
                config.bench.iterations = iterations;
            }
            config.validate()?;
            bench(&config, !model.is_empty(), json)
        }
        Command::ReferenceEngine { out, model, seed } => {
            apply_model_args(&mut config, &model);
            if let Some(seed) = seed {
                config.runtime.seed = seed;
            }
            config.validate()?;
            reference_engine(&config, &out)
        }
        Command::Inspect { engine } => inspect(&engine),
    }
}

fn apply_model_args(config: &mut PipelineConfig, args: &ModelArgs) {
    if let Some(batch) = args.batch {
        config.model.batch_size = batch;
    }
    if let Some(shape) = &args.input_shape {
        config.model.input_shape = shape.clone();
    }
    if let Some(shape) = &args.output_shape {
        config.model.output_shape = shape.clone();
    }
    if let Some(precision) = args.precision {
        config.set_uniform_precision(precision);
    }
}

fn build(config: &PipelineConfig) -> Result<()> {
    let onnx = config
        .model
        .interchange
        .clone()
        .context("no interchange file: pass --onnx or set model.interchange")?;
    let engine = config
        .model
        .engine
        .clone()
        .unwrap_or_else(|| onnx.with_extension("engine"));

    let interchange = InterchangeArtifact::open(
        &onnx,
        config.model.batch_size,
        &config.model.input_shape,
        config.precision.export,
    )?;
    let mut request =
        BuildRequest::new(interchange, engine, &config.model.output_shape, config.precision);
    request.workspace_mb = config.compiler.workspace_mb;
    request.extra_args = config.compiler.extra_args.clone();

    let compiler = EngineCompiler::new(config.compiler.executable.clone())
        .with_launcher(&config.compiler.launcher);
    let report = compiler
        .compile(&request)
        .with_context(|| format!("failed to build an engine from {}", onnx.display()))?;

    println!("engine:   {}", report.engine.display());
    println!("manifest: {}", report.manifest_path.display());
    println!("built in  {:.1}s", report.elapsed.as_secs_f64());
    Ok(())
}

fn bench(config: &PipelineConfig, explicit_model: bool, json: bool) -> Result<()> {
    let kind = config.runtime.kind;
    let path = match kind {
        RuntimeKind::OnnxRuntime => config
            .model
            .engine
            .clone()
            .or_else(|| config.model.interchange.clone()),
        _ => config.model.engine.clone(),
    }
    .context("nothing to benchmark: pass --engine or set model.engine")?;

    let blob =
        EngineBlob::read(&path).with_context(|| format!("cannot load {}", path.display()))?;
    let session_config = match blob.manifest() {
        Some(manifest) if !explicit_model => {
            info!(engine = %path.display(), "session shape taken from engine manifest");
            manifest.session_config()?
        }
        _ => config.session_config()?,
    };

    let mut session = runtimes::open_session(kind, &config.runtime, &blob, session_config.clone())
        .with_context(|| format!("cannot create a {kind:?} session for {}", path.display()))?;
    let input = Tensor::zeros(session_config.precision().dtype(), session_config.input_dims());

    let mut harness = Benchmark::new(config.bench_policy());
    if !config.bench.check_outputs {
        harness = harness.without_output_checks();
    }
    let report = harness.run(session.as_mut(), &input)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

fn reference_engine(config: &PipelineConfig, out: &Path) -> Result<()> {
    let session_config = config.session_config()?;
    let blob = ReferenceEngineBuilder::new(session_config.clone())
        .seed(config.runtime.seed)
        .build()?;
    let manifest =
        EngineManifest::describe(out, blob.bytes(), &session_config, config.precision, Vec::new());
    blob.with_manifest(manifest)
        .write(out)
        .with_context(|| format!("cannot write {}", out.display()))?;

    println!(
        "wrote reference engine {} (batch {}, {} -> {}, {})",
        out.display(),
        session_config.batch_size(),
        session_config.input_shape(),
        session_config.output_shape(),
        session_config.precision()
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let blob = EngineBlob::read(path).with_context(|| format!("cannot load {}", path.display()))?;
    println!("engine:   {} ({} bytes)", path.display(), blob.len());

    match blob.manifest() {
        Some(manifest) => println!("manifest: {}", serde_json::to_string_pretty(manifest)?),
        None => println!("manifest: none"),
    }

    if is_reference_blob(blob.bytes()) {
        let plan = ReferencePlan::decode(blob.bytes())?;
        println!(
            "reference engine: {} batch {} {} -> {} ({} parameters)",
            plan.precision,
            plan.batch_size,
            plan.input_shape,
            plan.output_shape,
            plan.weights.len() + plan.bias.len()
        );
    }
    Ok(())
}
