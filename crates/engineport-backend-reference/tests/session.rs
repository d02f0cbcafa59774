use anyhow::{ensure, Context, Result};
use engineport_backend_reference::{HostRuntime, ReferenceEngineBuilder};
use engineport_core::{
    DType, EngineBlob, EngineManifest, InferenceSession, Precision, PrecisionPlan, SessionConfig,
    SessionError, SessionState, Shape, Tensor,
};

fn classifier_config(batch: usize, precision: Precision) -> Result<SessionConfig> {
    Ok(SessionConfig::new(batch, precision, &[3, 224, 224], &[1000])?)
}

#[test]
fn fp16_batch_of_32_produces_finite_logits() -> Result<()> {
    let config = classifier_config(32, Precision::Reduced)?;
    let blob = ReferenceEngineBuilder::new(config.clone()).seed(7).build()?;
    let runtime = HostRuntime::new();
    let mut session = InferenceSession::new(&runtime, &blob, config)?;

    let input = Tensor::zeros(DType::F16, Shape::from_slice(&[32, 3, 224, 224]));
    let output = session.predict(&input)?;

    ensure!(output.shape().dims() == [32, 1000], "unexpected output shape");
    ensure!(output.dtype() == DType::F16, "expected f16 output");
    ensure!(output.byte_len() == 32 * 1000 * 2, "unexpected output size");
    ensure!(output.is_finite(), "output contains NaN or Inf");
    Ok(())
}

#[test]
fn repeated_predict_is_deterministic() -> Result<()> {
    let config = SessionConfig::new(4, Precision::Full, &[3, 16, 16], &[10])?;
    let blob = ReferenceEngineBuilder::new(config.clone()).seed(1).build()?;
    let runtime = HostRuntime::new();
    let mut session = InferenceSession::new(&runtime, &blob, config)?;

    let values: Vec<f32> = (0..4 * 3 * 16 * 16).map(|i| (i % 17) as f32 / 17.0).collect();
    let input = Tensor::from_f32(DType::F32, Shape::from_slice(&[4, 3, 16, 16]), &values)?;

    let first = session.predict(&input)?.to_f32_vec()?;
    for _ in 0..5 {
        assert_eq!(session.predict(&input)?.to_f32_vec()?, first);
    }
    Ok(())
}

#[test]
fn reduced_precision_tracks_full_precision_within_tolerance() -> Result<()> {
    let full = SessionConfig::new(2, Precision::Full, &[3, 8, 8], &[16])?;
    let reduced = SessionConfig::new(2, Precision::Reduced, &[3, 8, 8], &[16])?;
    let runtime = HostRuntime::new();
    let mut full_session = InferenceSession::new(
        &runtime,
        &ReferenceEngineBuilder::new(full).seed(3).build()?,
        SessionConfig::new(2, Precision::Full, &[3, 8, 8], &[16])?,
    )?;
    let mut reduced_session = InferenceSession::new(
        &runtime,
        &ReferenceEngineBuilder::new(reduced).seed(3).build()?,
        SessionConfig::new(2, Precision::Reduced, &[3, 8, 8], &[16])?,
    )?;

    let values: Vec<f32> = (0..2 * 3 * 8 * 8).map(|i| ((i * 7) % 13) as f32 / 13.0).collect();
    let shape = Shape::from_slice(&[2, 3, 8, 8]);
    let a = full_session
        .predict(&Tensor::from_f32(DType::F32, shape.clone(), &values)?)?
        .to_f32_vec()?;
    let b = reduced_session
        .predict(&Tensor::from_f32(DType::F16, shape, &values)?)?
        .to_f32_vec()?;

    for (x, y) in a.iter().zip(&b) {
        ensure!((x - y).abs() < 1e-2, "fp16 result {y} too far from fp32 {x}");
    }
    Ok(())
}

#[test]
fn other_batch_size_is_rejected() -> Result<()> {
    let config = SessionConfig::new(8, Precision::Full, &[3, 4, 4], &[5])?;
    let blob = ReferenceEngineBuilder::new(config.clone()).build()?;
    let runtime = HostRuntime::new();
    let mut session = InferenceSession::new(&runtime, &blob, config)?;

    let short = Tensor::zeros(DType::F32, Shape::from_slice(&[4, 3, 4, 4]));
    let err = session.predict(&short).err().context("expected rejection")?;
    ensure!(matches!(err, SessionError::InputShape { .. }));

    let err = session
        .predict_bytes(&short.bytes)
        .err()
        .context("expected rejection")?;
    ensure!(matches!(
        err,
        SessionError::InputSize {
            expected: 1536,
            actual: 768
        }
    ));
    ensure!(session.calls() == 0);
    Ok(())
}

#[test]
fn session_for_other_batch_than_engine_fails_to_construct() -> Result<()> {
    let built = SessionConfig::new(8, Precision::Full, &[3, 4, 4], &[5])?;
    let blob = ReferenceEngineBuilder::new(built).build()?;
    let runtime = HostRuntime::new();
    let requested = SessionConfig::new(4, Precision::Full, &[3, 4, 4], &[5])?;

    let err = InferenceSession::new(&runtime, &blob, requested)
        .err()
        .context("expected construction failure")?;
    ensure!(matches!(err, SessionError::EngineMismatch(_)));
    ensure!(runtime.arena().used() == 0, "buffers leaked");
    Ok(())
}

#[test]
fn truncated_engine_file_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("truncated.engine");
    let config = SessionConfig::new(1, Precision::Full, &[3, 4, 4], &[5])?;
    let blob = ReferenceEngineBuilder::new(config.clone()).build()?;
    std::fs::write(&path, &blob.bytes()[..blob.len() - 9])?;

    let blob = EngineBlob::read(&path)?;
    let err = InferenceSession::new(&HostRuntime::new(), &blob, config)
        .err()
        .context("expected deserialization failure")?;
    ensure!(matches!(err, SessionError::Deserialize(_)));
    Ok(())
}

#[test]
fn insufficient_device_memory_fails_construction() -> Result<()> {
    let config = SessionConfig::new(2, Precision::Full, &[3, 8, 8], &[10])?;
    let blob = ReferenceEngineBuilder::new(config.clone()).build()?;
    // Room for the input buffer (1536 bytes) but not the output buffer.
    let runtime = HostRuntime::with_capacity(1536 + 40);

    let err = InferenceSession::new(&runtime, &blob, config)
        .err()
        .context("expected allocation failure")?;
    ensure!(matches!(err, SessionError::Allocation { requested: 80, .. }));
    ensure!(runtime.arena().used() == 0, "partial allocation was kept");
    Ok(())
}

#[test]
fn manifest_precision_mismatch_is_surfaced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.engine");
    let reduced = SessionConfig::new(1, Precision::Reduced, &[3, 4, 4], &[5])?;
    let blob = ReferenceEngineBuilder::new(reduced.clone()).build()?;
    let manifest = EngineManifest::describe(
        &path,
        blob.bytes(),
        &reduced,
        PrecisionPlan::uniform(Precision::Reduced),
        Vec::new(),
    );
    blob.with_manifest(manifest).write(&path)?;

    let blob = EngineBlob::read(&path)?;
    let full = SessionConfig::new(1, Precision::Full, &[3, 4, 4], &[5])?;
    let err = InferenceSession::new(&HostRuntime::new(), &blob, full)
        .err()
        .context("expected precision mismatch")?;
    ensure!(matches!(err, SessionError::EngineMismatch(_)));

    InferenceSession::new(&HostRuntime::new(), &blob, reduced)?;
    Ok(())
}

#[test]
fn sessions_sharing_a_runtime_are_independent() -> Result<()> {
    let config = SessionConfig::new(1, Precision::Full, &[2, 2, 2], &[3])?;
    let runtime = HostRuntime::new();
    let mut a = InferenceSession::new(
        &runtime,
        &ReferenceEngineBuilder::new(config.clone()).seed(1).build()?,
        config.clone(),
    )?;
    let mut b = InferenceSession::new(
        &runtime,
        &ReferenceEngineBuilder::new(config.clone()).seed(2).build()?,
        config,
    )?;

    let ones = Tensor::from_f32(DType::F32, Shape::from_slice(&[1, 2, 2, 2]), &[1.0; 8])?;
    let out_a = a.predict(&ones)?.to_f32_vec()?;
    let out_b = b.predict(&ones)?.to_f32_vec()?;
    ensure!(out_a != out_b, "different engines should disagree");
    ensure!(a.predict(&ones)?.to_f32_vec()? == out_a);

    a.close();
    ensure!(a.state() == SessionState::Closed);
    ensure!(b.predict(&ones)?.to_f32_vec()? == out_b);
    Ok(())
}
