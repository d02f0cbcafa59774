use engineport_core::{EngineBlob, SessionConfig, SessionError, SessionResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::format::{ReferencePlan, MAX_RANK};

/// Produces reference engine blobs with deterministic parameters for a session config.
pub struct ReferenceEngineBuilder {
    config: SessionConfig,
    seed: u64,
}

impl ReferenceEngineBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self { config, seed: 0 }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn plan(&self) -> SessionResult<ReferencePlan> {
        if self.config.output_shape().rank() != 1 {
            return Err(SessionError::InvalidConfig(format!(
                "reference engines produce rank-1 outputs, got {}",
                self.config.output_shape()
            )));
        }

        let batch = self.config.batch_size();
        let shapes = [self.config.input_shape(), self.config.output_shape()];
        if batch > u32::MAX as usize {
            return Err(SessionError::InvalidConfig(format!(
                "batch {batch} does not fit a reference engine header"
            )));
        }
        for shape in shapes {
            if shape.rank() > MAX_RANK || shape.dims().iter().any(|&d| d > u32::MAX as usize) {
                return Err(SessionError::InvalidConfig(format!(
                    "shape {shape} does not fit a reference engine header"
                )));
            }
        }

        let channels = self.config.input_shape().dims()[0];
        let classes = self.config.output_shape().dims()[0];
        let weight_count = classes.checked_mul(channels).ok_or_else(|| {
            SessionError::InvalidConfig(format!("{classes} x {channels} weights overflow"))
        })?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let weights = (0..weight_count)
            .map(|_| rng.gen_range(-0.05f32..0.05))
            .collect();
        let bias = (0..classes).map(|_| rng.gen_range(-0.1f32..0.1)).collect();

        Ok(ReferencePlan {
            precision: self.config.precision(),
            batch_size: self.config.batch_size(),
            input_shape: self.config.input_shape().clone(),
            output_shape: self.config.output_shape().clone(),
            weights,
            bias,
        })
    }

    pub fn build(&self) -> SessionResult<EngineBlob> {
        let bytes = self.plan()?.encode();
        debug!(
            bytes = bytes.len(),
            batch = self.config.batch_size(),
            seed = self.seed,
            "reference engine built"
        );
        Ok(EngineBlob::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use engineport_core::Precision;

    use super::*;

    #[test]
    fn same_seed_gives_same_blob() {
        let config = SessionConfig::new(2, Precision::Full, &[3, 4, 4], &[5]).unwrap();
        let a = ReferenceEngineBuilder::new(config.clone()).seed(7).build().unwrap();
        let b = ReferenceEngineBuilder::new(config).seed(7).build().unwrap();
        assert_eq!(a.bytes(), b.bytes());
    }

    #[test]
    fn values_beyond_the_header_width_are_rejected() {
        let wide_batch = SessionConfig::new(1 << 33, Precision::Full, &[1], &[1]).unwrap();
        assert!(matches!(
            ReferenceEngineBuilder::new(wide_batch).plan(),
            Err(SessionError::InvalidConfig(_))
        ));

        let wide_dim = SessionConfig::new(1, Precision::Full, &[1 << 33], &[1]).unwrap();
        assert!(matches!(
            ReferenceEngineBuilder::new(wide_dim).plan(),
            Err(SessionError::InvalidConfig(_))
        ));

        let deep = SessionConfig::new(1, Precision::Full, &[1; 9], &[1]).unwrap();
        assert!(ReferenceEngineBuilder::new(deep).plan().is_err());
    }
}
