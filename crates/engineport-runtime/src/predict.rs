use anyhow::Result;
use engineport_core::{InferenceSession, Runtime, Tensor};

/// Anything the harness can time: a synchronous batch-in, batch-out call.
pub trait Predict {
    fn name(&self) -> &str;
    fn batch_size(&self) -> usize;
    fn predict(&mut self, input: &Tensor) -> Result<Tensor>;
}

impl<R: Runtime> Predict for InferenceSession<R> {
    fn name(&self) -> &str {
        self.runtime_name()
    }

    fn batch_size(&self) -> usize {
        self.config().batch_size()
    }

    fn predict(&mut self, input: &Tensor) -> Result<Tensor> {
        Ok(InferenceSession::predict(self, input)?)
    }
}
