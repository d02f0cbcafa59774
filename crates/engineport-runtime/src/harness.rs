use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use engineport_core::Tensor;
use serde::Serialize;
use tracing::{debug, info};

use crate::{LatencyStats, Predict};

const PROGRESS_EVERY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BenchPolicy {
    pub warmup: usize,
    pub iterations: usize,
}

impl Default for BenchPolicy {
    fn default() -> Self {
        Self {
            warmup: 50,
            iterations: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BenchReport {
    pub runtime: String,
    pub batch_size: usize,
    pub dtype: String,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub warmup: usize,
    pub stats: LatencyStats,
    /// Samples per second at the mean batch latency.
    pub throughput: f64,
    pub non_finite_outputs: usize,
}

pub struct Benchmark {
    policy: BenchPolicy,
    check_outputs: bool,
}

impl Benchmark {
    pub fn new(policy: BenchPolicy) -> Self {
        Self {
            policy,
            check_outputs: true,
        }
    }

    /// Skips the per-call NaN/Inf scan of outputs.
    pub fn without_output_checks(mut self) -> Self {
        self.check_outputs = false;
        self
    }

    pub fn policy(&self) -> BenchPolicy {
        self.policy
    }

    /// Runs the warm-up calls, then times each remaining call individually.
    pub fn run<P: Predict + ?Sized>(&self, model: &mut P, input: &Tensor) -> Result<BenchReport> {
        ensure!(
            self.policy.iterations > 0,
            "benchmark needs at least one timed iteration"
        );

        info!(
            runtime = model.name(),
            warmup = self.policy.warmup,
            iterations = self.policy.iterations,
            input = %input.shape(),
            "benchmark started"
        );

        for i in 0..self.policy.warmup {
            model
                .predict(input)
                .with_context(|| format!("warm-up call {} failed", i + 1))?;
        }

        let mut samples: Vec<Duration> = Vec::with_capacity(self.policy.iterations);
        let mut non_finite_outputs = 0;
        let mut output_shape = Vec::new();
        for i in 1..=self.policy.iterations {
            let t0 = Instant::now();
            let output = model
                .predict(input)
                .with_context(|| format!("timed call {i} failed"))?;
            samples.push(t0.elapsed());

            if self.check_outputs && !output.is_finite() {
                non_finite_outputs += 1;
            }
            if i == 1 {
                output_shape = output.shape().dims().to_vec();
            }
            if i % PROGRESS_EVERY == 0 {
                let mean_ms = samples.iter().sum::<Duration>().as_secs_f64() * 1e3 / i as f64;
                debug!(
                    "Iteration {i}/{}, avg batch time {mean_ms:.2} ms",
                    self.policy.iterations
                );
            }
        }

        let stats = LatencyStats::from_samples(&samples)?;
        let batch_size = model.batch_size();
        let throughput = if stats.mean_ms > 0.0 {
            batch_size as f64 / (stats.mean_ms / 1e3)
        } else {
            f64::INFINITY
        };

        let report = BenchReport {
            runtime: model.name().to_string(),
            batch_size,
            dtype: input.dtype().to_string(),
            input_shape: input.shape().dims().to_vec(),
            output_shape,
            warmup: self.policy.warmup,
            stats,
            throughput,
            non_finite_outputs,
        };
        info!(
            runtime = %report.runtime,
            mean_ms = report.stats.mean_ms,
            p99_ms = report.stats.p99_ms,
            throughput = report.throughput,
            "benchmark finished"
        );
        Ok(report)
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "runtime:          {}", self.runtime)?;
        writeln!(f, "input shape:      {:?} ({})", self.input_shape, self.dtype)?;
        writeln!(f, "output shape:     {:?}", self.output_shape)?;
        writeln!(f, "iterations:       {} (+{} warm-up)", s.count, self.warmup)?;
        writeln!(f, "mean batch time:  {:.3} ms ± {:.3} ms", s.mean_ms, s.std_ms)?;
        writeln!(f, "min / max:        {:.3} ms / {:.3} ms", s.min_ms, s.max_ms)?;
        writeln!(
            f,
            "p50 / p90 / p99:  {:.3} / {:.3} / {:.3} ms",
            s.p50_ms, s.p90_ms, s.p99_ms
        )?;
        write!(f, "throughput:       {:.1} samples/s", self.throughput)?;
        if self.non_finite_outputs > 0 {
            write!(
                f,
                "\nwarning:          {} outputs contained NaN or Inf",
                self.non_finite_outputs
            )?;
        }
        Ok(())
    }
}
