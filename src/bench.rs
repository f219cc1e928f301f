use std::{fs, time::Instant};

use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    dataset::{SyntheticBatch, SyntheticDataset},
    dispatch::compute_ctc_loss_with,
    engine::{self, CtcEngine},
    error::{CtcError, Result},
    options::{ComputeLocation, CtcOptions},
    parse_config::BenchConfig,
};

/// Relative difference above which a cross-check is reported.
pub const CROSS_CHECK_TOLERANCE: f32 = 1e-3;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub total_cost: f32,
    pub infeasible: usize,
    pub elapsed_ms: f64,
    /// Largest relative difference to the other engine, costs and gradients.
    pub cross_check: Option<f32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub loc: ComputeLocation,
    pub minibatch: usize,
    pub max_time: usize,
    pub alphabet_size: usize,
    pub iterations: Vec<IterationReport>,
    pub mean_elapsed_ms: f64,
}

struct Output {
    costs: Vec<f32>,
    grads: Vec<f32>,
}

fn run_engine(engine: &dyn CtcEngine, batch: &SyntheticBatch) -> Result<Output> {
    let mut costs = vec![0.0; batch.minibatch];
    let mut grads = vec![0.0; batch.probs.len()];
    compute_ctc_loss_with(
        engine,
        &batch.probs,
        Some(&mut grads),
        &batch.labels,
        &batch.label_sizes,
        &batch.input_sizes,
        batch.alphabet_size,
        batch.minibatch,
        &mut costs,
        None,
    )?;

    Ok(Output { costs, grads })
}

fn max_relative_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .filter(|(x, y)| x.is_finite() || y.is_finite())
        .map(|(x, y)| (x - y).abs() / x.abs().max(y.abs()).max(1.0))
        .fold(0.0, f32::max)
}

pub fn run(config: &BenchConfig) -> Result<BenchReport> {
    let start = Instant::now();
    let options = config.options();
    let engine = engine::from_options(&options);
    let reference = config.cross_check.then(|| {
        let loc = match options.loc {
            ComputeLocation::Cpu => ComputeLocation::Gpu,
            ComputeLocation::Gpu => ComputeLocation::Cpu,
        };
        engine::from_options(&CtcOptions { loc, ..options.clone() })
    });

    let dataset = SyntheticDataset::new(
        config.batch_config(),
        config.scale,
        config.random_seed,
        config.iterations,
    )?;

    info!(
        "Setup completed, took {} seconds.",
        start.elapsed().as_secs_f64()
    );

    let mut iterations = Vec::with_capacity(dataset.len());
    for iteration in 0..dataset.len() {
        let batch = dataset.get(iteration).ok_or_else(|| {
            CtcError::InvalidValue(format!("synthetic batch {iteration} could not be drawn"))
        })?;

        let start = Instant::now();
        let output = run_engine(engine.as_ref(), &batch)?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;

        let cross_check = match reference.as_deref() {
            Some(reference) => {
                let expected = run_engine(reference, &batch)?;
                let diff = max_relative_diff(&output.costs, &expected.costs)
                    .max(max_relative_diff(&output.grads, &expected.grads));
                if diff > CROSS_CHECK_TOLERANCE {
                    warn!(iteration, diff, "engines disagree");
                }
                Some(diff)
            }
            None => None,
        };

        let infeasible = output.costs.iter().filter(|c| c.is_infinite()).count();
        let total_cost = output.costs.iter().filter(|c| c.is_finite()).sum::<f32>();
        info!(
            "[Iteration {}] Cost {:.5} ({} infeasible), {:.3} ms",
            iteration, total_cost, infeasible, elapsed_ms
        );

        iterations.push(IterationReport {
            iteration,
            total_cost,
            infeasible,
            elapsed_ms,
            cross_check,
        });
    }

    let mean_elapsed_ms = if iterations.is_empty() {
        0.0
    } else {
        iterations.iter().map(|it| it.elapsed_ms).sum::<f64>() / iterations.len() as f64
    };
    let report = BenchReport {
        loc: config.loc,
        minibatch: config.minibatch,
        max_time: config.max_time,
        alphabet_size: config.alphabet_size,
        iterations,
        mean_elapsed_ms,
    };

    if let Some(path) = &config.report_path {
        fs::write(path, serde_json::to_string_pretty(&report)?)?;
        info!("{} written.", path);
    }

    Ok(report)
}
