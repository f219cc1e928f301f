//! Kernel-parallel engine on a burn backend.
//!
//! Each timestep is one batch of tensor kernels over the whole
//! `[minibatch, max_extended_len]` lattice, so sequences and extended
//! positions advance together and the device synchronizes between
//! timesteps. Variable lengths are handled with per-sequence masks staged on
//! the host in the caller's workspace; the alpha and beta tables live on the
//! device only for the duration of the call.

use std::panic::{catch_unwind, AssertUnwindSafe};

use burn::tensor::{backend::Backend, Bool, Data, Int, Shape, Tensor};
use tracing::{debug, warn};

use super::CtcEngine;
use crate::{
    buffer::{CtcBatch, GradsViewMut, ProbsView},
    error::{CtcError, Result},
    label::{can_skip, extended_len, fill_extended, is_feasible},
    numeric::{is_log_zero, LOG_ZERO_THRESHOLD, NEG_INF},
    options::{ComputeLocation, ProbabilityScale},
    utils::tensor_ext::{log_sum_exp3, log_sum_exp_rows, shift_left, shift_right},
    workspace::{check_workspace, gpu_workspace_size, BatchShape, GpuLayout, LATTICE_PLANES},
};

// Lattice planes, each `[minibatch, max_extended_len]`.
const EXTENDED: usize = 0;
const SKIP: usize = 1;
const START: usize = 2;
const SEED: usize = 3;
const DEAD: usize = 4;
const END: usize = 5;

#[derive(Clone, Debug)]
pub struct GpuCtc<B: Backend> {
    blank: usize,
    scale: ProbabilityScale,
    device: B::Device,
}

/// Per-sequence lattice description, resident on the device.
struct Lattice<B: Backend> {
    extended: Tensor<B, 2>,
    start: Tensor<B, 2, Bool>,
    skip_blocked: Tensor<B, 2, Bool>,
    skip_back_blocked: Tensor<B, 2, Bool>,
    padding: Tensor<B, 2, Bool>,
    not_final: Tensor<B, 2, Bool>,
    seed: Tensor<B, 2>,
    dead: Tensor<B, 2>,
    end: Tensor<B, 2>,
}

struct DeviceOutput {
    log_likelihoods: Vec<f32>,
    grads: Option<Vec<f32>>,
}

impl<B: Backend> GpuCtc<B> {
    pub fn new(blank: usize, scale: ProbabilityScale, device: B::Device) -> Self {
        Self {
            blank,
            scale,
            device,
        }
    }

    /// Writes the lattice planes of every sequence into `staging`.
    ///
    /// - `EXTENDED`: class at each extended position, padded with blank
    /// - `SKIP`: 1 where `s - 2 -> s` may skip a blank
    /// - `START`: 1 where alpha may start at `t = 0`
    /// - `SEED`: last valid timestep at the two final positions, -2 elsewhere
    /// - `DEAD`: first timestep from which beta is zero at this position
    ///   (`-1` for padding)
    /// - `END`: last valid timestep of the sequence, -1 if none
    fn stage_lattice(&self, batch: &CtcBatch<'_>, layout: &GpuLayout, ready: &[bool], staging: &mut [f32]) {
        let minibatch = batch.minibatch();
        let s_max = layout.max_extended_len;
        let plane = minibatch * s_max;
        let mut extended = vec![0u32; s_max];

        for seq in batch.labels.sequences() {
            let n = seq.index;
            let s_len = extended_len(seq.labels.len());
            fill_extended(seq.labels, self.blank, &mut extended[..s_len]);
            let end = if ready[n] {
                seq.input_len as f32 - 1.0
            } else {
                -1.0
            };

            for s in 0..s_max {
                let at = |p: usize| p * plane + n * s_max + s;
                let valid = ready[n] && s < s_len;
                let is_final = valid && s + 2 >= s_len;

                staging[at(EXTENDED)] = if s < s_len {
                    extended[s] as f32
                } else {
                    self.blank as f32
                };
                staging[at(SKIP)] = if s < s_len && can_skip(&extended[..s_len], s, self.blank) {
                    1.0
                } else {
                    0.0
                };
                staging[at(START)] = if valid && s < 2 { 1.0 } else { 0.0 };
                staging[at(SEED)] = if is_final { end } else { -2.0 };
                staging[at(DEAD)] = match (valid, is_final) {
                    (false, _) => -1.0,
                    (true, false) => end,
                    (true, true) => end + 1.0,
                };
                staging[at(END)] = end;
            }
        }
    }

    fn upload_lattice(&self, staging: &[f32], minibatch: usize, s_max: usize) -> Lattice<B> {
        let planes = Tensor::<B, 3>::from_data(
            Data::new(staging.to_vec(), Shape::new([LATTICE_PLANES, minibatch, s_max])).convert(),
            &self.device,
        );
        let plane = |p: usize| {
            planes
                .clone()
                .slice([p..(p + 1), 0..minibatch, 0..s_max])
                .reshape([minibatch, s_max])
        };

        let skip = plane(SKIP);
        let dead = plane(DEAD);
        let seed = plane(SEED);

        Lattice {
            extended: plane(EXTENDED),
            start: plane(START).equal_elem(1.0),
            skip_blocked: skip.clone().equal_elem(0.0),
            skip_back_blocked: shift_left(skip, 2, 0.0).equal_elem(0.0),
            padding: dead.clone().lower_elem(0.0),
            not_final: seed.clone().lower_elem(0.0),
            seed,
            dead,
            end: plane(END),
        }
    }

    /// Pre-emission log-alphas, `log(alpha[t][s] / p[t][ext[s]])`, and the
    /// log-likelihood of every sequence.
    fn forward(&self, lattice: &Lattice<B>, emissions: &Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let [max_time, minibatch, s_max] = emissions.dims();
        let emission = |t: usize| {
            emissions
                .clone()
                .slice([t..(t + 1), 0..minibatch, 0..s_max])
                .reshape([minibatch, s_max])
        };
        let neg_inf = || Tensor::<B, 2>::full([minibatch, s_max], NEG_INF, &self.device);

        let mut hat = neg_inf().mask_fill(lattice.start.clone(), 0.0);
        let mut row = (hat.clone() + emission(0)).clamp_min(NEG_INF);
        let mut final_row = neg_inf().mask_where(lattice.end.clone().equal_elem(0.0), row.clone());
        let mut hats = Vec::with_capacity(max_time);
        hats.push(hat.reshape([1, minibatch, s_max]));

        for t in 1..max_time {
            // alpha_{t-1}(s), alpha_{t-1}(s-1), alpha_{t-1}(s-2)
            let stay = row.clone();
            let step = shift_right(row.clone(), 1, NEG_INF);
            let skip = shift_right(row, 2, NEG_INF).mask_fill(lattice.skip_blocked.clone(), NEG_INF);

            hat = log_sum_exp3(stay, step, skip)
                .clamp_min(NEG_INF)
                .mask_fill(lattice.padding.clone(), NEG_INF);
            row = (hat.clone() + emission(t)).clamp_min(NEG_INF);
            final_row = final_row.mask_where(lattice.end.clone().equal_elem(t as f32), row.clone());
            hats.push(hat.reshape([1, minibatch, s_max]));
        }

        let log_likelihood =
            log_sum_exp_rows(final_row.mask_fill(lattice.not_final.clone(), NEG_INF));

        (Tensor::cat(hats, 0), log_likelihood)
    }

    /// Log-betas without the emission at `t`, `log(beta[t][s] / p[t][ext[s]])`.
    fn backward(&self, lattice: &Lattice<B>, emissions: &Tensor<B, 3>) -> Tensor<B, 3> {
        let [max_time, minibatch, s_max] = emissions.dims();
        let emission = |t: usize| {
            emissions
                .clone()
                .slice([t..(t + 1), 0..minibatch, 0..s_max])
                .reshape([minibatch, s_max])
        };

        let mut next = Tensor::<B, 2>::full([minibatch, s_max], NEG_INF, &self.device);
        let mut hats = Vec::with_capacity(max_time);

        for t in (0..max_time).rev() {
            // beta_{t+1}(s), beta_{t+1}(s+1), beta_{t+1}(s+2)
            let stay = next.clone();
            let step = shift_left(next.clone(), 1, NEG_INF);
            let skip =
                shift_left(next, 2, NEG_INF).mask_fill(lattice.skip_back_blocked.clone(), NEG_INF);

            let hat = log_sum_exp3(stay, step, skip)
                .clamp_min(NEG_INF)
                .mask_fill(lattice.seed.clone().equal_elem(t as f32), 0.0)
                .mask_fill(lattice.dead.clone().lower_equal_elem(t as f32), NEG_INF);
            next = (hat.clone() + emission(t)).clamp_min(NEG_INF);
            hats.push(hat.reshape([1, minibatch, s_max]));
        }
        hats.reverse();

        Tensor::cat(hats, 0)
    }

    /// Reduces `alpha_hat + beta_hat` per class with a one-hot matmul, which
    /// is `dP / dp[t][c]` in the log domain, and turns it into the gradient
    /// of every cost w.r.t. its inputs.
    fn gradient(
        &self,
        lattice: &Lattice<B>,
        log_probs: Tensor<B, 3>,
        log_alphas: Tensor<B, 3>,
        log_betas: Tensor<B, 3>,
        log_likelihood: Tensor<B, 1>,
    ) -> Tensor<B, 3> {
        let [max_time, minibatch, alphabet_size] = log_probs.dims();
        let [_, _, s_max] = log_alphas.dims();

        let log_alpha_beta = log_alphas + log_betas;
        let max = log_alpha_beta.clone().max_dim(2);
        let weights = (log_alpha_beta - max.clone().repeat(2, s_max)).exp();

        let classes: Vec<f32> = (0..alphabet_size).map(|c| c as f32).collect();
        let classes = Tensor::<B, 1>::from_data(
            Data::new(classes, Shape::new([alphabet_size])).convert(),
            &self.device,
        )
        .reshape([1, 1, alphabet_size])
        .repeat(0, minibatch)
        .repeat(1, s_max);
        // [minibatch, s_max, alphabet_size]
        let one_hot = lattice
            .extended
            .clone()
            .reshape([minibatch, s_max, 1])
            .repeat(2, alphabet_size)
            .equal(classes)
            .float();

        let class_sums = weights.swap_dims(0, 1).matmul(one_hot).swap_dims(0, 1);
        let log_class_sums = class_sums.log() + max.repeat(2, alphabet_size);
        let log_likelihood = log_likelihood
            .reshape([1, minibatch, 1])
            .repeat(0, max_time)
            .repeat(2, alphabet_size);

        let exponent = log_class_sums.clone() - log_likelihood;
        let grad = match self.scale {
            ProbabilityScale::Linear => exponent.exp().neg(),
            // d/dlog p = p * d/dp
            ProbabilityScale::Log => (exponent + log_probs.clone())
                .exp()
                .neg()
                .mask_fill(log_probs.lower_equal_elem(LOG_ZERO_THRESHOLD), 0.0),
        };

        grad.mask_fill(log_class_sums.lower_equal_elem(LOG_ZERO_THRESHOLD), 0.0)
    }

    fn run_kernels(
        &self,
        probs: ProbsView<'_>,
        staging: &[f32],
        layout: &GpuLayout,
        with_grads: bool,
    ) -> DeviceOutput {
        let [_, minibatch, alphabet_size] = probs.dims();
        let max_time = layout.max_input_len;
        let s_max = layout.max_extended_len;

        let input = Tensor::<B, 3>::from_data(
            Data::new(
                probs.as_slice()[..max_time * minibatch * alphabet_size].to_vec(),
                Shape::new([max_time, minibatch, alphabet_size]),
            )
            .convert(),
            &self.device,
        );
        let log_probs = match self.scale {
            ProbabilityScale::Linear => input.log(),
            ProbabilityScale::Log => input,
        }
        .clamp_min(NEG_INF);

        let lattice = self.upload_lattice(staging, minibatch, s_max);
        let indices: Tensor<B, 3, Int> = lattice
            .extended
            .clone()
            .int()
            .reshape([1, minibatch, s_max])
            .repeat(0, max_time);
        // log-probability of the class at every extended position
        let emissions = log_probs.clone().gather(2, indices);

        let (log_alphas, log_likelihood) = self.forward(&lattice, &emissions);
        let log_likelihoods = log_likelihood.clone().into_data().convert::<f32>().value;

        let grads = with_grads.then(|| {
            let log_betas = self.backward(&lattice, &emissions);
            self.gradient(&lattice, log_probs, log_alphas, log_betas, log_likelihood)
                .into_data()
                .convert::<f32>()
                .value
        });

        DeviceOutput {
            log_likelihoods,
            grads,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "device kernel panicked".to_string()
    }
}

impl<B: Backend> CtcEngine for GpuCtc<B> {
    fn location(&self) -> ComputeLocation {
        ComputeLocation::Gpu
    }

    fn blank_label(&self) -> usize {
        self.blank
    }

    fn workspace_size(&self, shape: &BatchShape, alphabet_size: usize) -> Result<usize> {
        gpu_workspace_size(shape, alphabet_size)
    }

    fn compute(
        &self,
        batch: &CtcBatch<'_>,
        costs: &mut [f32],
        grads: Option<GradsViewMut<'_>>,
        workspace: &mut [f32],
    ) -> Result<()> {
        let minibatch = batch.minibatch();
        let alphabet_size = batch.alphabet_size();
        if costs.len() != minibatch {
            return Err(CtcError::ShapeMismatch {
                what: "costs",
                expected: minibatch,
                actual: costs.len(),
            });
        }
        let shape = batch.labels.shape();
        check_workspace(workspace, self.workspace_size(shape, alphabet_size)?)?;

        let layout = GpuLayout::new(shape, alphabet_size);
        // sequences whose lattice has at least one timestep to run on
        let ready: Vec<bool> = batch
            .labels
            .sequences()
            .map(|seq| seq.input_len > 0 && is_feasible(seq.labels, seq.input_len))
            .collect();

        let output = if ready.iter().any(|&r| r) {
            // the whole workspace is the staging area
            let staging = workspace;
            self.stage_lattice(batch, &layout, &ready, staging);
            debug!(
                minibatch,
                max_time = layout.max_input_len,
                max_extended_len = layout.max_extended_len,
                "launching ctc kernels"
            );
            let staging: &[f32] = staging;
            let output = catch_unwind(AssertUnwindSafe(|| {
                self.run_kernels(batch.probs, staging, &layout, grads.is_some())
            }))
            .map_err(|payload| CtcError::Execution(panic_message(payload)))?;
            Some(output)
        } else {
            None
        };

        let mut scored = vec![false; minibatch];
        for seq in batch.labels.sequences() {
            let n = seq.index;
            let log_likelihood = match &output {
                Some(output) if ready[n] => output.log_likelihoods[n],
                _ if seq.input_len == 0 && seq.labels.is_empty() => 0.0,
                _ => f32::NEG_INFINITY,
            };

            if is_log_zero(log_likelihood) || log_likelihood.is_nan() {
                warn!(
                    sequence = n,
                    label_len = seq.labels.len(),
                    input_len = seq.input_len,
                    "label sequence cannot be aligned, cost is infinite"
                );
                costs[n] = f32::INFINITY;
            } else {
                costs[n] = -log_likelihood;
                scored[n] = ready[n];
            }
        }

        if let Some(mut grads) = grads {
            let device_grads = output.and_then(|output| output.grads);
            let max_time = layout.max_input_len;
            for (n, rows) in grads.sequence_rows().into_iter().enumerate() {
                let input_len = batch.labels.sequence(n).input_len;
                for (t, row) in rows.into_iter().enumerate() {
                    match &device_grads {
                        Some(device_grads) if scored[n] && t < input_len && t < max_time => {
                            let start = (t * minibatch + n) * alphabet_size;
                            row.copy_from_slice(&device_grads[start..start + alphabet_size]);
                        }
                        _ => row.fill(0.0),
                    }
                }
            }
        }

        Ok(())
    }
}
