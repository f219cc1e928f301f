use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::{debug, warn};

use super::CtcEngine;
use crate::{
    buffer::{CtcBatch, GradsViewMut, ProbsView, SequenceRef},
    error::{CtcError, Result},
    label::{can_skip, fill_extended, is_feasible},
    numeric::{log_plus, nll_gradient},
    options::{ComputeLocation, CtcOptions, ProbabilityScale},
    workspace::{check_workspace, cpu_workspace_size, BatchShape, CpuLayout},
};

/// Thread-parallel engine: every sequence is one unit of work with its own
/// workspace slice and its own output slots.
#[derive(Clone, Debug)]
pub struct CpuCtc {
    blank: usize,
    num_threads: usize,
    scale: ProbabilityScale,
}

/// Disjoint slice of everything one worker writes.
struct SequenceJob<'a> {
    seq: SequenceRef<'a>,
    cost: &'a mut f32,
    workspace: &'a mut [f32],
    grads: Option<Vec<&'a mut [f32]>>,
}

impl CpuCtc {
    pub fn new(blank: usize, num_threads: usize, scale: ProbabilityScale) -> Self {
        Self {
            blank,
            num_threads,
            scale,
        }
    }

    pub fn from_options(options: &CtcOptions) -> Self {
        Self::new(options.blank_label, options.num_threads, options.scale)
    }

    fn run(&self, probs: ProbsView<'_>, jobs: Vec<SequenceJob<'_>>) -> Result<()> {
        let work = move || {
            jobs.into_par_iter()
                .for_each(|job| self.compute_sequence(probs, job))
        };

        if self.num_threads == 0 {
            debug!(threads = rayon::current_num_threads(), "running ctc on the global pool");
            work();
        } else {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.num_threads)
                .build()?;
            debug!(threads = self.num_threads, "running ctc on a dedicated pool");
            pool.install(work);
        }

        Ok(())
    }

    fn compute_sequence(&self, probs: ProbsView<'_>, job: SequenceJob<'_>) {
        let SequenceJob {
            seq,
            cost,
            workspace,
            grads,
        } = job;
        let layout = CpuLayout::new(seq.labels.len(), seq.input_len, probs.alphabet_size());
        let (extended, rest) = workspace.split_at_mut(layout.extended_len);
        let (alphas, rest) = rest.split_at_mut(layout.alphas_len());
        let (betas, class_sums) = rest.split_at_mut(layout.extended_len);

        let extended: &mut [u32] = bytemuck::cast_slice_mut(extended);
        fill_extended(seq.labels, self.blank, extended);
        let extended: &[u32] = extended;

        let log_likelihood = if !is_feasible(seq.labels, seq.input_len) {
            f32::NEG_INFINITY
        } else if seq.input_len == 0 {
            // nothing to emit and nothing to align
            0.0
        } else {
            self.compute_alphas(probs, seq, extended, alphas)
        };

        let scored = log_likelihood > f32::NEG_INFINITY;
        if scored {
            *cost = -log_likelihood;
        } else {
            warn!(
                sequence = seq.index,
                label_len = seq.labels.len(),
                input_len = seq.input_len,
                "label sequence cannot be aligned, cost is infinite"
            );
            *cost = f32::INFINITY;
        }

        if let Some(mut rows) = grads {
            if scored && seq.input_len > 0 {
                self.compute_betas_and_grad(
                    probs,
                    seq,
                    extended,
                    alphas,
                    betas,
                    class_sums,
                    &mut rows[..seq.input_len],
                    log_likelihood,
                );
            } else {
                rows.iter_mut().for_each(|row| row.fill(0.0));
            }
            rows.iter_mut()
                .skip(seq.input_len)
                .for_each(|row| row.fill(0.0));
        }
    }

    /// Fills the table of pre-emission log-alphas, `log(alpha[t][s] / p)`
    /// for the emission `p` of position `s` at `t`, and returns the
    /// log-likelihood.
    fn compute_alphas(
        &self,
        probs: ProbsView<'_>,
        seq: SequenceRef<'_>,
        extended: &[u32],
        alphas: &mut [f32],
    ) -> f32 {
        let s_len = extended.len();
        let n = seq.index;
        let log_prob = |t: usize, s: usize| self.scale.to_log(probs.get(t, n, extended[s] as usize));

        alphas.fill(f32::NEG_INFINITY);
        alphas[..s_len.min(2)].fill(0.0);

        for t in 1..seq.input_len {
            let (prev, cur) = alphas[(t - 1) * s_len..(t + 1) * s_len].split_at_mut(s_len);
            let alpha = |s: usize| prev[s] + log_prob(t - 1, s);
            for s in 0..s_len {
                let mut sum = alpha(s);
                if s > 0 {
                    sum = log_plus(sum, alpha(s - 1));
                }
                if can_skip(extended, s, self.blank) {
                    sum = log_plus(sum, alpha(s - 2));
                }
                cur[s] = sum;
            }
        }

        let last = seq.input_len - 1;
        let last_row = &alphas[last * s_len..];
        let alpha = |s: usize| last_row[s] + log_prob(last, s);
        if s_len > 1 {
            log_plus(alpha(s_len - 1), alpha(s_len - 2))
        } else {
            alpha(0)
        }
    }

    /// Runs the beta recursion backwards in a single row and reduces
    /// `alpha_hat * beta_hat` per class, which is `dP / dp[t][c]`, into the
    /// gradient of every valid timestep. The row holds betas without the
    /// emission at `t`.
    #[allow(clippy::too_many_arguments)]
    fn compute_betas_and_grad(
        &self,
        probs: ProbsView<'_>,
        seq: SequenceRef<'_>,
        extended: &[u32],
        alphas: &[f32],
        betas: &mut [f32],
        class_sums: &mut [f32],
        rows: &mut [&mut [f32]],
        log_likelihood: f32,
    ) {
        let s_len = extended.len();
        let n = seq.index;
        let log_prob = |t: usize, s: usize| self.scale.to_log(probs.get(t, n, extended[s] as usize));

        betas.fill(f32::NEG_INFINITY);
        betas[s_len.saturating_sub(2)..].fill(0.0);

        for t in (0..seq.input_len).rev() {
            class_sums.fill(f32::NEG_INFINITY);
            let alpha_row = &alphas[t * s_len..(t + 1) * s_len];
            for s in 0..s_len {
                let c = extended[s] as usize;
                class_sums[c] = log_plus(class_sums[c], alpha_row[s] + betas[s]);
            }

            let frame = probs.frame(t, n);
            for ((grad, &p), &class_sum) in rows[t].iter_mut().zip(frame).zip(class_sums.iter()) {
                let log_jacobian = self.scale.log_jacobian(self.scale.to_log(p));
                *grad = nll_gradient(class_sum, log_likelihood, log_jacobian);
            }

            if t > 0 {
                for s in 0..s_len {
                    betas[s] += log_prob(t, s);
                }
                // ascending s only overwrites entries already consumed
                for s in 0..s_len {
                    let mut sum = betas[s];
                    if s + 1 < s_len {
                        sum = log_plus(sum, betas[s + 1]);
                    }
                    if s + 2 < s_len && can_skip(extended, s + 2, self.blank) {
                        sum = log_plus(sum, betas[s + 2]);
                    }
                    betas[s] = sum;
                }
            }
        }
    }
}

impl CtcEngine for CpuCtc {
    fn location(&self) -> ComputeLocation {
        ComputeLocation::Cpu
    }

    fn blank_label(&self) -> usize {
        self.blank
    }

    fn workspace_size(&self, shape: &BatchShape, alphabet_size: usize) -> Result<usize> {
        cpu_workspace_size(shape, alphabet_size)
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
        check_workspace(
            workspace,
            self.workspace_size(batch.labels.shape(), alphabet_size)?,
        )?;

        let mut rest = workspace;
        let mut slices = Vec::with_capacity(minibatch);
        for seq in batch.labels.sequences() {
            let total = CpuLayout::new(seq.labels.len(), seq.input_len, alphabet_size).total()?;
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(total);
            slices.push(head);
            rest = tail;
        }

        let mut grads = grads;
        let grad_rows: Vec<Option<Vec<&mut [f32]>>> = match grads.as_mut() {
            Some(grads) => grads.sequence_rows().into_iter().map(Some).collect(),
            None => (0..minibatch).map(|_| None).collect(),
        };

        let jobs = batch
            .labels
            .sequences()
            .zip(costs.iter_mut())
            .zip(slices)
            .zip(grad_rows)
            .map(|(((seq, cost), workspace), grads)| SequenceJob {
                seq,
                cost,
                workspace,
                grads,
            })
            .collect();

        self.run(batch.probs, jobs)
    }
}
