//! Entry points over flat caller buffers.
//!
//! Buffers follow the usual CTC binding conventions:
//!
//! - `probs`: `[max_time, minibatch, alphabet_size]`, row-major
//! - `labels`: every label sequence concatenated, blank excluded
//! - `label_sizes`, `input_sizes`: one entry per sequence
//! - `costs`: one negative log-likelihood per sequence
//! - `grads`: same shape as `probs`

use tracing::{debug, debug_span};

use crate::{
    buffer::{CtcBatch, GradsViewMut, LabelBatch, ProbsView},
    engine::{self, CtcEngine},
    error::{CtcError, Result},
    options::CtcOptions,
    workspace::{self, check_workspace, BatchShape, Workspace},
};

/// Number of `f32` scratch elements [`compute_ctc_loss`] needs for this batch
/// at `options.loc`.
pub fn get_workspace_size(
    label_sizes: &[i32],
    input_sizes: &[i32],
    alphabet_size: usize,
    minibatch: usize,
    options: &CtcOptions,
) -> Result<usize> {
    let shape = BatchShape::new(label_sizes, input_sizes, minibatch)?;

    workspace::workspace_size(&shape, alphabet_size, options.blank_label, options.loc)
}

/// Computes the CTC cost of every sequence and, when `grads` is given, the
/// gradient of every cost w.r.t. `probs`.
///
/// With `workspace: None` a scratch region is acquired for the duration of
/// the call. A caller-managed workspace must be exactly
/// [`get_workspace_size`] elements long.
#[allow(clippy::too_many_arguments)]
pub fn compute_ctc_loss(
    probs: &[f32],
    grads: Option<&mut [f32]>,
    labels: &[i32],
    label_sizes: &[i32],
    input_sizes: &[i32],
    alphabet_size: usize,
    minibatch: usize,
    costs: &mut [f32],
    workspace: Option<&mut [f32]>,
    options: &CtcOptions,
) -> Result<()> {
    check_blank(options.blank_label, alphabet_size)?;
    let engine = engine::from_options(options);

    compute_ctc_loss_with(
        engine.as_ref(),
        probs,
        grads,
        labels,
        label_sizes,
        input_sizes,
        alphabet_size,
        minibatch,
        costs,
        workspace,
    )
}

/// [`compute_ctc_loss`] on an engine built by the caller, so one engine
/// and its device can serve many batches.
#[allow(clippy::too_many_arguments)]
pub fn compute_ctc_loss_with(
    engine: &dyn CtcEngine,
    probs: &[f32],
    grads: Option<&mut [f32]>,
    labels: &[i32],
    label_sizes: &[i32],
    input_sizes: &[i32],
    alphabet_size: usize,
    minibatch: usize,
    costs: &mut [f32],
    workspace: Option<&mut [f32]>,
) -> Result<()> {
    let blank = engine.blank_label();
    check_blank(blank, alphabet_size)?;

    let span = debug_span!("ctc", loc = ?engine.location(), minibatch, alphabet_size);
    let _enter = span.enter();

    let shape = BatchShape::new(label_sizes, input_sizes, minibatch)?;
    let probs = ProbsView::new(probs, minibatch, alphabet_size)?;
    let labels = LabelBatch::new(labels, shape, alphabet_size, blank)?;
    let batch = CtcBatch::new(probs, labels)?;
    let grads = grads
        .map(|grads| GradsViewMut::new(grads, probs.dims()))
        .transpose()?;

    let size = engine.workspace_size(batch.labels.shape(), alphabet_size)?;
    debug!(
        max_time = probs.max_time(),
        workspace = size,
        with_grads = grads.is_some(),
        "computing ctc loss"
    );

    match workspace {
        Some(workspace) => {
            check_workspace(workspace, size)?;
            engine.compute(&batch, costs, grads, workspace)
        }
        None => {
            let mut scoped = Workspace::acquire(size)?;
            engine.compute(&batch, costs, grads, scoped.as_mut_slice())
        }
    }
}

fn check_blank(blank: usize, alphabet_size: usize) -> Result<()> {
    if alphabet_size == 0 {
        return Err(CtcError::InvalidValue("alphabet size must be positive".into()));
    }
    if blank >= alphabet_size {
        return Err(CtcError::BlankOutOfRange {
            blank,
            alphabet_size,
        });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use burn::backend::NdArray;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        engine::GpuCtc,
        error::CtcStatus,
        options::{ComputeLocation, ProbabilityScale},
    };

    const GUARD: usize = 8;
    const SENTINEL: f32 = 1234.5;

    fn random_probs(seed: u64, len: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(0.05f32..1.0)).collect()
    }

    /// Column `n` of a `[max_time, minibatch, alphabet_size]` buffer.
    fn column(data: &[f32], minibatch: usize, alphabet_size: usize, n: usize) -> Vec<f32> {
        data.chunks(alphabet_size)
            .skip(n)
            .step_by(minibatch)
            .flatten()
            .copied()
            .collect()
    }

    #[test]
    fn test_fixture_with_scoped_workspace() {
        let mut costs = [0.0];
        let mut grads = [0.0; 4];
        compute_ctc_loss(
            &[0.5; 4],
            Some(&mut grads),
            &[0],
            &[1],
            &[2],
            2,
            1,
            &mut costs,
            None,
            &CtcOptions::cpu(1),
        )
        .unwrap();

        assert!((costs[0] - (4.0f32 / 3.0).ln()).abs() < 1e-6);
        assert!((grads[0] + 4.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_workspace_guard_regions_untouched() {
        let (alphabet_size, minibatch) = (5, 3);
        let label_sizes = [2, 0, 3];
        let input_sizes = [4, 2, 6];
        let labels = [1, 2, 4, 4, 3];
        let probs = random_probs(1, 6 * minibatch * alphabet_size);
        let options = CtcOptions::cpu(0);

        let size =
            get_workspace_size(&label_sizes, &input_sizes, alphabet_size, minibatch, &options)
                .unwrap();
        let mut buffer = vec![SENTINEL; size + 2 * GUARD];
        let mut costs = vec![0.0; minibatch];
        let mut grads = vec![0.0; probs.len()];
        compute_ctc_loss(
            &probs,
            Some(&mut grads),
            &labels,
            &label_sizes,
            &input_sizes,
            alphabet_size,
            minibatch,
            &mut costs,
            Some(&mut buffer[GUARD..GUARD + size]),
            &options,
        )
        .unwrap();

        assert!(buffer[..GUARD].iter().all(|&v| v == SENTINEL));
        assert!(buffer[GUARD + size..].iter().all(|&v| v == SENTINEL));
        assert!(costs.iter().all(|c| c.is_finite() && *c >= 0.0));
    }

    #[test]
    fn test_gpu_workspace_guard_regions_untouched() {
        let (alphabet_size, minibatch) = (4, 2);
        let label_sizes = [2, 1];
        let input_sizes = [3, 2];
        let probs = random_probs(2, 3 * minibatch * alphabet_size);
        let engine = GpuCtc::<NdArray>::new(0, ProbabilityScale::Linear, Default::default());

        let shape = BatchShape::new(&label_sizes, &input_sizes, minibatch).unwrap();
        let size = engine.workspace_size(&shape, alphabet_size).unwrap();
        let mut buffer = vec![SENTINEL; size + 2 * GUARD];
        let mut costs = vec![0.0; minibatch];
        compute_ctc_loss_with(
            &engine,
            &probs,
            None,
            &[1, 2, 3],
            &label_sizes,
            &input_sizes,
            alphabet_size,
            minibatch,
            &mut costs,
            Some(&mut buffer[GUARD..GUARD + size]),
        )
        .unwrap();

        assert!(buffer[..GUARD].iter().all(|&v| v == SENTINEL));
        assert!(buffer[GUARD + size..].iter().all(|&v| v == SENTINEL));
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let mut costs = [0.0];
        let run = |options: &CtcOptions, minibatch: usize, costs: &mut [f32]| {
            compute_ctc_loss(
                &[0.5; 4], None, &[0], &[1], &[2], 2, minibatch, costs, None, options,
            )
        };

        let err = run(&CtcOptions::cpu(2), 1, &mut costs).unwrap_err();
        assert!(matches!(err, CtcError::BlankOutOfRange { .. }));
        assert_eq!(err.status(), CtcStatus::InvalidValue);

        let err = run(&CtcOptions::cpu(1), 0, &mut costs).unwrap_err();
        assert!(matches!(err, CtcError::EmptyMinibatch));

        let mut workspace = vec![0.0; 3];
        let err = compute_ctc_loss(
            &[0.5; 4],
            None,
            &[0],
            &[1],
            &[2],
            2,
            1,
            &mut costs,
            Some(&mut workspace),
            &CtcOptions::cpu(1),
        )
        .unwrap_err();
        assert!(matches!(err, CtcError::WorkspaceSize { .. }));
    }

    #[test]
    fn test_gpu_options_size_differs_from_cpu() {
        let cpu = CtcOptions::cpu(0);
        let gpu = CtcOptions {
            loc: ComputeLocation::Gpu,
            ..CtcOptions::cpu(0)
        };
        let cpu_size = get_workspace_size(&[2, 1], &[3, 5], 4, 2, &cpu).unwrap();
        let gpu_size = get_workspace_size(&[2, 1], &[3, 5], 4, 2, &gpu).unwrap();

        // 6 staged planes of N = 2 by S_max = 5
        assert_eq!(gpu_size, 6 * 2 * 5);
        // S = 5, T = 3 and S = 3, T = 5
        assert_eq!(cpu_size, (5 + 15 + 5 + 4) + (3 + 15 + 3 + 4));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn per_sequence_calls_match_batched_call_and_score_only(
            seed in any::<u64>(),
            sizes in prop::collection::vec((0usize..4, 0usize..7), 1..5),
        ) {
            let (alphabet_size, blank) = (5, 0);
            let minibatch = sizes.len();
            let max_time = sizes.iter().map(|&(_, t)| t).max().unwrap_or(0).max(1);
            let mut rng = StdRng::seed_from_u64(seed);
            let label_sizes: Vec<i32> = sizes.iter().map(|&(l, _)| l as i32).collect();
            let input_sizes: Vec<i32> = sizes.iter().map(|&(_, t)| t as i32).collect();
            let labels: Vec<i32> = (0..label_sizes.iter().sum::<i32>())
                .map(|_| rng.gen_range(1..alphabet_size as i32))
                .collect();
            let probs = random_probs(seed, max_time * minibatch * alphabet_size);
            let options = CtcOptions::cpu(blank).with_num_threads(2);

            let mut costs = vec![0.0; minibatch];
            let mut grads = vec![0.0; probs.len()];
            compute_ctc_loss(
                &probs, Some(&mut grads), &labels, &label_sizes, &input_sizes,
                alphabet_size, minibatch, &mut costs, None, &options,
            ).unwrap();

            let mut scores = vec![0.0; minibatch];
            compute_ctc_loss(
                &probs, None, &labels, &label_sizes, &input_sizes,
                alphabet_size, minibatch, &mut scores, None, &options,
            ).unwrap();
            prop_assert_eq!(&scores, &costs);

            let mut offset = 0;
            for n in 0..minibatch {
                let label_len = label_sizes[n] as usize;
                let own_labels = &labels[offset..offset + label_len];
                offset += label_len;
                let own_probs = column(&probs, minibatch, alphabet_size, n);

                let mut cost = [0.0];
                let mut own_grads = vec![0.0; own_probs.len()];
                compute_ctc_loss(
                    &own_probs, Some(&mut own_grads), own_labels, &label_sizes[n..=n],
                    &input_sizes[n..=n], alphabet_size, 1, &mut cost, None, &options,
                ).unwrap();

                prop_assert_eq!(cost[0], costs[n]);
                prop_assert_eq!(own_grads, column(&grads, minibatch, alphabet_size, n));
            }
        }
    }
}
