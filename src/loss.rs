use burn::nn::loss::Reduction;
use tracing::debug;

use crate::{
    dispatch::compute_ctc_loss,
    error::{CtcError, Result},
    options::CtcOptions,
};

/// The Connectionist Temporal Classification loss over host buffers.
pub struct CtcLoss {
    options: CtcOptions,
    reduction: Option<Reduction>,
    zero_infinity: bool,
}

// `burn::nn::loss::Reduction` derives neither `Clone` nor `Debug`, so these
// are written out by hand.
impl Clone for CtcLoss {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            reduction: self.reduction.as_ref().map(|r| match r {
                Reduction::Mean => Reduction::Mean,
                Reduction::Sum => Reduction::Sum,
                Reduction::Auto => Reduction::Auto,
            }),
            zero_infinity: self.zero_infinity,
        }
    }
}

impl std::fmt::Debug for CtcLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reduction = self.reduction.as_ref().map(|r| match r {
            Reduction::Mean => "Mean",
            Reduction::Sum => "Sum",
            Reduction::Auto => "Auto",
        });
        f.debug_struct("CtcLoss")
            .field("options", &self.options)
            .field("reduction", &reduction)
            .field("zero_infinity", &self.zero_infinity)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CtcLossOutput {
    /// Per-sequence cost, `+inf` for sequences that cannot be aligned unless
    /// `zero_infinity` is set.
    pub costs: Vec<f32>,
    /// Gradient of `loss` w.r.t. the probabilities, `[max_time, minibatch,
    /// alphabet_size]`.
    pub grads: Option<Vec<f32>>,
    /// Reduced cost, `None` without a reduction.
    pub loss: Option<f32>,
}

impl CtcLoss {
    pub fn new(options: CtcOptions) -> Self {
        Self {
            options,
            reduction: None,
            zero_infinity: false,
        }
    }

    /// - `None`: no reduction, the gradients are those of every cost
    /// - `Some(Reduction::Sum)`: the costs are summed
    /// - `Some(Reduction::Mean)` or `Some(Reduction::Auto)`: every cost is
    ///   divided by its label length, then the mean over the batch is taken
    pub fn with_reduction(mut self, reduction: Option<Reduction>) -> Self {
        self.reduction = reduction;
        self
    }

    /// Replaces infinite costs by zero.
    pub fn with_zero_infinity(mut self, zero_infinity: bool) -> Self {
        self.zero_infinity = zero_infinity;
        self
    }

    pub fn options(&self) -> &CtcOptions {
        &self.options
    }

    /// Compute the criterion and its gradient.
    ///
    /// # Parameters:
    ///
    /// - probs: `[max_time, minibatch, alphabet_size]` probabilities, in the
    ///   scale of the options
    /// - labels: concatenated label sequences, blank excluded
    /// - label_sizes, input_sizes: `[minibatch]`
    pub fn forward(
        &self,
        probs: &[f32],
        labels: &[i32],
        label_sizes: &[i32],
        input_sizes: &[i32],
        alphabet_size: usize,
    ) -> Result<CtcLossOutput> {
        self.run(probs, labels, label_sizes, input_sizes, alphabet_size, true)
    }

    /// Compute the criterion only, without the backward pass.
    pub fn score(
        &self,
        probs: &[f32],
        labels: &[i32],
        label_sizes: &[i32],
        input_sizes: &[i32],
        alphabet_size: usize,
    ) -> Result<CtcLossOutput> {
        self.run(probs, labels, label_sizes, input_sizes, alphabet_size, false)
    }

    fn run(
        &self,
        probs: &[f32],
        labels: &[i32],
        label_sizes: &[i32],
        input_sizes: &[i32],
        alphabet_size: usize,
        with_grads: bool,
    ) -> Result<CtcLossOutput> {
        let minibatch = label_sizes.len();
        if minibatch == 0 {
            return Err(CtcError::EmptyMinibatch);
        }

        let mut costs = vec![0.0; minibatch];
        let mut grads = with_grads.then(|| vec![0.0; probs.len()]);
        compute_ctc_loss(
            probs,
            grads.as_deref_mut(),
            labels,
            label_sizes,
            input_sizes,
            alphabet_size,
            minibatch,
            &mut costs,
            None,
            &self.options,
        )?;

        if self.zero_infinity {
            costs
                .iter_mut()
                .filter(|cost| cost.is_infinite())
                .for_each(|cost| *cost = 0.0);
        }

        let loss = match self.reduction {
            None => None,
            Some(Reduction::Sum) => Some(costs.iter().sum()),
            Some(Reduction::Mean) | Some(Reduction::Auto) => {
                let weights = mean_weights(label_sizes);
                if let Some(grads) = grads.as_mut() {
                    for (idx, frame) in grads.chunks_mut(alphabet_size).enumerate() {
                        let weight = weights[idx % minibatch];
                        frame.iter_mut().for_each(|g| *g *= weight);
                    }
                }
                Some(costs.iter().zip(&weights).map(|(cost, w)| cost * w).sum())
            }
        };
        debug!(minibatch, ?loss, "reduced ctc loss");

        Ok(CtcLossOutput { costs, grads, loss })
    }
}

/// `1 / (minibatch * max(label_len, 1))` for every sequence.
fn mean_weights(label_sizes: &[i32]) -> Vec<f32> {
    let minibatch = label_sizes.len() as f32;
    label_sizes
        .iter()
        .map(|&len| 1.0 / (minibatch * len.max(1) as f32))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::ProbabilityScale;

    const REFERENCE_LOG_PROBS: [[f32; 10]; 30] = [
        [-0.785, -3.471, -2.531, -3.948, -2.373, -3.042, -2.029, -2.255, -4.228, -3.810],
        [-3.548, -1.692, -0.967, -2.519, -2.806, -2.760, -2.434, -2.762, -3.638, -3.669],
        [-3.904, -1.799, -1.312, -2.530, -2.267, -3.169, -3.838, -2.073, -2.484, -2.418],
        [-0.890, -2.506, -3.405, -3.038, -2.483, -2.861, -2.749, -3.086, -1.960, -3.336],
        [-1.113, -3.557, -2.580, -1.465, -3.884, -1.993, -3.574, -3.466, -2.669, -2.985],
        [-3.948, -0.828, -1.805, -2.842, -2.767, -3.891, -2.825, -1.783, -5.566, -5.072],
        [-1.677, -1.703, -4.191, -3.862, -1.726, -2.616, -2.366, -2.324, -2.767, -2.418],
        [-1.511, -1.125, -3.526, -3.007, -2.975, -3.358, -2.037, -2.093, -4.137, -3.900],
        [-1.850, -2.767, -1.718, -2.185, -2.890, -1.998, -3.661, -3.997, -2.738, -1.671],
        [-2.621, -1.234, -3.499, -3.494, -1.612, -1.713, -2.179, -2.884, -4.122, -4.581],
        [-1.519, -3.283, -1.287, -3.217, -2.544, -3.128, -2.061, -3.039, -2.388, -3.272],
        [-1.112, -1.258, -3.206, -3.103, -3.918, -2.577, -4.399, -4.488, -2.187, -2.663],
        [-1.889, -2.344, -3.232, -2.781, -3.312, -0.911, -2.864, -4.825, -3.180, -2.243],
        [-4.368, -1.471, -1.308, -2.950, -3.211, -2.692, -1.923, -2.020, -3.859, -3.601],
        [-4.254, -3.291, -1.539, -2.622, -2.281, -1.427, -1.712, -3.082, -2.653, -3.809],
        [-3.322, -2.904, -0.942, -3.157, -2.987, -3.736, -1.208, -4.155, -4.383, -2.583],
        [-2.827, -2.293, -3.109, -3.196, -3.297, -2.451, -2.136, -3.423, -1.012, -2.146],
        [-1.803, -1.666, -1.780, -4.024, -3.083, -4.520, -2.674, -2.527, -3.365, -1.516],
        [-2.199, -2.340, -2.009, -3.736, -3.363, -2.721, -2.350, -1.951, -1.815, -2.009],
        [-1.721, -3.726, -1.701, -3.503, -2.153, -3.242, -2.284, -1.838, -2.646, -2.329],
        [-3.655, -2.916, -2.913, -1.197, -3.060, -2.154, -1.776, -3.404, -1.823, -3.310],
        [-2.671, -2.592, -2.929, -1.416, -2.007, -2.886, -2.781, -2.597, -1.738, -2.862],
        [-1.686, -4.173, -0.884, -5.493, -5.498, -1.707, -3.573, -5.085, -2.060, -3.352],
        [-2.114, -2.478, -2.178, -3.457, -3.264, -2.659, -2.653, -1.222, -2.375, -2.475],
        [-2.136, -3.563, -2.325, -3.081, -2.035, -3.154, -1.122, -3.486, -1.951, -3.270],
        [-3.206, -3.031, -3.913, -2.652, -2.985, -2.635, -1.153, -3.122, -3.256, -1.203],
        [-2.104, -1.719, -2.141, -2.695, -2.448, -2.991, -1.542, -2.646, -3.090, -3.066],
        [-3.320, -5.098, -1.085, -1.335, -2.588, -3.098, -2.466, -2.951, -3.911, -2.538],
        [-3.756, -1.814, -2.752, -2.410, -3.305, -2.387, -2.112, -1.720, -2.616, -1.843],
        [-3.985, -2.489, -2.305, -1.454, -2.533, -5.091, -1.759, -2.180, -3.673, -1.779],
    ];

    #[test]
    fn test_ctc_loss_log_scale_reference() {
        let probs: Vec<f32> = REFERENCE_LOG_PROBS.iter().flatten().copied().collect();
        let loss = CtcLoss::new(CtcOptions::cpu(0).with_scale(ProbabilityScale::Log))
            .with_reduction(Some(Reduction::Sum));

        let res = loss.forward(&probs, &[1, 9, 6, 9, 4], &[5], &[30], 10).unwrap();

        let expected = 50.3788948059082;
        assert!((res.loss.unwrap() - expected).abs() < 1e-2);
        assert_eq!(res.costs, vec![res.loss.unwrap()]);
        let grads = res.grads.unwrap();
        assert_eq!(grads.len(), 300);
        assert!(grads.iter().all(|g| g.is_finite()));
        assert!(grads.chunks(10).all(|frame| frame.iter().any(|&g| g != 0.0)));
    }

    #[test]
    fn test_mean_reduction_scales_costs_and_grads() {
        let probs = vec![0.25f32; 3 * 2 * 4];
        let args = (&[1, 2, 3][..], &[1, 2][..], &[3, 3][..]);
        let none = CtcLoss::new(CtcOptions::cpu(0))
            .forward(&probs, args.0, args.1, args.2, 4)
            .unwrap();
        let mean = CtcLoss::new(CtcOptions::cpu(0))
            .with_reduction(Some(Reduction::Mean))
            .forward(&probs, args.0, args.1, args.2, 4)
            .unwrap();

        assert_eq!(none.loss, None);
        let expected = (none.costs[0] / 1.0 + none.costs[1] / 2.0) / 2.0;
        assert!((mean.loss.unwrap() - expected).abs() < 1e-5);

        let (none_grads, mean_grads) = (none.grads.unwrap(), mean.grads.unwrap());
        for (idx, (g, m)) in none_grads.iter().zip(&mean_grads).enumerate() {
            let weight = if (idx / 4) % 2 == 0 { 0.5 } else { 0.25 };
            assert!((g * weight - m).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_infinity() {
        let probs = vec![0.5f32; 2 * 2 * 2];
        // [1, 1] needs three steps
        let args = (&[1, 1, 1][..], &[2, 1][..], &[2, 2][..]);
        let loss = CtcLoss::new(CtcOptions::cpu(0)).with_reduction(Some(Reduction::Sum));

        let res = loss.score(&probs, args.0, args.1, args.2, 2).unwrap();
        assert_eq!(res.loss, Some(f32::INFINITY));
        assert!(res.grads.is_none());

        let res = loss
            .with_zero_infinity(true)
            .forward(&probs, args.0, args.1, args.2, 2)
            .unwrap();
        assert_eq!(res.costs[0], 0.0);
        assert!(res.loss.unwrap().is_finite());
        assert!(res.grads.unwrap()[..2].iter().all(|&g| g == 0.0));
    }
}
