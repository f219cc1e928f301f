//! Random batches for benchmarking and cross-checking the engines.

use burn::data::dataset::Dataset;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{
    error::{CtcError, Result},
    options::ProbabilityScale,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyntheticBatchConfig {
    pub minibatch: usize,
    pub max_time: usize,
    pub alphabet_size: usize,
    pub blank_label: usize,
    pub min_label_len: usize,
    pub max_label_len: usize,
    /// Standard deviation of the logits, larger values give peakier frames.
    pub logit_std: f32,
}

/// One minibatch in the flat layout the engines consume.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SyntheticBatch {
    /// `[max_time, minibatch, alphabet_size]`
    pub probs: Vec<f32>,
    pub labels: Vec<i32>,
    pub label_sizes: Vec<i32>,
    pub input_sizes: Vec<i32>,
    pub minibatch: usize,
    pub alphabet_size: usize,
}

impl SyntheticBatch {
    /// Softmax of normal logits in the given scale, with labels short enough
    /// for every sequence to be alignable.
    pub fn generate<R: Rng>(
        config: &SyntheticBatchConfig,
        scale: ProbabilityScale,
        rng: &mut R,
    ) -> Result<Self> {
        Self::check(config)?;
        let SyntheticBatchConfig {
            minibatch,
            max_time,
            alphabet_size,
            blank_label,
            ..
        } = *config;
        let logits = Normal::new(0.0f32, config.logit_std)
            .map_err(|err| CtcError::InvalidValue(format!("logit distribution: {err}")))?;

        let mut labels = Vec::new();
        let mut label_sizes = Vec::with_capacity(minibatch);
        let mut input_sizes = Vec::with_capacity(minibatch);
        // 2 * L timesteps always fit L labels and their repeats
        let max_label_len = config.max_label_len.min(max_time / 2);
        let min_label_len = config.min_label_len.min(max_label_len);
        for _ in 0..minibatch {
            let label_len = rng.gen_range(min_label_len..=max_label_len);
            labels.extend((0..label_len).map(|_| {
                // skip over the blank
                let class = rng.gen_range(0..alphabet_size - 1);
                (if class >= blank_label { class + 1 } else { class }) as i32
            }));
            label_sizes.push(label_len as i32);
            input_sizes.push(rng.gen_range((2 * label_len).max(1)..=max_time) as i32);
        }

        let mut probs: Vec<f32> = (0..max_time * minibatch * alphabet_size)
            .map(|_| logits.sample(rng))
            .collect();
        probs
            .chunks_mut(alphabet_size)
            .for_each(|frame| softmax(frame, scale));

        Ok(Self {
            probs,
            labels,
            label_sizes,
            input_sizes,
            minibatch,
            alphabet_size,
        })
    }

    pub fn max_time(&self) -> usize {
        self.probs.len() / (self.minibatch * self.alphabet_size)
    }

    fn check(config: &SyntheticBatchConfig) -> Result<()> {
        if config.minibatch == 0 {
            return Err(CtcError::EmptyMinibatch);
        }
        if config.max_time == 0 {
            return Err(CtcError::InvalidValue("max_time must be positive".into()));
        }
        if config.alphabet_size < 2 {
            return Err(CtcError::InvalidValue(
                "alphabet needs the blank and at least one class".into(),
            ));
        }
        if config.blank_label >= config.alphabet_size {
            return Err(CtcError::BlankOutOfRange {
                blank: config.blank_label,
                alphabet_size: config.alphabet_size,
            });
        }

        Ok(())
    }
}

fn softmax(frame: &mut [f32], scale: ProbabilityScale) {
    let max = frame.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_norm = frame.iter().map(|x| (x - max).exp()).sum::<f32>().ln() + max;
    for x in frame.iter_mut() {
        *x = match scale {
            ProbabilityScale::Linear => (*x - log_norm).exp(),
            ProbabilityScale::Log => *x - log_norm,
        };
    }
}

/// Fixed-size sequence of reproducible batches, item `i` drawn from
/// `seed + i`.
pub struct SyntheticDataset {
    config: SyntheticBatchConfig,
    scale: ProbabilityScale,
    seed: u64,
    dataset_size: usize,
}

impl SyntheticDataset {
    pub fn new(
        config: SyntheticBatchConfig,
        scale: ProbabilityScale,
        seed: u64,
        dataset_size: usize,
    ) -> Result<Self> {
        SyntheticBatch::check(&config)?;

        Ok(Self {
            config,
            scale,
            seed,
            dataset_size,
        })
    }
}

impl Dataset<SyntheticBatch> for SyntheticDataset {
    fn get(&self, index: usize) -> Option<SyntheticBatch> {
        if index >= self.dataset_size {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));

        SyntheticBatch::generate(&self.config, self.scale, &mut rng).ok()
    }

    fn len(&self) -> usize {
        self.dataset_size
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::label::is_feasible;

    fn config() -> SyntheticBatchConfig {
        SyntheticBatchConfig {
            minibatch: 4,
            max_time: 20,
            alphabet_size: 6,
            blank_label: 2,
            min_label_len: 1,
            max_label_len: 15,
            logit_std: 2.0,
        }
    }

    #[test]
    fn test_generate_consistent_batch() {
        let mut rng = StdRng::seed_from_u64(0);
        let batch = SyntheticBatch::generate(&config(), ProbabilityScale::Linear, &mut rng).unwrap();

        assert_eq!(batch.max_time(), 20);
        assert_eq!(batch.label_sizes.iter().sum::<i32>() as usize, batch.labels.len());
        assert!(batch.labels.iter().all(|&l| l != 2 && (0..6).contains(&l)));
        for frame in batch.probs.chunks(6) {
            assert!((frame.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }

        let mut offset = 0;
        for (&label_len, &input_len) in batch.label_sizes.iter().zip(&batch.input_sizes) {
            let labels = &batch.labels[offset..offset + label_len as usize];
            offset += label_len as usize;
            assert!(input_len as usize <= 20);
            assert!(is_feasible(labels, input_len as usize));
        }
    }

    #[test]
    fn test_log_scale_frames() {
        let mut rng = StdRng::seed_from_u64(1);
        let batch = SyntheticBatch::generate(&config(), ProbabilityScale::Log, &mut rng).unwrap();

        for frame in batch.probs.chunks(6) {
            assert!(frame.iter().all(|&x| x <= 0.0));
            assert!((frame.iter().map(|x| x.exp()).sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_dataset_is_reproducible() {
        let dataset = SyntheticDataset::new(config(), ProbabilityScale::Linear, 42, 3).unwrap();

        assert_eq!(dataset.len(), 3);
        assert!(dataset.get(3).is_none());
        let (a, b) = (dataset.get(1).unwrap(), dataset.get(1).unwrap());
        assert_eq!(a.probs, b.probs);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_rejects_blank_only_alphabet() {
        let config = SyntheticBatchConfig {
            alphabet_size: 1,
            blank_label: 0,
            ..config()
        };
        let err = SyntheticDataset::new(config, ProbabilityScale::Linear, 0, 1).err().unwrap();
        assert!(matches!(err, CtcError::InvalidValue(_)));
    }
}
