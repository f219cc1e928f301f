//! Typed views over the flat caller buffers.
//!
//! Shapes are checked once, when a view is built, so the engines can index
//! without re-deriving or re-validating anything.

use crate::{
    error::{CtcError, Result},
    workspace::BatchShape,
};

/// Read-only `[max_time, minibatch, alphabet_size]` probability tensor.
#[derive(Clone, Copy, Debug)]
pub struct ProbsView<'a> {
    data: &'a [f32],
    max_time: usize,
    minibatch: usize,
    alphabet_size: usize,
}

impl<'a> ProbsView<'a> {
    /// Wraps `data`, deriving the time axis from its length.
    pub fn new(data: &'a [f32], minibatch: usize, alphabet_size: usize) -> Result<Self> {
        if minibatch == 0 {
            return Err(CtcError::EmptyMinibatch);
        }
        if alphabet_size == 0 {
            return Err(CtcError::InvalidValue("alphabet size must be positive".into()));
        }
        let frame = minibatch * alphabet_size;
        if data.len() % frame != 0 {
            return Err(CtcError::ShapeMismatch {
                what: "probabilities",
                expected: (data.len() / frame + 1) * frame,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            max_time: data.len() / frame,
            minibatch,
            alphabet_size,
        })
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.max_time, self.minibatch, self.alphabet_size]
    }

    pub fn max_time(&self) -> usize {
        self.max_time
    }

    pub fn minibatch(&self) -> usize {
        self.minibatch
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }

    /// Class distribution of sequence `n` at timestep `t`.
    #[inline]
    pub fn frame(&self, t: usize, n: usize) -> &'a [f32] {
        let start = (t * self.minibatch + n) * self.alphabet_size;
        &self.data[start..start + self.alphabet_size]
    }

    #[inline]
    pub fn get(&self, t: usize, n: usize, c: usize) -> f32 {
        self.data[(t * self.minibatch + n) * self.alphabet_size + c]
    }
}

/// Mutable gradient buffer with the same layout as [`ProbsView`].
#[derive(Debug)]
pub struct GradsViewMut<'a> {
    data: &'a mut [f32],
    dims: [usize; 3],
}

impl<'a> GradsViewMut<'a> {
    pub fn new(data: &'a mut [f32], dims: [usize; 3]) -> Result<Self> {
        let expected = dims.iter().product();
        if data.len() != expected {
            return Err(CtcError::ShapeMismatch {
                what: "gradients",
                expected,
                actual: data.len(),
            });
        }

        Ok(Self { data, dims })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Splits the buffer into per-sequence rows: `rows[n][t]` is the
    /// `alphabet_size` slice of sequence `n` at timestep `t`.
    pub fn sequence_rows(&mut self) -> Vec<Vec<&mut [f32]>> {
        let [max_time, minibatch, alphabet_size] = self.dims;
        let mut rows: Vec<Vec<&mut [f32]>> = (0..minibatch)
            .map(|_| Vec::with_capacity(max_time))
            .collect();
        for (idx, frame) in self.data.chunks_mut(alphabet_size).enumerate() {
            rows[idx % minibatch].push(frame);
        }

        rows
    }
}

/// One sequence of the minibatch.
#[derive(Clone, Copy, Debug)]
pub struct SequenceRef<'a> {
    pub index: usize,
    pub labels: &'a [i32],
    pub input_len: usize,
}

/// Concatenated labels of the minibatch, checked against the alphabet.
#[derive(Clone, Debug)]
pub struct LabelBatch<'a> {
    labels: &'a [i32],
    shape: BatchShape,
    offsets: Vec<usize>,
}

impl<'a> LabelBatch<'a> {
    pub fn new(
        labels: &'a [i32],
        shape: BatchShape,
        alphabet_size: usize,
        blank: usize,
    ) -> Result<Self> {
        let total = shape.total_label_len();
        if labels.len() != total {
            return Err(CtcError::ShapeMismatch {
                what: "labels (sum of label sizes)",
                expected: total,
                actual: labels.len(),
            });
        }
        if let Some(bad) = labels
            .iter()
            .find(|&&l| l < 0 || l as usize >= alphabet_size || l as usize == blank)
        {
            return Err(CtcError::InvalidValue(format!(
                "label {bad} is not a non-blank class of an alphabet of size {alphabet_size} \
                 (blank = {blank})"
            )));
        }

        let offsets = shape
            .sequences()
            .scan(0usize, |start, (label_len, _)| {
                let offset = *start;
                *start += label_len;
                Some(offset)
            })
            .collect();

        Ok(Self {
            labels,
            shape,
            offsets,
        })
    }

    pub fn shape(&self) -> &BatchShape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.minibatch()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequence(&self, n: usize) -> SequenceRef<'a> {
        let (label_len, input_len) = self.shape.sequence(n);
        let start = self.offsets[n];
        SequenceRef {
            index: n,
            labels: &self.labels[start..start + label_len],
            input_len,
        }
    }

    pub fn sequences(&self) -> impl Iterator<Item = SequenceRef<'a>> + '_ {
        (0..self.len()).map(|n| self.sequence(n))
    }
}

/// Everything an engine reads for one invocation.
#[derive(Clone, Debug)]
pub struct CtcBatch<'a> {
    pub probs: ProbsView<'a>,
    pub labels: LabelBatch<'a>,
}

impl<'a> CtcBatch<'a> {
    pub fn new(probs: ProbsView<'a>, labels: LabelBatch<'a>) -> Result<Self> {
        if probs.minibatch() != labels.len() {
            return Err(CtcError::ShapeMismatch {
                what: "label sizes",
                expected: probs.minibatch(),
                actual: labels.len(),
            });
        }
        let max_time = probs.max_time();
        if let Some(too_long) = labels.shape().input_lens().find(|&len| len > max_time) {
            return Err(CtcError::InvalidValue(format!(
                "input size {too_long} exceeds the {max_time} timesteps of the probabilities"
            )));
        }

        Ok(Self { probs, labels })
    }

    pub fn minibatch(&self) -> usize {
        self.probs.minibatch()
    }

    pub fn alphabet_size(&self) -> usize {
        self.probs.alphabet_size()
    }
}
