//! Workspace sizing and scoped scratch acquisition.
//!
//! The sizer only looks at the batch shape. Both engines carve their scratch
//! out of a single flat `f32` region whose length is fixed by the label and
//! input sizes of the batch, so it has to be recomputed for every batch.
//! Sizes that do not fit in `usize` are rejected rather than wrapped.

use tracing::{debug, trace};

use crate::{
    error::{CtcError, Result},
    label::extended_len,
    options::ComputeLocation,
};

/// Number of `[minibatch, max_extended_len]` planes the GPU engine stages on
/// the host to describe the lattice of every sequence.
pub const LATTICE_PLANES: usize = 6;

/// Validated label and input sizes of a minibatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchShape {
    label_lens: Vec<usize>,
    input_lens: Vec<usize>,
}

impl BatchShape {
    pub fn new(label_sizes: &[i32], input_sizes: &[i32], minibatch: usize) -> Result<Self> {
        if minibatch == 0 {
            return Err(CtcError::EmptyMinibatch);
        }
        for (what, sizes) in [("label sizes", label_sizes), ("input sizes", input_sizes)] {
            if sizes.len() != minibatch {
                return Err(CtcError::ShapeMismatch {
                    what,
                    expected: minibatch,
                    actual: sizes.len(),
                });
            }
            if let Some(negative) = sizes.iter().find(|&&size| size < 0) {
                return Err(CtcError::InvalidValue(format!(
                    "{what} must not be negative, got {negative}"
                )));
            }
        }

        Ok(Self {
            label_lens: label_sizes.iter().map(|&l| l as usize).collect(),
            input_lens: input_sizes.iter().map(|&l| l as usize).collect(),
        })
    }

    pub fn minibatch(&self) -> usize {
        self.label_lens.len()
    }

    /// `(label_len, input_len)` of sequence `n`.
    pub fn sequence(&self, n: usize) -> (usize, usize) {
        (self.label_lens[n], self.input_lens[n])
    }

    pub fn sequences(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.label_lens
            .iter()
            .copied()
            .zip(self.input_lens.iter().copied())
    }

    pub fn input_lens(&self) -> impl Iterator<Item = usize> + '_ {
        self.input_lens.iter().copied()
    }

    pub fn total_label_len(&self) -> usize {
        self.label_lens.iter().sum()
    }

    pub fn max_input_len(&self) -> usize {
        self.input_lens.iter().copied().max().unwrap_or(0)
    }

    pub fn max_extended_len(&self) -> usize {
        extended_len(self.label_lens.iter().copied().max().unwrap_or(0))
    }
}

/// Offsets of one sequence's tables inside its CPU workspace slice.
///
/// ```text
/// [ extended labels: S ][ alphas: T * S ][ betas: S ][ class sums: A ]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuLayout {
    pub extended_len: usize,
    pub input_len: usize,
    pub alphabet_size: usize,
}

impl CpuLayout {
    pub fn new(label_len: usize, input_len: usize, alphabet_size: usize) -> Self {
        Self {
            extended_len: extended_len(label_len),
            input_len,
            alphabet_size,
        }
    }

    /// Only meaningful once [`CpuLayout::total`] succeeded.
    pub fn alphas_len(&self) -> usize {
        self.input_len * self.extended_len
    }

    pub fn total(&self) -> Result<usize> {
        self.input_len
            .checked_mul(self.extended_len)
            .and_then(|alphas| alphas.checked_add(2 * self.extended_len))
            .and_then(|len| len.checked_add(self.alphabet_size))
            .ok_or_else(|| overflow(ComputeLocation::Cpu))
    }
}

/// Padded extents of the GPU lattice.
///
/// The alpha, beta and gradient tables live on the device; the host
/// workspace only stages the lattice planes:
///
/// ```text
/// [ plane 0: N * S ][ plane 1: N * S ] ... [ plane 5: N * S ]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuLayout {
    pub max_extended_len: usize,
    pub max_input_len: usize,
    pub alphabet_size: usize,
}

impl GpuLayout {
    pub fn new(shape: &BatchShape, alphabet_size: usize) -> Self {
        Self {
            max_extended_len: shape.max_extended_len(),
            max_input_len: shape.max_input_len(),
            alphabet_size,
        }
    }

    /// Host elements used to stage the lattice planes of `minibatch` sequences.
    pub fn staging_len(&self, minibatch: usize) -> Result<usize> {
        minibatch
            .checked_mul(self.max_extended_len)
            .and_then(|plane| plane.checked_mul(LATTICE_PLANES))
            .ok_or_else(|| overflow(ComputeLocation::Gpu))
    }
}

fn overflow(loc: ComputeLocation) -> CtcError {
    CtcError::InvalidValue(format!("{loc:?} workspace size does not fit in usize"))
}

pub fn cpu_workspace_size(shape: &BatchShape, alphabet_size: usize) -> Result<usize> {
    shape.sequences().try_fold(0usize, |size, (label_len, input_len)| {
        let total = CpuLayout::new(label_len, input_len, alphabet_size).total()?;
        size.checked_add(total)
            .ok_or_else(|| overflow(ComputeLocation::Cpu))
    })
}

pub fn gpu_workspace_size(shape: &BatchShape, alphabet_size: usize) -> Result<usize> {
    GpuLayout::new(shape, alphabet_size).staging_len(shape.minibatch())
}

/// Scratch elements needed by the engine at `loc` for this batch shape.
pub fn workspace_size(
    shape: &BatchShape,
    alphabet_size: usize,
    blank_label: usize,
    loc: ComputeLocation,
) -> Result<usize> {
    if alphabet_size == 0 {
        return Err(CtcError::InvalidValue("alphabet size must be positive".into()));
    }
    if blank_label >= alphabet_size {
        return Err(CtcError::BlankOutOfRange {
            blank: blank_label,
            alphabet_size,
        });
    }

    let size = match loc {
        ComputeLocation::Cpu => cpu_workspace_size(shape, alphabet_size)?,
        ComputeLocation::Gpu => gpu_workspace_size(shape, alphabet_size)?,
    };
    debug!(
        ?loc,
        minibatch = shape.minibatch(),
        alphabet_size,
        elements = size,
        "sized ctc workspace"
    );

    Ok(size)
}

/// Scratch region owned by one invocation, released when dropped.
#[derive(Debug)]
pub struct Workspace {
    buffer: Vec<f32>,
}

impl Workspace {
    /// Allocates `elements` zeroed floats, reporting allocation failure as
    /// an error instead of aborting.
    pub fn acquire(elements: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(elements)
            .map_err(|_| CtcError::Memops { elements })?;
        buffer.resize(elements, 0.0);
        trace!(elements, "acquired ctc workspace");

        Ok(Self { buffer })
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buffer
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        trace!(elements = self.buffer.len(), "released ctc workspace");
    }
}

/// Checks that a caller-managed workspace has exactly the sized length.
pub fn check_workspace(workspace: &[f32], expected: usize) -> Result<()> {
    if workspace.len() != expected {
        return Err(CtcError::WorkspaceSize {
            expected,
            actual: workspace.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_batch_shape_validation() {
        assert!(matches!(
            BatchShape::new(&[], &[], 0).unwrap_err(),
            CtcError::EmptyMinibatch
        ));
        assert!(matches!(
            BatchShape::new(&[1, 2], &[3], 2).unwrap_err(),
            CtcError::ShapeMismatch { .. }
        ));
        assert!(matches!(
            BatchShape::new(&[1, -2], &[3, 3], 2).unwrap_err(),
            CtcError::InvalidValue(_)
        ));

        let shape = BatchShape::new(&[1, 3], &[5, 2], 2).unwrap();
        assert_eq!(shape.total_label_len(), 4);
        assert_eq!(shape.max_input_len(), 5);
        assert_eq!(shape.max_extended_len(), 7);
    }

    #[test]
    fn test_cpu_size_is_sum_of_sequences() {
        let shape = BatchShape::new(&[1, 2], &[3, 4], 2).unwrap();
        // S = 3: 3 + 9 + 3 + 5, S = 5: 5 + 20 + 5 + 5
        assert_eq!(cpu_workspace_size(&shape, 5).unwrap(), 20 + 35);
    }

    #[test]
    fn test_gpu_size_is_staging_only() {
        let shape = BatchShape::new(&[1, 2], &[3, 4], 2).unwrap();
        // 6 planes of N = 2 by S_max = 5, independent of T and A
        assert_eq!(gpu_workspace_size(&shape, 5).unwrap(), 60);
        assert_eq!(gpu_workspace_size(&shape, 500).unwrap(), 60);

        let shape = BatchShape::new(&[2, 1], &[6, 4], 2).unwrap();
        assert_eq!(gpu_workspace_size(&shape, 4).unwrap(), 60);
    }

    #[test]
    fn test_size_overflow_is_an_error() {
        let max = [i32::MAX; 3];
        let shape = BatchShape::new(&max, &max, 3).unwrap();

        let err = workspace_size(&shape, 4, 0, ComputeLocation::Cpu).unwrap_err();
        assert!(matches!(err, CtcError::InvalidValue(_)));
        // staging fits, only the host planes are counted
        assert!(workspace_size(&shape, 4, 0, ComputeLocation::Gpu).is_ok());

        let layout = GpuLayout::new(&shape, 4);
        assert!(matches!(
            layout.staging_len(usize::MAX).unwrap_err(),
            CtcError::InvalidValue(_)
        ));
    }

    #[test]
    fn test_workspace_size_rejects_blank() {
        let shape = BatchShape::new(&[1], &[3], 1).unwrap();
        let err = workspace_size(&shape, 4, 4, ComputeLocation::Cpu).unwrap_err();
        assert!(matches!(err, CtcError::BlankOutOfRange { .. }));
        let err = workspace_size(&shape, 0, 0, ComputeLocation::Gpu).unwrap_err();
        assert!(matches!(err, CtcError::InvalidValue(_)));
    }

    #[test]
    fn test_workspace_acquire() {
        let mut workspace = Workspace::acquire(16).unwrap();
        assert_eq!(workspace.len(), 16);
        assert!(workspace.as_mut_slice().iter().all(|&v| v == 0.0));

        assert!(check_workspace(workspace.as_mut_slice(), 16).is_ok());
        assert!(matches!(
            check_workspace(workspace.as_mut_slice(), 15).unwrap_err(),
            CtcError::WorkspaceSize { .. }
        ));
    }

    #[test]
    fn test_workspace_acquire_failure() {
        let err = Workspace::acquire(usize::MAX).unwrap_err();
        assert!(matches!(err, CtcError::Memops { .. }));
    }
}
