//! Forward-backward engines.
//!
//! Both engines implement [`CtcEngine`] and are selected at runtime from the
//! options, so CPU and GPU can run side by side in one process.

use burn::backend::{wgpu::WgpuDevice, Wgpu};

use crate::{
    buffer::{CtcBatch, GradsViewMut},
    error::Result,
    options::{ComputeLocation, CtcOptions},
    workspace::BatchShape,
};

pub mod cpu;
pub mod gpu;

pub use cpu::CpuCtc;
pub use gpu::GpuCtc;

pub trait CtcEngine {
    fn location(&self) -> ComputeLocation;

    fn blank_label(&self) -> usize;

    /// Exact scratch elements [`CtcEngine::compute`] expects for this shape.
    fn workspace_size(&self, shape: &BatchShape, alphabet_size: usize) -> Result<usize>;

    /// Fills one cost per sequence and, when `grads` is given, the gradient
    /// of every cost w.r.t. the probabilities. Without `grads` only the
    /// forward pass runs.
    fn compute(
        &self,
        batch: &CtcBatch<'_>,
        costs: &mut [f32],
        grads: Option<GradsViewMut<'_>>,
        workspace: &mut [f32],
    ) -> Result<()>;
}

/// Engine matching `options.loc`.
pub fn from_options(options: &CtcOptions) -> Box<dyn CtcEngine> {
    match options.loc {
        ComputeLocation::Cpu => Box::new(CpuCtc::from_options(options)),
        ComputeLocation::Gpu => {
            let device = options.stream.clone().unwrap_or_else(WgpuDevice::default);
            Box::new(GpuCtc::<Wgpu>::new(options.blank_label, options.scale, device))
        }
    }
}
