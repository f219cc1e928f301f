use burn::backend::wgpu::WgpuDevice;
use serde::{Deserialize, Serialize};

/// Where the forward-backward recursion runs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComputeLocation {
    #[default]
    Cpu,
    Gpu,
}

/// How the entries of the probability tensor are expressed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbabilityScale {
    /// Plain class probabilities; gradients are taken w.r.t. them.
    #[default]
    Linear,
    /// Natural-log probabilities; gradients are taken w.r.t. the logs.
    Log,
}

impl ProbabilityScale {
    /// Log-probability of an input entry.
    #[inline]
    pub fn to_log(self, value: f32) -> f32 {
        match self {
            ProbabilityScale::Linear => value.ln(),
            ProbabilityScale::Log => value,
        }
    }

    /// `log(d p / d input)` for an entry with log-probability `log_prob`:
    /// 0 for linear inputs, `log_prob` for log inputs.
    #[inline]
    pub(crate) fn log_jacobian(self, log_prob: f32) -> f32 {
        match self {
            ProbabilityScale::Linear => 0.0,
            ProbabilityScale::Log => log_prob,
        }
    }
}

/// Configuration of a single engine invocation.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CtcOptions {
    pub loc: ComputeLocation,
    pub blank_label: usize,
    /// CPU worker count, `0` uses every available core.
    #[serde(default)]
    pub num_threads: usize,
    #[serde(default)]
    pub scale: ProbabilityScale,
    /// Device the GPU kernels are enqueued on, `None` picks the default adapter.
    #[serde(skip)]
    pub stream: Option<WgpuDevice>,
}

impl CtcOptions {
    pub fn cpu(blank_label: usize) -> Self {
        Self {
            loc: ComputeLocation::Cpu,
            blank_label,
            ..Default::default()
        }
    }

    pub fn gpu(blank_label: usize, stream: WgpuDevice) -> Self {
        Self {
            loc: ComputeLocation::Gpu,
            blank_label,
            stream: Some(stream),
            ..Default::default()
        }
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_scale(mut self, scale: ProbabilityScale) -> Self {
        self.scale = scale;
        self
    }
}
