pub mod bench;
pub mod buffer;
pub mod dataset;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod label;
pub mod loss;
pub mod numeric;
pub mod options;
pub mod parse_config;
pub mod utils;
pub mod workspace;

pub use dispatch::{compute_ctc_loss, compute_ctc_loss_with, get_workspace_size};
pub use engine::{CpuCtc, CtcEngine, GpuCtc};
pub use error::{CtcError, CtcStatus, Result};
pub use loss::{CtcLoss, CtcLossOutput};
pub use options::{ComputeLocation, CtcOptions, ProbabilityScale};
pub use workspace::{BatchShape, Workspace};
