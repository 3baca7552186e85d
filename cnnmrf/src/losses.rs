//! Loss stages of the style-transfer model.
//!
//! Every loss here reads the tensor flowing through the model and produces a
//! scalar without changing the tensor:
//!
//! - [`MrfStyleLoss`]: pulls every synthesis patch toward its nearest style patch.
//! - [`ContentLoss`]: mean squared error against a fixed content activation.
//! - [`TotalVariationLoss`]: smoothness penalty on the raw synthesis image.

pub mod content;
pub mod mrf;
pub mod total_variation;

pub use content::ContentLoss;
pub use mrf::{MrfStyleLoss, MrfStyleLossConfig, Reconstruction, StyleSample};
pub use total_variation::TotalVariationLoss;
