//! # CNNMRF-Burn
//!
//! Neural style transfer with a Markov-Random-Field style loss on the features
//! of a frozen convolutional backbone.
//!
//! Every local patch of the synthesis activation is pulled toward the style
//! patch it correlates with best. The search is a convolution of the synthesis
//! activation with the normalized style patches as filters, run over chunks of
//! the filter bank to keep the response map within device memory.

mod config;
mod error;
pub mod losses;
mod matcher;
mod model;
mod patch;


pub use backbones::Backbone;
pub use config::CnnMrfConfig;
pub use error::{CnnMrfError, CnnMrfResult};
pub use losses::{
    ContentLoss, MrfStyleLoss, MrfStyleLossConfig, Reconstruction, StyleSample, TotalVariationLoss,
};
pub use matcher::{PatchMatcher, PatchMatcherConfig, PatchMatches};
pub use model::{BackboneStage, CnnMrf, LossKind, LossReport, LossStage, Stage, StageLoss};
pub use patch::PatchSet;
