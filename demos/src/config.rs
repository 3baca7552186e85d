//! Configuration of the synthesis driver.

use std::path::PathBuf;

use backbones::BackboneType;
use cnnmrf_burn::CnnMrfConfig;
use serde::{Deserialize, Serialize};

/// Configuration for a style-transfer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Loss layout and weights.
    pub model: CnnMrfConfig,
    /// Feature extractor.
    pub backbone: BackboneType,
    /// Torchvision `.pth` checkpoint for the backbone.
    pub weights: Option<PathBuf>,
    /// Longer side of the content image at the finest level.
    pub max_size: u32,
    /// Number of pyramid levels, coarsest first.
    pub num_res: usize,
    /// Optimizer steps per level.
    pub iterations: usize,
    /// Adam learning rate.
    pub learning_rate: f64,
    /// Log the losses every this many steps.
    pub log_interval: usize,
    /// Directory for the intermediate and final images.
    pub output_path: PathBuf,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            model: CnnMrfConfig::new(),
            backbone: BackboneType::Vgg19,
            weights: None,
            max_size: 384,
            num_res: 3,
            iterations: 100,
            learning_rate: 0.05,
            log_interval: 10,
            output_path: PathBuf::from("outputs"),
        }
    }
}

impl SynthesisConfig {
    /// Checks the driver settings and the model configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_res == 0 {
            anyhow::bail!("num_res must be greater than 0");
        }
        let levels = u32::try_from(self.num_res - 1).unwrap_or(u32::MAX);
        if self.max_size.checked_shr(levels).unwrap_or(0) < 16 {
            anyhow::bail!(
                "max_size {} is too small for {} pyramid levels",
                self.max_size,
                self.num_res
            );
        }
        if self.log_interval == 0 {
            anyhow::bail!("log_interval must be greater than 0");
        }
        self.model.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SynthesisConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = SynthesisConfig {
            num_res: 2,
            weights: Some(PathBuf::from("vgg19.pth")),
            ..SynthesisConfig::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: SynthesisConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.num_res, 2);
        assert_eq!(parsed.backbone, BackboneType::Vgg19);
        assert_eq!(parsed.weights, config.weights);
        assert_eq!(parsed.model.style_layers, vec![7, 9]);
    }

    #[test]
    fn test_too_many_levels_are_rejected() {
        let config = SynthesisConfig {
            max_size: 64,
            num_res: 4,
            ..SynthesisConfig::default()
        };

        assert!(config.validate().is_err());
    }
}
