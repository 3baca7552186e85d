//! Configuration of the composite style-transfer model.

use std::collections::BTreeSet;

use burn::prelude::*;

use crate::{
    error::{CnnMrfError, CnnMrfResult},
    losses::MrfStyleLossConfig,
};

/// Configuration for [`CnnMrf`](crate::CnnMrf).
///
/// Layer indices refer to the top-level layers of the backbone. With a
/// torchvision-style VGG19 stack, the defaults put the style losses on
/// `conv2_2` (7) and `pool2` (9) and the content loss on `conv3_3` (14).
/// `content_children_layers` indexes the children of a VGG19 conv block
/// (conv, relu, conv, relu, ...), so the default 2 is the block's second conv.
#[derive(Config, Debug)]
pub struct CnnMrfConfig {
    /// Backbone depths followed by a content loss.
    #[config(default = "vec![14]")]
    pub content_layers: Vec<usize>,
    /// Backbone depths followed by an MRF style loss.
    #[config(default = "vec![7, 9]")]
    pub style_layers: Vec<usize>,
    /// Side length of the square patches compared by the style losses.
    #[config(default = 3)]
    pub patch_size: usize,
    /// Split content depths into the children of the backbone block.
    #[config(default = false)]
    pub content_children: bool,
    /// Children of a content block followed by a content loss.
    #[config(default = "vec![2]")]
    pub content_children_layers: Vec<usize>,
    /// Number of style patches correlated per convolution call.
    #[config(default = 256)]
    pub gpu_chunk_size: usize,
    /// Stride between style patches.
    #[config(default = 2)]
    pub mrf_style_stride: usize,
    /// Stride between synthesis patches.
    #[config(default = 2)]
    pub mrf_synthesis_stride: usize,
    /// Upper bound on the elements of one chunk's response map.
    #[config(default = "None")]
    pub max_response_elements: Option<usize>,
    /// Weight of the summed content losses.
    #[config(default = 1.0)]
    pub content_weight: f64,
    /// Weight of the summed style losses.
    #[config(default = 0.4)]
    pub style_weight: f64,
    /// Weight of the total-variation loss.
    #[config(default = 0.1)]
    pub tv_weight: f64,
}

impl CnnMrfConfig {
    /// Validates the configuration against itself.
    ///
    /// # Errors
    ///
    /// Returns [`CnnMrfError::InvalidConfiguration`] for zero-sized patches,
    /// strides or chunks, duplicated layer indices, or an empty child list
    /// while `content_children` is enabled.
    pub fn validate(&self) -> CnnMrfResult<()> {
        let positive = [
            ("patch_size", self.patch_size),
            ("gpu_chunk_size", self.gpu_chunk_size),
            ("mrf_style_stride", self.mrf_style_stride),
            ("mrf_synthesis_stride", self.mrf_synthesis_stride),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(CnnMrfError::InvalidConfiguration {
                reason: format!("{name} must be greater than 0"),
            });
        }

        ensure_unique("content_layers", &self.content_layers)?;
        ensure_unique("style_layers", &self.style_layers)?;

        if self.content_children {
            ensure_unique("content_children_layers", &self.content_children_layers)?;
            if self.content_children_layers.is_empty() && !self.content_layers.is_empty() {
                return Err(CnnMrfError::InvalidConfiguration {
                    reason: "content_children requires at least one child index".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Validates the layer indices against a backbone with `num_layers` layers.
    ///
    /// # Errors
    ///
    /// Returns [`CnnMrfError::InvalidConfiguration`] if an index is out of range.
    pub fn validate_depth(&self, num_layers: usize) -> CnnMrfResult<()> {
        let deepest = self
            .content_layers
            .iter()
            .chain(&self.style_layers)
            .copied()
            .max();

        match deepest {
            Some(depth) if depth >= num_layers => Err(CnnMrfError::InvalidConfiguration {
                reason: format!("Layer index {depth} is beyond the backbone depth {num_layers}"),
            }),
            _ => Ok(()),
        }
    }

    /// Number of backbone layers the model needs to run.
    pub fn depth(&self) -> usize {
        self.content_layers
            .iter()
            .chain(&self.style_layers)
            .max()
            .map_or(0, |deepest| deepest + 1)
    }

    /// Style-loss settings shared by every style layer.
    pub fn style_loss_config(&self) -> MrfStyleLossConfig {
        MrfStyleLossConfig::new()
            .with_patch_size(self.patch_size)
            .with_style_stride(self.mrf_style_stride)
            .with_synthesis_stride(self.mrf_synthesis_stride)
            .with_chunk_size(self.gpu_chunk_size)
            .with_max_response_elements(self.max_response_elements)
    }
}

fn ensure_unique(name: &str, indices: &[usize]) -> CnnMrfResult<()> {
    let mut seen = BTreeSet::new();
    match indices.iter().find(|index| !seen.insert(**index)) {
        Some(index) => Err(CnnMrfError::InvalidConfiguration {
            reason: format!("{name} lists index {index} more than once"),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        let config = CnnMrfConfig::new();

        assert!(config.validate().is_ok());
        assert_eq!(config.depth(), 15);
        assert!(config.validate_depth(37).is_ok());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = CnnMrfConfig::new().with_gpu_chunk_size(0);

        match config.validate() {
            Err(CnnMrfError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("gpu_chunk_size"));
            }
            _ => panic!("Expected InvalidConfiguration error"),
        }
    }

    #[test]
    fn duplicate_style_layers_are_rejected() {
        let config = CnnMrfConfig::new().with_style_layers(vec![7, 9, 7]);

        match config.validate() {
            Err(CnnMrfError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("style_layers"));
            }
            _ => panic!("Expected InvalidConfiguration error"),
        }
    }

    #[test]
    fn layers_beyond_backbone_are_rejected() {
        let config = CnnMrfConfig::new().with_content_layers(vec![40]);

        assert!(config.validate().is_ok());
        assert!(matches!(
            config.validate_depth(37),
            Err(CnnMrfError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn style_loss_config_carries_strides() {
        let config = CnnMrfConfig::new()
            .with_mrf_style_stride(1)
            .with_mrf_synthesis_stride(3)
            .with_gpu_chunk_size(64);

        let style = config.style_loss_config();
        assert_eq!(style.style_stride, 1);
        assert_eq!(style.synthesis_stride, 3);
        assert_eq!(style.chunk_size, 64);
        assert_eq!(style.patch_size, 3);
    }
}
