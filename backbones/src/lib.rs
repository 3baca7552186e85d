//! Backbone implementations for CNNMRF
//!
//! This crate defines the narrow interface the style-transfer model needs from
//! a frozen image classifier, [`Backbone`], and implements it for the
//! VGG feature stacks.

use burn::prelude::*;

pub use vgg::{VggBlock, VggBlocks, VggConfig, VggFeatures, VggLayer, VggLayerSpec, VggVariant};

/// Layer-addressable feature extractor.
///
/// Layers are run one at a time so that loss stages can be spliced between
/// them. Indices are stable: layer `i` is always the same operation.
pub trait Backbone<B: Backend> {
    /// Number of top-level layers.
    fn num_layers(&self) -> usize;

    /// Runs top-level layer `index` on `input`.
    fn forward_layer(&self, index: usize, input: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Number of children of layer `index`; zero for a leaf layer.
    ///
    /// Running every child of a layer in order must be equivalent to
    /// [`forward_layer`](Self::forward_layer).
    fn num_children(&self, _index: usize) -> usize {
        0
    }

    /// Runs child `child` of layer `index` on `input`.
    ///
    /// # Panics
    ///
    /// The default implementation panics: leaf layers have no children.
    fn forward_child(&self, index: usize, child: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let _ = input;
        panic!("layer {index} has no child {child}")
    }

    /// Runs layers `0..depth`.
    fn forward_until(&self, depth: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        (0..depth).fold(input, |input, index| self.forward_layer(index, input))
    }
}

/// Implement Backbone trait for the flat VGG stack
impl<B: Backend> Backbone<B> for VggFeatures<B> {
    fn num_layers(&self) -> usize {
        self.len()
    }

    fn forward_layer(&self, index: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        VggFeatures::forward_layer(self, index, input)
    }
}

/// Implement Backbone trait for the blocked VGG stack
impl<B: Backend> Backbone<B> for VggBlocks<B> {
    fn num_layers(&self) -> usize {
        self.len()
    }

    fn forward_layer(&self, index: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks()[index].forward(input)
    }

    fn num_children(&self, index: usize) -> usize {
        self.blocks().get(index).map_or(0, VggBlock::len)
    }

    fn forward_child(&self, index: usize, child: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks()[index].forward_child(child, input)
    }
}

/// Enumeration of supported backbone types
#[derive(Config, Debug, PartialEq)]
pub enum BackboneType {
    /// VGG16 features, one layer per operation
    Vgg16,
    /// VGG19 features, one layer per operation
    Vgg19,
    /// VGG19 features, one layer per convolution stage
    Vgg19Blocks,
}

/// Enum to wrap different backbone implementations
#[derive(Module, Debug)]
pub enum BackboneWrapper<B: Backend> {
    /// Flat feature stack
    Features(VggFeatures<B>),
    /// Feature stack grouped into stages
    Blocks(VggBlocks<B>),
}

impl<B: Backend> Backbone<B> for BackboneWrapper<B> {
    fn num_layers(&self) -> usize {
        match self {
            Self::Features(backbone) => backbone.num_layers(),
            Self::Blocks(backbone) => backbone.num_layers(),
        }
    }

    fn forward_layer(&self, index: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Features(backbone) => Backbone::forward_layer(backbone, index, input),
            Self::Blocks(backbone) => Backbone::forward_layer(backbone, index, input),
        }
    }

    fn num_children(&self, index: usize) -> usize {
        match self {
            Self::Features(backbone) => backbone.num_children(index),
            Self::Blocks(backbone) => backbone.num_children(index),
        }
    }

    fn forward_child(&self, index: usize, child: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Features(backbone) => backbone.forward_child(index, child, input),
            Self::Blocks(backbone) => backbone.forward_child(index, child, input),
        }
    }
}

/// Factory function to create backbones
pub fn create_backbone<B: Backend>(
    backbone_type: &BackboneType,
    device: &Device<B>,
) -> BackboneWrapper<B> {
    match backbone_type {
        BackboneType::Vgg16 => BackboneWrapper::Features(VggConfig::vgg16().init(device)),
        BackboneType::Vgg19 => BackboneWrapper::Features(VggConfig::vgg19().init(device)),
        BackboneType::Vgg19Blocks => {
            BackboneWrapper::Blocks(VggConfig::vgg19().init(device).into_blocks())
        }
    }
}

/// Creates a backbone and loads torchvision weights into it.
///
/// # Errors
///
/// Returns an error if the checkpoint cannot be loaded.
#[cfg(feature = "pretrained")]
pub fn create_pretrained_backbone<B: Backend>(
    backbone_type: &BackboneType,
    weights: impl Into<std::path::PathBuf>,
    device: &Device<B>,
) -> Result<BackboneWrapper<B>, burn::record::RecorderError> {
    let variant = match backbone_type {
        BackboneType::Vgg16 => VggConfig::vgg16(),
        BackboneType::Vgg19 | BackboneType::Vgg19Blocks => VggConfig::vgg19(),
    };
    let features = variant.init(device).load_pretrained(weights, device)?;

    Ok(match backbone_type {
        BackboneType::Vgg19Blocks => BackboneWrapper::Blocks(features.into_blocks()),
        _ => BackboneWrapper::Features(features),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_vgg19_backbone_layers() {
        let device = Default::default();
        let backbone = create_backbone::<TestBackend>(&BackboneType::Vgg19, &device);

        assert_eq!(backbone.num_layers(), 37);
        assert_eq!(backbone.num_children(0), 0);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        // conv3_3 sits behind two pooling layers
        let output = backbone.forward_until(15, input);
        assert_eq!(output.dims(), [1, 256, 8, 8]);
    }

    #[test]
    fn test_vgg19_blocks_children() {
        let device = Default::default();
        let backbone = create_backbone::<TestBackend>(&BackboneType::Vgg19Blocks, &device);

        assert_eq!(backbone.num_layers(), 5);
        assert_eq!(backbone.num_children(0), 5);
        assert_eq!(backbone.num_children(2), 9);
        assert_eq!(backbone.num_children(7), 0);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 16, 16],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let by_children =
            (0..5).fold(input.clone(), |x, child| backbone.forward_child(0, child, x));
        let by_layer = backbone.forward_layer(0, input);

        assert_eq!(by_layer.dims(), [1, 64, 8, 8]);
        by_children.into_data().assert_approx_eq::<f32>(
            &by_layer.into_data(),
            burn::tensor::Tolerance::default(),
        );
    }

    #[test]
    fn test_vgg16_backbone_layers() {
        let device = Default::default();
        let backbone = create_backbone::<TestBackend>(&BackboneType::Vgg16, &device);

        assert_eq!(backbone.num_layers(), 31);
    }
}
