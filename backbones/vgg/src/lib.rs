//! VGG feature stack for CNNMRF.
//!
//! This crate provides the convolutional part (`features`) of the VGG
//! classifiers, laid out exactly like torchvision's `vgg16().features` and
//! `vgg19().features`: every convolution, activation and pooling operation is
//! its own addressable layer, so layer indices line up with the ones used by
//! PyTorch style transfer recipes.
//!
//! Two layouts are available:
//! - [`VggFeatures`]: the flat layer list (37 layers for VGG19).
//! - [`VggBlocks`]: one layer per convolution stage (5 stages), where every
//!   stage exposes its convolutions, activations and pooling as children.

use core::f64::consts::SQRT_2;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// VGG configuration type for layer specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VggLayerSpec {
    /// Convolution layer with specified output channels, followed by a ReLU.
    Conv(usize),
    /// Max pooling layer.
    MaxPool,
}

use VggLayerSpec::{Conv as C, MaxPool as M};

#[rustfmt::skip]
const VGG16_LAYERS: &[VggLayerSpec] = &[
    C(64), C(64), M,
    C(128), C(128), M,
    C(256), C(256), C(256), M,
    C(512), C(512), C(512), M,
    C(512), C(512), C(512), M,
];

#[rustfmt::skip]
const VGG19_LAYERS: &[VggLayerSpec] = &[
    C(64), C(64), M,
    C(128), C(128), M,
    C(256), C(256), C(256), C(256), M,
    C(512), C(512), C(512), C(512), M,
    C(512), C(512), C(512), C(512), M,
];

/// VGG variant enumeration
#[derive(Config, Debug, PartialEq)]
pub enum VggVariant {
    /// VGG16
    Vgg16,
    /// VGG19
    Vgg19,
}

impl VggVariant {
    /// The layer plan of the variant's feature stack.
    pub const fn layers(&self) -> &'static [VggLayerSpec] {
        match self {
            Self::Vgg16 => VGG16_LAYERS,
            Self::Vgg19 => VGG19_LAYERS,
        }
    }
}

/// VGG configuration
#[derive(Config, Debug)]
pub struct VggConfig {
    /// VGG variant (16 or 19)
    #[config(default = "VggVariant::Vgg19")]
    pub variant: VggVariant,
    /// Number of channels of the input image.
    #[config(default = 3)]
    pub in_channels: usize,
}

impl VggConfig {
    /// VGG16 configuration
    pub fn vgg16() -> Self {
        Self::new().with_variant(VggVariant::Vgg16)
    }

    /// VGG19 configuration
    pub fn vgg19() -> Self {
        Self::new().with_variant(VggVariant::Vgg19)
    }

    /// Initialize the flat VGG feature stack.
    pub fn init<B: Backend>(&self, device: &B::Device) -> VggFeatures<B> {
        VggFeatures::from_plan(self.variant.layers(), self.in_channels, device)
    }
}

/// Individual layer types in the VGG feature stack.
#[derive(Module, Debug)]
pub enum VggLayer<B: Backend> {
    /// 3x3 convolution.
    Conv(Conv2d<B>),
    /// Rectified linear activation.
    Relu(Relu),
    /// 2x2 max pooling.
    MaxPool(MaxPool2d),
}

impl<B: Backend> VggLayer<B> {
    /// Forward pass through the layer.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Conv(conv) => conv.forward(input),
            Self::Relu(relu) => relu.forward(input),
            Self::MaxPool(pool) => pool.forward(input),
        }
    }

    const fn is_pool(&self) -> bool {
        matches!(self, Self::MaxPool(_))
    }
}

/// Flat VGG feature stack with torchvision layer indexing.
#[derive(Module, Debug)]
pub struct VggFeatures<B: Backend> {
    layers: Vec<VggLayer<B>>,
}

impl<B: Backend> VggFeatures<B> {
    /// Builds a feature stack from a layer plan.
    ///
    /// Every [`VggLayerSpec::Conv`] becomes a 3x3 convolution followed by a
    /// ReLU.
    pub fn from_plan(plan: &[VggLayerSpec], in_channels: usize, device: &B::Device) -> Self {
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        };

        let mut layers = Vec::new();
        let mut current_channels = in_channels;

        for spec in plan {
            match spec {
                VggLayerSpec::Conv(out_channels) => {
                    // 3x3 conv, stride=1, padding=1
                    let conv = Conv2dConfig::new([current_channels, *out_channels], [3, 3])
                        .with_stride([1, 1])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .with_initializer(initializer.clone())
                        .init(device);
                    layers.push(VggLayer::Conv(conv));
                    layers.push(VggLayer::Relu(Relu::new()));
                    current_channels = *out_channels;
                }
                VggLayerSpec::MaxPool => {
                    let maxpool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
                    layers.push(VggLayer::MaxPool(maxpool));
                }
            }
        }

        Self { layers }
    }

    /// Number of layers in the stack.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The layers of the stack in execution order.
    pub fn layers(&self) -> &[VggLayer<B>] {
        &self.layers
    }

    /// Runs a single layer.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn forward_layer(&self, index: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers[index].forward(input)
    }

    /// Runs the whole stack.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers
            .iter()
            .fold(input, |input, layer| layer.forward(input))
    }

    /// Regroups the stack into one block per convolution stage.
    ///
    /// Every block ends with its pooling layer, so block `i` yields the same
    /// activation as the flat stack right after its `i`-th pooling layer.
    pub fn into_blocks(self) -> VggBlocks<B> {
        let mut blocks = Vec::new();
        let mut current = Vec::new();

        for layer in self.layers {
            let closes_block = layer.is_pool();
            current.push(layer);
            if closes_block {
                blocks.push(VggBlock {
                    layers: core::mem::take(&mut current),
                });
            }
        }
        if !current.is_empty() {
            blocks.push(VggBlock { layers: current });
        }

        VggBlocks { blocks }
    }
}

/// A convolution stage of the VGG architecture.
#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    layers: Vec<VggLayer<B>>,
}

impl<B: Backend> VggBlock<B> {
    /// Forward pass through the whole block.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers
            .iter()
            .fold(input, |input, layer| layer.forward(input))
    }

    /// Number of child layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the block has no child layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs a single child layer.
    ///
    /// # Panics
    ///
    /// Panics if `child` is out of range.
    pub fn forward_child(&self, child: usize, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers[child].forward(input)
    }
}

/// VGG feature stack grouped into convolution stages.
#[derive(Module, Debug)]
pub struct VggBlocks<B: Backend> {
    blocks: Vec<VggBlock<B>>,
}

impl<B: Backend> VggBlocks<B> {
    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The blocks in execution order.
    pub fn blocks(&self) -> &[VggBlock<B>] {
        &self.blocks
    }

    /// Runs every block.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |input, block| block.forward(input))
    }
}

#[cfg(feature = "pretrained")]
mod pretrained {
    use std::path::PathBuf;

    use burn::{
        nn::conv::Conv2d,
        prelude::*,
        record::{FullPrecisionSettings, Recorder, RecorderError},
    };
    use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

    use super::{VggFeatures, VggLayer};

    /// The convolutions of a feature stack, in order.
    #[derive(Module, Debug)]
    struct ConvStack<B: Backend> {
        convs: Vec<Conv2d<B>>,
    }

    impl<B: Backend> VggFeatures<B> {
        /// Loads torchvision `vgg16`/`vgg19` weights from a `.pth` checkpoint.
        ///
        /// Only the `features.*` entries are read; the classifier head is ignored.
        ///
        /// # Errors
        ///
        /// Returns an error if the checkpoint cannot be read or lacks a
        /// convolution of the stack.
        pub fn load_pretrained(
            self,
            path: impl Into<PathBuf>,
            device: &B::Device,
        ) -> Result<Self, RecorderError> {
            let mut load_args = LoadArgs::new(path.into());
            let mut templates = Vec::new();

            for (index, layer) in self.layers.iter().enumerate() {
                if let VggLayer::Conv(conv) = layer {
                    load_args = load_args.with_key_remap(
                        &format!("features\\.{index}\\.(.+)"),
                        &format!("convs.{}.$1", templates.len()),
                    );
                    templates.push(conv.clone());
                }
            }

            let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
                .load(load_args, device)?;
            let mut loaded = ConvStack { convs: templates }
                .load_record(record)
                .convs
                .into_iter();

            let layers = self
                .layers
                .into_iter()
                .map(|layer| match layer {
                    VggLayer::Conv(conv) => VggLayer::Conv(loaded.next().unwrap_or(conv)),
                    other => other,
                })
                .collect();

            Ok(Self { layers })
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::NdArray,
        tensor::{Distribution, Tolerance},
    };

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn vgg19_has_torchvision_layer_count() {
        let device = Default::default();
        let model = VggConfig::vgg19().init::<TestBackend>(&device);

        assert_eq!(model.len(), 37);
        assert!(matches!(model.layers()[0], VggLayer::Conv(_)));
        assert!(matches!(model.layers()[1], VggLayer::Relu(_)));
        assert!(matches!(model.layers()[4], VggLayer::MaxPool(_)));
        assert!(matches!(model.layers()[36], VggLayer::MaxPool(_)));
    }

    #[test]
    fn vgg16_has_torchvision_layer_count() {
        let device = Default::default();
        let model = VggConfig::vgg16().init::<TestBackend>(&device);

        assert_eq!(model.len(), 31);
    }

    #[test]
    fn vgg19_layer_by_layer_matches_full_forward() {
        let device = Default::default();
        let model = VggConfig::vgg19().init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let mut x = input.clone();
        for index in 0..model.len() {
            x = model.forward_layer(index, x);
        }
        let full = model.forward(input);

        assert_eq!(full.dims(), [1, 512, 1, 1]);
        x.into_data()
            .assert_approx_eq::<f32>(&full.into_data(), Tolerance::default());
    }

    #[test]
    fn into_blocks_groups_by_pooling() {
        let device = Default::default();
        let model = VggConfig::vgg19().init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let flat = model.forward(input.clone());

        let blocks = model.into_blocks();
        let lengths: Vec<usize> = blocks.blocks().iter().map(VggBlock::len).collect();

        assert_eq!(lengths, vec![5, 5, 9, 9, 9]);
        blocks
            .forward(input)
            .into_data()
            .assert_approx_eq::<f32>(&flat.into_data(), Tolerance::default());
    }
}
