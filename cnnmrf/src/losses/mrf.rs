//! Markov-Random-Field style loss.
//!
//! The style activation is cut into overlapping patches once. On every forward
//! pass each synthesis patch is matched to the style patch with the highest
//! normalized cross-correlation, the matched (un-normalized) style patches are
//! placed back at their synthesis sites to form a target feature map, and the
//! loss is the mean squared error between that target and the synthesis
//! features. Where placements overlap, the target is the average of the
//! overlapping patches.

use burn::prelude::*;
use burn_extra_ops::{fold_patches, patch_coverage};

use crate::{
    error::CnnMrfResult,
    matcher::{PatchMatcher, PatchMatcherConfig, PatchMatches},
    patch::PatchSet,
};

/// Configuration for [`MrfStyleLoss`].
#[derive(Config, Debug)]
pub struct MrfStyleLossConfig {
    /// Side length of the square patches.
    #[config(default = 3)]
    pub patch_size: usize,
    /// Stride between style patches.
    #[config(default = 2)]
    pub style_stride: usize,
    /// Stride between synthesis patches.
    #[config(default = 2)]
    pub synthesis_stride: usize,
    /// Number of style patches correlated per convolution call.
    #[config(default = 256)]
    pub chunk_size: usize,
    /// Upper bound on the elements of one chunk's response map.
    #[config(default = "None")]
    pub max_response_elements: Option<usize>,
}

impl MrfStyleLossConfig {
    /// Initialize a style loss from the style image's activation.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk size is zero or no patch fits the
    /// activation.
    pub fn init<B: Backend>(&self, style_features: Tensor<B, 4>) -> CnnMrfResult<MrfStyleLoss<B>> {
        let matcher = PatchMatcherConfig::new()
            .with_chunk_size(self.chunk_size)
            .with_max_response_elements(self.max_response_elements)
            .init()?;
        let StyleSample { style, filters } =
            StyleSample::extract(style_features, self.patch_size, self.style_stride)?;

        Ok(MrfStyleLoss {
            style,
            filters,
            matcher,
            patch_size: self.patch_size,
            style_stride: self.style_stride,
            synthesis_stride: self.synthesis_stride,
        })
    }
}

/// MRF style loss at one backbone depth.
#[derive(Debug, Clone)]
pub struct MrfStyleLoss<B: Backend> {
    style: PatchSet<B>,
    filters: Tensor<B, 4>,
    matcher: PatchMatcher,
    patch_size: usize,
    style_stride: usize,
    synthesis_stride: usize,
}

/// Style patches cut from one activation, ready to be installed in a loss
/// with [`MrfStyleLoss::replace`].
#[derive(Debug, Clone)]
pub struct StyleSample<B: Backend> {
    style: PatchSet<B>,
    filters: Tensor<B, 4>,
}

impl<B: Backend> StyleSample<B> {
    fn extract(
        style_features: Tensor<B, 4>,
        patch_size: usize,
        stride: usize,
    ) -> CnnMrfResult<Self> {
        let style = PatchSet::extract(style_features.detach(), patch_size, stride)?;
        let filters = style.normalized();

        tracing::debug!(
            patches = style.len(),
            channels = style.channels(),
            patch_size,
            stride,
            "sampled style patches"
        );

        Ok(Self { style, filters })
    }

    /// The sampled patches.
    pub const fn patches(&self) -> &PatchSet<B> {
        &self.style
    }
}

/// Nearest-style-patch target for one synthesis activation.
#[derive(Debug, Clone)]
pub struct Reconstruction<B: Backend> {
    /// Overlap-averaged matched style patches, `[1, C, H, W]`.
    pub target: Tensor<B, 4>,
    /// 1 where at least one patch was placed, 0 elsewhere, `[1, 1, H, W]`.
    pub mask: Tensor<B, 4>,
    /// The matches the target was assembled from.
    pub matches: PatchMatches<B>,
}

impl<B: Backend> MrfStyleLoss<B> {
    /// Re-sample the style patches from a new style activation.
    ///
    /// # Errors
    ///
    /// Returns an error if no patch fits the activation. The previous patches
    /// are kept in that case.
    pub fn update(&mut self, style_features: Tensor<B, 4>) -> CnnMrfResult<()> {
        let sample = self.sample(style_features)?;
        self.replace(sample);
        Ok(())
    }

    /// Cuts patches from a new style activation with this loss's geometry,
    /// leaving the loss itself untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if no patch fits the activation.
    pub fn sample(&self, style_features: Tensor<B, 4>) -> CnnMrfResult<StyleSample<B>> {
        StyleSample::extract(style_features, self.patch_size, self.style_stride)
    }

    /// Installs patches produced by [`sample`](Self::sample).
    pub fn replace(&mut self, sample: StyleSample<B>) {
        self.style = sample.style;
        self.filters = sample.filters;
    }

    /// The current style patches.
    pub const fn style_patches(&self) -> &PatchSet<B> {
        &self.style
    }

    /// Builds the nearest-style-patch target for `synthesis`.
    ///
    /// # Errors
    ///
    /// Propagates matcher errors (channel mismatch, empty synthesis patch set,
    /// response budget).
    pub fn reconstruct(&self, synthesis: Tensor<B, 4>) -> CnnMrfResult<Reconstruction<B>> {
        let device = synthesis.device();
        let matches = self
            .matcher
            .find_matches(synthesis, &self.filters, self.synthesis_stride)?;
        let grid = *matches.grid();

        let summed = fold_patches(matches.gather(self.style.tensor()).detach(), &grid);
        let coverage = patch_coverage::<B>(&grid, &device);
        let target = summed / coverage.clone().clamp_min(1.0);
        let mask = coverage.greater_elem(0.0).float();

        Ok(Reconstruction {
            target,
            mask,
            matches,
        })
    }

    /// Calculate the MRF loss of `input`.
    ///
    /// Elements no synthesis patch reaches are left out of the mean.
    ///
    /// # Errors
    ///
    /// See [`reconstruct`](Self::reconstruct).
    pub fn forward(&self, input: Tensor<B, 4>) -> CnnMrfResult<Tensor<B, 1>> {
        let [_, channels, _, _] = input.dims();
        let Reconstruction { target, mask, .. } = self.reconstruct(input.clone())?;

        let covered = mask.clone().sum().mul_scalar(channels as f64);
        let squared = ((input - target) * mask).powf_scalar(2.0).sum();

        Ok(squared / covered)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, Tolerance};

    use super::*;
    use crate::{
        error::CnnMrfError,
        tests::{TestAutodiffBackend, TestBackend},
    };

    fn random_features(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn self_match_has_near_zero_loss() {
        let features = random_features([1, 6, 11, 11]);
        let loss = MrfStyleLossConfig::new().init(features.clone()).unwrap();

        let value = loss.forward(features).unwrap().into_scalar();

        assert!(value.abs() < 1e-6, "loss {value}");
    }

    #[test]
    fn self_match_with_uncovered_tail_has_near_zero_loss() {
        // 10 - 3 is odd, so the last row and column are never reached at stride 2
        let features = random_features([1, 4, 10, 10]);
        let loss = MrfStyleLossConfig::new()
            .with_chunk_size(5)
            .init(features.clone())
            .unwrap();

        let reconstruction = loss.reconstruct(features.clone()).unwrap();
        assert_eq!(reconstruction.mask.clone().sum().into_scalar(), 81.0);

        let value = loss.forward(features).unwrap().into_scalar();
        assert!(value.abs() < 1e-6, "loss {value}");
    }

    #[test]
    fn reconstruction_of_self_reproduces_features() {
        let features = random_features([1, 3, 9, 9]);
        let loss = MrfStyleLossConfig::new()
            .with_style_stride(1)
            .with_synthesis_stride(1)
            .init(features.clone())
            .unwrap();

        let reconstruction = loss.reconstruct(features.clone()).unwrap();

        // every window is its own nearest style patch
        assert_eq!(
            reconstruction.matches.to_vec(),
            (0..loss.style_patches().len()).collect::<Vec<_>>()
        );
        reconstruction
            .target
            .into_data()
            .assert_approx_eq::<f32>(&features.into_data(), Tolerance::default());
    }

    #[test]
    fn different_input_has_positive_loss() {
        let loss = MrfStyleLossConfig::new()
            .init(random_features([1, 4, 9, 9]))
            .unwrap();

        let value = loss
            .forward(random_features([1, 4, 9, 9]))
            .unwrap()
            .into_scalar();

        assert!(value > 0.0);
    }

    #[test]
    fn update_restyles_without_rebuilding() {
        let mut loss = MrfStyleLossConfig::new()
            .init(random_features([1, 4, 9, 9]))
            .unwrap();
        let new_style = random_features([1, 4, 13, 13]);

        loss.update(new_style.clone()).unwrap();

        assert_eq!(loss.style_patches().len(), 36);
        let value = loss.forward(new_style).unwrap().into_scalar();
        assert!(value.abs() < 1e-6, "loss {value}");
    }

    #[test]
    fn failed_update_keeps_previous_patches() {
        let mut loss = MrfStyleLossConfig::new()
            .init(random_features([1, 4, 9, 9]))
            .unwrap();

        let result = loss.update(random_features([1, 4, 2, 2]));

        assert!(matches!(result, Err(CnnMrfError::EmptyPatchSet { .. })));
        assert_eq!(loss.style_patches().len(), 16);
    }

    #[test]
    fn sample_leaves_loss_untouched_until_replaced() {
        let style = random_features([1, 4, 9, 9]);
        let mut loss = MrfStyleLossConfig::new().init(style.clone()).unwrap();
        let new_style = random_features([1, 4, 13, 13]);

        let sample = loss.sample(new_style.clone()).unwrap();

        assert_eq!(sample.patches().len(), 36);
        assert_eq!(loss.style_patches().len(), 16);
        let value = loss.forward(style).unwrap().into_scalar();
        assert!(value.abs() < 1e-6, "loss {value}");

        loss.replace(sample);

        assert_eq!(loss.style_patches().len(), 36);
        let value = loss.forward(new_style).unwrap().into_scalar();
        assert!(value.abs() < 1e-6, "loss {value}");
    }

    #[test]
    fn stride_wider_than_patch_leaves_gaps() {
        let features = random_features([1, 2, 11, 11]);
        let loss = MrfStyleLossConfig::new()
            .with_style_stride(4)
            .with_synthesis_stride(4)
            .init(features.clone())
            .unwrap();

        let reconstruction = loss.reconstruct(features.clone()).unwrap();

        // 3x3 sites of 3x3 patches
        assert_eq!(reconstruction.mask.sum().into_scalar(), 81.0);
        let value = loss.forward(features).unwrap().into_scalar();
        assert!(value.abs() < 1e-6, "loss {value}");
    }

    #[test]
    fn loss_has_gradient_toward_style() {
        let device = Default::default();
        let style = Tensor::<TestAutodiffBackend, 4>::random(
            [1, 3, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let loss = MrfStyleLossConfig::new().init(style).unwrap();
        let synthesis = Tensor::<TestAutodiffBackend, 4>::random(
            [1, 3, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        )
        .require_grad();

        let grads = loss.forward(synthesis.clone()).unwrap().backward();
        let grad = synthesis.grad(&grads).unwrap();

        assert_eq!(grad.dims(), [1, 3, 8, 8]);
        assert!(grad.abs().sum().into_scalar() > 0.0);
    }
}
