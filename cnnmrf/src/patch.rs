//! Patch sets cut from feature maps.

use burn::prelude::*;
use burn_extra_ops::{PatchGrid, TensorExtraOps};

use crate::error::{CnnMrfError, CnnMrfResult};

/// Overlapping `k x k` patches of a single feature map, in raster order.
#[derive(Debug, Clone)]
pub struct PatchSet<B: Backend> {
    patches: Tensor<B, 4>,
    grid: PatchGrid,
}

impl<B: Backend> PatchSet<B> {
    /// Extracts all patches of `features` at the given size and stride.
    ///
    /// # Errors
    ///
    /// Returns [`CnnMrfError::ShapeMismatch`] if the batch size is not 1, and
    /// [`CnnMrfError::EmptyPatchSet`] if no patch fits the map.
    pub fn extract(features: Tensor<B, 4>, patch_size: usize, stride: usize) -> CnnMrfResult<Self> {
        let grid = grid_for(&features, patch_size, stride)?;
        let patches = features.extract_patches(&grid);

        Ok(Self { patches, grid })
    }

    /// Number of patches.
    pub fn len(&self) -> usize {
        self.grid.len()
    }

    /// Whether the set has no patches.
    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    /// Number of channels of every patch.
    pub fn channels(&self) -> usize {
        self.patches.dims()[1]
    }

    /// Patch geometry over the source feature map.
    pub const fn grid(&self) -> &PatchGrid {
        &self.grid
    }

    /// All patches stacked as `[len, channels, k, k]`.
    pub fn tensor(&self) -> &Tensor<B, 4> {
        &self.patches
    }

    /// Offset and content of patch `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn get(&self, index: usize) -> ((usize, usize), Tensor<B, 3>) {
        assert!(index < self.len(), "patch {index} out of {}", self.len());
        let [_, channels, k, _] = self.patches.dims();
        let patch = self
            .patches
            .clone()
            .slice([index..index + 1, 0..channels, 0..k, 0..k])
            .squeeze::<3>(0);

        (self.grid.offset(index), patch)
    }

    /// Top-left offsets of all patches, in order.
    pub fn offsets(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.len()).map(|index| self.grid.offset(index))
    }

    /// Every patch divided by its own L2 norm.
    ///
    /// Norms are clamped away from zero, so all-zero patches stay all-zero.
    pub fn normalized(&self) -> Tensor<B, 4> {
        let [count, channels, k, _] = self.patches.dims();
        let norms = self
            .patches
            .clone()
            .reshape([count, channels * k * k])
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .clamp_min(f32::EPSILON)
            .reshape([count, 1, 1, 1]);

        self.patches.clone() / norms
    }
}

/// Patch geometry for a `[1, C, H, W]` feature map.
pub(crate) fn grid_for<B: Backend>(
    features: &Tensor<B, 4>,
    patch_size: usize,
    stride: usize,
) -> CnnMrfResult<PatchGrid> {
    let [batch, _, height, width] = features.dims();
    if batch != 1 {
        return Err(CnnMrfError::ShapeMismatch {
            expected: "a feature map with batch size 1".to_string(),
            actual: format!("{:?}", features.dims()),
        });
    }

    PatchGrid::new(height, width, patch_size, stride).ok_or(CnnMrfError::EmptyPatchSet {
        height,
        width,
        patch_size,
        stride,
    })
}
