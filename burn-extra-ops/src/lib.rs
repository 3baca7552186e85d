//! Additional operations for the Burn deep learning framework
//!
//! This crate provides operations that are commonly used in patch-based image
//! synthesis but are not available in the core Burn framework.

use burn::prelude::*;

mod patches;

// Convenient re-exports
pub use patches::{extract_patches, fold_patches, patch_coverage, PatchGrid};

/// Additional operations for Burn tensors
pub trait TensorExtraOps<B: Backend> {
    /// Cut the tensor into the windows of `grid`.
    fn extract_patches(self, grid: &PatchGrid) -> Self;

    /// Place windows of `grid` back into map space, summing overlaps.
    fn fold_patches(self, grid: &PatchGrid) -> Self;
}

impl<B: Backend> TensorExtraOps<B> for Tensor<B, 4> {
    fn extract_patches(self, grid: &PatchGrid) -> Self {
        extract_patches(self, grid)
    }

    fn fold_patches(self, grid: &PatchGrid) -> Self {
        fold_patches(self, grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{ndarray::NdArray, Autodiff},
        tensor::Tensor,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_tensor_extra_ops() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::random(
            [1, 2, 5, 5],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        )
        .require_grad();
        let grid = PatchGrid::new(5, 5, 3, 1).unwrap();

        let patches = tensor.clone().extract_patches(&grid);
        assert_eq!(patches.dims(), [9, 2, 3, 3]);

        let folded = patches.fold_patches(&grid);
        assert_eq!(folded.dims(), tensor.dims());

        // Every element is reached, so gradients flow back to the whole input
        let grads = folded.sum().backward();
        let grad = tensor.grad(&grads).unwrap();
        assert_eq!(grad.dims(), [1, 2, 5, 5]);
        assert!(grad.min().into_scalar() >= 1.0);
    }
}
