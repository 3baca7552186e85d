//! Total-variation smoothness penalty.

use burn::prelude::*;

/// Total-variation loss on the raw synthesis image.
///
/// `loss = (Σ (x[i, j+1] - x[i, j])² + Σ (x[i+1, j] - x[i, j])²) / numel`
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalVariationLoss;

impl TotalVariationLoss {
    /// Create a new total-variation loss.
    pub const fn new() -> Self {
        Self
    }

    /// Calculate the total variation of `input`.
    ///
    /// A spatial dimension of size 1 contributes no differences.
    pub fn forward<B: Backend>(&self, input: Tensor<B, 4>) -> Tensor<B, 1> {
        let [batch, channels, height, width] = input.dims();
        let numel = batch * channels * height * width;
        let mut total = Tensor::<B, 1>::zeros([1], &input.device());

        if width > 1 {
            let dx = input
                .clone()
                .slice([0..batch, 0..channels, 0..height, 1..width])
                - input
                    .clone()
                    .slice([0..batch, 0..channels, 0..height, 0..width - 1]);
            total = total + dx.powf_scalar(2.0).sum();
        }

        if height > 1 {
            let dy = input
                .clone()
                .slice([0..batch, 0..channels, 1..height, 0..width])
                - input.slice([0..batch, 0..channels, 0..height - 1, 0..width]);
            total = total + dy.powf_scalar(2.0).sum();
        }

        total.div_scalar(numel as f64)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, TensorData, Tolerance};

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn constant_image_has_zero_variation() {
        let device = Default::default();
        let image = Tensor::<TestBackend, 4>::full([1, 3, 6, 7], 0.42, &device);

        let loss = TotalVariationLoss::new().forward(image);

        loss.into_data().assert_eq(&TensorData::from([0.0f32]), false);
    }

    #[test]
    fn known_gradient_image() {
        let device = Default::default();
        let image =
            Tensor::<TestBackend, 4>::from_floats([[[[0.0, 1.0], [2.0, 3.0]]]], &device);

        let loss = TotalVariationLoss::new().forward(image);

        // horizontal: 1 + 1, vertical: 4 + 4, over 4 elements
        loss.into_data().assert_eq(&TensorData::from([2.5f32]), false);
    }

    #[test]
    fn varying_image_is_penalized() {
        let device = Default::default();
        let image = Tensor::<TestBackend, 4>::random(
            [1, 3, 8, 8],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let loss = TotalVariationLoss::new().forward(image).into_scalar();

        assert!(loss > 0.0);
    }

    #[test]
    fn single_row_uses_horizontal_differences_only() {
        let device = Default::default();
        let image = Tensor::<TestBackend, 4>::from_floats([[[[0.0, 2.0, 2.0]]]], &device);

        let loss = TotalVariationLoss::new().forward(image);

        loss.into_data()
            .assert_approx_eq::<f32>(&TensorData::from([4.0f32 / 3.0]), Tolerance::default());
    }
}
