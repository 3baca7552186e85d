//! Mean Squared Error (L2) loss against a fixed content activation.

use burn::prelude::*;

use crate::error::{CnnMrfError, CnnMrfResult};

/// Content loss at one backbone depth.
#[derive(Debug, Clone)]
pub struct ContentLoss<B: Backend> {
    target: Tensor<B, 4>,
}

impl<B: Backend> ContentLoss<B> {
    /// Create a content loss for `target`. The target is detached.
    pub fn new(target: Tensor<B, 4>) -> Self {
        Self {
            target: target.detach(),
        }
    }

    /// Replace the target activation.
    pub fn update(&mut self, target: Tensor<B, 4>) {
        self.target = target.detach();
    }

    /// The current target activation.
    pub fn target(&self) -> &Tensor<B, 4> {
        &self.target
    }

    /// Calculate MSE loss between `input` and the target.
    ///
    /// # Errors
    ///
    /// Returns [`CnnMrfError::ShapeMismatch`] if `input` and the target differ
    /// in shape.
    pub fn forward(&self, input: Tensor<B, 4>) -> CnnMrfResult<Tensor<B, 1>> {
        if input.dims() != self.target.dims() {
            return Err(CnnMrfError::ShapeMismatch {
                expected: format!("{:?}", self.target.dims()),
                actual: format!("{:?}", input.dims()),
            });
        }

        Ok((input - self.target.clone()).powf_scalar(2.0).mean())
    }
}
