//! # Patch Extraction and Reassembly
//!
//! Cuts a feature map into overlapping `k x k` windows and places windows back
//! into feature-map space. Both directions are expressed as convolution
//! primitives (`unfold4d` and a grouped `conv_transpose2d`), so they run on any
//! backend and stay differentiable.

use burn::tensor::{
    backend::Backend,
    module::{conv_transpose2d, unfold4d},
    ops::{ConvTransposeOptions, UnfoldOptions},
    Tensor,
};

/// Geometry of a set of square windows laid over a feature map.
///
/// Windows start at every `(row, col)` that is a multiple of `stride` and still
/// fits inside the map. Trailing partial windows are dropped; there is no
/// padding. Windows are numbered in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    height: usize,
    width: usize,
    patch_size: usize,
    stride: usize,
    rows: usize,
    cols: usize,
}

impl PatchGrid {
    /// Creates the grid for a `height x width` map.
    ///
    /// Returns `None` when no window fits, or when `patch_size` or `stride`
    /// is zero.
    pub const fn new(
        height: usize,
        width: usize,
        patch_size: usize,
        stride: usize,
    ) -> Option<Self> {
        if patch_size == 0 || stride == 0 || patch_size > height || patch_size > width {
            return None;
        }

        Some(Self {
            height,
            width,
            patch_size,
            stride,
            rows: (height - patch_size) / stride + 1,
            cols: (width - patch_size) / stride + 1,
        })
    }

    /// Number of windows.
    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the grid has no windows.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-left `(row, col)` of window `index`.
    pub const fn offset(&self, index: usize) -> (usize, usize) {
        (
            (index / self.cols) * self.stride,
            (index % self.cols) * self.stride,
        )
    }

    /// Height of the underlying map.
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Width of the underlying map.
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Side length of a window.
    pub const fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Distance between neighbouring windows.
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Number of window rows.
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of window columns.
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Rows and columns at the bottom/right edge that no window reaches.
    ///
    /// Always smaller than the stride, which is what transposed convolution
    /// requires for its output padding.
    const fn uncovered_tail(&self) -> [usize; 2] {
        [
            self.height - ((self.rows - 1) * self.stride + self.patch_size),
            self.width - ((self.cols - 1) * self.stride + self.patch_size),
        ]
    }
}

/// Extracts every window of `grid` from `features`.
///
/// # Shapes
/// - features: `[batch, channels, height, width]`
/// - output: `[batch * grid.len(), channels, k, k]`, batch-major then row-major
pub fn extract_patches<B: Backend>(features: Tensor<B, 4>, grid: &PatchGrid) -> Tensor<B, 4> {
    let [batch, channels, _, _] = features.dims();
    let k = grid.patch_size;

    let options = UnfoldOptions::new([grid.stride, grid.stride], [0, 0], [1, 1]);
    // [batch, channels * k * k, windows]
    let columns = unfold4d(features, [k, k], options);

    columns
        .swap_dims(1, 2)
        .reshape([batch * grid.len(), channels, k, k])
}

/// Places windows back into feature-map space, summing where they overlap.
///
/// This is the adjoint of [`extract_patches`]. Elements no window reaches are
/// zero.
///
/// # Shapes
/// - patches: `[batch * grid.len(), channels, k, k]`
/// - output: `[batch, channels, height, width]`
pub fn fold_patches<B: Backend>(patches: Tensor<B, 4>, grid: &PatchGrid) -> Tensor<B, 4> {
    let [count, channels, k, _] = patches.dims();
    let batch = count / grid.len();
    let device = patches.device();

    let columns = patches
        .reshape([batch, grid.len(), channels * k * k])
        .swap_dims(1, 2)
        .reshape([batch, channels * k * k, grid.rows, grid.cols]);

    let options = ConvTransposeOptions::new(
        [grid.stride, grid.stride],
        [0, 0],
        grid.uncovered_tail(),
        [1, 1],
        channels,
    );

    conv_transpose2d(columns, placement_kernel(channels, k, &device), None, options)
}

/// Number of windows covering each element of the map.
///
/// # Shapes
/// - output: `[1, 1, height, width]`
pub fn patch_coverage<B: Backend>(grid: &PatchGrid, device: &B::Device) -> Tensor<B, 4> {
    let k = grid.patch_size;
    let options = ConvTransposeOptions::new(
        [grid.stride, grid.stride],
        [0, 0],
        grid.uncovered_tail(),
        [1, 1],
        1,
    );

    conv_transpose2d(
        Tensor::ones([1, 1, grid.rows, grid.cols], device),
        Tensor::ones([1, 1, k, k], device),
        None,
        options,
    )
}

/// Grouped transposed-convolution weight that writes input channel
/// `c * k * k + t` to position `t` of output channel `c`.
///
/// Shape: `[channels * k * k, 1, k, k]`.
fn placement_kernel<B: Backend>(channels: usize, k: usize, device: &B::Device) -> Tensor<B, 4> {
    let taps = k * k;
    let mut one_hot = vec![0.0f32; taps * taps];
    for tap in 0..taps {
        one_hot[tap * taps + tap] = 1.0;
    }

    Tensor::<B, 1>::from_floats(one_hot.as_slice(), device)
        .reshape([taps, 1, k, k])
        .repeat(&[channels, 1, 1, 1])
}
