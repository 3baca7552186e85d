//! Image I/O and the pre/post-processing the VGG backbone expects.
//!
//! Images enter the model as `[1, 3, H, W]` tensors normalized with the
//! ImageNet channel statistics used to train the torchvision weights.

use std::path::Path;

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
        DType,
    },
};
use image::{
    buffer::ConvertBuffer, imageops::FilterType, DynamicImage, GenericImageView, ImageBuffer, Rgb,
};

/// ImageNet per-channel mean.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet per-channel standard deviation.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Loads an image as a `[1, 3, H, W]` tensor in `[0, 1]`.
///
/// If `max_size` is given, the image is downscaled so that its longer side is
/// at most `max_size` pixels, keeping the aspect ratio.
pub fn load_image<B: Backend, P: AsRef<Path>>(
    path: P,
    max_size: Option<u32>,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let path = path.as_ref();
    let mut img =
        image::open(path).with_context(|| format!("Failed to open image at {}", path.display()))?;

    if let Some(max_size) = max_size {
        let (width, height) = img.dimensions();
        if width.max(height) > max_size {
            img = img.resize(max_size, max_size, FilterType::Triangle);
        }
    }

    Ok(image_to_tensor(img, device))
}

/// Converts a decoded image to a `[1, 3, H, W]` tensor in `[0, 1]`.
pub fn image_to_tensor<B: Backend>(img: DynamicImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = img.dimensions();
    let data = TensorData::new(img.into_rgb32f().into_raw(), [height as usize, width as usize, 3])
        .convert::<B::FloatElem>();

    Tensor::<B, 3>::from_data(data, device)
        .permute([2, 0, 1])
        .unsqueeze::<4>()
}

/// Converts a `[1, 3, H, W]` tensor in `[0, 1]` to an 8-bit RGB image.
///
/// Values outside `[0, 1]` are clamped.
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 4>) -> Result<DynamicImage> {
    let [batch, channels, height, width] = tensor.dims();
    if batch != 1 || channels != 3 {
        anyhow::bail!("Expected a [1, 3, H, W] image tensor, got {:?}", tensor.dims());
    }

    let data = tensor
        .clamp(0.0, 1.0)
        .squeeze::<3>(0)
        .permute([1, 2, 0])
        .into_data()
        .convert_dtype(DType::F32)
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to convert tensor to f32: {e:?}"))?;

    let buffer = ImageBuffer::<Rgb<f32>, _>::from_raw(width as u32, height as u32, data)
        .context("Failed to create RGB f32 image buffer")?;
    let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> = buffer.convert();

    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Saves a `[1, 3, H, W]` tensor in `[0, 1]` as an image file.
pub fn save_image<B: Backend, P: AsRef<Path>>(tensor: Tensor<B, 4>, path: P) -> Result<()> {
    let path = path.as_ref();
    tensor_to_image(tensor)?
        .save(path)
        .with_context(|| format!("Failed to save image to {}", path.display()))
}

fn channel_stats<B: Backend>(stats: [f32; 3], device: &B::Device) -> Tensor<B, 4> {
    Tensor::<B, 1>::from_floats(stats, device).reshape([1, 3, 1, 1])
}

/// Maps `[0, 1]` RGB to the backbone's input distribution.
pub fn normalize<B: Backend>(image: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = image.device();
    (image - channel_stats(IMAGENET_MEAN, &device)) / channel_stats(IMAGENET_STD, &device)
}

/// Inverse of [`normalize`].
pub fn denormalize<B: Backend>(image: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = image.device();
    image * channel_stats(IMAGENET_STD, &device) + channel_stats(IMAGENET_MEAN, &device)
}

/// Bilinear resize of a `[N, C, H, W]` tensor.
pub fn resize<B: Backend>(image: Tensor<B, 4>, [height, width]: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, current_height, current_width] = image.dims();
    if (current_height, current_width) == (height, width) {
        return image;
    }

    interpolate(
        image,
        [height, width],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::Tolerance};

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_mean_color_normalizes_to_zero() {
        let device = Default::default();
        let image = channel_stats::<TestBackend>(IMAGENET_MEAN, &device).repeat(&[1, 1, 2, 3]);

        let normalized = normalize(image);

        normalized.into_data().assert_approx_eq::<f32>(
            &TensorData::zeros::<f32, _>([1, 3, 2, 3]),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_tensor_to_image_clamps_and_keeps_layout() {
        let device = Default::default();
        // red at (0, 0), out-of-range green at (0, 1)
        let tensor = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 0.0]], [[0.0, 2.0]], [[0.0, -1.0]]]],
            &device,
        );

        let img = tensor_to_image(tensor).unwrap().into_rgb8();

        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [0, 255, 0]);
    }

    #[test]
    fn test_resize_changes_spatial_dims_only() {
        let device = Default::default();
        let image = Tensor::<TestBackend, 4>::ones([1, 3, 8, 6], &device);

        let resized = resize(image, [4, 3]);

        assert_eq!(resized.dims(), [1, 3, 4, 3]);
        resized.into_data().assert_approx_eq::<f32>(
            &TensorData::ones::<f32, _>([1, 3, 4, 3]),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_wrong_channel_count_is_rejected() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device);

        assert!(tensor_to_image(tensor).is_err());
    }
}
