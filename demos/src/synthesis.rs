//! Multi-resolution synthesis driver.
//!
//! The synthesis image starts as the content image at the coarsest pyramid
//! level. At every level the model is retargeted to the style and content
//! images at that resolution, the synthesis image is upsampled from the
//! previous level and then refined with Adam against the model's total loss.

use anyhow::Result;
use burn::{
    module::Param,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use cnnmrf_burn::{Backbone, CnnMrf};

use crate::{config::SynthesisConfig, imaging::resize};

/// The synthesis image as the single trainable parameter of a module.
#[derive(Module, Debug)]
pub struct SynthesisImage<B: Backend> {
    pixels: Param<Tensor<B, 4>>,
}

impl<B: Backend> SynthesisImage<B> {
    pub fn new(image: Tensor<B, 4>) -> Self {
        Self {
            pixels: Param::from_tensor(image.detach()),
        }
    }

    /// Current pixels, `[1, 3, H, W]`.
    pub fn tensor(&self) -> Tensor<B, 4> {
        self.pixels.val()
    }
}

/// Spatial sizes of an image pyramid, coarsest first.
///
/// Level `i` of `num_res` is the full size divided by `2^(num_res - 1 - i)`,
/// rounded to the nearest pixel.
pub fn pyramid([height, width]: [usize; 2], num_res: usize) -> Vec<[usize; 2]> {
    (0..num_res)
        .rev()
        .map(|octave| {
            let factor = 1usize << octave;
            let scale = |size: usize| ((size + factor / 2) / factor).max(1);
            [scale(height), scale(width)]
        })
        .collect()
}

/// Runs the full pyramid and returns the synthesis image at full resolution.
///
/// `style` and `content` are normalized `[1, 3, H, W]` images. `on_level` is
/// called with the synthesis image after every level.
pub fn synthesize<B, M, F>(
    config: &SynthesisConfig,
    backbone: M,
    style: Tensor<B, 4>,
    content: Tensor<B, 4>,
    mut on_level: F,
) -> Result<Tensor<B, 4>>
where
    B: AutodiffBackend,
    M: Backbone<B> + Module<B>,
    F: FnMut(usize, Tensor<B, 4>) -> Result<()>,
{
    let [_, _, content_height, content_width] = content.dims();
    let [_, _, style_height, style_width] = style.dims();
    let content_sizes = pyramid([content_height, content_width], config.num_res);
    let style_sizes = pyramid([style_height, style_width], config.num_res);

    let mut model = config.model.init(
        backbone,
        resize(style.clone(), style_sizes[0]),
        resize(content.clone(), content_sizes[0]),
    )?;
    let mut synthesis = resize(content.clone(), content_sizes[0]);

    let sizes = content_sizes.into_iter().zip(style_sizes);
    for (level, (content_size, style_size)) in sizes.enumerate() {
        if level > 0 {
            model.update_style_and_content_image(
                resize(style.clone(), style_size),
                resize(content.clone(), content_size),
            )?;
            synthesis = resize(synthesis, content_size);
        }

        tracing::info!(
            level,
            height = content_size[0],
            width = content_size[1],
            iterations = config.iterations,
            "synthesizing level"
        );

        synthesis = optimize(&model, synthesis, config, level)?;
        on_level(level, synthesis.clone())?;
    }

    Ok(synthesis)
}

fn optimize<B: AutodiffBackend, M: Backbone<B>>(
    model: &CnnMrf<B, M>,
    initial: Tensor<B, 4>,
    config: &SynthesisConfig,
    level: usize,
) -> Result<Tensor<B, 4>> {
    let mut image = SynthesisImage::new(initial);
    let mut optimizer = AdamConfig::new().init();

    for iteration in 0..config.iterations {
        let report = model.forward(image.tensor())?;

        if iteration % config.log_interval == 0 || iteration + 1 == config.iterations {
            tracing::info!(
                level,
                iteration,
                total = report.total.clone().into_scalar().elem::<f32>(),
                style = report.style_score().into_scalar().elem::<f32>(),
                content = report.content_score().into_scalar().elem::<f32>(),
                tv = report.tv_score().into_scalar().elem::<f32>(),
                "loss"
            );
        }

        let grads = GradientsParams::from_grads(report.total.backward(), &image);
        image = optimizer.step(config.learning_rate, image, grads);
    }

    Ok(image.tensor().detach())
}
