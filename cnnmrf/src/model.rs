//! # Composite style-transfer model
//!
//! A [`CnnMrf`] is an ordered pipeline of [`Stage`]s: frozen backbone layers
//! with loss stages spliced in after the depths named by the configuration.
//! Loss stages pass their input through untouched; the scalar each one
//! computes is collected into a [`LossReport`] by [`CnnMrf::forward`].
//!
//! The first stage is always the total-variation loss, so it sees the raw
//! synthesis image rather than backbone features.

use std::ops::Range;

use backbones::Backbone;
use burn::prelude::*;

use crate::{
    config::CnnMrfConfig,
    error::{CnnMrfError, CnnMrfResult},
    losses::{ContentLoss, MrfStyleLoss, StyleSample, TotalVariationLoss},
};

/// A run of backbone operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneStage {
    /// Top-level layer index.
    pub depth: usize,
    /// Children of the layer to run, or `None` for the whole layer.
    pub children: Option<Range<usize>>,
}

impl BackboneStage {
    /// A stage running the whole layer `depth`.
    pub const fn layer(depth: usize) -> Self {
        Self {
            depth,
            children: None,
        }
    }

    /// A stage running `children` of layer `depth`.
    pub const fn children(depth: usize, children: Range<usize>) -> Self {
        Self {
            depth,
            children: Some(children),
        }
    }

    /// Runs this stage of `backbone` on `input`.
    pub fn forward<B: Backend, M: Backbone<B>>(
        &self,
        backbone: &M,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        match &self.children {
            None => backbone.forward_layer(self.depth, input),
            Some(children) => children
                .clone()
                .fold(input, |x, child| backbone.forward_child(self.depth, child, x)),
        }
    }
}

/// The kind of a loss stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossKind {
    /// Smoothness of the raw image.
    TotalVariation,
    /// Distance to the content activation.
    Content,
    /// MRF distance to the style patches.
    Style,
}

/// A pass-through stage that emits a scalar loss.
#[derive(Debug, Clone)]
pub enum LossStage<B: Backend> {
    TotalVariation(TotalVariationLoss),
    Content(ContentLoss<B>),
    Style(MrfStyleLoss<B>),
}

impl<B: Backend> LossStage<B> {
    pub const fn kind(&self) -> LossKind {
        match self {
            Self::TotalVariation(_) => LossKind::TotalVariation,
            Self::Content(_) => LossKind::Content,
            Self::Style(_) => LossKind::Style,
        }
    }

    /// Calculate the loss of the tensor reaching this stage.
    ///
    /// # Errors
    ///
    /// Propagates content and style loss errors.
    pub fn forward(&self, input: Tensor<B, 4>) -> CnnMrfResult<Tensor<B, 1>> {
        match self {
            Self::TotalVariation(loss) => Ok(loss.forward(input)),
            Self::Content(loss) => loss.forward(input),
            Self::Style(loss) => loss.forward(input),
        }
    }
}

/// One node of the pipeline.
#[derive(Debug, Clone)]
pub enum Stage<B: Backend> {
    Backbone(BackboneStage),
    Loss(LossStage<B>),
}

/// Loss emitted by a single stage.
#[derive(Debug, Clone)]
pub struct StageLoss<B: Backend> {
    /// Position of the stage in the pipeline.
    pub position: usize,
    pub kind: LossKind,
    pub value: Tensor<B, 1>,
}

/// Losses collected from one forward pass.
#[derive(Debug, Clone)]
pub struct LossReport<B: Backend> {
    /// Weighted sum of all stage losses.
    pub total: Tensor<B, 1>,
    /// Every stage loss in pipeline order.
    pub stages: Vec<StageLoss<B>>,
}

impl<B: Backend> LossReport<B> {
    /// Unweighted sum of the losses of `kind`; zero if there are none.
    pub fn score(&self, kind: LossKind) -> Tensor<B, 1> {
        let device = self.total.device();
        self.stages
            .iter()
            .filter(|stage| stage.kind == kind)
            .fold(Tensor::zeros([1], &device), |sum, stage| {
                sum + stage.value.clone()
            })
    }

    pub fn style_score(&self) -> Tensor<B, 1> {
        self.score(LossKind::Style)
    }

    pub fn content_score(&self) -> Tensor<B, 1> {
        self.score(LossKind::Content)
    }

    pub fn tv_score(&self) -> Tensor<B, 1> {
        self.score(LossKind::TotalVariation)
    }
}

/// New target of a loss stage, computed before any stage is changed.
enum Retarget<B: Backend> {
    Content(Tensor<B, 4>),
    Style(StyleSample<B>),
}

/// Frozen backbone interleaved with content, style and total-variation losses.
#[derive(Debug)]
pub struct CnnMrf<B: Backend, M> {
    backbone: M,
    stages: Vec<Stage<B>>,
    content_weight: f64,
    style_weight: f64,
    tv_weight: f64,
}

impl CnnMrfConfig {
    /// Builds the pipeline over `backbone` and captures the style and content
    /// targets.
    ///
    /// Backbone layers beyond the deepest configured depth are never run.
    ///
    /// # Arguments
    ///
    /// * `backbone` - The feature extractor; it is frozen here.
    /// * `style_image` - Preprocessed style image, `[1, 3, H, W]`.
    /// * `content_image` - Preprocessed content image, `[1, 3, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid for this backbone or a
    /// style activation is too small for a single patch.
    pub fn init<B: Backend, M: Backbone<B> + Module<B>>(
        &self,
        backbone: M,
        style_image: Tensor<B, 4>,
        content_image: Tensor<B, 4>,
    ) -> CnnMrfResult<CnnMrf<B, M>> {
        self.validate()?;
        self.validate_depth(backbone.num_layers())?;

        let backbone = backbone.no_grad();
        let style_config = self.style_loss_config();

        let mut stages = vec![Stage::Loss(LossStage::TotalVariation(
            TotalVariationLoss::new(),
        ))];
        let mut style = style_image.detach();
        let mut content = content_image.detach();

        for depth in 0..self.depth() {
            let is_content = self.content_layers.contains(&depth);

            let backbone_stages = if is_content && self.content_children {
                self.child_stages(&backbone, depth)?
            } else {
                vec![BackboneStage::layer(depth)]
            };

            for stage in backbone_stages {
                style = stage.forward(&backbone, style);
                content = stage.forward(&backbone, content);
                let ends_on_content = match &stage.children {
                    None => is_content,
                    Some(children) => self
                        .content_children_layers
                        .contains(&(children.end - 1)),
                };

                stages.push(Stage::Backbone(stage));
                if ends_on_content {
                    stages.push(Stage::Loss(LossStage::Content(ContentLoss::new(
                        content.clone(),
                    ))));
                }
            }

            if self.style_layers.contains(&depth) {
                stages.push(Stage::Loss(LossStage::Style(
                    style_config.init(style.clone())?,
                )));
            }
        }

        let model = CnnMrf {
            backbone,
            stages,
            content_weight: self.content_weight,
            style_weight: self.style_weight,
            tv_weight: self.tv_weight,
        };

        tracing::info!(
            depth = self.depth(),
            stages = model.stages.len(),
            content = model.loss_stage_count(LossKind::Content),
            style = model.loss_stage_count(LossKind::Style),
            "assembled CNNMRF pipeline"
        );

        Ok(model)
    }

    /// Splits layer `depth` so that a content stage can follow each listed
    /// child. The remaining children form the last stage.
    fn child_stages<B: Backend, M: Backbone<B>>(
        &self,
        backbone: &M,
        depth: usize,
    ) -> CnnMrfResult<Vec<BackboneStage>> {
        let count = backbone.num_children(depth);
        let mut children = self.content_children_layers.clone();
        children.sort_unstable();

        if let Some(child) = children.iter().find(|child| **child >= count) {
            return Err(CnnMrfError::InvalidConfiguration {
                reason: format!("Layer {depth} has {count} children, child {child} requested"),
            });
        }

        let mut stages = Vec::with_capacity(children.len() + 1);
        let mut start = 0;
        for child in children {
            stages.push(BackboneStage::children(depth, start..child + 1));
            start = child + 1;
        }
        if start < count {
            stages.push(BackboneStage::children(depth, start..count));
        }

        Ok(stages)
    }
}

impl<B: Backend, M: Backbone<B>> CnnMrf<B, M> {
    /// Runs `synthesis` through the pipeline once and collects every loss.
    ///
    /// # Errors
    ///
    /// Propagates loss errors, e.g. a synthesis activation too small for a
    /// patch or a content activation of a different size than its target.
    pub fn forward(&self, synthesis: Tensor<B, 4>) -> CnnMrfResult<LossReport<B>> {
        let device = synthesis.device();
        let mut x = synthesis;
        let mut losses = Vec::new();

        for (position, stage) in self.stages.iter().enumerate() {
            match stage {
                Stage::Backbone(stage) => x = stage.forward(&self.backbone, x),
                Stage::Loss(loss) => losses.push(StageLoss {
                    position,
                    kind: loss.kind(),
                    value: loss.forward(x.clone())?,
                }),
            }
        }

        let total = losses
            .iter()
            .fold(Tensor::zeros([1], &device), |total, stage| {
                total + stage.value.clone().mul_scalar(self.weight(stage.kind))
            });

        Ok(LossReport {
            total,
            stages: losses,
        })
    }

    /// Replaces the style and content targets without rebuilding the pipeline.
    ///
    /// The backbone stages are replayed on both images and every loss stage
    /// is retargeted to the activation reaching it. Targets are installed only
    /// once all of them were computed.
    ///
    /// # Errors
    ///
    /// Returns an error if a new style activation is too small for a single
    /// patch. No stage is changed in that case.
    pub fn update_style_and_content_image(
        &mut self,
        style_image: Tensor<B, 4>,
        content_image: Tensor<B, 4>,
    ) -> CnnMrfResult<()> {
        let mut style = style_image.detach();
        let mut content = content_image.detach();
        let mut retargets = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let retarget = match stage {
                Stage::Backbone(stage) => {
                    style = stage.forward(&self.backbone, style);
                    content = stage.forward(&self.backbone, content);
                    None
                }
                Stage::Loss(LossStage::Content(_)) => Some(Retarget::Content(content.clone())),
                Stage::Loss(LossStage::Style(loss)) => {
                    Some(Retarget::Style(loss.sample(style.clone())?))
                }
                Stage::Loss(LossStage::TotalVariation(_)) => None,
            };
            retargets.push(retarget);
        }

        for (stage, retarget) in self.stages.iter_mut().zip(retargets) {
            match (stage, retarget) {
                (Stage::Loss(LossStage::Content(loss)), Some(Retarget::Content(target))) => {
                    loss.update(target);
                }
                (Stage::Loss(LossStage::Style(loss)), Some(Retarget::Style(sample))) => {
                    loss.replace(sample);
                }
                _ => {}
            }
        }

        tracing::debug!(
            style = ?style.dims(),
            content = ?content.dims(),
            "retargeted style and content losses"
        );

        Ok(())
    }

    /// The pipeline in execution order.
    pub fn stages(&self) -> &[Stage<B>] {
        &self.stages
    }

    /// Number of loss stages of `kind`.
    pub fn loss_stage_count(&self, kind: LossKind) -> usize {
        self.stages
            .iter()
            .filter(|stage| matches!(stage, Stage::Loss(loss) if loss.kind() == kind))
            .count()
    }

    /// Weight applied to losses of `kind` in the total.
    pub const fn weight(&self, kind: LossKind) -> f64 {
        match kind {
            LossKind::TotalVariation => self.tv_weight,
            LossKind::Content => self.content_weight,
            LossKind::Style => self.style_weight,
        }
    }
}
