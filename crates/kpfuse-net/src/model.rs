//! The fused segmentation model.
//!
//! Two encoder towers walk the same architecture plan over one shared
//! geometric batch: the 3D tower over point features, the 2D tower over
//! per-point aggregated image features. Skip snapshots are captured at
//! the planned indices (raw 3D tap first, 2D features concatenated onto
//! it), the tower outputs are averaged, and the decoder reinjects the
//! fused snapshots last-in-first-out before each planned concat index.

use candle_core::{DType, Error, Result, Tensor};
use candle_nn::VarBuilder;

use kpfuse_core::{FusionSegConfig, LabelMap};

use crate::aggregation::{unproject_to_points, FeatureAggregation};
use crate::architecture::{ArchitecturePlan, FusionTowers};
use crate::backbone::ImageFeatureExtractor;
use crate::batch::SceneBatch;
use crate::blocks::DeformState;
use crate::loss::SegmentationLoss;

pub struct FusionSegModel {
    towers: FusionTowers,
    plan: ArchitecturePlan,
    aggregation: FeatureAggregation,
    backbone: Box<dyn ImageFeatureExtractor>,
    loss: SegmentationLoss,
    config: FusionSegConfig,
}

impl FusionSegModel {
    /// Builds the full model: validates the configuration, derives the
    /// architecture plan, and constructs both towers, the decoder and
    /// the heads. The 2D backbone is injected already loaded and stays
    /// frozen.
    pub fn new(
        config: FusionSegConfig,
        label_values: &[i64],
        ignored_labels: &[i64],
        backbone: Box<dyn ImageFeatureExtractor>,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate().map_err(Error::wrap)?;
        let plan = ArchitecturePlan::build(&config).map_err(Error::wrap)?;

        let label_map = LabelMap::new(label_values, ignored_labels);
        let num_classes = label_map.num_classes();
        if num_classes == 0 {
            return Err(Error::Msg("no valid labels left after ignoring".into()));
        }

        if backbone.feature_dim() != config.image_feature_dim {
            return Err(Error::Msg(format!(
                "backbone feature width {} does not match configured {}",
                backbone.feature_dim(),
                config.image_feature_dim
            )));
        }

        let towers = FusionTowers::new(&plan, &config, num_classes, vb.pp("towers"))?;
        let aggregation =
            FeatureAggregation::new(config.image_feature_dim, vb.pp("aggregation"))?;

        let loss = SegmentationLoss::new(
            label_map,
            &config.class_weights,
            config.deform_fitting_mode,
            config.deform_fitting_power,
            config.repulse_extent,
        )
        .map_err(Error::wrap)?;

        tracing::debug!(
            encoder_blocks = plan.encoder_3d.len(),
            decoder_blocks = plan.decoder.len(),
            levels = plan.num_levels,
            classes = num_classes,
            "built fusion towers"
        );

        Ok(Self {
            towers,
            plan,
            aggregation,
            backbone,
            loss,
            config,
        })
    }

    pub fn plan(&self) -> &ArchitecturePlan {
        &self.plan
    }

    pub fn config(&self) -> &FusionSegConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.loss.num_classes()
    }

    /// Per-point aggregated 2D features for the whole stacked batch,
    /// `(np, image_feature_dim)`.
    fn image_features(&self, batch: &SceneBatch) -> Result<Tensor> {
        let dims = batch.images.dims();
        if dims.len() != 5 {
            return Err(Error::Msg(format!(
                "images must be (scenes, views, c, h, w), got {dims:?}"
            )));
        }
        let (b, v, ch, h, w) = (dims[0], dims[1], dims[2], dims[3], dims[4]);

        // Collapse scenes and views for the 2D network.
        let images = batch.images.reshape((b * v, ch, h, w))?;
        let features = self.backbone.features(&images)?;
        let c = features.dims()[1];

        // (b*v, c, h, w) -> (b, c, v*h*w)
        let features = features
            .reshape((b, v, c, h, w))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, c, v * h * w))?;

        // (b, v, h, w, 3) -> (b, 3, v*h*w)
        let image_xyz = batch
            .image_xyz
            .permute((0, 4, 1, 2, 3))?
            .contiguous()?
            .reshape((b, 3, v * h * w))?;

        let (grouped_features, grouped_xyz) =
            unproject_to_points(&features, &image_xyz, &batch.knn_indices)?;

        let points = batch.aggregation_points.t()?.contiguous()?;
        let fused = self
            .aggregation
            .forward(&grouped_xyz, &points, &grouped_features)?;

        fused.t()?.contiguous()
    }

    /// Runs the two encoder towers, the fusion, the decoder and the
    /// head; returns per-point class logits `(np, num_classes)`.
    pub fn forward(&self, batch: &SceneBatch) -> Result<Tensor> {
        batch.check_levels(self.plan.num_levels)?;

        let x_2d = self.image_features(batch)?.detach();

        // 3D input features: constant one + colors.
        let (np, _) = batch.colors.dims2()?;
        let ones = Tensor::ones((np, 1), DType::F32, batch.colors.device())?;
        let x_3d = Tensor::cat(&[&ones, &batch.colors], 1)?.detach();

        // 3D tower captures the raw taps.
        let mut skip_x: Vec<Tensor> = Vec::with_capacity(self.plan.encoder_skips.len());
        let mut x_3d = x_3d;
        for (block_i, block) in self.towers.encoder_3d.iter().enumerate() {
            if self.plan.encoder_skips.contains(&block_i) {
                skip_x.push(x_3d.clone());
            }
            x_3d = block.forward(&x_3d, batch)?;
        }

        // 2D tower turns each tap into a fused 2D+3D snapshot.
        let mut tap = 0;
        let mut x_2d = x_2d;
        for (block_i, block) in self.towers.encoder_2d.iter().enumerate() {
            if self.plan.encoder_skips.contains(&block_i) {
                skip_x[tap] = Tensor::cat(&[&skip_x[tap], &x_2d], 1)?;
                tap += 1;
            }
            x_2d = block.forward(&x_2d, batch)?;
        }

        // Middle fusion by elementwise average of the tower outputs.
        let mut x = Tensor::stack(&[&x_3d, &x_2d], 0)?.mean(0)?;

        for (block_i, block) in self.towers.decoder.iter().enumerate() {
            if self.plan.decoder_concats.contains(&block_i) {
                let snapshot = skip_x
                    .pop()
                    .ok_or_else(|| Error::Msg("no skip snapshot left to concatenate".into()))?;
                x = Tensor::cat(&[&x, &snapshot], 1)?;
            }
            x = block.forward(&x, batch)?;
        }

        let x = self.towers.head_mlp.forward(&x)?;
        self.towers.head_logits.forward(&x)
    }

    /// Regularizer state of every deformable convolution that has run.
    pub fn deform_states(&self) -> Vec<DeformState> {
        self.towers
            .encoder_3d
            .iter()
            .chain(self.towers.encoder_2d.iter())
            .chain(self.towers.decoder.iter())
            .filter_map(|block| block.kpconv())
            .filter_map(|conv| conv.deform_state())
            .collect()
    }

    /// Training loss on raw labels.
    pub fn loss(&self, outputs: &Tensor, labels: &Tensor) -> Result<Tensor> {
        self.loss.loss(outputs, labels, &self.deform_states())
    }

    /// Accuracy of the current batch on raw labels.
    pub fn accuracy(&self, outputs: &Tensor, labels: &Tensor) -> Result<f32> {
        self.loss.accuracy(outputs, labels)
    }
}
