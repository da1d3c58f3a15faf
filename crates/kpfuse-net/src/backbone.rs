//! Frozen 2D image backbone.
//!
//! The 2D tower consumes per-pixel features produced by a pretrained
//! image network. The network sits behind [`ImageFeatureExtractor`] so
//! the fusion model never sees checkpoint mechanics; the provided
//! implementation is a small UNet-style ResNet that loads its weights
//! from a safetensors file and runs inference-only.

use std::path::Path;

use candle_core::{DType, Result, Tensor};
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};

/// Per-pixel feature extractor over a stack of views.
///
/// Input `(n, 3, h, w)`, output `(n, c, h, w)` with `c =
/// feature_dim()`. Implementations are frozen: outputs carry no
/// gradient history.
pub trait ImageFeatureExtractor {
    fn features(&self, images: &Tensor) -> Result<Tensor>;
    fn feature_dim(&self) -> usize;
}

/// Residual block with two 3x3 convolutions.
struct BasicBlock2d {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock2d {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv1_config = Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let conv1 = conv2d(in_channels, out_channels, 3, conv1_config, vb.pp("conv1"))?;
        let bn1 = batch_norm(out_channels, 1e-5, vb.pp("bn1"))?;

        let conv2_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv2 = conv2d(out_channels, out_channels, 3, conv2_config, vb.pp("conv2"))?;
        let bn2 = batch_norm(out_channels, 1e-5, vb.pp("bn2"))?;

        let downsample = if stride != 1 || in_channels != out_channels {
            let ds_config = Conv2dConfig {
                stride,
                ..Default::default()
            };
            let ds_conv = conv2d(in_channels, out_channels, 1, ds_config, vb.pp("ds_conv"))?;
            let ds_bn = batch_norm(out_channels, 1e-5, vb.pp("ds_bn"))?;
            Some((ds_conv, ds_bn))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(x)?, false)?,
            None => x.clone(),
        };

        let out = self.bn1.forward_t(&self.conv1.forward(x)?, false)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, false)?;
        ((out + identity)?).relu()
    }
}

/// 2D backbone configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackboneConfig {
    /// Input image channels.
    pub in_channels: usize,
    /// Base channel width of the first stage.
    pub base_channels: usize,
    /// Residual blocks per stage.
    pub stage_blocks: [usize; 3],
    /// Per-pixel output feature width.
    pub feature_dim: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            base_channels: 32,
            stage_blocks: [2, 2, 2],
            feature_dim: 64,
        }
    }
}

/// UNet-style ResNet producing per-pixel features at input resolution.
pub struct UNetResNetBackbone {
    stem_conv: Conv2d,
    stem_bn: BatchNorm,
    stage1: Vec<BasicBlock2d>,
    stage2: Vec<BasicBlock2d>,
    stage3: Vec<BasicBlock2d>,
    up2_conv: Conv2d,
    up2_refine: Conv2d,
    up1_conv: Conv2d,
    up1_refine: Conv2d,
    feature_conv: Conv2d,
    config: BackboneConfig,
}

impl UNetResNetBackbone {
    pub fn new(config: BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let c = config.base_channels;

        let stem_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let stem_conv = conv2d(config.in_channels, c, 3, stem_config, vb.pp("stem_conv"))?;
        let stem_bn = batch_norm(c, 1e-5, vb.pp("stem_bn"))?;

        let stage1 = Self::make_stage(c, c, config.stage_blocks[0], 1, vb.pp("stage1"))?;
        let stage2 = Self::make_stage(c, c * 2, config.stage_blocks[1], 2, vb.pp("stage2"))?;
        let stage3 = Self::make_stage(c * 2, c * 4, config.stage_blocks[2], 2, vb.pp("stage3"))?;

        // Top-down path back to input resolution.
        let lateral_config = Conv2dConfig::default();
        let refine_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let up2_conv = conv2d(c * 4, c * 2, 1, lateral_config, vb.pp("up2_conv"))?;
        let up2_refine = conv2d(c * 2, c * 2, 3, refine_config, vb.pp("up2_refine"))?;
        let up1_conv = conv2d(c * 2, c, 1, lateral_config, vb.pp("up1_conv"))?;
        let up1_refine = conv2d(c, c, 3, refine_config, vb.pp("up1_refine"))?;

        let feature_conv = conv2d(
            c,
            config.feature_dim,
            1,
            Conv2dConfig::default(),
            vb.pp("feature_conv"),
        )?;

        Ok(Self {
            stem_conv,
            stem_bn,
            stage1,
            stage2,
            stage3,
            up2_conv,
            up2_refine,
            up1_conv,
            up1_refine,
            feature_conv,
            config,
        })
    }

    /// Loads frozen weights from a safetensors checkpoint.
    pub fn from_safetensors<P: AsRef<Path>>(
        path: P,
        config: BackboneConfig,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path.as_ref()], DType::F32, device)?
        };
        tracing::info!(path = %path.as_ref().display(), "loaded 2d backbone checkpoint");
        Self::new(config, vb)
    }

    fn make_stage(
        in_channels: usize,
        out_channels: usize,
        n_blocks: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Vec<BasicBlock2d>> {
        let mut blocks = Vec::with_capacity(n_blocks);
        blocks.push(BasicBlock2d::new(
            in_channels,
            out_channels,
            stride,
            vb.pp("block_0"),
        )?);
        for i in 1..n_blocks {
            blocks.push(BasicBlock2d::new(
                out_channels,
                out_channels,
                1,
                vb.pp(format!("block_{}", i)),
            )?);
        }
        Ok(blocks)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = self.stem_bn.forward_t(&self.stem_conv.forward(x)?, false)?.relu()?;

        for block in &self.stage1 {
            x = block.forward(&x)?;
        }
        let skip1 = x.clone();

        for block in &self.stage2 {
            x = block.forward(&x)?;
        }
        let skip2 = x.clone();

        for block in &self.stage3 {
            x = block.forward(&x)?;
        }

        // Upsample to each skip's resolution and add laterally.
        let (_, _, h2, w2) = skip2.dims4()?;
        let x = self.up2_conv.forward(&x)?.upsample_nearest2d(h2, w2)?;
        let x = self.up2_refine.forward(&(x + skip2)?)?.relu()?;

        let (_, _, h1, w1) = skip1.dims4()?;
        let x = self.up1_conv.forward(&x)?.upsample_nearest2d(h1, w1)?;
        let x = self.up1_refine.forward(&(x + skip1)?)?.relu()?;

        self.feature_conv.forward(&x)
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }
}

impl ImageFeatureExtractor for UNetResNetBackbone {
    fn features(&self, images: &Tensor) -> Result<Tensor> {
        // Frozen: the 2D network never trains with the towers.
        Ok(self.forward(images)?.detach())
    }

    fn feature_dim(&self) -> usize {
        self.config.feature_dim
    }
}
