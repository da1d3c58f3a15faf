//! Inference engine wrapping the fused model.
//!
//! Handles device selection and checkpoint loading (model weights and
//! the frozen 2D backbone are separate safetensors files), and exposes
//! batch-mode prediction.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use kpfuse_core::FusionSegConfig;

use crate::backbone::{BackboneConfig, UNetResNetBackbone};
use crate::batch::SceneBatch;
use crate::model::FusionSegModel;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda(usize),
    Metal,
}

/// Inference engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InferenceConfig {
    /// Model configuration.
    pub model: FusionSegConfig,
    /// 2D backbone configuration.
    pub backbone: BackboneConfig,
    /// Device to run inference on.
    pub device: DeviceType,
    /// Raw label values of the dataset.
    pub label_values: Vec<i64>,
    /// Subset of label values excluded from the loss.
    pub ignored_labels: Vec<i64>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: FusionSegConfig::default(),
            backbone: BackboneConfig::default(),
            device: DeviceType::Cpu,
            label_values: (0..20).collect(),
            ignored_labels: Vec::new(),
        }
    }
}

/// Batch-mode inference engine.
pub struct InferenceEngine {
    model: FusionSegModel,
    device: Device,
}

impl InferenceEngine {
    /// Create an engine with random weights (for testing).
    pub fn new_random(config: InferenceConfig) -> Result<Self> {
        let device = Self::get_device(config.device)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let backbone = UNetResNetBackbone::new(config.backbone.clone(), vb.pp("backbone_2d"))?;
        let model = FusionSegModel::new(
            config.model,
            &config.label_values,
            &config.ignored_labels,
            Box::new(backbone),
            vb,
        )?;

        Ok(Self { model, device })
    }

    /// Load an engine from safetensors checkpoints: the model weights
    /// and the (frozen) pretrained 2D backbone.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        model_path: P,
        backbone_path: Q,
        config: InferenceConfig,
    ) -> Result<Self> {
        let device = Self::get_device(config.device)?;

        let backbone = UNetResNetBackbone::from_safetensors(
            backbone_path,
            config.backbone.clone(),
            &device,
        )?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_path.as_ref()], DType::F32, &device)?
        };
        tracing::info!(
            path = %model_path.as_ref().display(),
            "loaded fusion model checkpoint"
        );

        let model = FusionSegModel::new(
            config.model,
            &config.label_values,
            &config.ignored_labels,
            Box::new(backbone),
            vb,
        )?;

        Ok(Self { model, device })
    }

    fn get_device(device_type: DeviceType) -> Result<Device> {
        match device_type {
            DeviceType::Cpu => Ok(Device::Cpu),
            DeviceType::Cuda(ordinal) => Device::new_cuda(ordinal),
            DeviceType::Metal => Device::new_metal(0),
        }
    }

    /// Per-point class logits for one batch.
    pub fn predict(&self, batch: &SceneBatch) -> Result<Tensor> {
        self.model.forward(batch)
    }

    /// Per-point dense class indices (argmax decode).
    pub fn segment(&self, batch: &SceneBatch) -> Result<Vec<u32>> {
        let logits = self.model.forward(batch)?;
        logits.argmax(1)?.to_vec1::<u32>()
    }

    pub fn model(&self) -> &FusionSegModel {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpfuse_core::BlockKind::*;

    #[test]
    fn test_engine_construction() -> Result<()> {
        let config = InferenceConfig {
            model: FusionSegConfig {
                architecture: vec![Simple, Resnetb, Unary],
                first_features_dim: 8,
                in_features_dim_2d: 8,
                image_feature_dim: 8,
                num_kernel_points: 5,
                ..Default::default()
            },
            backbone: BackboneConfig {
                base_channels: 4,
                stage_blocks: [1, 1, 1],
                feature_dim: 8,
                ..Default::default()
            },
            label_values: vec![0, 1, 2],
            ignored_labels: vec![0],
            ..Default::default()
        };

        let engine = InferenceEngine::new_random(config)?;
        assert_eq!(engine.model().num_classes(), 2);
        assert!(matches!(engine.device(), Device::Cpu));
        Ok(())
    }

    #[test]
    fn test_engine_rejects_invalid_model_config() {
        let config = InferenceConfig {
            model: FusionSegConfig {
                architecture: vec![],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(InferenceEngine::new_random(config).is_err());
    }
}
