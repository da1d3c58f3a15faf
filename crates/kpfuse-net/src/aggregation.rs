//! 2D→3D feature aggregation.
//!
//! Each 3D point collects its k nearest pixels from the flattened
//! multi-view stack (precomputed KNN tables), then fuses the candidates
//! with attention weighted by relative geometry. The per-scene gather
//! runs as an explicit sequential loop; scenes are concatenated along
//! the point axis afterwards, and that ordering is part of the model's
//! observable behavior.

use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, conv2d, ops::softmax, BatchNorm, Conv2d, Conv2dConfig, Module, VarBuilder};

/// Gathers feature columns `(c, m)` through an index table `(n, k)`,
/// producing `(c, n, k)`. Indices must all be in range; unlike the
/// neighbor tables of the convolution levels there is no shadow row
/// here.
pub fn group_points(features: &Tensor, indices: &Tensor) -> Result<Tensor> {
    let (c, _m) = features.dims2()?;
    let (n, k) = indices.dims2()?;
    let flat = indices.flatten_all()?;
    let gathered = features.index_select(&flat, 1)?;
    gathered.reshape((c, n, k))
}

/// Per-scene unprojection of 2D features onto the stacked 3D points.
///
/// * `feature_2d` - `(scenes, c, views*h*w)` per-pixel features
/// * `image_xyz` - `(scenes, 3, views*h*w)` unprojected pixel coordinates
/// * `knn_indices` - per scene `(np_i, k)` pixel indices
///
/// Returns `(c, np, k)` grouped features and `(3, np, k)` grouped
/// coordinates for the concatenated batch.
pub fn unproject_to_points(
    feature_2d: &Tensor,
    image_xyz: &Tensor,
    knn_indices: &[Tensor],
) -> Result<(Tensor, Tensor)> {
    let mut grouped_features = Vec::with_capacity(knn_indices.len());
    let mut grouped_xyz = Vec::with_capacity(knn_indices.len());

    for (i, knn) in knn_indices.iter().enumerate() {
        let scene_features = feature_2d.get(i)?;
        grouped_features.push(group_points(&scene_features, knn)?);

        // Coordinates carry no gradient.
        let scene_xyz = image_xyz.get(i)?.detach();
        grouped_xyz.push(group_points(&scene_xyz, knn)?);
    }

    let features = Tensor::cat(&grouped_features, 1)?;
    let xyz = Tensor::cat(&grouped_xyz, 1)?;
    Ok((features, xyz))
}

/// Attention-weighted fusion of the k source pixels of each point.
pub struct FeatureAggregation {
    mlp1: Conv2d,
    bn1: BatchNorm,
    mlp2: Conv2d,
    bn2: BatchNorm,
    score: Conv2d,
    feature_dim: usize,
}

impl FeatureAggregation {
    pub fn new(feature_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig::default();
        let mlp1 = conv2d(3 + feature_dim, feature_dim, 1, cfg, vb.pp("mlp1"))?;
        let bn1 = batch_norm(feature_dim, 1e-5, vb.pp("bn1"))?;
        let mlp2 = conv2d(feature_dim, feature_dim, 1, cfg, vb.pp("mlp2"))?;
        let bn2 = batch_norm(feature_dim, 1e-5, vb.pp("bn2"))?;
        let score = conv2d(feature_dim, 1, 1, cfg, vb.pp("score"))?;
        Ok(Self {
            mlp1,
            bn1,
            mlp2,
            bn2,
            score,
            feature_dim,
        })
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Fuses the candidates of each point.
    ///
    /// * `grouped_xyz` - `(3, np, k)` candidate coordinates
    /// * `points` - `(3, np)` aggregation target coordinates
    /// * `grouped_features` - `(c, np, k)` candidate features
    ///
    /// Returns `(c, np)` fused per-point features.
    pub fn forward(
        &self,
        grouped_xyz: &Tensor,
        points: &Tensor,
        grouped_features: &Tensor,
    ) -> Result<Tensor> {
        let relative = grouped_xyz.broadcast_sub(&points.unsqueeze(2)?)?;
        let input = Tensor::cat(&[&relative, grouped_features], 0)?.unsqueeze(0)?;

        let h = self.bn1.forward_train(&self.mlp1.forward(&input)?)?.relu()?;
        let h = self.bn2.forward_train(&self.mlp2.forward(&h)?)?.relu()?;

        // Softmax over the k candidates of each point.
        let scores = self.score.forward(&h)?;
        let attention = softmax(&scores, 3)?;

        let weighted = grouped_features.unsqueeze(0)?.broadcast_mul(&attention)?;
        weighted.sum(3)?.squeeze(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_group_points_gathers_columns() -> Result<()> {
        let device = Device::Cpu;
        let features = Tensor::new(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &device)?;
        let indices = Tensor::new(&[[0u32, 2], [1, 1]], &device)?;

        let grouped = group_points(&features, &indices)?;
        assert_eq!(grouped.dims(), &[2, 2, 2]);
        let values: Vec<Vec<Vec<f32>>> = grouped.to_vec3()?;
        assert_eq!(values[0][0], vec![1.0, 3.0]);
        assert_eq!(values[1][1], vec![5.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_unproject_concatenates_scenes() -> Result<()> {
        let device = Device::Cpu;
        let feature_2d = Tensor::randn(0f32, 1.0, (2, 4, 6), &device)?;
        let image_xyz = Tensor::randn(0f32, 1.0, (2, 3, 6), &device)?;
        let knn = vec![
            Tensor::zeros((5, 2), DType::U32, &device)?,
            Tensor::zeros((3, 2), DType::U32, &device)?,
        ];

        let (features, xyz) = unproject_to_points(&feature_2d, &image_xyz, &knn)?;
        assert_eq!(features.dims(), &[4, 8, 2]);
        assert_eq!(xyz.dims(), &[3, 8, 2]);
        Ok(())
    }

    #[test]
    fn test_aggregation_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let agg = FeatureAggregation::new(8, vb)?;
        let grouped_xyz = Tensor::randn(0f32, 1.0, (3, 10, 4), &device)?;
        let points = Tensor::randn(0f32, 1.0, (3, 10), &device)?;
        let grouped_features = Tensor::randn(0f32, 1.0, (8, 10, 4), &device)?;

        let fused = agg.forward(&grouped_xyz, &points, &grouped_features)?;
        assert_eq!(fused.dims(), &[8, 10]);
        Ok(())
    }
}
