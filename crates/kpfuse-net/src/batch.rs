//! Per-sample geometric batch context.
//!
//! A [`SceneBatch`] bundles everything the convolution layers need at
//! each resolution level: point coordinates, neighbor tables, pooling
//! and upsampling correspondences, plus the multi-view image data for
//! the 2D tower. It is produced entirely outside this crate (by the
//! subsampling/neighborhood pipeline of the data loader); the network
//! only reads from it.

use candle_core::{Error, Result, Tensor};

/// Read-only geometric context shared by every layer of one forward
/// pass.
///
/// Index tensors are `u32`. Neighbor and correspondence tables use the
/// shadow convention: the index `n_l` (one past the last point of level
/// `l`) addresses a padding row that the gather helpers append before
/// indexing, so rows with fewer real neighbors are padded with `n_l`.
pub struct SceneBatch {
    /// Stacked point coordinates per level, `(n_l, 3)`.
    pub points: Vec<Tensor>,
    /// Neighbor indices per level, `(n_l, h_l)`.
    pub neighbors: Vec<Tensor>,
    /// Pooling correspondences from level `l` to `l+1`, `(n_{l+1}, h)`.
    pub pools: Vec<Tensor>,
    /// Upsampling correspondences from level `l+1` to `l`, `(n_l, h)`,
    /// closest point first.
    pub upsamples: Vec<Tensor>,
    /// Per-level, per-scene point counts (for global pooling).
    pub lengths: Vec<Vec<usize>>,
    /// Multi-view images, `(scenes, views, 3, h, w)`.
    pub images: Tensor,
    /// Unprojected 3D coordinates of every pixel, `(scenes, views, h, w, 3)`.
    pub image_xyz: Tensor,
    /// Per-scene K-nearest-pixel indices into the flattened view stack,
    /// `(np_i, k)`.
    pub knn_indices: Vec<Tensor>,
    /// Aggregation target coordinates for the full stacked batch, `(np, 3)`.
    pub aggregation_points: Tensor,
    /// Per-point color features, `(np, 3)`.
    pub colors: Tensor,
}

impl SceneBatch {
    pub fn num_levels(&self) -> usize {
        self.points.len()
    }

    pub fn num_scenes(&self) -> usize {
        self.knn_indices.len()
    }

    pub fn level_points(&self, layer: usize) -> Result<&Tensor> {
        self.points
            .get(layer)
            .ok_or_else(|| Error::Msg(format!("batch has no points at level {layer}")))
    }

    pub fn level_neighbors(&self, layer: usize) -> Result<&Tensor> {
        self.neighbors
            .get(layer)
            .ok_or_else(|| Error::Msg(format!("batch has no neighbors at level {layer}")))
    }

    pub fn level_pools(&self, layer: usize) -> Result<&Tensor> {
        self.pools
            .get(layer)
            .ok_or_else(|| Error::Msg(format!("batch has no pooling table at level {layer}")))
    }

    pub fn level_upsamples(&self, layer: usize) -> Result<&Tensor> {
        self.upsamples
            .get(layer)
            .ok_or_else(|| Error::Msg(format!("batch has no upsampling table at level {layer}")))
    }

    pub fn level_lengths(&self, layer: usize) -> Result<&[usize]> {
        self.lengths
            .get(layer)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Msg(format!("batch has no lengths at level {layer}")))
    }

    /// Checks that the batch carries at least `required` resolution
    /// levels before a forward pass starts walking the towers.
    pub fn check_levels(&self, required: usize) -> Result<()> {
        if self.points.len() < required {
            return Err(Error::Msg(format!(
                "batch has {} resolution levels, architecture needs {required}",
                self.points.len()
            )));
        }
        Ok(())
    }
}
