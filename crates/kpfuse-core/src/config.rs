//! Architecture and model configuration.
//!
//! A network topology is declared as an ordered list of [`BlockKind`]
//! descriptors; [`FusionSegConfig`] carries the descriptors together with
//! the global hyperparameters (initial radius, feature widths, kernel
//! count, loss settings). Configurations are plain serde values so they
//! can be read from JSON files.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One convolution/pooling/upsampling block in an architecture list.
///
/// The variants form a closed set; parsing an unrecognized token is a
/// configuration error, not a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Single kernel-point convolution, outputs half the configured width.
    Simple,
    SimpleStrided,
    SimpleEquivariant,
    SimpleEquivariantStrided,
    /// Bottleneck residual block around a kernel-point convolution.
    Resnetb,
    ResnetbStrided,
    ResnetbDeformable,
    ResnetbDeformableStrided,
    /// Pointwise linear + norm + activation.
    Unary,
    /// Neighbor max over pooling correspondences.
    MaxPool,
    /// Per-scene global average.
    GlobalAverage,
    /// Closest-point upsampling to the finer level.
    NearestUpsample,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Simple => "simple",
            BlockKind::SimpleStrided => "simple_strided",
            BlockKind::SimpleEquivariant => "simple_equivariant",
            BlockKind::SimpleEquivariantStrided => "simple_equivariant_strided",
            BlockKind::Resnetb => "resnetb",
            BlockKind::ResnetbStrided => "resnetb_strided",
            BlockKind::ResnetbDeformable => "resnetb_deformable",
            BlockKind::ResnetbDeformableStrided => "resnetb_deformable_strided",
            BlockKind::Unary => "unary",
            BlockKind::MaxPool => "max_pool",
            BlockKind::GlobalAverage => "global_average",
            BlockKind::NearestUpsample => "nearest_upsample",
        }
    }

    /// True for blocks that move features to the next (coarser) level:
    /// the strided convolutions and the neighbor max pool.
    pub fn is_strided(&self) -> bool {
        matches!(
            self,
            BlockKind::SimpleStrided
                | BlockKind::SimpleEquivariantStrided
                | BlockKind::ResnetbStrided
                | BlockKind::ResnetbDeformableStrided
                | BlockKind::MaxPool
        )
    }

    pub fn is_upsample(&self) -> bool {
        matches!(self, BlockKind::NearestUpsample)
    }

    pub fn is_global(&self) -> bool {
        matches!(self, BlockKind::GlobalAverage)
    }

    pub fn is_deformable(&self) -> bool {
        matches!(
            self,
            BlockKind::ResnetbDeformable | BlockKind::ResnetbDeformableStrided
        )
    }

    pub fn is_equivariant(&self) -> bool {
        matches!(
            self,
            BlockKind::SimpleEquivariant | BlockKind::SimpleEquivariantStrided
        )
    }

    /// Simple blocks emit half the configured output width per tower; the
    /// halves meet again at the next fusion point.
    pub fn halves_width(&self) -> bool {
        matches!(
            self,
            BlockKind::Simple
                | BlockKind::SimpleStrided
                | BlockKind::SimpleEquivariant
                | BlockKind::SimpleEquivariantStrided
        )
    }

    /// A skip tap is recorded immediately before every block that changes
    /// resolution or aggregates globally.
    pub fn records_skip(&self) -> bool {
        self.is_strided() || self.is_upsample() || self.is_global()
    }
}

impl FromStr for BlockKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(BlockKind::Simple),
            "simple_strided" => Ok(BlockKind::SimpleStrided),
            "simple_equivariant" => Ok(BlockKind::SimpleEquivariant),
            "simple_equivariant_strided" => Ok(BlockKind::SimpleEquivariantStrided),
            "resnetb" => Ok(BlockKind::Resnetb),
            "resnetb_strided" => Ok(BlockKind::ResnetbStrided),
            "resnetb_deformable" => Ok(BlockKind::ResnetbDeformable),
            "resnetb_deformable_strided" => Ok(BlockKind::ResnetbDeformableStrided),
            "unary" => Ok(BlockKind::Unary),
            "max_pool" => Ok(BlockKind::MaxPool),
            "global_average" => Ok(BlockKind::GlobalAverage),
            "nearest_upsample" => Ok(BlockKind::NearestUpsample),
            _ => Err(Error::Config(format!("unknown block descriptor: {s}"))),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fitting mode for the deformable-kernel regularizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FittingMode {
    Point2Point,
    /// Recognized but unimplemented; selecting it is a fatal
    /// configuration error.
    Point2Plane,
}

/// Full model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionSegConfig {
    /// Ordered block descriptors defining the encoder+decoder topology.
    pub architecture: Vec<BlockKind>,
    /// Grid size of the first subsampling level, in meters.
    pub first_subsampling_dl: f64,
    /// Convolution radius as a multiple of the subsampling grid size.
    pub conv_radius: f64,
    /// Kernel influence extent as a multiple of the grid size.
    pub kp_extent: f64,
    /// Number of kernel points per convolution.
    pub num_kernel_points: usize,
    /// Input feature width of the 3D tower (constant 1 + RGB = 4).
    pub in_features_dim_3d: usize,
    /// Input feature width of the 2D tower (aggregated image features).
    pub in_features_dim_2d: usize,
    /// Output width of the first block; doubles at each pooling level.
    pub first_features_dim: usize,
    /// Per-class loss weights; empty means unweighted.
    pub class_weights: Vec<f32>,
    /// Deformable fitting mode.
    pub deform_fitting_mode: FittingMode,
    /// Global weight of the deformable regularizer.
    pub deform_fitting_power: f64,
    /// Learning-rate multiplier for deformable offset parameters,
    /// consumed by the optimizer setup.
    pub deform_lr_factor: f64,
    /// Repulsion distance between kernel points, in extent units.
    pub repulse_extent: f64,
    /// Channel width of the 2D backbone's per-pixel features.
    pub image_feature_dim: usize,
    /// Number of source pixels aggregated per 3D point.
    pub num_view_neighbors: usize,
}

impl Default for FusionSegConfig {
    fn default() -> Self {
        use BlockKind::*;
        Self {
            architecture: vec![
                Simple,
                Resnetb,
                ResnetbStrided,
                Resnetb,
                Resnetb,
                ResnetbStrided,
                Resnetb,
                Resnetb,
                ResnetbStrided,
                Resnetb,
                Resnetb,
                ResnetbStrided,
                Resnetb,
                NearestUpsample,
                Unary,
                NearestUpsample,
                Unary,
                NearestUpsample,
                Unary,
                NearestUpsample,
                Unary,
            ],
            first_subsampling_dl: 0.04,
            conv_radius: 2.5,
            kp_extent: 1.2,
            num_kernel_points: 15,
            in_features_dim_3d: 4,
            in_features_dim_2d: 64,
            first_features_dim: 64,
            class_weights: Vec::new(),
            deform_fitting_mode: FittingMode::Point2Point,
            deform_fitting_power: 1.0,
            deform_lr_factor: 0.1,
            repulse_extent: 1.2,
            image_feature_dim: 64,
            num_view_neighbors: 3,
        }
    }
}

impl FusionSegConfig {
    /// Convolution radius of the first level.
    pub fn first_radius(&self) -> f64 {
        self.first_subsampling_dl * self.conv_radius
    }

    /// Static preconditions that do not depend on the architecture walk.
    ///
    /// The walk itself (equivariant widths, skip/upsample balance) is
    /// checked when the architecture plan is built.
    pub fn validate(&self) -> Result<()> {
        if self.architecture.is_empty() {
            return Err(Error::Config("architecture list is empty".into()));
        }
        if self.num_kernel_points < 2 {
            return Err(Error::Config(format!(
                "num_kernel_points must be at least 2, got {}",
                self.num_kernel_points
            )));
        }
        if self.first_features_dim == 0 {
            return Err(Error::Config("first_features_dim must be non-zero".into()));
        }
        if self.deform_fitting_mode == FittingMode::Point2Plane {
            return Err(Error::Config(
                "point2plane fitting mode not implemented yet".into(),
            ));
        }
        if self.in_features_dim_2d != self.image_feature_dim {
            return Err(Error::Config(format!(
                "in_features_dim_2d ({}) must match image_feature_dim ({})",
                self.in_features_dim_2d, self.image_feature_dim
            )));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_kind_roundtrip() {
        for token in [
            "simple",
            "resnetb_deformable_strided",
            "max_pool",
            "nearest_upsample",
        ] {
            let kind: BlockKind = token.parse().unwrap();
            assert_eq!(kind.as_str(), token);
        }
    }

    #[test]
    fn test_unknown_block_descriptor() {
        let err = "resnetc".parse::<BlockKind>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_predicates() {
        assert!(BlockKind::ResnetbStrided.is_strided());
        assert!(BlockKind::MaxPool.is_strided());
        assert!(!BlockKind::Resnetb.is_strided());
        assert!(BlockKind::NearestUpsample.records_skip());
        assert!(BlockKind::GlobalAverage.records_skip());
        assert!(BlockKind::Simple.halves_width());
        assert!(!BlockKind::Unary.halves_width());
        assert!(BlockKind::ResnetbDeformable.is_deformable());
    }

    #[test]
    fn test_validate_rejects_point2plane() {
        let config = FusionSegConfig {
            deform_fitting_mode: FittingMode::Point2Plane,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_default() {
        FusionSegConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "architecture": ["simple", "resnetb_strided", "nearest_upsample", "unary"],
            "first_subsampling_dl": 0.04,
            "conv_radius": 2.5,
            "kp_extent": 1.2,
            "num_kernel_points": 15,
            "in_features_dim_3d": 4,
            "in_features_dim_2d": 64,
            "first_features_dim": 64,
            "class_weights": [],
            "deform_fitting_mode": "point2point",
            "deform_fitting_power": 1.0,
            "deform_lr_factor": 0.1,
            "repulse_extent": 1.2,
            "image_feature_dim": 64,
            "num_view_neighbors": 3
        }"#;
        let config = FusionSegConfig::from_json(json).unwrap();
        assert_eq!(config.architecture.len(), 4);
        assert_eq!(config.architecture[1], BlockKind::ResnetbStrided);
    }
}
