//! Architecture planning and tower construction.
//!
//! Construction happens in two phases. [`ArchitecturePlan::build`] walks
//! the declarative block list once, threading an explicit
//! [`BuilderState`] through the walk, and records everything the network
//! needs later: per-block dimensions and radii, the indices where skip
//! taps are captured, and the decoder indices where fused snapshots are
//! concatenated back in. [`FusionTowers::new`] then instantiates the
//! actual layers from the plan. Keeping the bookkeeping pure makes the
//! dimension/radius laws checkable without touching a tensor.

use candle_core::Result as CandleResult;
use candle_nn::VarBuilder;

use kpfuse_core::{BlockKind, Error, FusionSegConfig, Result};

use crate::blocks::{build_block, Block, UnaryBlock};

/// Bookkeeping threaded through the construction walk. Each transition
/// consumes the previous state and returns the next one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuilderState {
    /// Resolution level, incremented on pooling and decremented on
    /// upsampling.
    pub layer: usize,
    /// Convolution radius at the current level.
    pub radius: f64,
    /// Input feature width of the 3D tower.
    pub in_dim_3d: usize,
    /// Input feature width of the 2D tower.
    pub in_dim_2d: usize,
    /// Configured output width at the current level.
    pub out_dim: usize,
}

impl BuilderState {
    fn initial(config: &FusionSegConfig) -> Self {
        Self {
            layer: 0,
            radius: config.first_radius(),
            in_dim_3d: config.in_features_dim_3d,
            in_dim_2d: config.in_features_dim_2d,
            out_dim: config.first_features_dim,
        }
    }

    /// State after an encoder block: simple blocks hand half the output
    /// width to the next block, pooling transitions double radius and
    /// width and move one level down.
    fn after_encoder_block(self, kind: BlockKind) -> Self {
        let next_in = if kind.halves_width() {
            self.out_dim / 2
        } else {
            self.out_dim
        };
        let mut next = Self {
            in_dim_3d: next_in,
            in_dim_2d: next_in,
            ..self
        };
        if kind.is_strided() {
            next.layer += 1;
            next.radius *= 2.0;
            next.out_dim *= 2;
        }
        next
    }
}

/// Everything recorded about one block before layers are built.
#[derive(Debug, Clone)]
pub struct BlockPlan {
    pub kind: BlockKind,
    pub radius: f64,
    pub in_dim: usize,
    pub out_dim: usize,
    pub layer: usize,
}

/// Pure construction plan for the two encoder towers and the decoder.
#[derive(Debug, Clone)]
pub struct ArchitecturePlan {
    pub encoder_3d: Vec<BlockPlan>,
    pub encoder_2d: Vec<BlockPlan>,
    pub decoder: Vec<BlockPlan>,
    /// Encoder block indices at which a skip tap is captured, in order.
    pub encoder_skips: Vec<usize>,
    /// Combined (3D + 2D) input width at each tap, indexed by level.
    pub encoder_skip_dims: Vec<usize>,
    /// Decoder block indices immediately preceded by a concat of the
    /// next pending skip snapshot.
    pub decoder_concats: Vec<usize>,
    /// Input width of the first head layer.
    pub head_in_dim: usize,
    /// Number of resolution levels the batch context must provide.
    pub num_levels: usize,
}

impl ArchitecturePlan {
    pub fn build(config: &FusionSegConfig) -> Result<Self> {
        let arch = &config.architecture;

        let mut encoder_3d = Vec::new();
        let mut encoder_2d = Vec::new();
        let mut encoder_skips = Vec::new();
        let mut encoder_skip_dims = Vec::new();

        let mut state = BuilderState::initial(config);

        for (block_i, &kind) in arch.iter().enumerate() {
            if kind.is_equivariant() && state.out_dim % 3 != 0 {
                return Err(Error::Config(format!(
                    "equivariant block at index {block_i} but feature width {} is not a factor of 3",
                    state.out_dim
                )));
            }

            // First upsample block starts the decoder.
            if kind.is_upsample() {
                break;
            }

            if kind.records_skip() {
                encoder_skips.push(block_i);
                encoder_skip_dims.push(state.in_dim_3d + state.in_dim_2d);
            }

            encoder_3d.push(BlockPlan {
                kind,
                radius: state.radius,
                in_dim: state.in_dim_3d,
                out_dim: state.out_dim,
                layer: state.layer,
            });
            encoder_2d.push(BlockPlan {
                kind,
                radius: state.radius,
                in_dim: state.in_dim_2d,
                out_dim: state.out_dim,
                layer: state.layer,
            });

            state = state.after_encoder_block(kind);
        }

        let num_levels = state.layer + 1;

        let mut decoder = Vec::new();
        let mut decoder_concats = Vec::new();

        let start = arch.iter().position(|k| k.is_upsample());
        // The decoder starts on the concatenation of the two tower
        // outputs; its first block is always an upsampling gather, so
        // only the bookkeeping sees the doubled width.
        let mut in_dim = state.in_dim_3d + state.in_dim_2d;
        let mut layer = state.layer;
        let mut radius = state.radius;
        let mut out_dim = state.out_dim;

        if let Some(start) = start {
            for (block_i, &kind) in arch[start..].iter().enumerate() {
                if kind.is_strided() {
                    return Err(Error::Config(format!(
                        "strided block {kind} is not valid in the decoder"
                    )));
                }

                if block_i > 0 && arch[start + block_i - 1].is_upsample() {
                    let skip_dim = encoder_skip_dims.get(layer).copied().ok_or_else(|| {
                        Error::Config(
                            "more upsampling transitions than recorded skip taps".into(),
                        )
                    })?;
                    in_dim += skip_dim;
                    decoder_concats.push(block_i);
                }

                decoder.push(BlockPlan {
                    kind,
                    radius,
                    in_dim,
                    out_dim,
                    layer,
                });
                in_dim = out_dim;

                if kind.is_upsample() {
                    if layer == 0 {
                        return Err(Error::Config(
                            "more upsampling transitions than pooling transitions".into(),
                        ));
                    }
                    layer -= 1;
                    radius *= 0.5;
                    out_dim /= 2;
                }
            }
        }

        Ok(Self {
            encoder_3d,
            encoder_2d,
            decoder,
            encoder_skips,
            encoder_skip_dims,
            decoder_concats,
            head_in_dim: out_dim,
            num_levels,
        })
    }
}

/// The constructed layer collections: two encoder towers sharing one
/// plan shape (separate weights), the decoder, and the per-point head.
pub struct FusionTowers {
    pub encoder_3d: Vec<Block>,
    pub encoder_2d: Vec<Block>,
    pub decoder: Vec<Block>,
    pub head_mlp: UnaryBlock,
    pub head_logits: UnaryBlock,
}

impl FusionTowers {
    pub fn new(
        plan: &ArchitecturePlan,
        config: &FusionSegConfig,
        num_classes: usize,
        vb: VarBuilder,
    ) -> CandleResult<Self> {
        let mut encoder_3d = Vec::with_capacity(plan.encoder_3d.len());
        for (i, bp) in plan.encoder_3d.iter().enumerate() {
            encoder_3d.push(build_block(
                bp.kind,
                bp.radius,
                bp.in_dim,
                bp.out_dim,
                bp.layer,
                config,
                vb.pp(format!("encoder3d_{i}")),
            )?);
        }

        let mut encoder_2d = Vec::with_capacity(plan.encoder_2d.len());
        for (i, bp) in plan.encoder_2d.iter().enumerate() {
            encoder_2d.push(build_block(
                bp.kind,
                bp.radius,
                bp.in_dim,
                bp.out_dim,
                bp.layer,
                config,
                vb.pp(format!("encoder2d_{i}")),
            )?);
        }

        let mut decoder = Vec::with_capacity(plan.decoder.len());
        for (i, bp) in plan.decoder.iter().enumerate() {
            decoder.push(build_block(
                bp.kind,
                bp.radius,
                bp.in_dim,
                bp.out_dim,
                bp.layer,
                config,
                vb.pp(format!("decoder_{i}")),
            )?);
        }

        let head_mlp = UnaryBlock::new(
            plan.head_in_dim,
            config.first_features_dim,
            false,
            false,
            vb.pp("head_mlp"),
        )?;
        let head_logits = UnaryBlock::new(
            config.first_features_dim,
            num_classes,
            false,
            true,
            vb.pp("head_logits"),
        )?;

        Ok(Self {
            encoder_3d,
            encoder_2d,
            decoder,
            head_mlp,
            head_logits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpfuse_core::BlockKind::*;

    fn config_with(architecture: Vec<BlockKind>) -> FusionSegConfig {
        FusionSegConfig {
            architecture,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_single_pool_single_upsample() {
        // One pooling transition, one upsampling transition.
        let config = config_with(vec![
            Simple,
            Resnetb,
            ResnetbStrided,
            Resnetb,
            NearestUpsample,
            Unary,
        ]);
        let plan = ArchitecturePlan::build(&config).unwrap();

        assert_eq!(plan.encoder_3d.len(), 4);
        assert_eq!(plan.encoder_2d.len(), 4);
        assert_eq!(plan.decoder.len(), 2);
        assert_eq!(plan.num_levels, 2);

        // Exactly one tap, at the strided block, capturing 64 + 64.
        assert_eq!(plan.encoder_skips, vec![2]);
        assert_eq!(plan.encoder_skip_dims, vec![128]);
        // Exactly one concat, right after the upsample.
        assert_eq!(plan.decoder_concats, vec![1]);

        // 3D tower dims: 4 -> 32 -> 64 -> 64 -> 128.
        let dims_3d: Vec<(usize, usize)> = plan
            .encoder_3d
            .iter()
            .map(|b| (b.in_dim, b.out_dim))
            .collect();
        assert_eq!(dims_3d, vec![(4, 64), (32, 64), (64, 64), (64, 128)]);
        // 2D tower starts at the aggregated image width instead.
        assert_eq!(plan.encoder_2d[0].in_dim, 64);
        assert_eq!(plan.encoder_2d[3].in_dim, 64);

        // Decoder: upsample sees the concatenated tower widths on paper,
        // the unary after it gains the recorded skip width.
        assert_eq!(plan.decoder[0].in_dim, 256);
        assert_eq!(plan.decoder[0].layer, 1);
        assert_eq!(plan.decoder[1].in_dim, 128 + 128);
        assert_eq!(plan.decoder[1].out_dim, 64);
        assert_eq!(plan.decoder[1].layer, 0);

        // Back to the original width at the head.
        assert_eq!(plan.head_in_dim, 64);
    }

    #[test]
    fn test_radius_and_width_law() {
        // N = 2 pooling transitions, M = 1 upsampling transition.
        let config = config_with(vec![
            Simple,
            ResnetbStrided,
            Resnetb,
            ResnetbStrided,
            Resnetb,
            NearestUpsample,
            Unary,
        ]);
        let plan = ArchitecturePlan::build(&config).unwrap();
        let r0 = config.first_radius();

        assert_eq!(plan.num_levels, 3);
        // Final decoder state: radius r0 * 2^(N-M), width w0 * 2^(N-M).
        assert_eq!(plan.head_in_dim, config.first_features_dim * 2);
        let last = plan.decoder.last().unwrap();
        assert!((last.radius - r0 * 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_equivariant_width_must_divide_by_three() {
        let config = config_with(vec![SimpleEquivariant, Unary]);
        // Default width 64 is not a multiple of 3.
        let err = ArchitecturePlan::build(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let config = FusionSegConfig {
            architecture: vec![SimpleEquivariant, Unary],
            first_features_dim: 66,
            ..Default::default()
        };
        ArchitecturePlan::build(&config).unwrap();
    }

    #[test]
    fn test_more_upsamples_than_pools_fails() {
        let config = config_with(vec![Simple, NearestUpsample, Unary]);
        let err = ArchitecturePlan::build(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // Balanced M = N succeeds.
        let config = config_with(vec![Simple, ResnetbStrided, NearestUpsample, Unary]);
        ArchitecturePlan::build(&config).unwrap();
    }

    #[test]
    fn test_no_upsample_means_empty_decoder() {
        let config = config_with(vec![Simple, Resnetb, Unary]);
        let plan = ArchitecturePlan::build(&config).unwrap();
        assert!(plan.decoder.is_empty());
        assert!(plan.decoder_concats.is_empty());
        assert_eq!(plan.encoder_skips.len(), 0);
        assert_eq!(plan.head_in_dim, 64);
    }

    #[test]
    fn test_strided_block_rejected_in_decoder() {
        let config = config_with(vec![
            Simple,
            ResnetbStrided,
            NearestUpsample,
            ResnetbStrided,
        ]);
        let err = ArchitecturePlan::build(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_max_pool_records_skip() {
        let config = config_with(vec![Simple, MaxPool, Resnetb, NearestUpsample, Unary]);
        let plan = ArchitecturePlan::build(&config).unwrap();
        assert_eq!(plan.encoder_skips, vec![1]);
        // Tap captures the halved simple output on both towers.
        assert_eq!(plan.encoder_skip_dims, vec![64]);
    }
}
