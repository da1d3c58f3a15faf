//! # kpfuse-net
//!
//! Multi-modal network for semantic segmentation of 3D scenes.
//!
//! Two encoder towers walk the same declarative block list: one over 3D
//! point features (constant + color), one over per-point aggregated 2D
//! image features unprojected from multi-view images. Skip snapshots are
//! captured at every resolution change, fused across modalities, and
//! reinjected in a mirrored decoder. The convolution primitive is a
//! kernel-point convolution with optional deformable kernels.
//!
//! ## Module layout
//!
//! 1. **Blocks** ([`blocks`]): kernel-point convolution + the block set
//!    (simple, bottleneck residual, pooling, upsampling, unary).
//! 2. **Architecture** ([`architecture`]): pure plan built from the
//!    descriptor list, then tower construction from the plan.
//! 3. **Backbone** ([`backbone`]): frozen 2D image feature extractor.
//! 4. **Aggregation** ([`aggregation`]): 2D→3D unprojection and
//!    attention-weighted per-point feature aggregation.
//! 5. **Model** ([`model`]): the fused forward pass.
//! 6. **Loss** ([`loss`]): masked cross-entropy, deformable-kernel
//!    regularizer, accuracy.

pub mod aggregation;
pub mod architecture;
pub mod backbone;
pub mod batch;
pub mod blocks;
pub mod inference;
pub mod loss;
pub mod model;

pub use aggregation::*;
pub use architecture::*;
pub use backbone::*;
pub use batch::*;
pub use blocks::*;
pub use inference::*;
pub use loss::*;
pub use model::*;
