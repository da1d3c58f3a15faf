//! Kernel-point convolution and the block library.
//!
//! Every block is an opaque callable `forward(features, batch) ->
//! features` over the stacked point cloud of one resolution level.
//! Strided blocks read their query points from the pooling tables and
//! emit features on the next (coarser) level; upsampling blocks gather
//! back to the finer level.

use candle_core::{Error, Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, Init, Linear, Module, VarBuilder};
use parking_lot::RwLock;

use kpfuse_core::{kernel_dispositions, BlockKind, FusionSegConfig};

use crate::batch::SceneBatch;

const LEAKY_SLOPE: f64 = 0.1;

/// Coordinate used for the shadow row appended to support points, far
/// enough that shadow neighbors fall outside any kernel's influence.
const SHADOW_COORD: f32 = 1e6;

pub(crate) fn leaky_relu(x: &Tensor) -> Result<Tensor> {
    let scaled = (x * LEAKY_SLOPE)?;
    x.maximum(&scaled)
}

/// Gathers rows of `x` `(n, d)` through an index table `(m, h)`,
/// appending a constant padding row so the shadow index `n` is valid.
/// Returns `(m, h, d)`.
pub(crate) fn gather_rows_padded(x: &Tensor, inds: &Tensor, pad: f32) -> Result<Tensor> {
    let (_n, d) = x.dims2()?;
    let (m, h) = inds.dims2()?;
    let pad_row = Tensor::full(pad, (1, d), x.device())?.to_dtype(x.dtype())?;
    let padded = Tensor::cat(&[x, &pad_row], 0)?;
    let flat = inds.flatten_all()?;
    let gathered = padded.index_select(&flat, 0)?;
    gathered.reshape((m, h, d))
}

/// Batch-norm over stacked point features `(n, d)`.
fn norm_points(bn: &BatchNorm, x: &Tensor) -> Result<Tensor> {
    let x = x.t()?.unsqueeze(0)?.contiguous()?;
    let x = bn.forward_train(&x)?;
    x.squeeze(0)?.t()?.contiguous()
}

/// State recorded by a deformable convolution during its forward pass,
/// consumed by the fitting/repulsion regularizer.
#[derive(Clone)]
pub struct DeformState {
    /// Min squared distance from each (deformed) kernel point to the
    /// input neighbors, `(n, k)`.
    pub min_d2: Tensor,
    /// Deformed kernel positions relative to each query point, `(n, k, 3)`.
    pub deformed_kp: Tensor,
    /// Influence extent of the layer, for normalization.
    pub extent: f64,
}

struct Deform {
    offset_conv: Box<KPConv>,
    offset_bias: Tensor,
    state: RwLock<Option<DeformState>>,
}

/// Kernel-point convolution.
///
/// A small set of reference points carries one weight matrix each;
/// every input neighbor contributes to each kernel point with a linear
/// influence `max(0, 1 - d/extent)`. In the deformable variant an
/// internal rigid convolution predicts per-kernel offsets, and the
/// layer records the state the regularizer needs.
pub struct KPConv {
    weights: Tensor,
    kernel_points: Tensor,
    num_kernels: usize,
    in_dim: usize,
    out_dim: usize,
    radius: f64,
    kp_extent: f64,
    deform: Option<Deform>,
}

impl KPConv {
    pub fn new(
        num_kernels: usize,
        in_dim: usize,
        out_dim: usize,
        radius: f64,
        kp_extent: f64,
        deformable: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weights = vb.get_with_hints(
            (num_kernels, in_dim, out_dim),
            "weights",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;

        let dispositions = kernel_dispositions(num_kernels, kp_extent);
        let flat: Vec<f32> = dispositions
            .iter()
            .flat_map(|p| [p.x as f32, p.y as f32, p.z as f32])
            .collect();
        let kernel_points = Tensor::from_vec(flat, (num_kernels, 3), vb.device())?;

        let deform = if deformable {
            let offset_conv = KPConv::new(
                num_kernels,
                in_dim,
                3 * num_kernels,
                radius,
                kp_extent,
                false,
                vb.pp("offset_conv"),
            )?;
            let offset_bias =
                vb.get_with_hints(3 * num_kernels, "offset_bias", Init::Const(0.0))?;
            Some(Deform {
                offset_conv: Box::new(offset_conv),
                offset_bias,
                state: RwLock::new(None),
            })
        } else {
            None
        };

        Ok(Self {
            weights,
            kernel_points,
            num_kernels,
            in_dim,
            out_dim,
            radius,
            kp_extent,
            deform,
        })
    }

    pub fn is_deformable(&self) -> bool {
        self.deform.is_some()
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// State of the last forward pass, present only for deformable
    /// convolutions that have run at least once.
    pub fn deform_state(&self) -> Option<DeformState> {
        self.deform.as_ref().and_then(|d| d.state.read().clone())
    }

    /// Applies the convolution.
    ///
    /// * `q_pts` - query points `(m, 3)`
    /// * `s_pts` - support points `(n, 3)`
    /// * `neighb_inds` - neighbor table `(m, h)` into the support points
    /// * `x` - support features `(n, in_dim)`
    pub fn forward(
        &self,
        q_pts: &Tensor,
        s_pts: &Tensor,
        neighb_inds: &Tensor,
        x: &Tensor,
    ) -> Result<Tensor> {
        let (m, _h) = neighb_inds.dims2()?;
        let k = self.num_kernels;

        // Neighbor coordinates relative to the query points. Shadow
        // neighbors land far away and get zero influence.
        let neighbors = gather_rows_padded(s_pts, neighb_inds, SHADOW_COORD)?;
        let neighbors = neighbors.broadcast_sub(&q_pts.unsqueeze(1)?)?;

        // Kernel positions, deformed if offsets are predicted.
        let kernels = if let Some(deform) = &self.deform {
            let offset_feats = deform.offset_conv.forward(q_pts, s_pts, neighb_inds, x)?;
            let offset_feats = offset_feats.broadcast_add(&deform.offset_bias)?;
            let offsets = (offset_feats.reshape((m, k, 3))? * self.kp_extent)?;
            offsets.broadcast_add(&self.kernel_points.unsqueeze(0)?)?
        } else {
            self.kernel_points.unsqueeze(0)?
        };

        // (m, h, k) squared distances between neighbors and kernels.
        let differences = neighbors
            .unsqueeze(2)?
            .broadcast_sub(&kernels.unsqueeze(1)?)?;
        let sq_distances = differences.sqr()?.sum(3)?;

        if let Some(deform) = &self.deform {
            // Deformed kernels are per-query here, (m, k, 3).
            *deform.state.write() = Some(DeformState {
                min_d2: sq_distances.min(1)?,
                deformed_kp: kernels.clone(),
                extent: self.kp_extent,
            });
        }

        // Linear influence, clipped at the extent.
        let distances = sq_distances.sqrt()?;
        let influence = distances.affine(-1.0 / self.kp_extent, 1.0)?.relu()?;
        let influence = influence.transpose(1, 2)?.contiguous()?; // (m, k, h)

        // Influence-weighted neighbor features: (m, k, in_dim).
        let neighb_x = gather_rows_padded(x, neighb_inds, 0.0)?;
        let weighted = influence.matmul(&neighb_x)?;

        // One weight matrix per kernel point, summed.
        let weighted = weighted.permute((1, 0, 2))?.contiguous()?; // (k, m, in_dim)
        let kernel_outputs = weighted.matmul(&self.weights)?; // (k, m, out_dim)
        kernel_outputs.sum(0)
    }
}

/// Pointwise linear + optional batch norm + leaky ReLU.
pub struct UnaryBlock {
    linear: Linear,
    norm: Option<BatchNorm>,
    no_relu: bool,
}

impl UnaryBlock {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        use_bn: bool,
        no_relu: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = linear(in_dim, out_dim, vb.pp("linear"))?;
        let norm = if use_bn {
            Some(batch_norm(out_dim, 1e-5, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self {
            linear,
            norm,
            no_relu,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = self.linear.forward(x)?;
        if let Some(bn) = &self.norm {
            x = norm_points(bn, &x)?;
        }
        if self.no_relu {
            Ok(x)
        } else {
            leaky_relu(&x)
        }
    }
}

/// Single kernel-point convolution emitting half the configured width.
pub struct SimpleBlock {
    kpconv: KPConv,
    norm: BatchNorm,
    layer: usize,
    strided: bool,
}

impl SimpleBlock {
    pub fn new(
        num_kernels: usize,
        in_dim: usize,
        out_dim: usize,
        radius: f64,
        kp_extent: f64,
        layer: usize,
        strided: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let half = out_dim / 2;
        let kpconv = KPConv::new(
            num_kernels,
            in_dim,
            half,
            radius,
            kp_extent,
            false,
            vb.pp("kpconv"),
        )?;
        let norm = batch_norm(half, 1e-5, vb.pp("norm"))?;
        Ok(Self {
            kpconv,
            norm,
            layer,
            strided,
        })
    }

    pub fn forward(&self, x: &Tensor, batch: &SceneBatch) -> Result<Tensor> {
        let s_pts = batch.level_points(self.layer)?;
        let (q_pts, inds) = if self.strided {
            (
                batch.level_points(self.layer + 1)?,
                batch.level_pools(self.layer)?,
            )
        } else {
            (s_pts, batch.level_neighbors(self.layer)?)
        };
        let x = self.kpconv.forward(q_pts, s_pts, inds, x)?;
        leaky_relu(&norm_points(&self.norm, &x)?)
    }
}

/// Bottleneck residual block: unary down, kernel-point convolution,
/// unary up, shortcut across.
pub struct ResnetBottleneckBlock {
    unary1: Option<UnaryBlock>,
    kpconv: KPConv,
    norm_conv: BatchNorm,
    unary2: UnaryBlock,
    unary_shortcut: Option<UnaryBlock>,
    layer: usize,
    strided: bool,
}

impl ResnetBottleneckBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_kernels: usize,
        in_dim: usize,
        out_dim: usize,
        radius: f64,
        kp_extent: f64,
        layer: usize,
        strided: bool,
        deformable: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mid = out_dim / 4;

        let unary1 = if in_dim != mid {
            Some(UnaryBlock::new(in_dim, mid, true, false, vb.pp("unary1"))?)
        } else {
            None
        };

        let kpconv = KPConv::new(
            num_kernels,
            mid,
            mid,
            radius,
            kp_extent,
            deformable,
            vb.pp("kpconv"),
        )?;
        let norm_conv = batch_norm(mid, 1e-5, vb.pp("norm_conv"))?;

        let unary2 = UnaryBlock::new(mid, out_dim, true, true, vb.pp("unary2"))?;

        let unary_shortcut = if in_dim != out_dim {
            Some(UnaryBlock::new(
                in_dim,
                out_dim,
                true,
                true,
                vb.pp("unary_shortcut"),
            )?)
        } else {
            None
        };

        Ok(Self {
            unary1,
            kpconv,
            norm_conv,
            unary2,
            unary_shortcut,
            layer,
            strided,
        })
    }

    pub fn forward(&self, x: &Tensor, batch: &SceneBatch) -> Result<Tensor> {
        let s_pts = batch.level_points(self.layer)?;
        let (q_pts, inds) = if self.strided {
            (
                batch.level_points(self.layer + 1)?,
                batch.level_pools(self.layer)?,
            )
        } else {
            (s_pts, batch.level_neighbors(self.layer)?)
        };

        let h = match &self.unary1 {
            Some(u) => u.forward(x)?,
            None => x.clone(),
        };
        let h = self.kpconv.forward(q_pts, s_pts, inds, &h)?;
        let h = leaky_relu(&norm_points(&self.norm_conv, &h)?)?;
        let h = self.unary2.forward(&h)?;

        // Shortcut: pooled to the coarser level when the block strides.
        let shortcut = if self.strided {
            max_pool_neighbors(x, inds)?
        } else {
            x.clone()
        };
        let shortcut = match &self.unary_shortcut {
            Some(u) => u.forward(&shortcut)?,
            None => shortcut,
        };

        leaky_relu(&(h + shortcut)?)
    }

    pub fn kpconv(&self) -> &KPConv {
        &self.kpconv
    }
}

/// Neighbor max over an index table.
fn max_pool_neighbors(x: &Tensor, inds: &Tensor) -> Result<Tensor> {
    let gathered = gather_rows_padded(x, inds, 0.0)?;
    gathered.max(1)
}

/// Max pool onto the next resolution level.
pub struct MaxPoolBlock {
    layer: usize,
}

impl MaxPoolBlock {
    pub fn new(layer: usize) -> Self {
        Self { layer }
    }

    pub fn forward(&self, x: &Tensor, batch: &SceneBatch) -> Result<Tensor> {
        max_pool_neighbors(x, batch.level_pools(self.layer)?)
    }
}

/// Per-scene global average at the block's level.
pub struct GlobalAverageBlock {
    layer: usize,
}

impl GlobalAverageBlock {
    pub fn new(layer: usize) -> Self {
        Self { layer }
    }

    pub fn forward(&self, x: &Tensor, batch: &SceneBatch) -> Result<Tensor> {
        let lengths = batch.level_lengths(self.layer)?;
        let mut means = Vec::with_capacity(lengths.len());
        let mut start = 0;
        for &len in lengths {
            let segment = x.narrow(0, start, len)?;
            means.push(segment.mean(0)?);
            start += len;
        }
        Tensor::stack(&means, 0)
    }
}

/// Closest-point upsampling from the coarser level back to this block's
/// level.
pub struct NearestUpsampleBlock {
    layer: usize,
}

impl NearestUpsampleBlock {
    pub fn new(layer: usize) -> Self {
        Self { layer }
    }

    pub fn forward(&self, x: &Tensor, batch: &SceneBatch) -> Result<Tensor> {
        if self.layer == 0 {
            return Err(Error::Msg(
                "nearest_upsample has no finer level to return to".into(),
            ));
        }
        let upsamples = batch.level_upsamples(self.layer - 1)?;
        let closest = upsamples.narrow(1, 0, 1)?.contiguous()?;
        let gathered = gather_rows_padded(x, &closest, 0.0)?;
        gathered.squeeze(1)
    }
}

/// A constructed block of any kind, dispatched by enum.
pub enum Block {
    Unary(UnaryBlock),
    Simple(SimpleBlock),
    ResnetBottleneck(ResnetBottleneckBlock),
    MaxPool(MaxPoolBlock),
    GlobalAverage(GlobalAverageBlock),
    NearestUpsample(NearestUpsampleBlock),
}

impl Block {
    pub fn forward(&self, x: &Tensor, batch: &SceneBatch) -> Result<Tensor> {
        match self {
            Block::Unary(b) => b.forward(x),
            Block::Simple(b) => b.forward(x, batch),
            Block::ResnetBottleneck(b) => b.forward(x, batch),
            Block::MaxPool(b) => b.forward(x, batch),
            Block::GlobalAverage(b) => b.forward(x, batch),
            Block::NearestUpsample(b) => b.forward(x, batch),
        }
    }

    /// The block's kernel-point convolution, if it has one.
    pub fn kpconv(&self) -> Option<&KPConv> {
        match self {
            Block::ResnetBottleneck(b) => Some(b.kpconv()),
            _ => None,
        }
    }
}

/// Constructs the block matching a descriptor at the given position in
/// the network.
pub fn build_block(
    kind: BlockKind,
    radius: f64,
    in_dim: usize,
    out_dim: usize,
    layer: usize,
    config: &FusionSegConfig,
    vb: VarBuilder,
) -> Result<Block> {
    let kp_extent = radius * config.kp_extent / config.conv_radius;
    let k = config.num_kernel_points;
    let block = match kind {
        BlockKind::Unary => {
            Block::Unary(UnaryBlock::new(in_dim, out_dim, true, false, vb)?)
        }
        BlockKind::Simple
        | BlockKind::SimpleStrided
        | BlockKind::SimpleEquivariant
        | BlockKind::SimpleEquivariantStrided => Block::Simple(SimpleBlock::new(
            k,
            in_dim,
            out_dim,
            radius,
            kp_extent,
            layer,
            kind.is_strided(),
            vb,
        )?),
        BlockKind::Resnetb
        | BlockKind::ResnetbStrided
        | BlockKind::ResnetbDeformable
        | BlockKind::ResnetbDeformableStrided => {
            Block::ResnetBottleneck(ResnetBottleneckBlock::new(
                k,
                in_dim,
                out_dim,
                radius,
                kp_extent,
                layer,
                kind.is_strided(),
                kind.is_deformable(),
                vb,
            )?)
        }
        BlockKind::MaxPool => Block::MaxPool(MaxPoolBlock::new(layer)),
        BlockKind::GlobalAverage => Block::GlobalAverage(GlobalAverageBlock::new(layer)),
        BlockKind::NearestUpsample => {
            Block::NearestUpsample(NearestUpsampleBlock::new(layer))
        }
    };
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_leaky_relu_values() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[-1.0f32, 0.0, 2.0], &device)?;
        let out: Vec<f32> = leaky_relu(&x)?.to_vec1()?;
        assert_eq!(out, vec![-0.1, 0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_gather_shadow_row() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &device)?;
        // Shadow index 2 addresses the padding row.
        let inds = Tensor::new(&[[0u32, 2], [1, 1]], &device)?;
        let out = gather_rows_padded(&x, &inds, 0.0)?;
        assert_eq!(out.dims(), &[2, 2, 2]);
        let rows: Vec<Vec<Vec<f32>>> = out.to_vec3()?;
        assert_eq!(rows[0][1], vec![0.0, 0.0]);
        assert_eq!(rows[1][0], vec![3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_rigid_kpconv_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let conv = KPConv::new(5, 4, 8, 0.1, 0.12, false, vb)?;
        assert!(!conv.is_deformable());

        let pts = Tensor::randn(0f32, 0.05, (6, 3), &device)?;
        let inds = Tensor::zeros((6, 3), DType::U32, &device)?;
        let x = Tensor::randn(0f32, 1.0, (6, 4), &device)?;

        let out = conv.forward(&pts, &pts, &inds, &x)?;
        assert_eq!(out.dims(), &[6, 8]);
        assert!(conv.deform_state().is_none());
        Ok(())
    }

    #[test]
    fn test_deformable_kpconv_records_state() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let conv = KPConv::new(5, 4, 8, 0.1, 0.12, true, vb)?;
        assert!(conv.is_deformable());
        assert!(conv.deform_state().is_none());

        let pts = Tensor::randn(0f32, 0.05, (6, 3), &device)?;
        let inds = Tensor::zeros((6, 3), DType::U32, &device)?;
        let x = Tensor::randn(0f32, 1.0, (6, 4), &device)?;

        let out = conv.forward(&pts, &pts, &inds, &x)?;
        assert_eq!(out.dims(), &[6, 8]);

        let state = conv.deform_state().expect("state after forward");
        assert_eq!(state.min_d2.dims(), &[6, 5]);
        assert_eq!(state.deformed_kp.dims(), &[6, 5, 3]);
        Ok(())
    }

    #[test]
    fn test_unary_block_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = UnaryBlock::new(4, 6, true, false, vb)?;
        let x = Tensor::randn(0f32, 1.0, (5, 4), &device)?;
        let out = block.forward(&x)?;
        assert_eq!(out.dims(), &[5, 6]);
        Ok(())
    }
}
