//! Segmentation loss and accuracy.
//!
//! The loss is a cross-entropy over remapped labels (ignored labels are
//! masked out of both numerator and denominator) plus a geometric
//! regularizer keeping deformable kernel points close to the data and
//! away from each other.

use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::ops::log_softmax;

use kpfuse_core::{FittingMode, LabelMap};

use crate::blocks::DeformState;

#[derive(Debug)]
pub struct SegmentationLoss {
    label_map: LabelMap,
    class_weights: Option<Vec<f32>>,
    fitting_mode: FittingMode,
    fitting_power: f64,
    repulse_extent: f64,
}

impl SegmentationLoss {
    pub fn new(
        label_map: LabelMap,
        class_weights: &[f32],
        fitting_mode: FittingMode,
        fitting_power: f64,
        repulse_extent: f64,
    ) -> kpfuse_core::Result<Self> {
        if !class_weights.is_empty() && class_weights.len() != label_map.num_classes() {
            return Err(kpfuse_core::Error::Config(format!(
                "{} class weights for {} classes",
                class_weights.len(),
                label_map.num_classes()
            )));
        }
        let class_weights = if class_weights.is_empty() {
            None
        } else {
            Some(class_weights.to_vec())
        };
        Ok(Self {
            label_map,
            class_weights,
            fitting_mode,
            fitting_power,
            repulse_extent,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.label_map.num_classes()
    }

    /// Remaps raw labels `(np,)` i64 to dense indices, ignored labels to
    /// the sentinel. Total over any input.
    pub fn remap_targets(&self, labels: &Tensor) -> Result<Tensor> {
        let raw = labels.to_vec1::<i64>()?;
        let mapped: Vec<i64> = raw.iter().map(|&v| self.label_map.remap(v)).collect();
        Tensor::from_vec(mapped, raw.len(), labels.device())
    }

    /// Cross-entropy over non-ignored points, optionally class-weighted:
    /// `Σ w[y_i]·nll_i / Σ w[y_i]`. Returns a zero scalar when every
    /// point is ignored.
    pub fn cross_entropy(&self, logits: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (np, c) = logits.dims2()?;
        let log_probs = log_softmax(logits, 1)?;

        let targets = target.to_vec1::<i64>()?;
        if targets.len() != np {
            return Err(Error::Msg(format!(
                "{} targets for {np} points",
                targets.len()
            )));
        }

        let mut picked = vec![0f32; np * c];
        let mut denom = 0f64;
        for (i, &t) in targets.iter().enumerate() {
            if t >= 0 && (t as usize) < c {
                let w = self
                    .class_weights
                    .as_ref()
                    .map(|ws| ws[t as usize])
                    .unwrap_or(1.0);
                picked[i * c + t as usize] = w;
                denom += w as f64;
            }
        }
        if denom == 0.0 {
            return Tensor::zeros((), DType::F32, logits.device());
        }

        let picked = Tensor::from_vec(picked, (np, c), logits.device())?;
        let nll = (log_probs * picked)?.sum_all()?.neg()?;
        nll / denom
    }

    /// Fitting + repulsion regularizer over the recorded state of every
    /// deformable convolution.
    ///
    /// Fitting penalizes kernel points far from their closest input
    /// point; repulsion penalizes pairs closer than the configured
    /// extent (distances are clipped below zero before squaring, so
    /// only violations contribute). Zero when no deformable layer is
    /// present.
    pub fn regularizer(&self, states: &[DeformState], device: &Device) -> Result<Tensor> {
        match self.fitting_mode {
            FittingMode::Point2Point => {}
            FittingMode::Point2Plane => {
                return Err(Error::Msg(
                    "point2plane fitting mode not implemented yet".into(),
                ))
            }
        }

        let mut total = Tensor::zeros((), DType::F32, device)?;
        for state in states {
            // Distances normalized by the layer extent so every layer
            // contributes at the same scale.
            let min_d2 = (&state.min_d2 / (state.extent * state.extent))?;
            let fitting = min_d2.abs()?.mean_all()?;

            let kp = (&state.deformed_kp / state.extent)?;
            let (_n, k, _) = kp.dims3()?;
            let mut repulsive = Tensor::zeros((), DType::F32, device)?;
            for i in 0..k {
                let current = kp.narrow(1, i, 1)?;
                let mut parts = Vec::new();
                if i > 0 {
                    parts.push(kp.narrow(1, 0, i)?);
                }
                if i + 1 < k {
                    parts.push(kp.narrow(1, i + 1, k - 1 - i)?);
                }
                if parts.is_empty() {
                    continue;
                }
                let parts: Vec<&Tensor> = parts.iter().collect();
                let others = Tensor::cat(&parts, 1)?.detach();

                let distances = others.broadcast_sub(&current)?.sqr()?.sum(2)?.sqrt()?;
                let violations = (distances.clone() - self.repulse_extent)?
                    .minimum(&Tensor::zeros_like(&distances)?)?;
                let rep = violations.sqr()?.sum(1)?;
                let rep = (rep.abs()?.mean_all()? / k as f64)?;
                repulsive = (repulsive + rep)?;
            }

            let term = ((fitting * 2.0)? + repulsive)?;
            total = (total + (term * self.fitting_power)?)?;
        }
        Ok(total)
    }

    /// Combined training loss: cross-entropy plus the deformable
    /// regularizer.
    pub fn loss(
        &self,
        logits: &Tensor,
        labels: &Tensor,
        deform_states: &[DeformState],
    ) -> Result<Tensor> {
        let target = self.remap_targets(labels)?;
        let output_loss = self.cross_entropy(logits, &target)?;
        let reg_loss = self.regularizer(deform_states, logits.device())?;
        output_loss + reg_loss
    }

    /// Fraction of points whose argmax prediction matches the remapped
    /// label. The denominator counts every point, including
    /// ignored-label ones; mask beforehand for the other convention.
    pub fn accuracy(&self, logits: &Tensor, labels: &Tensor) -> Result<f32> {
        let target = self.remap_targets(labels)?;
        let predicted = logits.argmax(1)?.to_dtype(DType::I64)?;
        let correct = predicted
            .eq(&target)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        let total = target.dim(0)? as f32;
        Ok(correct / total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpfuse_core::FittingMode::Point2Point;

    fn test_loss(class_weights: &[f32]) -> SegmentationLoss {
        let map = LabelMap::new(&[1, 2], &[]);
        SegmentationLoss::new(map, class_weights, Point2Point, 1.0, 1.2).unwrap()
    }

    #[test]
    fn test_remap_targets() -> Result<()> {
        let device = Device::Cpu;
        let loss = test_loss(&[]);
        let labels = Tensor::new(&[1i64, 2, 99, -5], &device)?;
        let target: Vec<i64> = loss.remap_targets(&labels)?.to_vec1()?;
        assert_eq!(target, vec![0, 1, -1, -1]);
        Ok(())
    }

    #[test]
    fn test_cross_entropy_ignores_sentinel() -> Result<()> {
        let device = Device::Cpu;
        let loss = test_loss(&[]);

        let logits = Tensor::new(&[[0.0f32, 0.0], [0.0, 0.0]], &device)?;
        // Second point has an invalid label and must not contribute.
        let labels = Tensor::new(&[1i64, 99], &device)?;
        let target = loss.remap_targets(&labels)?;
        let value: f32 = loss.cross_entropy(&logits, &target)?.to_scalar()?;
        assert!((value - 0.6931472).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_cross_entropy_class_weights() -> Result<()> {
        let device = Device::Cpu;
        let loss = test_loss(&[1.0, 3.0]);

        let logits = Tensor::new(&[[2.0f32, 0.0], [0.0, 0.0]], &device)?;
        let labels = Tensor::new(&[1i64, 2], &device)?;
        let target = loss.remap_targets(&labels)?;
        let value: f32 = loss.cross_entropy(&logits, &target)?.to_scalar()?;
        // (1*0.126928 + 3*0.693147) / 4
        assert!((value - 0.5515925).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_cross_entropy_all_ignored_is_zero() -> Result<()> {
        let device = Device::Cpu;
        let loss = test_loss(&[]);
        let logits = Tensor::new(&[[1.0f32, 2.0]], &device)?;
        let labels = Tensor::new(&[42i64], &device)?;
        let target = loss.remap_targets(&labels)?;
        let value: f32 = loss.cross_entropy(&logits, &target)?.to_scalar()?;
        assert_eq!(value, 0.0);
        Ok(())
    }

    #[test]
    fn test_weight_count_mismatch_rejected() {
        let map = LabelMap::new(&[1, 2], &[]);
        let err = SegmentationLoss::new(map, &[1.0], Point2Point, 1.0, 1.2).unwrap_err();
        assert!(matches!(err, kpfuse_core::Error::Config(_)));
    }

    #[test]
    fn test_accuracy_counts_ignored_in_denominator() -> Result<()> {
        let device = Device::Cpu;
        let loss = test_loss(&[]);

        let logits = Tensor::new(&[[5.0f32, 0.0], [0.0, 5.0]], &device)?;
        // First point correct, second point ignored (never matches).
        let labels = Tensor::new(&[1i64, 99], &device)?;
        let acc = loss.accuracy(&logits, &labels)?;
        assert_eq!(acc, 0.5);
        Ok(())
    }

    fn deform_state(device: &Device, separation: f32, extent: f64) -> Result<DeformState> {
        // Two kernel points `separation` apart on one query.
        let kp = Tensor::new(
            &[[[0.0f32, 0.0, 0.0], [separation, 0.0, 0.0]]],
            device,
        )?;
        Ok(DeformState {
            min_d2: Tensor::zeros((1, 2), DType::F32, device)?,
            deformed_kp: (kp * extent)?,
            extent,
        })
    }

    #[test]
    fn test_repulsion_zero_beyond_extent() -> Result<()> {
        let device = Device::Cpu;
        let loss = test_loss(&[]);

        // Pairwise distance 10 in extent units, repulse extent 1.2.
        let state = deform_state(&device, 10.0, 0.5)?;
        let value: f32 = loss.regularizer(&[state], &device)?.to_scalar()?;
        assert_eq!(value, 0.0);
        Ok(())
    }

    #[test]
    fn test_repulsion_positive_when_clustered() -> Result<()> {
        let device = Device::Cpu;
        let loss = test_loss(&[]);

        let state = deform_state(&device, 0.1, 0.5)?;
        let value: f32 = loss.regularizer(&[state], &device)?.to_scalar()?;
        assert!(value > 0.0);
        Ok(())
    }

    #[test]
    fn test_point2plane_rejected_at_runtime() {
        let device = Device::Cpu;
        let map = LabelMap::new(&[1, 2], &[]);
        let loss =
            SegmentationLoss::new(map, &[], FittingMode::Point2Plane, 1.0, 1.2).unwrap();
        assert!(loss.regularizer(&[], &device).is_err());
    }

    #[test]
    fn test_empty_states_zero_regularizer() -> Result<()> {
        let device = Device::Cpu;
        let loss = test_loss(&[]);
        let value: f32 = loss.regularizer(&[], &device)?.to_scalar()?;
        assert_eq!(value, 0.0);
        Ok(())
    }
}
