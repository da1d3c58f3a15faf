//! Label remapping between raw dataset label values and dense class
//! indices.

/// Sentinel index for labels excluded from the loss.
pub const IGNORED_LABEL: i64 = -1;

/// Maps raw label values to the dense range `[0, C-1]`.
///
/// Built once from the dataset's label values and the ignored subset;
/// any value outside the valid list maps to [`IGNORED_LABEL`]. The
/// mapping is total: every input produces either a dense index or the
/// sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    valid: Vec<i64>,
}

impl LabelMap {
    pub fn new(label_values: &[i64], ignored_labels: &[i64]) -> Self {
        let mut valid: Vec<i64> = label_values
            .iter()
            .copied()
            .filter(|c| !ignored_labels.contains(c))
            .collect();
        valid.sort_unstable();
        valid.dedup();
        Self { valid }
    }

    /// Number of classes after remapping.
    pub fn num_classes(&self) -> usize {
        self.valid.len()
    }

    /// Sorted list of valid raw label values.
    pub fn valid_labels(&self) -> &[i64] {
        &self.valid
    }

    /// Dense index of a raw label, or [`IGNORED_LABEL`] if it is not in
    /// the valid list.
    pub fn remap(&self, raw: i64) -> i64 {
        match self.valid.binary_search(&raw) {
            Ok(i) => i as i64,
            Err(_) => IGNORED_LABEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_dense() {
        let map = LabelMap::new(&[0, 1, 2, 3], &[0]);
        assert_eq!(map.num_classes(), 3);
        assert_eq!(map.remap(1), 0);
        assert_eq!(map.remap(3), 2);
        assert_eq!(map.remap(0), IGNORED_LABEL);
        assert_eq!(map.remap(42), IGNORED_LABEL);
    }

    #[test]
    fn test_remap_sparse_values() {
        let map = LabelMap::new(&[5, 12, 7, 33], &[33]);
        assert_eq!(map.valid_labels(), &[5, 7, 12]);
        assert_eq!(map.remap(7), 1);
        assert_eq!(map.remap(33), IGNORED_LABEL);
    }

    #[test]
    fn test_remap_total_and_idempotent_on_dense_maps() {
        // With a dense valid list, remapping its own output is a fixpoint
        // and the sentinel stays the sentinel.
        let map = LabelMap::new(&[0, 1, 2], &[]);
        for raw in -3..6 {
            let once = map.remap(raw);
            let twice = map.remap(once);
            assert_eq!(once, twice);
        }
        assert_eq!(map.remap(IGNORED_LABEL), IGNORED_LABEL);
    }

    #[test]
    fn test_duplicate_values_collapse() {
        let map = LabelMap::new(&[2, 2, 1], &[]);
        assert_eq!(map.num_classes(), 2);
        assert_eq!(map.remap(2), 1);
    }
}
