/// Material index reserved for quantities that belong to the whole domain
/// rather than to any one material (a shared pressure field, the matrix).
///
pub const OUT_OF_DOMAIN: i32 = -1;




/// An ordered set of unique material indices. Material indices are small
/// non-negative integers; the one exception is the reserved out-of-domain
/// subset.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MaterialSubset {
    indices: Vec<i32>,
}




// ============================================================================
impl MaterialSubset {
    /// Create a subset from the given indices. Duplicates are removed and the
    /// result is sorted.
    ///
    pub fn new<I: IntoIterator<Item = i32>>(indices: I) -> Self {
        let mut indices: Vec<i32> = indices.into_iter().collect();
        assert!(
            indices.iter().all(|&m| m >= 0),
            "material indices must be non-negative; use MaterialSubset::out_of_domain");
        indices.sort_unstable();
        indices.dedup();
        Self { indices }
    }

    pub fn single(index: i32) -> Self {
        Self::new(std::iter::once(index))
    }

    /// The reserved subset for whole-domain quantities.
    ///
    pub fn out_of_domain() -> Self {
        Self {
            indices: vec![OUT_OF_DOMAIN],
        }
    }

    pub fn is_out_of_domain(&self) -> bool {
        self.indices == [OUT_OF_DOMAIN]
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.indices.iter().copied()
    }

    pub fn contains(&self, index: i32) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{MaterialSubset, OUT_OF_DOMAIN};

    #[test]
    fn subsets_are_sorted_and_unique() {
        let m = MaterialSubset::new(vec![3, 1, 3, 0]);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert!(m.contains(1));
        assert!(!m.contains(2));
    }

    #[test]
    fn out_of_domain_subset_is_reserved() {
        let m = MaterialSubset::out_of_domain();
        assert!(m.is_out_of_domain());
        assert!(m.contains(OUT_OF_DOMAIN));
        assert!(!MaterialSubset::single(0).is_out_of_domain());
    }
}
