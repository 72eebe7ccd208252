//! Per-property flags for an entity entry.
//!
//! The change tracker keeps one set for properties the caller marked
//! modified explicitly and one for properties detection found changed.

/// A compact bitset representing "property is flagged" for indices `0..len`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldsSet {
    len: usize,
    bits: Box<[u64]>,
}

impl FieldsSet {
    /// Create an empty (all-clear) set for `len` properties.
    #[must_use]
    pub fn empty(len: usize) -> Self {
        let words = len.div_ceil(64);
        Self {
            len,
            bits: vec![0u64; words].into_boxed_slice(),
        }
    }

    /// Flag a property index.
    ///
    /// Indices outside `0..len` are ignored.
    pub fn set(&mut self, idx: usize) {
        if idx >= self.len {
            return;
        }
        if let Some(w) = self.bits.get_mut(idx / 64) {
            *w |= 1u64 << (idx % 64);
        }
    }

    /// Clear a property index.
    pub fn unset(&mut self, idx: usize) {
        if idx >= self.len {
            return;
        }
        if let Some(w) = self.bits.get_mut(idx / 64) {
            *w &= !(1u64 << (idx % 64));
        }
    }

    /// Check whether a property index is flagged.
    #[must_use]
    pub fn is_set(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        self.bits
            .get(idx / 64)
            .is_some_and(|w| (w & (1u64 << (idx % 64))) != 0)
    }

    /// Clear every flag.
    pub fn clear(&mut self) {
        for w in &mut self.bits {
            *w = 0;
        }
    }

    /// Whether any flag is set.
    #[must_use]
    pub fn any(&self) -> bool {
        self.bits.iter().any(|w| *w != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_unset_across_words() {
        let mut s = FieldsSet::empty(70);
        s.set(3);
        s.set(65);
        assert!(s.is_set(3));
        assert!(s.is_set(65));
        assert!(!s.is_set(4));
        s.unset(65);
        assert!(!s.is_set(65));
        assert!(s.any());
        s.clear();
        assert!(!s.any());
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut s = FieldsSet::empty(2);
        s.set(5);
        assert!(!s.is_set(5));
        assert!(!s.any());
    }
}
