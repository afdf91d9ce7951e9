use serde::{Deserialize, Serialize};

const USED_BITS_SHIFT: u32 = 58;
pub const MAX_USED_BITS: u8 = 58;

/// A partition of the document key space. The top six bits hold the number
/// of used location bits; the remaining bits hold the location itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId(u64);

impl BucketId {
    pub fn new(used_bits: u8, location: u64) -> Self {
        assert!(
            used_bits <= MAX_USED_BITS,
            "bucket id cannot use {used_bits} bits (max {MAX_USED_BITS})"
        );
        Self(((used_bits as u64) << USED_BITS_SHIFT) | (location & low_mask(used_bits)))
    }

    pub fn from_raw(raw: u64) -> Self {
        let used_bits = ((raw >> USED_BITS_SHIFT) as u8).min(MAX_USED_BITS);
        Self::new(used_bits, raw)
    }

    /// Bucket holding `document` at the given split level.
    pub fn for_document(document: &DocumentId, used_bits: u8) -> Self {
        Self::new(used_bits, document.location())
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn used_bits(self) -> u8 {
        (self.0 >> USED_BITS_SHIFT) as u8
    }

    pub fn location(self) -> u64 {
        self.0 & low_mask(MAX_USED_BITS)
    }

    /// True when every location inside `other` also lies inside `self`.
    pub fn contains(self, other: BucketId) -> bool {
        other.used_bits() >= self.used_bits()
            && (other.location() & low_mask(self.used_bits())) == self.location()
    }

    pub fn split_children(self) -> (BucketId, BucketId) {
        let bits = self.used_bits();
        assert!(bits < MAX_USED_BITS, "cannot split {self}: no bits left");
        let location = self.location();
        (
            BucketId::new(bits + 1, location),
            BucketId::new(bits + 1, location | (1u64 << bits)),
        )
    }

    pub fn parent(self) -> Option<BucketId> {
        let bits = self.used_bits();
        if bits == 0 {
            return None;
        }
        Some(BucketId::new(bits - 1, self.location()))
    }

    /// Well-mixed hash of the raw id. Sequentially numbered buckets differ
    /// only in their low bits, so this must not be used modulo-raw.
    pub fn stripe_hash(self) -> u64 {
        fmix64(self.0)
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BucketId(0x{:016x})", self.0)
    }
}

impl std::fmt::Debug for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Location bits derived from the document identity.
    pub fn location(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in self.0.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        fmix64(h)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

fn low_mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// murmur3 64-bit finalizer
pub(crate) fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod tests {
    use super::{BucketId, DocumentId};

    #[test]
    fn split_children_are_contained_by_parent() {
        let parent = BucketId::new(16, 0x8001);
        let (left, right) = parent.split_children();
        assert_eq!(left.used_bits(), 17);
        assert!(parent.contains(left));
        assert!(parent.contains(right));
        assert!(!left.contains(right));
        assert_eq!(left.parent(), Some(parent));
        assert_eq!(right.parent(), Some(parent));
    }

    #[test]
    fn document_bucket_lands_in_exactly_one_child() {
        for i in 0..64 {
            let doc = DocumentId::new(format!("id:test:music::{i}"));
            let full = BucketId::for_document(&doc, 58);
            let parent = BucketId::for_document(&doc, 8);
            let (left, right) = parent.split_children();
            assert!(parent.contains(full));
            assert_ne!(left.contains(full), right.contains(full));
        }
    }

    #[test]
    fn location_is_masked_to_used_bits() {
        let id = BucketId::new(4, 0xffff);
        assert_eq!(id.location(), 0xf);
        assert_eq!(BucketId::from_raw(id.raw()), id);
    }

    #[test]
    fn stripe_hash_spreads_sequential_buckets() {
        let stripes = 8u64;
        let mut counts = [0usize; 8];
        for location in 0..1024u64 {
            let idx = BucketId::new(16, location).stripe_hash() % stripes;
            counts[idx as usize] += 1;
        }
        for count in counts {
            assert!((64..=192).contains(&count), "skewed stripe fill: {counts:?}");
        }
    }
}
