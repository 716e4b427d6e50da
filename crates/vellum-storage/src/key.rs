//! Key and value codecs for index entries.
//!
//! Entries are packed into page slots at a fixed size per tree instance,
//! so both keys and values declare their encoded length up front. Ordering
//! is supplied separately through [`KeyComparator`]; a caller may pass a
//! non-default comparator to implement prefix lookups over composite keys.

use bytes::{Buf, BufMut};
use std::cmp::Ordering;

/// A fixed-size key storable in index pages.
pub trait IndexKey: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Encoded size in bytes. Every key of this type occupies exactly this
    /// many bytes in a page slot.
    const ENCODED_LEN: usize;

    /// Writes the key into `buf`, advancing it by `ENCODED_LEN`.
    fn encode(&self, buf: &mut impl BufMut);

    /// Reads a key from `buf`, advancing it by `ENCODED_LEN`.
    fn decode(buf: &mut impl Buf) -> Self;
}

/// A fixed-size value storable in leaf pages.
pub trait IndexValue: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    /// Encoded size in bytes.
    const ENCODED_LEN: usize;

    /// Writes the value into `buf`, advancing it by `ENCODED_LEN`.
    fn encode(&self, buf: &mut impl BufMut);

    /// Reads a value from `buf`, advancing it by `ENCODED_LEN`.
    fn decode(buf: &mut impl Buf) -> Self;
}

impl IndexKey for i64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_i64()
    }
}

impl IndexKey for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_u64()
    }
}

impl IndexValue for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_u64()
    }
}

/// Record identifier: locates a tuple by page number and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rid {
    pub page_num: u32,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_num: u32, slot: u32) -> Self {
        Self { page_num, slot }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_num, self.slot)
    }
}

impl IndexValue for Rid {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.page_num);
        buf.put_u32_le(self.slot);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let page_num = buf.get_u32_le();
        let slot = buf.get_u32_le();
        Self { page_num, slot }
    }
}

/// Fixed N-byte key, comparable as a byte string.
///
/// Integers are packed big-endian with the sign bit flipped, so that the
/// byte-wise ordering of [`GenericComparator`] agrees with the numeric
/// ordering of the source integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericKey<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> Default for GenericKey<N> {
    fn default() -> Self {
        Self { data: [0u8; N] }
    }
}

impl<const N: usize> GenericKey<N> {
    /// Builds a key from an integer, preserving numeric order under
    /// byte-wise comparison.
    pub fn from_i64(value: i64) -> Self {
        assert!(N >= 8, "GenericKey must hold at least 8 bytes for an i64");
        let mut key = Self::default();
        let packed = (value as u64) ^ (1 << 63);
        key.data[..8].copy_from_slice(&packed.to_be_bytes());
        key
    }

    /// Builds a key from a byte slice, truncating or zero-padding to N.
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut key = Self::default();
        let len = slice.len().min(N);
        key.data[..len].copy_from_slice(&slice[..len]);
        key
    }

    /// Recovers the integer stored by `from_i64`.
    pub fn to_i64(&self) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[..8]);
        (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl<const N: usize> IndexKey for GenericKey<N> {
    const ENCODED_LEN: usize = N;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.data);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let mut key = Self::default();
        buf.copy_to_slice(&mut key.data);
        key
    }
}

/// Orders keys for search and placement within pages.
///
/// Implementations must be cheap to clone; the tree clones its comparator
/// into iterators and passes it by reference through page primitives.
pub trait KeyComparator<K>: Clone + Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Comparator delegating to the key's `Ord`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: IndexKey + Ord> KeyComparator<K> for OrdComparator {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Byte-wise comparator for [`GenericKey`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericComparator<const N: usize>;

impl<const N: usize> KeyComparator<GenericKey<N>> for GenericComparator<N> {
    fn compare(&self, a: &GenericKey<N>, b: &GenericKey<N>) -> Ordering {
        a.data.cmp(&b.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_codec_roundtrip() {
        let mut buf = Vec::new();
        (-42i64).encode(&mut buf);
        assert_eq!(buf.len(), <i64 as IndexKey>::ENCODED_LEN);
        let decoded = <i64 as IndexKey>::decode(&mut buf.as_slice());
        assert_eq!(decoded, -42);
    }

    #[test]
    fn test_rid_codec_roundtrip() {
        let rid = Rid::new(7, 3);
        let mut buf = Vec::new();
        rid.encode(&mut buf);
        assert_eq!(buf.len(), Rid::ENCODED_LEN);
        let decoded = Rid::decode(&mut buf.as_slice());
        assert_eq!(decoded, rid);
    }

    #[test]
    fn test_rid_display() {
        assert_eq!(Rid::new(1, 2).to_string(), "1:2");
    }

    #[test]
    fn test_generic_key_preserves_integer_order() {
        let cmp = GenericComparator::<16>;
        let values = [-100i64, -1, 0, 1, 99, i64::MAX, i64::MIN];
        for &a in &values {
            for &b in &values {
                let ka = GenericKey::<16>::from_i64(a);
                let kb = GenericKey::<16>::from_i64(b);
                assert_eq!(cmp.compare(&ka, &kb), a.cmp(&b), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_generic_key_i64_roundtrip() {
        for v in [-5i64, 0, 12345, i64::MIN, i64::MAX] {
            assert_eq!(GenericKey::<8>::from_i64(v).to_i64(), v);
        }
    }

    #[test]
    fn test_generic_key_codec_roundtrip() {
        let key = GenericKey::<16>::from_slice(b"hello");
        let mut buf = Vec::new();
        key.encode(&mut buf);
        assert_eq!(buf.len(), 16);
        let decoded = GenericKey::<16>::decode(&mut buf.as_slice());
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_ord_comparator() {
        let cmp = OrdComparator;
        assert_eq!(cmp.compare(&1i64, &2i64), Ordering::Less);
        assert_eq!(cmp.compare(&2i64, &2i64), Ordering::Equal);
        assert_eq!(cmp.compare(&3i64, &2i64), Ordering::Greater);
    }

    #[test]
    fn test_prefix_comparator_over_composite_keys() {
        // A comparator looking only at the first 8 bytes treats all keys
        // sharing that prefix as equal; composite keys use this for
        // prefix range lookups.
        #[derive(Clone)]
        struct PrefixComparator;
        impl KeyComparator<GenericKey<16>> for PrefixComparator {
            fn compare(&self, a: &GenericKey<16>, b: &GenericKey<16>) -> Ordering {
                a.as_bytes()[..8].cmp(&b.as_bytes()[..8])
            }
        }

        let mut a = GenericKey::<16>::from_i64(7);
        a.data[8] = 1;
        let mut b = GenericKey::<16>::from_i64(7);
        b.data[8] = 2;

        assert_eq!(GenericComparator::<16>.compare(&a, &b), Ordering::Less);
        assert_eq!(PrefixComparator.compare(&a, &b), Ordering::Equal);
    }
}
