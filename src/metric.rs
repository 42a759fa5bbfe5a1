//! XOR metric and key derivation.
//!
//! - **Distance**: `distance(a, b) = a XOR b`, bytewise.
//! - **Ordering**: big-endian unsigned comparison of XOR results; the first
//!   differing byte decides.
//! - **Key encoding**: application keys are mapped onto the id space either by
//!   hashing or by truncating/zero-padding, consistently per deployment.

use std::cmp::Ordering;

use blake3::Hasher;

use crate::identity::{Contact, NodeId};

/// Bytes of keystream discarded before the obfuscated value is derived.
const OBFUSCATION_SKIP: usize = 1024;

#[inline]
pub fn xor_distance(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

pub fn distance(a: &NodeId, b: &NodeId) -> Vec<u8> {
    xor_distance(a.as_bytes(), b.as_bytes())
}

pub fn distance_cmp(a: &[u8], b: &[u8]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        if x < y {
            return Ordering::Less;
        } else if x > y {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// Orders `a` and `b` by their distance to `pivot` without allocating.
///
/// `Less` means `a` is closer to `pivot` than `b`.
pub fn compare(a: &NodeId, b: &NodeId, pivot: &NodeId) -> Ordering {
    let (a, b, p) = (a.as_bytes(), b.as_bytes(), pivot.as_bytes());
    for i in 0..a.len().min(b.len()).min(p.len()) {
        let da = a[i] ^ p[i];
        let db = b[i] ^ p[i];
        if da != db {
            return da.cmp(&db);
        }
    }
    Ordering::Equal
}

pub fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    contacts.sort_by(|a, b| compare(&a.id, &b.id, target));
}

/// Maps application keys onto the id space.
#[derive(Clone, Copy, Debug)]
pub struct KeyEncoder {
    id_len: usize,
    hash_keys: bool,
}

impl KeyEncoder {
    pub fn new(id_len: usize, hash_keys: bool) -> Self {
        Self { id_len, hash_keys }
    }

    pub fn id_len(&self) -> usize {
        self.id_len
    }

    pub fn encode(&self, key: &[u8]) -> NodeId {
        if self.hash_keys {
            let mut hasher = Hasher::new();
            hasher.update(key);
            let mut out = vec![0u8; self.id_len];
            hasher.finalize_xof().fill(&mut out);
            return NodeId::from_bytes(out);
        }

        if key.len() == self.id_len {
            return NodeId::from_bytes(key.to_vec());
        }

        let mut out = vec![0u8; self.id_len];
        let n = key.len().min(self.id_len);
        out[..n].copy_from_slice(&key[..n]);
        NodeId::from_bytes(out)
    }
}

/// Derives the key queried in place of `plain` during an obfuscated lookup.
///
/// The first five bytes and the last two are kept so prefix-based surveys
/// and challenge/response keyed on the tail still line up; everything in
/// between is replaced by a zero/non-zero mask of the plain key.
pub fn obfuscated_key(plain: &NodeId) -> NodeId {
    let plain = plain.as_bytes();
    let len = plain.len();
    let mut out = vec![0u8; len];

    let head = len.min(5);
    out[..head].copy_from_slice(&plain[..head]);

    for i in 6..len {
        if plain[i] == 0 {
            out[i] = 1;
        }
    }

    if len >= 2 {
        out[len - 2] = plain[len - 2];
        out[len - 1] = plain[len - 1];
    }
    NodeId::from_bytes(out)
}

/// Marker value stored under the obfuscated key.
///
/// A keystream seeded from the plain key, applied to the plain key. Anyone
/// holding the plain key can recompute it; it only changes the traffic
/// shape and provides no confidentiality.
pub fn obfuscated_value(plain_key: &[u8]) -> Vec<u8> {
    let seed = blake3::hash(plain_key);
    let mut stream = Hasher::new_keyed(seed.as_bytes()).finalize_xof();

    let mut skip = [0u8; OBFUSCATION_SKIP];
    stream.fill(&mut skip);

    let mut out = vec![0u8; plain_key.len()];
    stream.fill(&mut out);
    for (o, p) in out.iter_mut().zip(plain_key.iter()) {
        *o ^= p;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_id(len: usize) -> NodeId {
        let mut rng = rand::thread_rng();
        NodeId::from_bytes((0..len).map(|_| rng.gen::<u8>()).collect::<Vec<_>>())
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        for _ in 0..200 {
            let a = random_id(20);
            let b = random_id(20);
            assert_eq!(distance(&a, &b), distance(&b, &a));
            assert!(distance(&a, &a).iter().all(|byte| *byte == 0));
        }
    }

    #[test]
    fn compare_matches_distance_equality() {
        for _ in 0..200 {
            let a = random_id(20);
            let b = random_id(20);
            let pivot = random_id(20);
            let equal = distance(&a, &pivot) == distance(&b, &pivot);
            assert_eq!(compare(&a, &b, &pivot) == Ordering::Equal, equal);
            assert_eq!(
                compare(&a, &b, &pivot),
                distance_cmp(&distance(&a, &pivot), &distance(&b, &pivot))
            );
        }
        let a = random_id(20);
        let pivot = random_id(20);
        assert_eq!(compare(&a, &a, &pivot), Ordering::Equal);
    }

    #[test]
    fn compare_is_unsigned_on_first_differing_byte() {
        let pivot = NodeId::zero(4);
        let a = NodeId::from_bytes(vec![0x00, 0xff, 0x00, 0x00]);
        let b = NodeId::from_bytes(vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(compare(&a, &b, &pivot), Ordering::Less);
        let c = NodeId::from_bytes(vec![0x80, 0x00, 0x00, 0x00]);
        assert_eq!(compare(&c, &b, &pivot), Ordering::Greater);
    }

    #[test]
    fn encoding_is_identity_when_length_matches() {
        let encoder = KeyEncoder::new(20, false);
        let key = random_id(20);
        let once = encoder.encode(key.as_bytes());
        assert_eq!(once, key);
        assert_eq!(encoder.encode(once.as_bytes()), once);
    }

    #[test]
    fn encoding_truncates_and_pads() {
        let encoder = KeyEncoder::new(4, false);
        assert_eq!(
            encoder.encode(&[1, 2, 3, 4, 5, 6]).as_bytes(),
            &[1, 2, 3, 4]
        );
        assert_eq!(encoder.encode(&[9, 8]).as_bytes(), &[9, 8, 0, 0]);
        assert_eq!(encoder.encode(&[9, 8]), encoder.encode(&[9, 8]));
    }

    #[test]
    fn hashed_encoding_has_id_length() {
        let encoder = KeyEncoder::new(20, true);
        let a = encoder.encode(b"some key");
        assert_eq!(a.len(), 20);
        assert_eq!(a, encoder.encode(b"some key"));
        assert_ne!(a, encoder.encode(b"other key"));
        assert_eq!(&a.as_bytes()[..], &blake3::hash(b"some key").as_bytes()[..20]);
    }

    #[test]
    fn obfuscated_key_keeps_head_and_tail() {
        let plain = NodeId::from_bytes(vec![
            1, 2, 3, 4, 5, 6, 0, 9, 0, 7, 11, 0, 3, 3, 3, 3, 3, 3, 0xaa, 0xbb,
        ]);
        let obs = obfuscated_key(&plain);
        let bytes = obs.as_bytes();
        assert_eq!(&bytes[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(bytes[5], 0);
        assert_eq!(bytes[6], 1);
        assert_eq!(bytes[7], 0);
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[11], 1);
        assert_eq!(&bytes[18..], &[0xaa, 0xbb]);
        assert_ne!(obs, plain);
    }

    #[test]
    fn obfuscated_value_is_deterministic_per_key() {
        let key = random_id(20);
        let v1 = obfuscated_value(key.as_bytes());
        let v2 = obfuscated_value(key.as_bytes());
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 20);
        assert_ne!(v1, key.as_bytes());
        assert_ne!(v1, obfuscated_value(random_id(20).as_bytes()));
    }
}
