//! Small stateless helpers shared across fabric components: string hashing,
//! MD5 hex digests, Fisher-Yates shuffling, and UUIDv4 validation.

use md5::{Digest, Md5};
use rand::Rng;
use uuid::Uuid;

/// djb2 variant string hash, unsigned 32-bit, deterministic for all inputs.
///
/// Walks the string from the end, matching the publisher-pool hash used to
/// key pooled channel connections (§4.4): the exact walk direction and
/// xor-mix matter because this value is a testable constant, not just an
/// internal bucketing choice.
pub fn string_hash(s: &str) -> u32 {
    let bytes: Vec<u32> = s.chars().map(|c| c as u32).collect();
    let mut hash: u32 = 5381;
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        hash = hash.wrapping_mul(33) ^ bytes[i];
    }
    hash
}

/// Lowercase hex MD5 digest of `s`.
pub fn md5_hash(s: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// In-place Fisher-Yates shuffle.
pub fn shuffle<T>(items: &mut [T]) {
    let mut rng = rand::thread_rng();
    let len = items.len();
    for i in (1..len).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Returns a shuffled copy of `items`, leaving the original untouched.
///
/// Discovery caches the unshuffled roster and reshuffles a fresh copy on
/// every call, so the cache never observes shuffle order.
pub fn shuffled<T: Clone>(items: &[T]) -> Vec<T> {
    let mut copy = items.to_vec();
    shuffle(&mut copy);
    copy
}

/// Generates a random UUIDv4 with dashes stripped, used as an instance identity.
pub fn new_instance_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// True iff `s` parses as a (dashed or undashed) UUID.
pub fn is_uuid(s: &str) -> bool {
    Uuid::parse_str(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_hash_matches_known_vector() {
        assert_eq!(string_hash("TEST_STRING"), 2282002681);
    }

    #[test]
    fn string_hash_is_deterministic_and_non_negative() {
        for s in ["", "a", "service-name", "hydra:service:nodes"] {
            let a = string_hash(s);
            let b = string_hash(s);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn md5_hash_matches_known_vector() {
        assert_eq!(
            md5_hash("TEST_KEY"),
            "58cf16b25485a0116b85806bba9ca7e4"
        );
    }

    #[test]
    fn shuffle_preserves_multiset() {
        let mut items = vec![1, 2, 3, 4, 5];
        let original = items.clone();
        shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort();
        let mut orig_sorted = original;
        orig_sorted.sort();
        assert_eq!(sorted, orig_sorted);
    }

    #[test]
    fn shuffled_leaves_original_untouched() {
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let copy = shuffled(&items);
        assert_eq!(items, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let mut sorted_copy = copy;
        sorted_copy.sort();
        assert_eq!(sorted_copy, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn new_instance_id_is_undashed_uuid() {
        let id = new_instance_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('-'));
    }

    #[test]
    fn is_uuid_detects_valid_and_invalid() {
        assert!(is_uuid(&new_instance_id()));
        assert!(!is_uuid("not-a-uuid"));
    }
}
