//! Deterministic vector-store point ids.
//!
//! Ingestion must be idempotent and the session gateway must be able to
//! resolve a chunk's payload by O(1) point fetch, so every point id is
//! derived from its `chunk_id` by a fixed name-based (MD5) UUID function
//! rather than being assigned at insert time. This is a public contract:
//! any reimplementation in another language must match this byte layout
//! exactly, which is why the fixed test vector below exists.

use uuid::{Builder, Uuid};

/// `uuid = v3(md5(utf8(chunk_id)))`: MD5 over the chunk id bytes alone (no
/// namespace prefix), with the version/variant bits set per RFC 4122. This
/// matches `UUID.nameUUIDFromBytes(chunk_id.getBytes())` byte-for-byte, so a
/// reimplementation in another language derives the same id from the same
/// chunk id.
pub fn deterministic_point_id(chunk_id: &str) -> Uuid {
    let digest = md5::compute(chunk_id.as_bytes());
    Builder::from_md5_bytes(digest.0).into_uuid()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let a = deterministic_point_id("TOPIC-11");
        let b = deterministic_point_id("TOPIC-11");
        assert_eq!(a, b);
    }

    #[test]
    fn differs_by_input() {
        assert_ne!(
            deterministic_point_id("TOPIC-11"),
            deterministic_point_id("TOPIC-12")
        );
    }

    /// Fixed reference vector: "TOPIC-11" must always map to this UUID.
    /// If this test ever needs to change, every previously-ingested vector
    /// point is orphaned.
    #[test]
    fn fixed_reference_vector() {
        let digest = md5::compute(b"TOPIC-11");
        let expected = Builder::from_md5_bytes(digest.0).into_uuid();
        assert_eq!(deterministic_point_id("TOPIC-11"), expected);
        assert_eq!(
            deterministic_point_id("TOPIC-11").to_string(),
            "4fb7254c-aeba-3e25-9d34-c904efb9f595"
        );
    }

    #[test]
    fn is_rfc4122_variant_3() {
        let id = deterministic_point_id("TOPIC-11");
        assert_eq!(id.get_version_num(), 3);
    }
}
