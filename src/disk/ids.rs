//! Identifiers derived from the gadget description, so that rebuilding the
//! same input yields the same partition tables and filesystems.

use sha2::{Digest, Sha256};
use uuid::{Builder, Uuid};

/// Hex SHA-256 of the gadget description text.
pub fn digest_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn hash_parts(seed: &str, parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    for part in parts {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    hasher.finalize().into()
}

/// A version 4 shaped UUID whose bits come from `seed` and `parts`.
pub fn derive_uuid(seed: &str, parts: &[&str]) -> Uuid {
    let hash = hash_parts(seed, parts);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    Builder::from_random_bytes(bytes).into_uuid()
}

/// A 32-bit id (MBR disk signature, FAT volume id).
pub fn derive_u32(seed: &str, parts: &[&str]) -> u32 {
    let hash = hash_parts(seed, parts);
    u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        let seed = digest_text("volumes: {}");
        assert_eq!(seed.len(), 64);
        let a = derive_uuid(&seed, &["pc", "0"]);
        assert_eq!(a, derive_uuid(&seed, &["pc", "0"]));
        assert_ne!(a, derive_uuid(&seed, &["pc", "1"]));
        assert_eq!(a.get_version_num(), 4);
        // part boundaries matter
        assert_ne!(
            derive_u32(&seed, &["ab", "c"]),
            derive_u32(&seed, &["a", "bc"])
        );
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        assert_eq!(
            digest_text(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
