//! Opaque key generation for snippets and tunnels.

use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Length of the public identifier in hex characters.
const KEY_LEN: usize = 7;

/// Mint a 7-character lowercase hex key.
///
/// A v4 UUID is hashed through SHA-1 to get a uniform domain, then truncated.
/// At 28 bits the per-pair collision probability is ~2^-28, which is fine for
/// an ephemeral store whose records expire within a day. Collisions are not
/// retried against the store.
pub fn mint_key() -> String {
    let id = Uuid::new_v4();
    let digest = Sha1::digest(id.to_string().as_bytes());
    hex::encode(digest)[..KEY_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_seven_lowercase_hex_chars() {
        for _ in 0..64 {
            let key = mint_key();
            assert_eq!(key.len(), 7);
            assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn keys_differ_between_mints() {
        assert_ne!(mint_key(), mint_key());
    }
}
