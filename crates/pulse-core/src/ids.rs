//! Message ids and payload fingerprints.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fresh id for queue messages.
pub fn new_message_id() -> Uuid {
    Uuid::new_v4()
}

/// Stable SHA-256 hex digest, used to dedup raw payloads on replay.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
        assert_eq!(fingerprint(b"").len(), 64);
    }
}
