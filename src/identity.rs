//! Subject resolver.
//!
//! Maps a billable principal to a stable anonymized hash used in telemetry.
//! The digest is keyed with a process-wide secret so that hashes are stable
//! across restarts but unlinkable across deployments with different secrets.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::models::Subject;

type HmacSha256 = Hmac<Sha256>;

/// Keyed subject hasher. Output is always 16 bytes, lowercase hex encoded.
#[derive(Clone)]
pub struct SubjectHasher {
    secret: Vec<u8>,
}

impl SubjectHasher {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Compute the anonymized hash for a subject.
    pub fn hash(&self, subject: &Subject) -> String {
        // HMAC accepts keys of any length.
        #[allow(clippy::expect_used)]
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC key of any length is valid");
        mac.update(subject.type_str().as_bytes());
        mac.update(b":");
        mac.update(subject.id().to_string().as_bytes());
        let digest = mac.finalize().into_bytes();
        hex::encode(&digest[..16])
    }

    /// Constant-time comparison of a subject against a previously produced
    /// hash. Timing does not reveal how many leading bytes match.
    pub fn verify(&self, subject: &Subject, candidate: &str) -> bool {
        let expected = self.hash(subject);
        expected.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_fixed_width() {
        let hasher = SubjectHasher::new("test-secret");
        let subject = Subject::User(42);
        let a = hasher.hash(&subject);
        let b = hasher.hash(&subject);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32); // 16 bytes, hex encoded
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_subjects_and_types_diverge() {
        let hasher = SubjectHasher::new("test-secret");
        assert_ne!(hasher.hash(&Subject::User(1)), hasher.hash(&Subject::User(2)));
        assert_ne!(
            hasher.hash(&Subject::User(1)),
            hasher.hash(&Subject::Token(1))
        );
    }

    #[test]
    fn different_secrets_are_unlinkable() {
        let a = SubjectHasher::new("deployment-a");
        let b = SubjectHasher::new("deployment-b");
        let subject = Subject::Token(7);
        assert_ne!(a.hash(&subject), b.hash(&subject));
    }

    #[test]
    fn verify_round_trips() {
        let hasher = SubjectHasher::new("test-secret");
        let subject = Subject::User(100);
        let hash = hasher.hash(&subject);
        assert!(hasher.verify(&subject, &hash));
        assert!(!hasher.verify(&Subject::User(101), &hash));
        assert!(!hasher.verify(&subject, "not-a-hash"));
    }
}
