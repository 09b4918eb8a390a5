//! Launch credentials: signed tokens authorising a single job launch on a
//! named node set for a bounded time.
//!
//! The signature is an HMAC tag over the canonical byte encoding of
//! `(uid, job_id, node_list, expiration)`. Credentials are single-use:
//! the first successful `verify` marks the live entry used, a second
//! verification of the same credential is rejected.

use std::sync::Mutex;
use std::time::Duration;

use orion::hazardous::mac::hmac::sha512::{HmacSha512, SecretKey, Tag};
use serde::{Deserialize, Serialize};

use crate::common::error::{CredFailure, SlateError};
use crate::{JobId, Map, UserId};

/// Fixed length of the appended signature (HMAC-SHA512 tag).
pub const SIG_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub job_id: JobId,
    pub uid: UserId,
    /// Hostlist-encoded node set the launch is authorised on.
    pub node_list: String,
    /// Unix seconds.
    pub expiration: u64,
}

impl Credential {
    /// Canonical wire bytes: `(uid, job_id, node_list_len, node_list_utf8,
    /// expiration)` in fixed big-endian layout.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let names = self.node_list.as_bytes();
        let mut out = Vec::with_capacity(4 + 4 + 4 + names.len() + 8);
        out.extend_from_slice(&self.uid.to_be_bytes());
        out.extend_from_slice(&self.job_id.as_num().to_be_bytes());
        out.extend_from_slice(&(names.len() as u32).to_be_bytes());
        out.extend_from_slice(names);
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out
    }

    fn from_canonical_bytes(bytes: &[u8]) -> crate::Result<Credential> {
        let take = |bytes: &[u8], at: usize| -> crate::Result<[u8; 4]> {
            bytes
                .get(at..at + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| SlateError::InvalidRequest("truncated credential".into()))
        };
        let uid = u32::from_be_bytes(take(bytes, 0)?);
        let job_id = u32::from_be_bytes(take(bytes, 4)?);
        let name_len = u32::from_be_bytes(take(bytes, 8)?) as usize;
        let names = bytes
            .get(12..12 + name_len)
            .ok_or_else(|| SlateError::InvalidRequest("truncated credential".into()))?;
        let exp_bytes: [u8; 8] = bytes
            .get(12 + name_len..12 + name_len + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| SlateError::InvalidRequest("truncated credential".into()))?;
        Ok(Credential {
            job_id: JobId::new(job_id),
            uid,
            node_list: String::from_utf8(names.to_vec())
                .map_err(|_| SlateError::InvalidRequest("credential node list not utf-8".into()))?,
            expiration: u64::from_be_bytes(exp_bytes),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCredential {
    pub cred: Credential,
    pub signature: Vec<u8>,
}

impl SignedCredential {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.cred.canonical_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<SignedCredential> {
        if bytes.len() < SIG_LEN {
            return Err(SlateError::InvalidRequest("credential too short".into()));
        }
        let (payload, signature) = bytes.split_at(bytes.len() - SIG_LEN);
        Ok(SignedCredential {
            cred: Credential::from_canonical_bytes(payload)?,
            signature: signature.to_vec(),
        })
    }
}

/// Live record of an issued or revoked credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveEntry {
    pub job_id: JobId,
    pub expiration: u64,
    pub revoked: bool,
    pub revoke_time: Option<u64>,
    pub used: bool,
    pub issued_count: u32,
}

pub struct CredentialEngine {
    key: SecretKey,
    /// Single exclusive lock; operations are O(n) in live credentials and
    /// tolerable given short expirations.
    live: Mutex<Map<JobId, LiveEntry>>,
    expiration_window: Duration,
}

impl CredentialEngine {
    pub fn new(key: SecretKey, expiration_window: Duration) -> Self {
        CredentialEngine {
            key,
            live: Mutex::new(Map::default()),
            expiration_window,
        }
    }

    pub fn with_generated_key(expiration_window: Duration) -> crate::Result<Self> {
        let key = SecretKey::generate();
        Ok(Self::new(key, expiration_window))
    }

    pub fn sign(&self, cred: Credential) -> crate::Result<SignedCredential> {
        let tag = HmacSha512::hmac(&self.key, &cred.canonical_bytes())
            .map_err(|_| SlateError::Transient("credential signing failed".into()))?;
        let mut live = self.live.lock().unwrap();
        let entry = live.entry(cred.job_id).or_insert_with(|| LiveEntry {
            job_id: cred.job_id,
            expiration: cred.expiration,
            revoked: false,
            revoke_time: None,
            used: false,
            issued_count: 0,
        });
        entry.expiration = cred.expiration;
        entry.issued_count += 1;
        Ok(SignedCredential {
            signature: tag.unprotected_as_bytes().to_vec(),
            cred,
        })
    }

    /// Verification order: signature, expiration, then the live list.
    /// The reuse check and the used-mark are atomic under the live lock.
    pub fn verify(&self, signed: &SignedCredential, now: u64) -> crate::Result<()> {
        let tag = Tag::from_slice(&signed.signature)
            .map_err(|_| SlateError::CredentialInvalid(CredFailure::BadSignature))?;
        if HmacSha512::verify(&tag, &self.key, &signed.cred.canonical_bytes()).is_err() {
            return Err(SlateError::CredentialInvalid(CredFailure::BadSignature));
        }
        if now >= signed.cred.expiration {
            return Err(SlateError::CredentialInvalid(CredFailure::Expired));
        }
        let mut live = self.live.lock().unwrap();
        let entry = live.entry(signed.cred.job_id).or_insert_with(|| LiveEntry {
            job_id: signed.cred.job_id,
            expiration: signed.cred.expiration,
            revoked: false,
            revoke_time: None,
            used: false,
            issued_count: 1,
        });
        if entry.revoked {
            return Err(SlateError::CredentialInvalid(CredFailure::Revoked));
        }
        if entry.used {
            return Err(SlateError::CredentialInvalid(CredFailure::Reused));
        }
        entry.used = true;
        Ok(())
    }

    /// Inserts or updates a live-list entry as revoked. A verify arriving
    /// after this call observes the revocation.
    pub fn revoke(&self, job_id: JobId, expiration: u64, now: u64) {
        let mut live = self.live.lock().unwrap();
        let entry = live.entry(job_id).or_insert_with(|| LiveEntry {
            job_id,
            expiration,
            revoked: false,
            revoke_time: None,
            used: false,
            issued_count: 0,
        });
        entry.revoked = true;
        entry.revoke_time = Some(now);
        entry.expiration = entry.expiration.max(expiration);
    }

    /// Removes entries past `expiration + EXPIRATION_WINDOW`.
    pub fn gc(&self, now: u64) -> usize {
        let window = self.expiration_window.as_secs();
        let mut live = self.live.lock().unwrap();
        let before = live.len();
        live.retain(|_, entry| entry.expiration + window >= now);
        before - live.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn is_revoked(&self, job_id: JobId) -> bool {
        self.live
            .lock()
            .unwrap()
            .get(&job_id)
            .is_some_and(|e| e.revoked)
    }

    /// Live entries for the state snapshot.
    pub fn export_live(&self) -> Vec<LiveEntry> {
        self.live.lock().unwrap().values().cloned().collect()
    }

    pub fn import_live(&self, entries: Vec<LiveEntry>) {
        let mut live = self.live.lock().unwrap();
        for entry in entries {
            live.insert(entry.job_id, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CredentialEngine {
        CredentialEngine::with_generated_key(Duration::from_secs(600)).unwrap()
    }

    fn cred(job: u32, expiration: u64) -> Credential {
        Credential {
            job_id: JobId::new(job),
            uid: 1000,
            node_list: "linux[01-04]".to_string(),
            expiration,
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let engine = engine();
        let signed = engine.sign(cred(7, 1234)).unwrap();
        let bytes = signed.to_bytes();
        assert_eq!(SignedCredential::from_bytes(&bytes).unwrap(), signed);
        assert!(SignedCredential::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_verify_single_use_then_revoked() {
        // Scenario: first verify Ok, second Reused, after revoke Revoked.
        let engine = engine();
        let now = 1000;
        let signed = engine.sign(cred(1, now + 600)).unwrap();
        assert!(engine.verify(&signed, now).is_ok());
        assert!(matches!(
            engine.verify(&signed, now),
            Err(SlateError::CredentialInvalid(CredFailure::Reused))
        ));
        engine.revoke(JobId::new(1), now + 600, now);
        assert!(matches!(
            engine.verify(&signed, now),
            Err(SlateError::CredentialInvalid(CredFailure::Revoked))
        ));
    }

    #[test]
    fn test_verify_checks_signature_first() {
        let engine = engine();
        let mut signed = engine.sign(cred(2, 2000)).unwrap();
        signed.signature[0] ^= 0xff;
        // Tampered signature loses even against an expired credential check.
        assert!(matches!(
            engine.verify(&signed, 5000),
            Err(SlateError::CredentialInvalid(CredFailure::BadSignature))
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let engine = engine();
        let mut signed = engine.sign(cred(3, 2000)).unwrap();
        signed.cred.node_list = "linux[01-99]".to_string();
        assert!(matches!(
            engine.verify(&signed, 100),
            Err(SlateError::CredentialInvalid(CredFailure::BadSignature))
        ));
    }

    #[test]
    fn test_expiration() {
        let engine = engine();
        let signed = engine.sign(cred(4, 500)).unwrap();
        assert!(matches!(
            engine.verify(&signed, 500),
            Err(SlateError::CredentialInvalid(CredFailure::Expired))
        ));
    }

    #[test]
    fn test_revoke_before_first_verify() {
        let engine = engine();
        let signed = engine.sign(cred(5, 2000)).unwrap();
        engine.revoke(JobId::new(5), 2000, 100);
        assert!(matches!(
            engine.verify(&signed, 200),
            Err(SlateError::CredentialInvalid(CredFailure::Revoked))
        ));
    }

    #[test]
    fn test_gc_honours_expiration_window() {
        let engine = engine();
        engine.sign(cred(6, 1000)).unwrap();
        assert_eq!(engine.live_count(), 1);
        // Still inside the window.
        assert_eq!(engine.gc(1500), 0);
        assert_eq!(engine.gc(1601), 1);
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn test_verify_with_different_key_fails() {
        let engine = engine();
        let other = engine_with_other_key();
        let signed = engine.sign(cred(8, 2000)).unwrap();
        assert!(matches!(
            other.verify(&signed, 100),
            Err(SlateError::CredentialInvalid(CredFailure::BadSignature))
        ));
    }

    fn engine_with_other_key() -> CredentialEngine {
        CredentialEngine::with_generated_key(Duration::from_secs(600)).unwrap()
    }
}
