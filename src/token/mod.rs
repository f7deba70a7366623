//! HMAC-signed, labeled, expiring tokens
//!
//! Tokens secure cookies, XSRF state and queue message authenticity
//! without any server-side storage: the wire string *is* the token.
//!
//! Wire format is four `.`-joined hex fields:
//!
//! ```text
//! <keyID>.<digest>.<value>.<expiresUnix>
//! ```
//!
//! The digest covers the canonical JSON serialization of
//! `{label, value, expiry}`. The label never travels on the wire; the
//! verifier supplies it, so a token minted for `cookie/auth` cannot be
//! replayed against `cookie/xsrf` even under the same key.
//!
//! Key rotation: specs are registered under increasing ids and the
//! highest id signs new tokens; tokens minted under older ids keep
//! verifying as long as their spec stays registered.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Sha256, Sha384, Sha512};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Hash function backing a key's HMAC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenHash {
    Sha256,
    /// Default, matching the historic deployment
    #[default]
    Sha384,
    Sha512,
}

/// One signing key: id, secret bytes and hash selection
#[derive(Clone)]
pub struct KeySpec {
    pub id: u32,
    pub secret: Vec<u8>,
    pub hash: TokenHash,
}

impl KeySpec {
    pub fn new(id: u32, secret: impl Into<Vec<u8>>) -> Self {
        Self { id, secret: secret.into(), hash: TokenHash::default() }
    }

    pub fn with_hash(mut self, hash: TokenHash) -> Self {
        self.hash = hash;
        self
    }
}

impl std::fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never put secret bytes in debug output.
        f.debug_struct("KeySpec").field("id", &self.id).field("hash", &self.hash).finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyRegistryError {
    #[error("token keys: no key specs registered")]
    Empty,
    #[error("token keys: duplicate key id {0}")]
    DuplicateId(u32),
    #[error("token keys: empty secret for key id {0}")]
    EmptySecret(u32),
}

/// Registry of signing keys, keyed by id; the highest id signs
#[derive(Debug, Clone)]
pub struct TokenKeys {
    keys: BTreeMap<u32, KeySpec>,
}

/// Canonical signed payload. Short field names are part of the wire
/// compatibility contract, not a style choice.
#[derive(Serialize)]
struct Payload<'a> {
    c: &'a str,
    v: &'a str,
    e: i64,
}

impl TokenKeys {
    pub fn new(specs: Vec<KeySpec>) -> Result<Self, KeyRegistryError> {
        if specs.is_empty() {
            return Err(KeyRegistryError::Empty);
        }
        let mut keys = BTreeMap::new();
        for spec in specs {
            if spec.secret.is_empty() {
                return Err(KeyRegistryError::EmptySecret(spec.id));
            }
            let id = spec.id;
            if keys.insert(id, spec).is_some() {
                return Err(KeyRegistryError::DuplicateId(id));
            }
        }
        Ok(Self { keys })
    }

    /// The spec new tokens are signed with (highest registered id)
    pub fn signing_spec(&self) -> &KeySpec {
        // Non-empty by construction.
        self.keys.values().next_back().unwrap()
    }

    pub fn get(&self, id: u32) -> Option<&KeySpec> {
        self.keys.get(&id)
    }

    /// Sign `value` for `label`, valid for `ttl` from now, using the
    /// current signing key.
    pub fn sign(&self, label: &str, value: &str, ttl: Duration) -> String {
        self.sign_with(self.signing_spec(), label, value, ttl)
    }

    /// Sign with an explicit spec. Used for rotation tests and for
    /// callers that must keep minting under an older key.
    pub fn sign_with(&self, spec: &KeySpec, label: &str, value: &str, ttl: Duration) -> String {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let digest = {
            let payload = Payload { c: label, v: value, e: expires };
            compute_digest(spec, &payload)
        };
        format!("{:x}.{}.{}.{:x}", spec.id, hex::encode(digest), hex::encode(value), expires)
    }

    /// Verify a wire token against `label`, returning the embedded
    /// value. Every failure mode collapses to `None`: callers treat
    /// invalid identically to absent.
    pub fn verify(&self, label: &str, wire: &str) -> Option<String> {
        if wire.is_empty() {
            return None;
        }
        let fields: Vec<&str> = wire.split('.').collect();
        if fields.len() != 4 {
            return None;
        }
        let key_id = u32::from_str_radix(fields[0], 16).ok()?;
        let spec = self.keys.get(&key_id)?;
        let expected = hex::decode(fields[1]).ok()?;
        let value = hex::decode(fields[2]).ok()?;
        let value = String::from_utf8(value).ok()?;
        let expires = i64::from_str_radix(fields[3], 16).ok()?;
        if expires <= Utc::now().timestamp() {
            return None;
        }
        let payload = Payload { c: label, v: &value, e: expires };
        if verify_digest(spec, &payload, &expected) {
            Some(value)
        } else {
            None
        }
    }
}

fn canonical_bytes(payload: &Payload<'_>) -> Vec<u8> {
    // serde_json field order follows struct declaration, which is what
    // makes this serialization canonical.
    serde_json::to_vec(payload).expect("token payload serialization cannot fail")
}

fn compute_digest(spec: &KeySpec, payload: &Payload<'_>) -> Vec<u8> {
    let bytes = canonical_bytes(payload);
    match spec.hash {
        TokenHash::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(&spec.secret)
                .expect("HMAC accepts any key length");
            mac.update(&bytes);
            mac.finalize().into_bytes().to_vec()
        }
        TokenHash::Sha384 => {
            let mut mac = Hmac::<Sha384>::new_from_slice(&spec.secret)
                .expect("HMAC accepts any key length");
            mac.update(&bytes);
            mac.finalize().into_bytes().to_vec()
        }
        TokenHash::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(&spec.secret)
                .expect("HMAC accepts any key length");
            mac.update(&bytes);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Constant-time digest check via `Mac::verify_slice`.
fn verify_digest(spec: &KeySpec, payload: &Payload<'_>, expected: &[u8]) -> bool {
    let bytes = canonical_bytes(payload);
    match spec.hash {
        TokenHash::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(&spec.secret)
                .expect("HMAC accepts any key length");
            mac.update(&bytes);
            mac.verify_slice(expected).is_ok()
        }
        TokenHash::Sha384 => {
            let mut mac = Hmac::<Sha384>::new_from_slice(&spec.secret)
                .expect("HMAC accepts any key length");
            mac.update(&bytes);
            mac.verify_slice(expected).is_ok()
        }
        TokenHash::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(&spec.secret)
                .expect("HMAC accepts any key length");
            mac.update(&bytes);
            mac.verify_slice(expected).is_ok()
        }
    }
}

/// Constant-time equality for secrets carried outside the HMAC scheme
/// (queue keys, init keys). Equal length is required, then the whole
/// buffer is folded regardless of where the first mismatch sits.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TokenKeys {
        TokenKeys::new(vec![KeySpec::new(1, b"first-secret".to_vec())]).unwrap()
    }

    #[test]
    fn round_trip() {
        let keys = keys();
        let wire = keys.sign("cookie/auth", "42", Duration::from_secs(60));
        assert_eq!(keys.verify("cookie/auth", &wire), Some("42".to_string()));
    }

    #[test]
    fn label_scopes_the_token() {
        let keys = keys();
        let wire = keys.sign("cookie/auth", "42", Duration::from_secs(60));
        assert_eq!(keys.verify("cookie/xsrf", &wire), None);
    }

    #[test]
    fn expired_token_is_invalid() {
        let keys = keys();
        let wire = keys.sign("t", "v", Duration::from_secs(0));
        // Zero ttl puts the expiry at "now", which is not strictly in
        // the future.
        assert_eq!(keys.verify("t", &wire), None);
    }

    #[test]
    fn tampering_any_field_invalidates() {
        let keys = keys();
        let wire = keys.sign("t", "value", Duration::from_secs(60));
        let fields: Vec<&str> = wire.split('.').collect();
        for idx in 1..4 {
            let mut tampered: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
            // Flip one hex digit in the field.
            let mut chars: Vec<char> = tampered[idx].chars().collect();
            chars[0] = if chars[0] == '0' { '1' } else { '0' };
            tampered[idx] = chars.into_iter().collect();
            assert_eq!(keys.verify("t", &tampered.join(".")), None, "field {idx}");
        }
    }

    #[test]
    fn malformed_wire_forms() {
        let keys = keys();
        for wire in ["", "a.b.c", "a.b.c.d.e", "zz.00.00.00", "1.nothex.00.10"] {
            assert_eq!(keys.verify("t", wire), None, "{wire:?}");
        }
    }

    #[test]
    fn rotation_old_key_still_verifies() {
        let old = KeySpec::new(1, b"old".to_vec());
        let keys = TokenKeys::new(vec![old.clone(), KeySpec::new(2, b"new".to_vec())]).unwrap();
        assert_eq!(keys.signing_spec().id, 2);
        let old_wire = keys.sign_with(&old, "t", "v", Duration::from_secs(60));
        let new_wire = keys.sign("t", "v", Duration::from_secs(60));
        assert_eq!(keys.verify("t", &old_wire), Some("v".to_string()));
        assert_eq!(keys.verify("t", &new_wire), Some("v".to_string()));
        // A key id that was never registered fails closed.
        let only_new = TokenKeys::new(vec![KeySpec::new(2, b"new".to_vec())]).unwrap();
        assert_eq!(only_new.verify("t", &old_wire), None);
    }

    #[test]
    fn registry_rejects_bad_specs() {
        assert!(matches!(TokenKeys::new(vec![]), Err(KeyRegistryError::Empty)));
        assert!(matches!(
            TokenKeys::new(vec![KeySpec::new(1, b"a".to_vec()), KeySpec::new(1, b"b".to_vec())]),
            Err(KeyRegistryError::DuplicateId(1))
        ));
        assert!(matches!(
            TokenKeys::new(vec![KeySpec::new(3, Vec::new())]),
            Err(KeyRegistryError::EmptySecret(3))
        ));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
