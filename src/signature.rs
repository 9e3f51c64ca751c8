use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::collections::BTreeMap;
use std::fmt;

use crate::params::{canonicalize, serialize, ParameterSet};

type HmacSha512 = Hmac<Sha512>;

/// Field carrying the signature on both the redirect and the callback.
pub const SECURE_HASH: &str = "vnp_SecureHash";
/// Optional hash-algorithm tag the gateway may echo back.
pub const SECURE_HASH_TYPE: &str = "vnp_SecureHashType";
/// Gateway status code passed through on a verified callback.
pub const RESPONSE_CODE: &str = "vnp_ResponseCode";

pub const RESERVED_FIELDS: [&str; 2] = [SECURE_HASH, SECURE_HASH_TYPE];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("reserved field `{0}` must not be supplied")] ReservedField(String),
    #[error("HMAC-SHA512 is unavailable")] CryptoUnavailable,
}

/// Outcome of checking a callback. A missing or wrong signature is an
/// ordinary `valid: false`, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub response_code: Option<String>,
}

impl Verification {
    fn rejected() -> Self {
        Self { valid: false, response_code: None }
    }
}

fn mac_for(secret: &str) -> HmacSha512 {
    // Empty secrets are rejected by config validation, not here.
    HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}

/// Lowercase hex HMAC-SHA512 of `serialized` keyed by `secret`.
pub fn sign(serialized: &str, secret: &str) -> String {
    let mut mac = mac_for(secret);
    mac.update(serialized.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Canonicalize, sign and append the signature as the last entry.
pub fn build_signed_request<'a, I, V>(
    base_params: I,
    secret: &str,
) -> Result<ParameterSet, SignatureError>
where
    I: IntoIterator<Item = (&'a String, V)>,
    V: fmt::Display,
{
    let mut set = canonicalize(base_params);
    if let Some(key) = RESERVED_FIELDS.iter().find(|k| set.contains_key(k)) {
        return Err(SignatureError::ReservedField((*key).to_string()));
    }
    let signed = sign(&serialize(&set), secret);
    set.push(SECURE_HASH, signed);
    Ok(set)
}

/// Recompute the signature over everything but the reserved fields and
/// compare it to the one supplied.
pub fn verify(received: &BTreeMap<String, String>, secret: &str) -> Verification {
    let mut params = received.clone();
    let supplied = match params.remove(SECURE_HASH) {
        Some(sig) => sig,
        None => return Verification::rejected(),
    };
    params.remove(SECURE_HASH_TYPE);

    let expected = match hex::decode(&supplied) {
        Ok(bytes) => bytes,
        Err(_) => return Verification::rejected(),
    };

    let canonical = serialize(&canonicalize(&params));
    let mut mac = mac_for(secret);
    mac.update(canonical.as_bytes());
    // `verify_slice` is constant-time and fails on any length mismatch.
    if mac.verify_slice(&expected).is_err() {
        return Verification::rejected();
    }

    Verification {
        valid: true,
        response_code: params.get(RESPONSE_CODE).cloned(),
    }
}

/// Known-answer check from RFC 4231, test case 2. Run once at startup; a
/// failure means the service must not take traffic.
pub fn self_test() -> Result<(), SignatureError> {
    const EXPECTED: &str = "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea2505549758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737";
    if sign("what do ya want for nothing?", "Jefe") == EXPECTED {
        Ok(())
    } else {
        Err(SignatureError::CryptoUnavailable)
    }
}
