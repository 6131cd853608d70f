//! HMAC request signing.
//!
//! A signature covers the method, the URL, the canonical JSON body, a
//! millisecond timestamp and a random nonce, one per line:
//!
//! ```text
//! POST
//! https://api.example.com/api/users
//! {"age":30,"name":"Bob"}
//! 1700000000000
//! 3q2-7wAAAAAAAAAAAAAAAA
//! ```
//!
//! The result travels in the `Authorization` header as
//! `Signature signature="<b64>",timestamp="<ms>",nonce="<b64url>"`.

use crate::fingerprint::canonical_json;
use crate::{Error, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use http::Method;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Sha256, Sha512};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

pub const SIGNATURE_HEADER: &str = "authorization";

const NONCE_LEN: usize = 16;

/// MAC used for request signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
pub enum SignatureAlgorithm {
    #[default]
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl SignatureAlgorithm {
    fn mac(self, key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        fn compute<M: Mac + hmac::digest::KeyInit>(key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
            let mut mac = <M as Mac>::new_from_slice(key)
                .map_err(|e| Error::Signing(format!("invalid key: {e}")))?;
            mac.update(message);
            Ok(mac.finalize().into_bytes().to_vec())
        }

        match self {
            SignatureAlgorithm::Sha256 => compute::<Hmac<Sha256>>(key, message),
            SignatureAlgorithm::Sha512 => compute::<Hmac<Sha512>>(key, message),
        }
    }
}

/// A computed signature and the inputs needed to verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSignature {
    /// Standard base64 of the MAC.
    pub signature: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub nonce: String,
}

impl RequestSignature {
    /// Renders the `Authorization` header value.
    pub fn to_header(&self) -> String {
        format!(
            "Signature signature=\"{}\",timestamp=\"{}\",nonce=\"{}\"",
            self.signature, self.timestamp, self.nonce
        )
    }

    /// Parses a header produced by [`to_header`](Self::to_header).
    ///
    /// ```
    /// use palisade::signer::RequestSignature;
    ///
    /// let sig = RequestSignature::parse_header(
    ///     r#"Signature signature="abc=",timestamp="1700000000000",nonce="n0nce""#,
    /// ).unwrap();
    /// assert_eq!(sig.timestamp, 1_700_000_000_000);
    /// assert_eq!(sig.nonce, "n0nce");
    /// ```
    pub fn parse_header(header: &str) -> Result<Self> {
        let params = header
            .trim()
            .strip_prefix("Signature ")
            .ok_or_else(|| Error::Signing("missing `Signature` scheme".to_string()))?;

        let (mut signature, mut timestamp, mut nonce) = (None, None, None);
        for part in params.split(',') {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Signing(format!("malformed parameter `{part}`")))?;
            let value = value.trim().trim_matches('"').to_string();
            match name.trim() {
                "signature" => signature = Some(value),
                "timestamp" => timestamp = Some(value),
                "nonce" => nonce = Some(value),
                _ => {}
            }
        }

        let missing = |name: &str| Error::Signing(format!("missing `{name}` parameter"));
        let timestamp = timestamp
            .ok_or_else(|| missing("timestamp"))?
            .parse()
            .map_err(|_| Error::Signing("timestamp is not an integer".to_string()))?;
        Ok(Self {
            signature: signature.ok_or_else(|| missing("signature"))?,
            timestamp,
            nonce: nonce.ok_or_else(|| missing("nonce"))?,
        })
    }
}

/// Signs outbound requests and verifies signatures with a shared secret.
pub struct RequestSigner {
    secret: Vec<u8>,
    algorithm: SignatureAlgorithm,
    tolerance: Duration,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("algorithm", &self.algorithm)
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if `secret` is empty.
    pub fn new(secret: impl AsRef<[u8]>, algorithm: SignatureAlgorithm) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::ConfigurationError(
                "Signing secret must not be empty".to_string(),
            ));
        }
        Ok(Self {
            secret: secret.to_vec(),
            algorithm,
            tolerance: Duration::from_secs(300),
        })
    }

    /// Maximum accepted age of a signature during verification.
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Signs a request. `timestamp` defaults to now; a fresh nonce is drawn
    /// from the OS random source for every call.
    pub fn sign_request(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        timestamp: Option<u64>,
    ) -> Result<RequestSignature> {
        let timestamp = timestamp.unwrap_or_else(unix_millis);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let nonce = URL_SAFE_NO_PAD.encode(nonce);

        let mac = self.mac(method, url, body, timestamp, &nonce)?;
        Ok(RequestSignature {
            signature: STANDARD.encode(mac),
            timestamp,
            nonce,
        })
    }

    /// Checks a signature against the request it claims to cover.
    ///
    /// Returns `false` for signatures older than the tolerance, for
    /// undecodable signatures and for any mismatch. The comparison runs in
    /// constant time.
    pub fn verify_signature(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        signature: &RequestSignature,
    ) -> bool {
        let age_ms = unix_millis().abs_diff(signature.timestamp);
        if age_ms > self.tolerance.as_millis() as u64 {
            tracing::debug!(age_ms, "Signature outside tolerance window");
            return false;
        }
        let Ok(provided) = STANDARD.decode(&signature.signature) else {
            return false;
        };
        let Ok(expected) = self.mac(method, url, body, signature.timestamp, &signature.nonce) else {
            return false;
        };
        provided.len() == expected.len() && bool::from(provided.ct_eq(&expected))
    }

    fn mac(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        timestamp: u64,
        nonce: &str,
    ) -> Result<Vec<u8>> {
        let body = body.map(canonical_json).unwrap_or_default();
        let payload = [
            method.as_str(),
            url,
            body.as_str(),
            &timestamp.to_string(),
            nonce,
        ]
        .join("\n");
        self.algorithm.mac(&self.secret, payload.as_bytes())
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const URL: &str = "https://api.example.com/api/users";

    fn signer() -> RequestSigner {
        RequestSigner::new("test-secret", SignatureAlgorithm::Sha256).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = signer();
        let body = json!({"name": "Bob", "age": 30});
        let sig = signer
            .sign_request(&Method::POST, URL, Some(&body), None)
            .unwrap();
        assert!(signer.verify_signature(&Method::POST, URL, Some(&body), &sig));

        // Key order does not matter, values do.
        let reordered = json!({"age": 30, "name": "Bob"});
        assert!(signer.verify_signature(&Method::POST, URL, Some(&reordered), &sig));
        let altered = json!({"name": "Bob", "age": 31});
        assert!(!signer.verify_signature(&Method::POST, URL, Some(&altered), &sig));
        assert!(!signer.verify_signature(&Method::PUT, URL, Some(&body), &sig));
    }

    #[test]
    fn test_stale_signature_rejected() {
        let signer = signer().with_tolerance(Duration::from_secs(60));
        let old = unix_millis() - 120_000;
        let sig = signer.sign_request(&Method::GET, URL, None, Some(old)).unwrap();
        assert!(!signer.verify_signature(&Method::GET, URL, None, &sig));
    }

    #[test]
    fn test_wrong_secret_and_garbage_rejected() {
        let sig = signer().sign_request(&Method::GET, URL, None, None).unwrap();
        let other = RequestSigner::new("other", SignatureAlgorithm::Sha256).unwrap();
        assert!(!other.verify_signature(&Method::GET, URL, None, &sig));

        let garbage = RequestSignature {
            signature: "not base64!".to_string(),
            ..sig.clone()
        };
        assert!(!signer().verify_signature(&Method::GET, URL, None, &garbage));

        let truncated = RequestSignature {
            signature: STANDARD.encode([0u8; 4]),
            ..sig
        };
        assert!(!signer().verify_signature(&Method::GET, URL, None, &truncated));
    }

    #[test]
    fn test_nonces_are_unique() {
        let signer = signer();
        let a = signer.sign_request(&Method::GET, URL, None, Some(1)).unwrap();
        let b = signer.sign_request(&Method::GET, URL, None, Some(1)).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn test_sha512_signature_length() {
        let signer = RequestSigner::new("k", SignatureAlgorithm::Sha512).unwrap();
        let sig = signer.sign_request(&Method::GET, URL, None, None).unwrap();
        assert_eq!(STANDARD.decode(&sig.signature).unwrap().len(), 64);
        assert!(signer.verify_signature(&Method::GET, URL, None, &sig));
    }

    #[test]
    fn test_header_round_trip() {
        let sig = signer().sign_request(&Method::GET, URL, None, None).unwrap();
        assert_eq!(RequestSignature::parse_header(&sig.to_header()).unwrap(), sig);
        assert!(RequestSignature::parse_header("Bearer abc").is_err());
        assert!(RequestSignature::parse_header(r#"Signature nonce="n""#).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            RequestSigner::new("", SignatureAlgorithm::Sha256),
            Err(Error::ConfigurationError(_))
        ));
    }
}
