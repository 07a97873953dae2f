//! Signed head assertions.
//!
//! An assertion is a compact JWS (`header.claims.signature`, base64url
//! without padding) signed with Ed25519. It names exactly one node.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TrustError;

const SUBJECT: &str = "head";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims carried by an assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub sub: String,
    pub aud: String,
    pub node_id: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints assertions with the head's private key.
pub struct AssertionSigner {
    key: SigningKey,
    audience: String,
    ttl: Duration,
}

impl AssertionSigner {
    pub fn new(key: SigningKey, audience: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key,
            audience: audience.into(),
            ttl,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Sign a fresh assertion bound to `node_id`.
    pub fn sign_for_node(&self, node_id: &str) -> Result<String, TrustError> {
        let iat = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).map_err(|e| TrustError::Signing(e.to_string()))?;
        self.sign(&AssertionClaims {
            sub: SUBJECT.to_string(),
            aud: self.audience.clone(),
            node_id: node_id.to_string(),
            iat,
            exp: iat + ttl,
        })
    }

    pub fn sign(&self, claims: &AssertionClaims) -> Result<String, TrustError> {
        let header = Header {
            alg: "EdDSA".to_string(),
            typ: "JWT".to_string(),
        };
        let header = serde_json::to_vec(&header).map_err(|e| TrustError::Signing(e.to_string()))?;
        let claims = serde_json::to_vec(claims).map_err(|e| TrustError::Signing(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(claims)
        );
        let signature = self.key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Checks assertions against a fixed set of trusted keys.
#[derive(Debug, Clone)]
pub struct AssertionVerifier {
    keys: Vec<VerifyingKey>,
    audience: String,
}

impl AssertionVerifier {
    pub fn new(keys: Vec<VerifyingKey>, audience: impl Into<String>) -> Self {
        Self {
            keys,
            audience: audience.into(),
        }
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Verify signature, audience, expiry and the bound node id.
    pub fn verify_for_node(&self, token: &str, node_id: &str) -> Result<AssertionClaims, TrustError> {
        if self.keys.is_empty() {
            return Err(TrustError::NoTrustedKeys);
        }
        let token = token.trim();
        let mut parts = token.split('.');
        let (Some(header), Some(claims), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TrustError::Missing);
        };

        let header: Header = decode_json(header)?;
        if header.alg != "EdDSA" {
            return Err(rejected(format!("unexpected alg {}", header.alg)));
        }

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| rejected(format!("signature encoding: {e}")))?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|e| rejected(format!("signature: {e}")))?;
        let signing_input = token.rsplit_once('.').map_or("", |(input, _)| input);
        if !self
            .keys
            .iter()
            .any(|k| k.verify_strict(signing_input.as_bytes(), &signature).is_ok())
        {
            return Err(rejected("signature does not match any trusted key"));
        }

        let claims: AssertionClaims = decode_json(claims)?;
        if claims.aud != self.audience {
            return Err(rejected(format!("audience {}", claims.aud)));
        }
        if claims.exp <= Utc::now().timestamp() {
            return Err(rejected("expired"));
        }
        if claims.node_id != node_id {
            return Err(rejected(format!("bound to node {}", claims.node_id)));
        }
        Ok(claims)
    }
}

fn rejected(reason: impl Into<String>) -> TrustError {
    TrustError::Rejected {
        reason: reason.into(),
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, TrustError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| rejected(format!("segment encoding: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| rejected(format!("segment json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> AssertionSigner {
        AssertionSigner::new(
            SigningKey::generate(&mut rand::rngs::OsRng),
            "node",
            Duration::from_secs(120),
        )
    }

    #[test]
    fn signed_assertion_verifies_for_its_node() {
        let signer = signer();
        let verifier = AssertionVerifier::new(vec![signer.verifying_key()], "node");
        let token = signer.sign_for_node("A").unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = verifier.verify_for_node(&token, "A").unwrap();
        assert_eq!(claims.sub, "head");
        assert_eq!(claims.node_id, "A");
        assert_eq!(claims.exp - claims.iat, 120);
    }

    #[test]
    fn assertion_for_other_node_is_rejected() {
        let signer = signer();
        let verifier_b = AssertionVerifier::new(vec![signer.verifying_key()], "node");
        let token = signer.sign_for_node("A").unwrap();
        let err = verifier_b.verify_for_node(&token, "B").unwrap_err();
        assert!(matches!(err, TrustError::Rejected { .. }));
        assert_eq!(err.to_string(), "Invalid assertion");
    }

    #[test]
    fn wrong_audience_expired_and_wrong_key_are_rejected() {
        let head = signer();
        let verifier = AssertionVerifier::new(vec![head.verifying_key()], "node");

        let other_aud = AssertionSigner::new(
            SigningKey::from_bytes(&head.key.to_bytes()),
            "elsewhere",
            Duration::from_secs(120),
        );
        assert!(verifier
            .verify_for_node(&other_aud.sign_for_node("A").unwrap(), "A")
            .is_err());

        let now = Utc::now().timestamp();
        let expired = head
            .sign(&AssertionClaims {
                sub: "head".to_string(),
                aud: "node".to_string(),
                node_id: "A".to_string(),
                iat: now - 300,
                exp: now - 180,
            })
            .unwrap();
        assert!(verifier.verify_for_node(&expired, "A").is_err());

        let stranger = signer();
        assert!(verifier
            .verify_for_node(&stranger.sign_for_node("A").unwrap(), "A")
            .is_err());
    }

    #[test]
    fn tampered_claims_and_garbage_are_rejected() {
        let signer = signer();
        let verifier = AssertionVerifier::new(vec![signer.verifying_key()], "node");
        let token = signer.sign_for_node("A").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&serde_json::json!({
                "sub": "head", "aud": "node", "node_id": "B",
                "iat": 0, "exp": i64::MAX,
            }))
            .unwrap(),
        );
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);
        assert!(verifier.verify_for_node(&forged, "B").is_err());
        assert!(matches!(
            verifier.verify_for_node("not-a-token", "A"),
            Err(TrustError::Missing)
        ));
    }

    #[test]
    fn empty_key_set_rejects() {
        let verifier = AssertionVerifier::new(vec![], "node");
        let token = signer().sign_for_node("A").unwrap();
        assert!(matches!(
            verifier.verify_for_node(&token, "A"),
            Err(TrustError::NoTrustedKeys)
        ));
    }
}
