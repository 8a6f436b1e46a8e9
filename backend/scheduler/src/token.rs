//! Claim-link tokens.
//!
//! Tokens are HS256 JWTs in compact form, so the claim API can verify them
//! with any JWT library sharing `CLAIM_TOKEN_SECRET`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::{Result, SchedulerError};

type HmacSha256 = Hmac<Sha256>;

const HEADER: &[u8] = br#"{"alg":"HS256","typ":"JWT"}"#;

pub trait TokenMinter: Send + Sync {
    /// Mint a signed token for `email`, issued at `now` (unix seconds).
    fn mint(&self, email: &str, now: i64) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTokenClaims {
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct HmacTokenMinter {
    key: Vec<u8>,
    ttl_secs: i64,
}

impl HmacTokenMinter {
    pub fn new(secret: &str, ttl_secs: i64) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            ttl_secs,
        }
    }

    fn sign(&self, signing_input: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| SchedulerError::Config(format!("invalid claim token key: {e}")))?;
        mac.update(signing_input.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }
}

impl TokenMinter for HmacTokenMinter {
    fn mint(&self, email: &str, now: i64) -> Result<String> {
        let claims = ClaimTokenClaims {
            email: email.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };

        let header = URL_SAFE_NO_PAD.encode(HEADER);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{header}.{payload}");
        let signature = self.sign(&signing_input)?;

        Ok(format!("{signing_input}.{signature}"))
    }
}
