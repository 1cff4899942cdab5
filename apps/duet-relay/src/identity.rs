use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use duet_protocol::{ParticipantDescriptor, ParticipantId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use thiserror::Error;

type HmacSha256 = Hmac<sha2::Sha256>;

/// Verifies identity tokens minted by the authentication collaborator.
///
/// A token is `base64url(claims json) "." base64url(hmac-sha256(claims json))`
/// keyed by a secret shared with the issuer.
#[derive(Clone)]
pub struct IdentityVerifier {
    secret: Arc<[u8]>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity token is malformed")]
    Malformed,
    #[error("identity token encoding invalid: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("identity claims invalid: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("identity token mac mismatch")]
    MacMismatch,
    #[error("identity token expired")]
    Expired,
    #[error("identity token missing participant id")]
    MissingParticipant,
    #[error("identity secret rejected by hmac")]
    InvalidKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityClaims {
    participant_id: ParticipantId,
    display_name: String,
    exp: i64,
}

impl IdentityVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    /// Issue a token; used by the issuing collaborator and in tests.
    pub fn mint(
        &self,
        participant: &ParticipantDescriptor,
        ttl: Duration,
    ) -> Result<String, IdentityError> {
        let claims = IdentityClaims {
            participant_id: participant.participant_id.clone(),
            display_name: participant.display_name.clone(),
            exp: (Utc::now() + ttl).timestamp(),
        };
        let payload = serde_json::to_vec(&claims)?;
        let mac = self.sign(&payload)?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(mac)
        ))
    }

    pub fn verify(&self, token: &str) -> Result<ParticipantDescriptor, IdentityError> {
        self.verify_at(token, Utc::now())
    }

    fn verify_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ParticipantDescriptor, IdentityError> {
        let (payload_b64, mac_b64) = token.split_once('.').ok_or(IdentityError::Malformed)?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64)?;
        let mac = URL_SAFE_NO_PAD.decode(mac_b64)?;

        let mut verifier =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| IdentityError::InvalidKey)?;
        verifier.update(&payload);
        verifier
            .verify_slice(&mac)
            .map_err(|_| IdentityError::MacMismatch)?;

        let claims: IdentityClaims = serde_json::from_slice(&payload)?;
        if claims.exp <= now.timestamp() {
            return Err(IdentityError::Expired);
        }
        if claims.participant_id.as_str().trim().is_empty() {
            return Err(IdentityError::MissingParticipant);
        }
        Ok(ParticipantDescriptor {
            participant_id: claims.participant_id,
            display_name: claims.display_name,
        })
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| IdentityError::InvalidKey)?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
