use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{ParticipantId, RoomId};
use crate::{Error, Result};

/// Relay access token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayClaims {
    /// Server-assigned participant identity
    pub sub: String,
    /// Room the bearer may join
    pub room: String,
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl RelayClaims {
    #[must_use]
    pub fn identity(&self) -> ParticipantId {
        ParticipantId::from_string(self.sub.clone())
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        RoomId::from_string(self.room.clone())
    }
}

/// Signs short-lived relay credentials (HS256, secret shared with the relay)
#[derive(Clone)]
pub struct RelayTokenIssuer {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    issuer: String,
    ttl: Duration,
}

impl std::fmt::Debug for RelayTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTokenIssuer")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl RelayTokenIssuer {
    pub fn new(secret: &[u8], issuer: impl Into<String>, ttl: std::time::Duration) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::InvalidInput("relay token secret is empty".to_string()));
        }
        let ttl = Duration::from_std(ttl)
            .map_err(|e| Error::InvalidInput(format!("relay token ttl out of range: {e}")))?;

        Ok(Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            issuer: issuer.into(),
            ttl,
        })
    }

    /// Sign a token for `identity` in `room`, returning it with its expiry
    pub fn issue(&self, room: &RoomId, identity: &ParticipantId) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let claims = RelayClaims {
            sub: identity.as_str().to_string(),
            room: room.as_str().to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok((token, expires_at))
    }

    /// Verify a token and extract claims
    pub fn verify(&self, token: &str) -> Result<RelayClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.leeway = 30;

        Ok(decode::<RelayClaims>(token, &self.decoding_key, &validation)?.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> RelayTokenIssuer {
        RelayTokenIssuer::new(b"test-secret", "plaza", std::time::Duration::from_secs(600)).unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = issuer();
        let (token, expires_at) = issuer
            .issue(&RoomId::from("lobby"), &ParticipantId::from("alice-x1"))
            .unwrap();

        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.identity(), ParticipantId::from("alice-x1"));
        assert_eq!(claims.room_id(), RoomId::from("lobby"));
        assert_eq!(claims.exp, expires_at.timestamp());
        assert_eq!(claims.exp - claims.iat, 600);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (token, _) = issuer()
            .issue(&RoomId::from("lobby"), &ParticipantId::from("alice"))
            .unwrap();
        let other =
            RelayTokenIssuer::new(b"other-secret", "plaza", std::time::Duration::from_secs(600)).unwrap();

        assert!(matches!(other.verify(&token), Err(Error::Token(_))));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(RelayTokenIssuer::new(b"", "plaza", std::time::Duration::from_secs(1)).is_err());
    }
}
