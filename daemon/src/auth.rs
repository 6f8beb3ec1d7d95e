//! Request signing for the admin API.
//!
//! Requests are authorised with a NIP-98 style HTTP auth event (kind
//! 27235) that binds the target URL and method, signed with the operator's
//! secp256k1 key (BIP-340 Schnorr, x-only public key) and sent base64
//! encoded.

use async_trait::async_trait;
use base64::Engine as _;
use rand::rngs::OsRng;
use secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Event kind reserved for HTTP authentication.
pub const HTTP_AUTH_KIND: u32 = 27235;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no active session")]
    NotLoggedIn,

    #[error("signer not available yet: {0}")]
    SignerUnavailable(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The logged-in operator, as far as the feedback stream is concerned.
#[async_trait]
pub trait AuthSession: Send + Sync {
    fn is_logged_in(&self) -> bool;

    /// Produce an authorization token for `method url`.
    async fn sign_request(&self, url: &str, method: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpAuthEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl HttpAuthEvent {
    pub fn sign(key: &SecretKey, url: &str, method: &str, created_at: i64) -> Result<Self, AuthError> {
        let secp = Secp256k1::signing_only();
        let keypair = Keypair::from_secret_key(&secp, key);
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        let tags = vec![
            vec!["u".to_string(), url.to_string()],
            vec!["method".to_string(), method.to_uppercase()],
        ];
        let content = String::new();
        let digest = event_digest(&pubkey, created_at, HTTP_AUTH_KIND, &tags, &content)?;
        let id = hex::encode(digest);
        let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);
        let sig = hex::encode(sig.serialize());

        Ok(Self {
            id,
            pubkey,
            created_at,
            kind: HTTP_AUTH_KIND,
            tags,
            content,
            sig,
        })
    }

    /// Token value: the event JSON, base64 encoded.
    pub fn to_token(&self) -> Result<String, AuthError> {
        let json = serde_json::to_string(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

/// `sha256([0, pubkey, created_at, kind, tags, content])`; its hex form is
/// the event id and the Schnorr signature covers the raw digest.
fn event_digest(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32], AuthError> {
    let commitment = serde_json::to_string(&serde_json::json!([0, pubkey, created_at, kind, tags, content]))?;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(commitment.as_bytes()));
    Ok(digest)
}

/// Hex encoded 32-byte secp256k1 secret key.
pub fn parse_signing_key(text: &str) -> Result<SecretKey, AuthError> {
    let bytes = hex::decode(text.trim()).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(AuthError::InvalidKey("expected 32 bytes".to_string()));
    }
    SecretKey::from_slice(&bytes).map_err(|e| AuthError::InvalidKey(e.to_string()))
}

/// Write a fresh key to `path` and return its x-only public key, hex
/// encoded.
pub fn generate_key_file(path: &Path) -> Result<String, AuthError> {
    let secp = Secp256k1::signing_only();
    let key = SecretKey::new(&mut OsRng);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(key.secret_bytes()))?;
    let (pubkey, _parity) = key.x_only_public_key(&secp);
    Ok(hex::encode(pubkey.serialize()))
}

/// Session backed by a key file. The file is read on every signing call,
/// so a key dropped in place after start-up is picked up by the next retry.
pub struct KeyFileSession {
    key_file: Option<PathBuf>,
}

impl KeyFileSession {
    pub fn new(key_file: Option<PathBuf>) -> Self {
        Self { key_file }
    }
}

#[async_trait]
impl AuthSession for KeyFileSession {
    fn is_logged_in(&self) -> bool {
        self.key_file.is_some()
    }

    async fn sign_request(&self, url: &str, method: &str) -> Result<String, AuthError> {
        let path = self.key_file.as_ref().ok_or(AuthError::NotLoggedIn)?;
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AuthError::SignerUnavailable(format!("{:?} does not exist", path)));
            }
            Err(e) => return Err(e.into()),
        };
        let key = parse_signing_key(&text)?;
        HttpAuthEvent::sign(&key, url, method, chrono::Utc::now().timestamp())?.to_token()
    }
}
