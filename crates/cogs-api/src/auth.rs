//! Project key parsing and connection signing.
//!
//! A project key is a `"<P>-<identity>-<secret>"` triplet where `P` is one
//! of the permission letters `R`, `W` or `A` and `secret` is hex. Every
//! connection attempt presents an [`AuthPayload`] signed with each retained
//! key: the HMAC-SHA256 digests are XOR-combined into one 32-byte value.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

const DIGEST_LEN: usize = 32;

// ── Permission ───────────────────────────────────────────────────────

/// Permission granted by a project key. Ordering is the canonical order
/// in which letters appear in the signed `permissions` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    /// The valid permission prefixes, in canonical order.
    pub const ALPHABET: &'static str = "RWA";

    pub fn letter(self) -> char {
        match self {
            Self::Read => 'R',
            Self::Write => 'W',
            Self::Admin => 'A',
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "R" => Some(Self::Read),
            "W" => Some(Self::Write),
            "A" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

// ── ProjectKey ───────────────────────────────────────────────────────

/// A single parsed project key. The secret is never printed.
#[derive(Debug, Clone)]
pub struct ProjectKey {
    pub permission: Permission,
    pub identity: String,
    secret: SecretString,
}

impl ProjectKey {
    fn mac(&self, payload: &[u8]) -> Result<[u8; DIGEST_LEN], Error> {
        let key_bytes = hex::decode(self.secret.expose_secret())
            .map_err(|e| Error::auth_key(format!("key secret is not valid hex: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&key_bytes)
            .map_err(|e| Error::auth_key(format!("unusable HMAC key: {e}")))?;
        mac.update(payload);

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&mac.finalize().into_bytes());
        Ok(digest)
    }
}

impl FromStr for ProjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        let [prefix, identity, secret] = parts.as_slice() else {
            return Err(Error::auth_key(
                "invalid format for project key (expected <P>-<identity>-<secret>)",
            ));
        };

        let permission = Permission::from_prefix(prefix).ok_or_else(|| {
            Error::auth_key(format!(
                "invalid permission prefix '{prefix}' (valid prefixes are {})",
                Permission::ALPHABET
            ))
        })?;

        if identity.is_empty() || secret.is_empty() {
            return Err(Error::auth_key("project key has an empty identity or secret"));
        }
        if hex::decode(secret).is_err() {
            return Err(Error::auth_key("project key secret is not valid hex"));
        }

        Ok(Self {
            permission,
            identity: (*identity).to_owned(),
            secret: SecretString::from((*secret).to_owned()),
        })
    }
}

// ── AuthPayload / SignedAuth ─────────────────────────────────────────

/// The JSON document whose exact serialization is signed.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuthPayload {
    pub identity: String,
    pub permissions: String,
    pub security_timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_uuid: Option<Uuid>,
}

/// Encoded auth material carried on the WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAuth {
    /// Base64 of the payload JSON (`Payload` header).
    pub payload_base64: String,
    /// Hex of the XOR-combined HMACs (`PayloadHMAC` header).
    pub hmac_hex: String,
}

impl SignedAuth {
    /// Header name/value pairs for the upgrade request.
    pub fn headers(&self) -> [(&'static str, &str); 2] {
        [
            ("Payload", self.payload_base64.as_str()),
            ("PayloadHMAC", self.hmac_hex.as_str()),
        ]
    }
}

// ── KeySet ───────────────────────────────────────────────────────────

/// The validated set of keys for one connection: one key per permission,
/// all sharing a single identity.
#[derive(Debug, Clone)]
pub struct KeySet {
    identity: String,
    keys: BTreeMap<Permission, ProjectKey>,
}

impl KeySet {
    /// Parse and validate project keys.
    ///
    /// Duplicate permissions keep the last key supplied. Keys naming
    /// different identities are rejected.
    pub fn parse<I, S>(keys: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut identity: Option<String> = None;
        let mut retained = BTreeMap::new();

        for raw in keys {
            let key: ProjectKey = raw.as_ref().parse()?;
            match &identity {
                None => identity = Some(key.identity.clone()),
                Some(first) if *first != key.identity => {
                    return Err(Error::auth_key(format!(
                        "project keys name different identities ('{first}' and '{}')",
                        key.identity
                    )));
                }
                Some(_) => {}
            }
            retained.insert(key.permission, key);
        }

        let identity = identity.ok_or_else(|| Error::auth_key("no project keys supplied"))?;
        Ok(Self {
            identity,
            keys: retained,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Concatenated permission letters, e.g. `"RW"`.
    pub fn permissions(&self) -> String {
        self.keys.keys().map(|p| p.letter()).collect()
    }

    /// Build the payload for a connection attempt at `now`.
    pub fn payload(&self, session_uuid: Option<Uuid>, now: DateTime<Utc>) -> AuthPayload {
        AuthPayload {
            identity: self.identity.clone(),
            permissions: self.permissions(),
            security_timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            session_uuid,
        }
    }

    /// Sign a payload built at `now`.
    pub fn sign(
        &self,
        session_uuid: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<SignedAuth, Error> {
        self.sign_payload(&self.payload(session_uuid, now))
    }

    /// Sign an already-built payload with every retained key.
    pub fn sign_payload(&self, payload: &AuthPayload) -> Result<SignedAuth, Error> {
        let json = serde_json::to_string(payload).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })?;

        let mut combined = [0u8; DIGEST_LEN];
        for key in self.keys.values() {
            let digest = key.mac(json.as_bytes())?;
            for (acc, byte) in combined.iter_mut().zip(digest) {
                *acc ^= byte;
            }
        }

        Ok(SignedAuth {
            payload_base64: base64::engine::general_purpose::STANDARD.encode(json.as_bytes()),
            hmac_hex: hex::encode(combined),
        })
    }
}

/// Parse `keys` and sign a fresh payload with the current UTC time.
pub fn sign<I, S>(keys: I, session_uuid: Option<Uuid>) -> Result<SignedAuth, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    KeySet::parse(keys)?.sign(session_uuid, Utc::now())
}

// ── Tests ────────────────────────────────────────────────────────────
