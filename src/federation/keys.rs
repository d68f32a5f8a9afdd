//! Actor key pairs
//!
//! Every local actor signs with RSASSA-PKCS1-v1_5 / SHA-256 keys. Pairs
//! are generated on first use and persisted as JSON Web Keys under
//! `["keypairs", identifier]`, as an ordered list whose first entry is the
//! primary signing key.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::{KvKey, KvStore};
use crate::error::AppError;

/// JWK `alg` for RSASSA-PKCS1-v1_5 with SHA-256
const JWK_ALG: &str = "RS256";

/// RSA JSON Web Key (RFC 7517 / RFC 7518 §6.3)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    pub n: String,
    pub e: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<bool>,
}

fn encode_uint(value: &BigUint) -> String {
    BASE64URL.encode(value.to_bytes_be())
}

fn decode_uint(field: &str, value: &str) -> Result<BigUint, AppError> {
    let bytes = BASE64URL
        .decode(value.trim_end_matches('='))
        .map_err(|e| AppError::Crypto(format!("Invalid JWK member {}: {}", field, e)))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, AppError> {
    value
        .as_deref()
        .ok_or_else(|| AppError::Crypto(format!("JWK is missing member {}", field)))
}

impl Jwk {
    pub fn from_public_key(key: &RsaPublicKey) -> Self {
        Self {
            kty: "RSA".to_string(),
            alg: Some(JWK_ALG.to_string()),
            n: encode_uint(key.n()),
            e: encode_uint(key.e()),
            d: None,
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
            key_ops: Some(vec!["verify".to_string()]),
            ext: Some(true),
        }
    }

    pub fn from_private_key(key: &RsaPrivateKey) -> Result<Self, AppError> {
        let [p, q] = key.primes() else {
            return Err(AppError::Crypto(
                "Only two-prime RSA keys can be exported".to_string(),
            ));
        };
        let one = BigUint::from(1u32);
        let two = BigUint::from(2u32);
        let d = key.d();
        let dp = d % &(p - &one);
        let dq = d % &(q - &one);
        // p is prime, so q^(p-2) mod p is the inverse of q.
        let qi = q.modpow(&(p - &two), p);

        Ok(Self {
            kty: "RSA".to_string(),
            alg: Some(JWK_ALG.to_string()),
            n: encode_uint(key.n()),
            e: encode_uint(key.e()),
            d: Some(encode_uint(d)),
            p: Some(encode_uint(p)),
            q: Some(encode_uint(q)),
            dp: Some(encode_uint(&dp)),
            dq: Some(encode_uint(&dq)),
            qi: Some(encode_uint(&qi)),
            key_ops: Some(vec!["sign".to_string()]),
            ext: Some(true),
        })
    }

    fn check_type(&self) -> Result<(), AppError> {
        if self.kty != "RSA" {
            return Err(AppError::Crypto(format!("Unsupported JWK kty: {}", self.kty)));
        }
        match self.alg.as_deref() {
            None | Some(JWK_ALG) => Ok(()),
            Some(other) => Err(AppError::Crypto(format!("Unsupported JWK alg: {}", other))),
        }
    }

    pub fn to_public_key(&self) -> Result<RsaPublicKey, AppError> {
        self.check_type()?;
        RsaPublicKey::new(decode_uint("n", &self.n)?, decode_uint("e", &self.e)?)
            .map_err(|e| AppError::Crypto(format!("Invalid RSA public key: {}", e)))
    }

    pub fn to_private_key(&self) -> Result<RsaPrivateKey, AppError> {
        self.check_type()?;
        let primes = vec![
            decode_uint("p", required("p", &self.p)?)?,
            decode_uint("q", required("q", &self.q)?)?,
        ];
        let mut key = RsaPrivateKey::from_components(
            decode_uint("n", &self.n)?,
            decode_uint("e", &self.e)?,
            decode_uint("d", required("d", &self.d)?)?,
            primes,
        )
        .map_err(|e| AppError::Crypto(format!("Invalid RSA private key: {}", e)))?;

        key.validate()
            .map_err(|e| AppError::Crypto(format!("Inconsistent RSA private key: {}", e)))?;
        key.precompute()
            .map_err(|e| AppError::Crypto(format!("RSA precomputation failed: {}", e)))?;
        Ok(key)
    }
}

/// Serialized form of a [`KeyPair`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedKeyPair {
    pub private_key: Jwk,
    pub public_key: Jwk,
}

/// In-memory key pair
#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyPair {
    /// Generate a fresh pair. CPU bound; call from a blocking context.
    pub fn generate(bits: usize) -> Result<Self, AppError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::Crypto(format!("Key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// SPKI PEM, as published in `publicKey.publicKeyPem`
    pub fn public_key_pem(&self) -> Result<String, AppError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Crypto(format!("Failed to encode public key: {}", e)))
    }

    pub fn export(&self) -> Result<ExportedKeyPair, AppError> {
        Ok(ExportedKeyPair {
            private_key: Jwk::from_private_key(&self.private_key)?,
            public_key: Jwk::from_public_key(&self.public_key),
        })
    }

    pub fn import(exported: &ExportedKeyPair) -> Result<Self, AppError> {
        let private_key = exported.private_key.to_private_key()?;
        let public_key = exported.public_key.to_public_key()?;
        if RsaPublicKey::from(&private_key) != public_key {
            return Err(AppError::Crypto(
                "Stored public key does not match private key".to_string(),
            ));
        }
        Ok(Self {
            private_key,
            public_key,
        })
    }
}

/// Owns the key pair lifecycle of the local actor
pub struct KeyManager {
    kv: Arc<dyn KvStore>,
    /// The only identifier that owns keys
    identifier: String,
    key_bits: usize,
}

impl KeyManager {
    pub fn new(kv: Arc<dyn KvStore>, identifier: impl Into<String>, key_bits: usize) -> Self {
        Self {
            kv,
            identifier: identifier.into(),
            key_bits,
        }
    }

    fn key(identifier: &str) -> KvKey {
        KvKey::new(["keypairs", identifier])
    }

    /// Stored pairs for `identifier`, generating the first pair if none exist.
    ///
    /// Identifiers other than the configured actor have no keys. Concurrent
    /// first calls, including from other processes sharing the store,
    /// converge on whichever pair won the conditional put.
    pub async fn get_or_create_key_pairs(&self, identifier: &str) -> Result<Vec<KeyPair>, AppError> {
        if identifier != self.identifier {
            return Ok(Vec::new());
        }

        let key = Self::key(identifier);
        if let Some(stored) = self.kv.get(&key).await? {
            return decode_stored(stored);
        }

        tracing::info!(identifier = %identifier, bits = self.key_bits, "No key pair found, generating");
        let bits = self.key_bits;
        let generated = tokio::task::spawn_blocking(move || KeyPair::generate(bits))
            .await
            .map_err(|e| AppError::Crypto(format!("Key generation task failed: {}", e)))??;

        let value = serde_json::to_value(vec![generated.export()?])
            .map_err(|e| AppError::Crypto(format!("Failed to serialize key pair: {}", e)))?;

        if self.kv.set_if_absent(&key, value).await? {
            crate::metrics::KEY_PAIRS_GENERATED.inc();
            tracing::info!(identifier = %identifier, "Key pair generated and stored");
            return Ok(vec![generated]);
        }

        tracing::debug!(identifier = %identifier, "Lost key generation race, loading stored pair");
        let stored = self.kv.get(&key).await?.ok_or_else(|| {
            AppError::Persistence("Key pair vanished after conditional write".to_string())
        })?;
        decode_stored(stored)
    }

    /// Primary signing pair for `identifier`
    pub async fn primary_key_pair(&self, identifier: &str) -> Result<Option<KeyPair>, AppError> {
        Ok(self
            .get_or_create_key_pairs(identifier)
            .await?
            .into_iter()
            .next())
    }
}

/// Accepts the list form and a bare single-pair object.
fn decode_stored(stored: Value) -> Result<Vec<KeyPair>, AppError> {
    let exported: Vec<ExportedKeyPair> = if stored.is_array() {
        serde_json::from_value(stored)
    } else {
        serde_json::from_value(stored).map(|single| vec![single])
    }
    .map_err(|e| AppError::Crypto(format!("Invalid stored key pair: {}", e)))?;

    if exported.is_empty() {
        return Err(AppError::Crypto("Stored key pair list is empty".to_string()));
    }

    exported.iter().map(KeyPair::import).collect()
}
