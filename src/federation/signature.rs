//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::AppError;

/// Maximum accepted distance between the `Date` header and now
const MAX_CLOCK_SKEW_SECONDS: i64 = 300;

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
    /// Host header value covered by the signature
    pub host: String,
}

/// `host[:port]`, with the port only when it is not the scheme default.
///
/// Matches the `Host` header an HTTP client sends for `url`.
pub fn host_header_value(url: &Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn request_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Sign an HTTP request
///
/// Covers `(request-target) host date`, plus `digest` when a body is sent.
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     &inbox_url,
///     Some(&body),
///     key_pair.private_key(),
///     "https://my.server/users/me#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &Url,
    body: Option<&[u8]>,
    private_key: &RsaPrivateKey,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let host = host_header_value(url)?;
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let request_target = format!("{} {}", method.to_lowercase(), request_path(url));

    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key
        .try_sign_with_rng(&mut rng, signing_string.as_bytes())
        .map_err(|e| AppError::Crypto(format!("Signing failed: {}", e)))?;
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
        host,
    })
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
}

/// True when any `SHA-256=` entry of a Digest header matches `body`.
fn digest_matches(digest_header: &str, body: &[u8]) -> bool {
    let expected = generate_digest(body);
    let expected_value = expected.trim_start_matches("SHA-256=");
    digest_header.split(',').any(|entry| {
        entry
            .trim()
            .split_once('=')
            .map(|(algorithm, value)| {
                algorithm.eq_ignore_ascii_case("sha-256") && value == expected_value
            })
            .unwrap_or(false)
    })
}

/// Verify an HTTP request signature
///
/// `path_and_query` is the request target as received, query included.
///
/// # Errors
/// `Validation` describing the first check that failed.
pub fn verify_signature(
    method: &str,
    path_and_query: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key: &RsaPublicKey,
) -> Result<(), AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Validation(
            "Signed headers must include: digest".to_string(),
        ));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;
    let skew = (Utc::now().timestamp() - date.timestamp()).abs();
    if skew > MAX_CLOCK_SKEW_SECONDS {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    if let Some(body_data) = body {
        if !digest_matches(header_str(headers, "digest")?, body_data) {
            return Err(AppError::Validation("Digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = if header_name == "(request-target)" {
            format!("{} {}", method.to_lowercase(), path_and_query)
        } else {
            let values = headers
                .get_all(header_name.as_str())
                .iter()
                .map(|v| {
                    v.to_str()
                        .map(str::trim)
                        .map_err(|_| AppError::Validation(format!("Invalid {} header", header_name)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if values.is_empty() {
                return Err(AppError::Validation(format!(
                    "Missing {} header",
                    header_name
                )));
            }
            values.join(", ")
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Validation(format!("Invalid signature format: {}", e)))?;

    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::Validation("Signature verification failed".to_string()))
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` defaults to `hs2019` and `headers` to `date` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}
