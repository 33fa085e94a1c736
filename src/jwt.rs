//! JWT encode/decode/sign/verify with encrypted payload support.
//!
//! Tokens are the standard three dot-separated base64url segments. Signing
//! covers `HS256/384/512` (shared secret) and `RS256/384/512` (PEM key
//! pair). A `secureData` claim is encrypted at issuance with a per-token
//! AES-256-GCM key derived from the shared secret (or an explicit encryption
//! key) and the token id.

use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::{
    crypto::{self, HashAlg},
    error::AuthError,
    scope,
    ttl::{now_unix_seconds, parse_ttl},
};

/// Default `iss` claim stamped on issued tokens.
pub const DEFAULT_JWT_ISSUER: &str = "zanix-auth";

/// Supported signature algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "HS256")]
    Hs256,
    #[serde(rename = "HS384")]
    Hs384,
    #[serde(rename = "HS512")]
    Hs512,
    #[serde(rename = "RS256")]
    Rs256,
    #[serde(rename = "RS384")]
    Rs384,
    #[serde(rename = "RS512")]
    Rs512,
}

impl Algorithm {
    #[must_use]
    pub const fn is_rsa(self) -> bool {
        matches!(self, Self::Rs256 | Self::Rs384 | Self::Rs512)
    }

    const fn hash(self) -> HashAlg {
        match self {
            Self::Hs256 | Self::Rs256 => HashAlg::Sha256,
            Self::Hs384 | Self::Rs384 => HashAlg::Sha384,
            Self::Hs512 | Self::Rs512 => HashAlg::Sha512,
        }
    }
}

/// Token audience: a single scope string or an ordered sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    /// The audience as a list of scope strings.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub alg: Algorithm,
    pub typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Header {
    fn new(alg: Algorithm, kid: Option<String>) -> Self {
        Self {
            alg,
            typ: "JWT".to_string(),
            kid,
        }
    }
}

/// JWT claims: the reserved fields plus an open extension map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(rename = "rateLimit", skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(rename = "secureData", skip_serializing_if = "Option::is_none")]
    pub secure_data: Option<String>,
    /// Refresh tokens embed the options used to mint the companion access
    /// token, so a refresh alone can regenerate the pair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// Scope strings carried in `aud`.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.aud.as_ref().map(Audience::to_vec).unwrap_or_default()
    }
}

/// Issuance options.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    pub algorithm: Algorithm,
    /// TTL string (`"1h"`) or bare seconds; absent means no `exp` claim.
    pub expiration: Option<String>,
    /// Key id recorded in the header for later key selection.
    pub kid: Option<String>,
    /// Explicit AES key source for `secureData`; defaults to the signing
    /// secret for HMAC algorithms.
    pub encryption_key: Option<String>,
}

/// Verification options. Unset fields skip the corresponding claim check.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Expected algorithm; the header value is only trusted when absent.
    pub algorithm: Option<Algorithm>,
    pub issuer: Option<String>,
    /// Empty string disables the subject check, same as `None`.
    pub subject: Option<String>,
    /// Required scopes checked any-of against the token audience.
    pub audience: Vec<String>,
    pub encryption_key: Option<String>,
    /// Clock override for expiry checks; wall clock when absent.
    pub now: Option<i64>,
}

/// A token split and decoded without verification.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    pub header: Header,
    pub claims: Claims,
    pub signature: Vec<u8>,
}

/// Issue a signed token.
///
/// `jti` defaults to a fresh UUID and `iss` to [`DEFAULT_JWT_ISSUER`]. A
/// present `secureData` claim is replaced by its ciphertext, except for RSA
/// tokens without an explicit encryption key, where it is dropped (the
/// signing key is not a shared secret).
///
/// # Errors
///
/// Fails on a non-positive expiration, unusable key material or an
/// encryption failure.
pub fn create(mut claims: Claims, secret: &str, opts: &SignOptions) -> Result<String, AuthError> {
    let jti = claims
        .jti
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();
    claims
        .iss
        .get_or_insert_with(|| DEFAULT_JWT_ISSUER.to_string());

    if let Some(expiration) = &opts.expiration {
        let ttl = parse_ttl(expiration)?;
        if ttl <= 0 {
            return Err(AuthError::internal(
                "INVALID_EXPIRATION",
                format!("Token expiration must be positive, got {expiration:?}"),
            ));
        }
        claims.exp = Some(now_unix_seconds() + ttl);
    }

    if let Some(plaintext) = claims.secure_data.take() {
        if opts.algorithm.is_rsa() && opts.encryption_key.is_none() {
            warn!("dropping secureData from RSA token without an encryption key");
        } else {
            let key_source = opts.encryption_key.as_deref().unwrap_or(secret);
            let key = crypto::derive_data_key(key_source, &jti);
            let ciphertext = crypto::encrypt(&key, plaintext.as_bytes())?;
            claims.secure_data = Some(Base64UrlUnpadded::encode_string(&ciphertext));
        }
    }

    let header = Header::new(opts.algorithm, opts.kid.clone());
    let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(&claims)?);

    let signature = if opts.algorithm.is_rsa() {
        crypto::rsa_sign(opts.algorithm.hash(), secret.as_bytes(), signing_input.as_bytes())?
    } else {
        crypto::hmac_sign(opts.algorithm.hash(), secret.as_bytes(), signing_input.as_bytes())?
    };

    Ok(format!(
        "{signing_input}.{}",
        Base64UrlUnpadded::encode_string(&signature)
    ))
}

/// Verify a token's signature and claims, returning the decoded payload.
///
/// A present `secureData` claim is decrypted in place when a key is
/// resolvable; decryption failures are logged and leave the ciphertext
/// untouched rather than failing the token.
///
/// # Errors
///
/// `INVALID_TOKEN` for malformed input, `INVALID_TOKEN_SIGNATURE`,
/// `EXPIRED_TOKEN` (with `{currentTime, expirationTime}` meta),
/// `INVALID_TOKEN_ISSUER`, `INVALID_TOKEN_PERMISSIONS` or
/// `INVALID_TOKEN_SUBJECT` per failed check.
pub fn verify(token: &str, secret: &str, opts: &VerifyOptions) -> Result<Claims, AuthError> {
    let (header_b64, payload_b64, signature_b64) = split_token(token)?;

    let header: Header = b64d_json(header_b64)?;
    let algorithm = opts.algorithm.unwrap_or(header.alg);
    let signature = Base64UrlUnpadded::decode_vec(signature_b64).map_err(|_| invalid_token())?;

    let signing_input = format!("{header_b64}.{payload_b64}");
    let verified = if algorithm.is_rsa() {
        crypto::rsa_verify(
            algorithm.hash(),
            secret.as_bytes(),
            signing_input.as_bytes(),
            &signature,
        )?
    } else {
        crypto::hmac_verify(
            algorithm.hash(),
            secret.as_bytes(),
            signing_input.as_bytes(),
            &signature,
        )?
    };
    if !verified {
        return Err(AuthError::forbidden(
            "INVALID_TOKEN_SIGNATURE",
            "Invalid token signature.",
        ));
    }

    let mut claims: Claims = b64d_json(payload_b64)?;

    if claims.secure_data.is_some() {
        decrypt_secure_data(&mut claims, algorithm, secret, opts.encryption_key.as_deref());
    }

    let now = opts.now.unwrap_or_else(now_unix_seconds);
    if let Some(exp) = claims.exp
        && now > exp
    {
        return Err(AuthError::forbidden("EXPIRED_TOKEN", "Token has expired.")
            .with_meta(serde_json::json!({
                "currentTime": now,
                "expirationTime": exp,
            })));
    }

    if let Some(expected) = &opts.issuer
        && claims.iss.as_deref() != Some(expected.as_str())
    {
        return Err(AuthError::forbidden(
            "INVALID_TOKEN_ISSUER",
            "Invalid token issuer.",
        ));
    }

    if !opts.audience.is_empty()
        && let Err(reason) = scope::validate(&opts.audience, &claims.scopes())
    {
        return Err(AuthError::forbidden("INVALID_TOKEN_PERMISSIONS", reason));
    }

    if let Some(expected) = opts.subject.as_deref().filter(|subject| !subject.is_empty())
        && claims.sub.as_deref() != Some(expected)
    {
        return Err(AuthError::forbidden(
            "INVALID_TOKEN_SUBJECT",
            "Invalid token subject.",
        ));
    }

    Ok(claims)
}

/// Split and decode a token without verifying it.
///
/// Used to read the `kid` before key selection and to decode
/// already-validated tokens in downstream flows.
///
/// # Errors
///
/// `INVALID_TOKEN` for malformed input.
pub fn decode(token: &str) -> Result<DecodedToken, AuthError> {
    let (header_b64, payload_b64, signature_b64) = split_token(token)?;
    Ok(DecodedToken {
        header: b64d_json(header_b64)?,
        claims: b64d_json(payload_b64)?,
        signature: Base64UrlUnpadded::decode_vec(signature_b64).map_err(|_| invalid_token())?,
    })
}

fn decrypt_secure_data(
    claims: &mut Claims,
    algorithm: Algorithm,
    secret: &str,
    encryption_key: Option<&str>,
) {
    // The RSA verification key is public material, never a data key.
    let key_source = match encryption_key {
        Some(key) => key,
        None if !algorithm.is_rsa() => secret,
        None => return,
    };
    let Some(jti) = claims.jti.clone() else {
        return;
    };
    let Some(ciphertext_b64) = claims.secure_data.as_deref() else {
        return;
    };

    let key = crypto::derive_data_key(key_source, &jti);
    let plaintext = Base64UrlUnpadded::decode_vec(ciphertext_b64)
        .map_err(|_| AuthError::internal("DECRYPTION_FAILED", "secureData is not base64url"))
        .and_then(|ciphertext| crypto::decrypt(&key, &ciphertext))
        .and_then(|bytes| {
            String::from_utf8(bytes).map_err(|_| {
                AuthError::internal("DECRYPTION_FAILED", "secureData is not valid UTF-8")
            })
        });

    match plaintext {
        Ok(plaintext) => claims.secure_data = Some(plaintext),
        Err(err) => {
            // Leave the ciphertext in place; callers may hold the right key.
            warn!(error = %err, "failed to decrypt secureData, leaving ciphertext");
        }
    }
}

fn split_token(token: &str) -> Result<(&str, &str, &str), AuthError> {
    let mut parts = token.split('.');
    let header = parts.next().ok_or_else(invalid_token)?;
    let payload = parts.next().ok_or_else(invalid_token)?;
    let signature = parts.next().ok_or_else(invalid_token)?;
    if parts.next().is_some() || header.is_empty() || payload.is_empty() {
        return Err(invalid_token());
    }
    Ok((header, payload, signature))
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, AuthError> {
    let json = serde_json::to_vec(value)
        .map_err(|err| AuthError::internal("ENCODING_FAILED", err.to_string()))?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthError> {
    let bytes = Base64UrlUnpadded::decode_vec(segment).map_err(|_| invalid_token())?;
    serde_json::from_slice(&bytes).map_err(|_| invalid_token())
}

fn invalid_token() -> AuthError {
    AuthError::forbidden("INVALID_TOKEN", "Token is malformed.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_rsa_keypair;
    use anyhow::Result;
    use serde_json::json;

    const SECRET: &str = "my-secret";

    fn claims_with_extra() -> Claims {
        let mut claims = Claims {
            sub: Some("user-1".to_string()),
            ..Claims::default()
        };
        claims.extra.insert("role".to_string(), json!("admin"));
        claims
    }

    #[test]
    fn create_defaults_jti_and_issuer() -> Result<()> {
        let token = create(Claims::default(), SECRET, &SignOptions::default())?;
        let verified = verify(&token, SECRET, &VerifyOptions::default())?;
        assert!(verified.jti.is_some_and(|jti| Uuid::parse_str(&jti).is_ok()));
        assert_eq!(verified.iss.as_deref(), Some(DEFAULT_JWT_ISSUER));
        Ok(())
    }

    #[test]
    fn round_trip_preserves_payload() -> Result<()> {
        let token = create(claims_with_extra(), SECRET, &SignOptions::default())?;
        let verified = verify(&token, SECRET, &VerifyOptions::default())?;
        assert_eq!(verified.sub.as_deref(), Some("user-1"));
        assert_eq!(verified.extra.get("role"), Some(&json!("admin")));
        assert!(verified.exp.is_none());
        Ok(())
    }

    #[test]
    fn tampered_payload_fails_signature_check() -> Result<()> {
        let token = create(claims_with_extra(), SECRET, &SignOptions::default())?;
        let mut parts: Vec<String> = token.split('.').map(ToString::to_string).collect();
        // Valid base64url payload for a different document.
        parts[1] = Base64UrlUnpadded::encode_string(br#"{"sub":"evil"}"#);
        let tampered = parts.join(".");

        let err = verify(&tampered, SECRET, &VerifyOptions::default()).err();
        assert!(err.is_some_and(|err| err.code() == "INVALID_TOKEN_SIGNATURE"));
        Ok(())
    }

    #[test]
    fn wrong_secret_fails_signature_check() -> Result<()> {
        let token = create(Claims::default(), SECRET, &SignOptions::default())?;
        let err = verify(&token, "other-secret", &VerifyOptions::default()).err();
        assert!(err.is_some_and(|err| err.code() == "INVALID_TOKEN_SIGNATURE"));
        Ok(())
    }

    #[test]
    fn expired_token_reports_times() -> Result<()> {
        let opts = SignOptions {
            expiration: Some("1s".to_string()),
            ..SignOptions::default()
        };
        let token = create(Claims::default(), SECRET, &opts)?;

        let future = now_unix_seconds() + 120;
        let err = verify(
            &token,
            SECRET,
            &VerifyOptions {
                now: Some(future),
                ..VerifyOptions::default()
            },
        )
        .err()
        .map(|err| (err.code(), err.meta().cloned()));

        let (code, meta) = err.expect("expected expiry failure");
        assert_eq!(code, "EXPIRED_TOKEN");
        let meta = meta.expect("expiry meta");
        assert_eq!(meta.get("currentTime"), Some(&json!(future)));
        assert!(meta.get("expirationTime").is_some());
        Ok(())
    }

    #[test]
    fn non_positive_expiration_is_rejected() {
        let opts = SignOptions {
            expiration: Some("0".to_string()),
            ..SignOptions::default()
        };
        assert!(create(Claims::default(), SECRET, &opts).is_err());
    }

    #[test]
    fn issuer_mismatch_fails() -> Result<()> {
        let token = create(Claims::default(), SECRET, &SignOptions::default())?;
        let err = verify(
            &token,
            SECRET,
            &VerifyOptions {
                issuer: Some("someone-else".to_string()),
                ..VerifyOptions::default()
            },
        )
        .err();
        assert!(err.is_some_and(|err| err.code() == "INVALID_TOKEN_ISSUER"));
        Ok(())
    }

    #[test]
    fn audience_overlap_passes_and_disjoint_fails() -> Result<()> {
        let claims = Claims {
            aud: Some(Audience::Many(vec![
                "read".to_string(),
                "write".to_string(),
            ])),
            ..Claims::default()
        };
        let token = create(claims, SECRET, &SignOptions::default())?;

        let ok = verify(
            &token,
            SECRET,
            &VerifyOptions {
                audience: vec!["write".to_string(), "admin".to_string()],
                ..VerifyOptions::default()
            },
        );
        assert!(ok.is_ok());

        let err = verify(
            &token,
            SECRET,
            &VerifyOptions {
                audience: vec!["admin".to_string()],
                ..VerifyOptions::default()
            },
        )
        .err();
        assert!(err.is_some_and(|err| err.code() == "INVALID_TOKEN_PERMISSIONS"));
        Ok(())
    }

    #[test]
    fn subject_mismatch_fails_and_empty_expected_is_skipped() -> Result<()> {
        let token = create(claims_with_extra(), SECRET, &SignOptions::default())?;

        let err = verify(
            &token,
            SECRET,
            &VerifyOptions {
                subject: Some("user-2".to_string()),
                ..VerifyOptions::default()
            },
        )
        .err();
        assert!(err.is_some_and(|err| err.code() == "INVALID_TOKEN_SUBJECT"));

        let ok = verify(
            &token,
            SECRET,
            &VerifyOptions {
                subject: Some(String::new()),
                ..VerifyOptions::default()
            },
        );
        assert!(ok.is_ok());
        Ok(())
    }

    #[test]
    fn secure_data_is_encrypted_in_transit() -> Result<()> {
        let claims = Claims {
            secure_data: Some("top-secret".to_string()),
            ..Claims::default()
        };
        let token = create(claims, SECRET, &SignOptions::default())?;

        // The raw payload segment must not leak the plaintext.
        let decoded = decode(&token)?;
        let in_token = decoded.claims.secure_data.expect("ciphertext present");
        assert_ne!(in_token, "top-secret");

        let verified = verify(&token, SECRET, &VerifyOptions::default())?;
        assert_eq!(verified.secure_data.as_deref(), Some("top-secret"));
        Ok(())
    }

    #[test]
    fn secure_data_uses_explicit_encryption_key() -> Result<()> {
        let claims = Claims {
            secure_data: Some("top-secret".to_string()),
            ..Claims::default()
        };
        let sign = SignOptions {
            encryption_key: Some("data-key".to_string()),
            ..SignOptions::default()
        };
        let token = create(claims, SECRET, &sign)?;

        // Without the data key, decryption fails and the ciphertext stays,
        // but the token itself still verifies.
        let without_key = verify(&token, SECRET, &VerifyOptions::default())?;
        assert_ne!(without_key.secure_data.as_deref(), Some("top-secret"));

        let with_key = verify(
            &token,
            SECRET,
            &VerifyOptions {
                encryption_key: Some("data-key".to_string()),
                ..VerifyOptions::default()
            },
        )?;
        assert_eq!(with_key.secure_data.as_deref(), Some("top-secret"));
        Ok(())
    }

    #[test]
    fn rsa_round_trip_and_secure_data_drop() -> Result<()> {
        let (private_pem, public_pem) = generate_rsa_keypair(2048)?;

        let claims = Claims {
            sub: Some("api-1".to_string()),
            secure_data: Some("top-secret".to_string()),
            ..Claims::default()
        };
        let sign = SignOptions {
            algorithm: Algorithm::Rs256,
            kid: Some("V1".to_string()),
            ..SignOptions::default()
        };
        let token = create(claims, &private_pem, &sign)?;

        let decoded = decode(&token)?;
        assert_eq!(decoded.header.kid.as_deref(), Some("V1"));
        // No shared secret, so the field was dropped at issuance.
        assert!(decoded.claims.secure_data.is_none());

        let verified = verify(
            &token,
            &public_pem,
            &VerifyOptions {
                algorithm: Some(Algorithm::Rs256),
                ..VerifyOptions::default()
            },
        )?;
        assert_eq!(verified.sub.as_deref(), Some("api-1"));
        Ok(())
    }

    #[test]
    fn malformed_tokens_are_invalid() {
        for bad in ["", "a", "a.b", "a.b.c.d", "!.!.!"] {
            let err = verify(bad, SECRET, &VerifyOptions::default()).err();
            assert!(
                err.is_some_and(|err| err.code() == "INVALID_TOKEN"),
                "expected INVALID_TOKEN for {bad:?}"
            );
        }
        assert!(decode("not-a-token").is_err());
    }
}
