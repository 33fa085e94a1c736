//! Crypto primitives behind the token codec and OTP engine.
//!
//! Thin adapters over the RustCrypto stack: HMAC-SHA2 and RSA PKCS#1 v1.5
//! for token signatures, AES-256-GCM for encrypted payload fields, OS
//! randomness for one-time codes and key generation.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::error::AuthError;

/// Hash widths shared by the HMAC and RSA signature families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha512,
}

/// HMAC-SHA2 signature over `data`.
///
/// # Errors
///
/// Returns an internal error if the MAC cannot be keyed.
pub fn hmac_sign(alg: HashAlg, key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let tag = match alg {
        HashAlg::Sha256 => {
            let mut mac: Hmac<Sha256> = Mac::new_from_slice(key).map_err(keying_failed)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlg::Sha384 => {
            let mut mac: Hmac<Sha384> = Mac::new_from_slice(key).map_err(keying_failed)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        HashAlg::Sha512 => {
            let mut mac: Hmac<Sha512> = Mac::new_from_slice(key).map_err(keying_failed)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(tag)
}

/// Constant-time HMAC verification.
///
/// # Errors
///
/// Returns an internal error if the MAC cannot be keyed; a wrong signature is
/// `Ok(false)`, not an error.
pub fn hmac_verify(
    alg: HashAlg,
    key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, AuthError> {
    let expected = hmac_sign(alg, key, data)?;
    Ok(expected.ct_eq(signature).unwrap_u8() == 1)
}

/// RSA PKCS#1 v1.5 signature over `data`.
///
/// # Errors
///
/// Returns an internal error when the private key PEM/DER cannot be parsed.
pub fn rsa_sign(alg: HashAlg, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let key = decode_rsa_private_key(private_key)?;
    let signature = match alg {
        HashAlg::Sha256 => SigningKey::<Sha256>::new(key).sign(data).to_vec(),
        HashAlg::Sha384 => SigningKey::<Sha384>::new(key).sign(data).to_vec(),
        HashAlg::Sha512 => SigningKey::<Sha512>::new(key).sign(data).to_vec(),
    };
    Ok(signature)
}

/// RSA PKCS#1 v1.5 verification.
///
/// # Errors
///
/// Returns an internal error when the public key cannot be parsed; a wrong
/// signature is `Ok(false)`.
pub fn rsa_verify(
    alg: HashAlg,
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, AuthError> {
    let key = decode_rsa_public_key(public_key)?;
    let Ok(signature) = Signature::try_from(signature) else {
        return Ok(false);
    };
    let verified = match alg {
        HashAlg::Sha256 => VerifyingKey::<Sha256>::new(key).verify(data, &signature).is_ok(),
        HashAlg::Sha384 => VerifyingKey::<Sha384>::new(key).verify(data, &signature).is_ok(),
        HashAlg::Sha512 => VerifyingKey::<Sha512>::new(key).verify(data, &signature).is_ok(),
    };
    Ok(verified)
}

fn decode_rsa_private_key(pem_or_der: &[u8]) -> Result<RsaPrivateKey, AuthError> {
    if pem_or_der.starts_with(b"-----BEGIN") {
        let text = std::str::from_utf8(pem_or_der).map_err(|_| key_parse_failed())?;
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(text) {
            return Ok(key);
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(text) {
            return Ok(key);
        }
        return Err(key_parse_failed());
    }

    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(pem_or_der) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(pem_or_der) {
        return Ok(key);
    }
    Err(key_parse_failed())
}

fn decode_rsa_public_key(pem_or_der: &[u8]) -> Result<RsaPublicKey, AuthError> {
    if pem_or_der.starts_with(b"-----BEGIN") {
        let text = std::str::from_utf8(pem_or_der).map_err(|_| key_parse_failed())?;
        if let Ok(key) = RsaPublicKey::from_public_key_pem(text) {
            return Ok(key);
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_pem(text) {
            return Ok(key);
        }
        return Err(key_parse_failed());
    }

    if let Ok(key) = RsaPublicKey::from_public_key_der(pem_or_der) {
        return Ok(key);
    }
    if let Ok(key) = RsaPublicKey::from_pkcs1_der(pem_or_der) {
        return Ok(key);
    }
    Err(key_parse_failed())
}

/// Generate an RSA key pair as `(private_pem, public_pem)`.
///
/// # Errors
///
/// Returns an internal error when key generation or PEM encoding fails.
pub fn generate_rsa_keypair(bits: usize) -> Result<(String, String), AuthError> {
    let mut rng = rsa::rand_core::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|err| AuthError::internal("KEYGEN_FAILED", err.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|err| AuthError::internal("KEYGEN_FAILED", err.to_string()))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| AuthError::internal("KEYGEN_FAILED", err.to_string()))?;

    Ok((private_pem, public_pem))
}

/// AES-256-GCM encryption. Returns `nonce (12 bytes) || ciphertext`.
///
/// # Errors
///
/// Returns an internal error when encryption fails or randomness is
/// unavailable.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; 12];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|err| AuthError::internal("RNG_FAILED", err.to_string()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|err| AuthError::internal("ENCRYPTION_FAILED", err.to_string()))?;

    let mut out = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// AES-256-GCM decryption of `nonce || ciphertext`.
///
/// # Errors
///
/// Returns an internal error when the input is too short or authentication
/// fails.
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    if data.len() < 12 {
        return Err(AuthError::internal(
            "DECRYPTION_FAILED",
            "Invalid ciphertext length",
        ));
    }

    let (nonce_bytes, ciphertext) = data.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|err| AuthError::internal("DECRYPTION_FAILED", err.to_string()))
}

/// Derive the AES key for an encrypted payload field from the shared secret
/// and the token id, so each token gets its own data key.
#[must_use]
pub fn derive_data_key(secret: &str, jti: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(jti.as_bytes());
    hasher.finalize().into()
}

/// SHA-256 rendered as lowercase hex.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Sample `length` decimal digits from OS randomness.
///
/// Each byte is reduced mod 10; the slight bias is acceptable for short-lived
/// one-time codes.
///
/// # Errors
///
/// Returns an internal error when randomness is unavailable.
pub fn random_digits(length: usize) -> Result<String, AuthError> {
    let mut bytes = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::internal("RNG_FAILED", err.to_string()))?;
    Ok(bytes.iter().map(|byte| ((byte % 10) + b'0') as char).collect())
}

fn keying_failed(err: hmac::digest::InvalidLength) -> AuthError {
    AuthError::internal("SIGNING_FAILED", err.to_string())
}

fn key_parse_failed() -> AuthError {
    AuthError::internal("MISSING_KEY", "Failed to parse RSA key")
}
