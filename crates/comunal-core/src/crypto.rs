use crate::error::CryptoError;
use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const KDF_ITERATIONS: u32 = 100_000;
pub const DERIVED_KEY_LEN: usize = 32;
pub const TOKEN_VERSION: u8 = 0x02;
pub const NONCE_LEN: usize = 24;
pub const SEAL_HEX_LEN: usize = 64;
const TAG_LEN: usize = 16;

/// Salt shared by every installation. Existing documents were sealed with it,
/// so it cannot change without a re-encryption pass.
pub const APP_SALT: &[u8] = b"comunal.registro.documentos.v1";

type HmacSha256 = Hmac<Sha256>;

pub fn derive_key(password: &str, iterations: u32) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), APP_SALT, iterations, &mut key[..]);
    key
}

/// Encrypts `plaintext` into a self-contained token:
/// `base64url(version || nonce || ciphertext || tag)`.
pub fn encrypt_token(key: &[u8; DERIVED_KEY_LEN], plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut raw = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    raw.push(TOKEN_VERSION);
    raw.extend_from_slice(&nonce);
    raw.extend_from_slice(&ciphertext);
    Ok(general_purpose::URL_SAFE.encode(raw))
}

pub fn decrypt_token(key: &[u8; DERIVED_KEY_LEN], token: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let raw = general_purpose::URL_SAFE
        .decode(token.trim_ascii())
        .map_err(|_| CryptoError::MalformedToken("not base64"))?;
    if raw.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::MalformedToken("too short"));
    }
    if raw[0] != TOKEN_VERSION {
        return Err(CryptoError::MalformedToken("unknown version"));
    }
    let (nonce, ciphertext) = raw[1..].split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Outer integrity seal, keyed with the raw password bytes.
pub fn seal(password: &str, data: &[u8]) -> Result<String, CryptoError> {
    let mut mac = new_mac(password)?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex seal produced by [`seal`].
pub fn verify_seal(password: &str, data: &[u8], seal_hex: &str) -> bool {
    let Ok(expected) = hex::decode(seal_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = new_mac(password) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(&expected).is_ok()
}

fn new_mac(password: &str) -> Result<HmacSha256, CryptoError> {
    <HmacSha256 as Mac>::new_from_slice(password.as_bytes()).map_err(|_| CryptoError::MacKey)
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
