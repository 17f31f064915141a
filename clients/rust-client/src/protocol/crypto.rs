//! Password sealing for the Open request.
//!
//! The server publishes an X25519 public key. For every Open the client
//! draws an ephemeral key pair and a random session key. The session key is
//! wrapped with a keystream derived from the Diffie-Hellman secret, the
//! password is encrypted under the session key, and an HMAC-SHA256 tag
//! covers nonce and ciphertext.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use super::error::DriverError;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPassword {
    #[serde(with = "serde_bytes")]
    pub ephemeral_public: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub tag: Vec<u8>,
}

/// Generate a fresh long-lived secret
pub fn generate_secret() -> StaticSecret {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    StaticSecret::from(bytes)
}

pub fn public_key_bytes(secret: &StaticSecret) -> Vec<u8> {
    PublicKey::from(secret).as_bytes().to_vec()
}

fn public_key(bytes: &[u8]) -> Result<PublicKey, DriverError> {
    let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
        DriverError::AuthError(format!(
            "Public key must be exactly {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(arr))
}

fn mac(key: &[u8]) -> Result<HmacSha256, DriverError> {
    HmacSha256::new_from_slice(key)
        .map_err(|e| DriverError::AuthError(format!("Invalid HMAC key: {}", e)))
}

/// XOR `data` with an HMAC-SHA256 counter-mode keystream
///
/// The keystream is a pure function of key, label and nonce, so a
/// (key, nonce) pair must never encrypt two messages. Every seal draws a
/// fresh session key and nonce from `OsRng`, and the wrap key is a fresh
/// ephemeral Diffie-Hellman secret.
fn apply_keystream(key: &[u8], label: &[u8], nonce: &[u8], data: &mut [u8]) -> Result<(), DriverError> {
    for (counter, block) in data.chunks_mut(32).enumerate() {
        let mut m = mac(key)?;
        m.update(label);
        m.update(nonce);
        m.update(&(counter as u32).to_be_bytes());
        let stream = m.finalize().into_bytes();
        for (b, k) in block.iter_mut().zip(stream.iter()) {
            *b ^= k;
        }
    }
    Ok(())
}

fn tag(session_key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, DriverError> {
    let mut m = mac(session_key)?;
    m.update(b"tag");
    m.update(nonce);
    m.update(ciphertext);
    Ok(m)
}

/// Seal `password` for the holder of the secret behind `server_public`
///
/// Never reuse the returned nonce; each call generates its own.
pub fn seal_password(server_public: &[u8], password: &str) -> Result<SealedPassword, DriverError> {
    let server_public = public_key(server_public)?;
    let ephemeral = generate_secret();
    let shared = ephemeral.diffie_hellman(&server_public);

    let mut nonce = vec![0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let mut session_key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut session_key);

    let mut ciphertext = password.as_bytes().to_vec();
    apply_keystream(&session_key, b"seal", &nonce, &mut ciphertext)?;
    let tag = tag(&session_key, &nonce, &ciphertext)?
        .finalize()
        .into_bytes()
        .to_vec();

    let mut wrapped_key = session_key;
    apply_keystream(shared.as_bytes(), b"wrap", &nonce, &mut wrapped_key)?;

    Ok(SealedPassword {
        ephemeral_public: PublicKey::from(&ephemeral).as_bytes().to_vec(),
        nonce,
        wrapped_key,
        ciphertext,
        tag,
    })
}

/// Recover the password sealed by [`seal_password`]
pub fn open_password(secret: &StaticSecret, sealed: &SealedPassword) -> Result<String, DriverError> {
    if sealed.wrapped_key.len() != KEY_LEN {
        return Err(DriverError::AuthError("Malformed sealed password".to_string()));
    }
    let shared = secret.diffie_hellman(&public_key(&sealed.ephemeral_public)?);

    let mut session_key = sealed.wrapped_key.clone();
    apply_keystream(shared.as_bytes(), b"wrap", &sealed.nonce, &mut session_key)?;

    tag(&session_key, &sealed.nonce, &sealed.ciphertext)?
        .verify_slice(&sealed.tag)
        .map_err(|_| DriverError::AuthError("Password failed authentication".to_string()))?;

    let mut plain = sealed.ciphertext.clone();
    apply_keystream(&session_key, b"seal", &sealed.nonce, &mut plain)?;
    String::from_utf8(plain)
        .map_err(|_| DriverError::AuthError("Password is not valid UTF-8".to_string()))
}
