//! Cryptographic primitives for the VMess codec
//!
//! - MD5 / HMAC-MD5 digests used for key derivation and user tokens
//! - FNV-1a 32 checksums guarding headers, commands and auth chunks
//! - AES-128-CFB stream wrappers for header and body encryption

mod stream;

pub use stream::{CryptionReader, CryptionWriter};

use cfb_mode::cipher::KeyIvInit;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// AES-128 key and IV size
pub const KEY_SIZE: usize = 16;

pub type Aes128CfbEnc = cfb_mode::BufEncryptor<aes::Aes128>;
pub type Aes128CfbDec = cfb_mode::BufDecryptor<aes::Aes128>;

type HmacMd5 = Hmac<Md5>;

/// MD5 digest of the concatenation of `parts`
pub fn md5_sum(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// HMAC-MD5 of `msg` under `key`
pub fn hmac_md5(key: &[u8], msg: &[u8]) -> Result<[u8; 16]> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("HMAC init failed: {}", e)))?;
    mac.update(msg);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// FNV-1a 32-bit hash
pub fn fnv1a32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    data.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}

/// AES-128-CFB encryptor for `key`/`iv`
pub fn new_encryptor(key: &[u8; KEY_SIZE], iv: &[u8; KEY_SIZE]) -> Result<Aes128CfbEnc> {
    Aes128CfbEnc::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("CFB encryptor init failed: {}", e)))
}

/// AES-128-CFB decryptor for `key`/`iv`
pub fn new_decryptor(key: &[u8; KEY_SIZE], iv: &[u8; KEY_SIZE]) -> Result<Aes128CfbDec> {
    Aes128CfbDec::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("CFB decryptor init failed: {}", e)))
}

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
