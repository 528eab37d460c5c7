//! AES primitives shared by the key-block codec and software tokens
//!
//! Thin wrappers over the RustCrypto `aes`, `cbc` and `cmac` crates that
//! select the AES variant from the key length (16, 24 or 32 bytes).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockCipher, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use cmac::{Cmac, Mac};
use thiserror::Error;

/// AES block size in bytes
pub const AES_BLOCK_LEN: usize = 16;

/// Cipher primitive errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// Key is not 16, 24 or 32 bytes
    #[error("Invalid AES key length: {0}")]
    InvalidKeyLength(usize),

    /// Data is not a multiple of the block size
    #[error("Data length {0} is not block aligned")]
    NotBlockAligned(usize),

    /// IV is not one block
    #[error("Invalid IV length: {0}")]
    InvalidIvLength(usize),
}

fn check_aligned(data: &[u8]) -> Result<(), CipherError> {
    if data.len() % AES_BLOCK_LEN != 0 {
        return Err(CipherError::NotBlockAligned(data.len()));
    }
    Ok(())
}

fn ecb_with<C: BlockEncrypt + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = C::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(AES_BLOCK_LEN) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// AES-ECB encryption of block aligned data
pub fn aes_ecb_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError> {
    check_aligned(data)?;
    match key.len() {
        16 => ecb_with::<Aes128>(key, data),
        24 => ecb_with::<Aes192>(key, data),
        32 => ecb_with::<Aes256>(key, data),
        n => Err(CipherError::InvalidKeyLength(n)),
    }
}

macro_rules! cmac_tag {
    ($cipher:ty, $key:expr, $data:expr) => {{
        let mut mac = <Cmac<$cipher> as Mac>::new_from_slice($key)
            .map_err(|_| CipherError::InvalidKeyLength($key.len()))?;
        mac.update($data);
        let mut tag = [0u8; AES_BLOCK_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }};
}

/// AES-CMAC tag (16 bytes)
pub fn aes_cmac(key: &[u8], data: &[u8]) -> Result<[u8; AES_BLOCK_LEN], CipherError> {
    match key.len() {
        16 => cmac_tag!(Aes128, key, data),
        24 => cmac_tag!(Aes192, key, data),
        32 => cmac_tag!(Aes256, key, data),
        n => Err(CipherError::InvalidKeyLength(n)),
    }
}

fn cbc_encrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let mut encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(AES_BLOCK_LEN) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

fn cbc_decrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let mut decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(AES_BLOCK_LEN) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// AES-CBC encryption without padding
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError> {
    check_aligned(data)?;
    if iv.len() != AES_BLOCK_LEN {
        return Err(CipherError::InvalidIvLength(iv.len()));
    }
    match key.len() {
        16 => cbc_encrypt_with::<Aes128>(key, iv, data),
        24 => cbc_encrypt_with::<Aes192>(key, iv, data),
        32 => cbc_encrypt_with::<Aes256>(key, iv, data),
        n => Err(CipherError::InvalidKeyLength(n)),
    }
}

/// AES-CBC decryption without padding
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError> {
    check_aligned(data)?;
    if iv.len() != AES_BLOCK_LEN {
        return Err(CipherError::InvalidIvLength(iv.len()));
    }
    match key.len() {
        16 => cbc_decrypt_with::<Aes128>(key, iv, data),
        24 => cbc_decrypt_with::<Aes192>(key, iv, data),
        32 => cbc_decrypt_with::<Aes256>(key, iv, data),
        n => Err(CipherError::InvalidKeyLength(n)),
    }
}

/// Constant time comparison
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
