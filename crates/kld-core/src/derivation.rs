//! Key derivation service
//!
//! Manufacturing reset secrets, reincarnation keys and key check values. All
//! master key material stays on the token; only derived handles and public
//! artifacts leave these functions.

use crate::hsm::{find_key, KeyLabels};
use crate::keyblock::headers;
use crate::token::{CryptoToken, KeyScope, KeyTemplate, KeyType, KeyUsage, Mechanism, ObjectClass, ObjectHandle};
use crate::transcript::fingerprint;
use crate::types::{ManufacturingResetSecret, AES_256_KEY_LEN, KCV_LEN};
use crate::{Hsm, KldError, KldResult};

const AES_BLOCK_LEN: usize = 16;

impl<S: CryptoToken> Hsm<S> {
    /// Derive the secret that unlocks a `Manufactured` device for reset
    ///
    /// The two words are the first eight bytes of the AES-ECB encryption of
    /// `derivation_input` repeated four times in native byte order.
    pub fn derive_mfg_reset_secret(&mut self, derivation_input: u32) -> KldResult<ManufacturingResetSecret> {
        let block = self.mfg_reset_cipher_block(derivation_input)?;
        let words = [
            u32::from_ne_bytes([block[0], block[1], block[2], block[3]]),
            u32::from_ne_bytes([block[4], block[5], block[6], block[7]]),
        ];
        log::info!("Derived manufacturing reset secret for input {:08X}", derivation_input);
        Ok(ManufacturingResetSecret { words })
    }

    /// Encrypted block the manufacturing reset secret is taken from
    pub fn mfg_reset_cipher_block(&mut self, derivation_input: u32) -> KldResult<[u8; AES_BLOCK_LEN]> {
        let master = find_key(
            &mut self.session,
            ObjectClass::SecretKey,
            KeyType::Aes,
            &self.labels.mfg_reset_master,
        )?;

        let mut block = [0u8; AES_BLOCK_LEN];
        for chunk in block.chunks_exact_mut(4) {
            chunk.copy_from_slice(&derivation_input.to_ne_bytes());
        }

        let encrypted = self.session.encrypt(&Mechanism::AesEcb, master, &block)?;
        encrypted.as_slice().try_into().map_err(|_| {
            KldError::ProtocolInvariantViolation(format!(
                "AES-ECB returned {} bytes for one block",
                encrypted.len()
            ))
        })
    }

    /// Derive the reincarnation key for a device from its derivation info
    ///
    /// The returned handle is a session object; the caller destroys it.
    pub fn derive_reincarnation_key(&mut self, derivation_info: &[u8]) -> KldResult<ObjectHandle> {
        derive_reincarnation_key(&mut self.session, &self.labels, derivation_info)
    }

    /// Key check value of an AES-256 key: CMAC over a zero block, truncated
    pub fn compute_aes_key_check_value(&mut self, key: &[u8; AES_256_KEY_LEN]) -> KldResult<[u8; KCV_LEN]> {
        aes_key_check_value(&mut self.session, key)
    }
}

pub(crate) fn derive_reincarnation_key<S: CryptoToken + ?Sized>(
    token: &mut S,
    labels: &KeyLabels,
    derivation_info: &[u8],
) -> KldResult<ObjectHandle> {
    let master = find_key(token, ObjectClass::SecretKey, KeyType::Aes, &labels.reincarnation_master)?;

    token.digest_init(&Mechanism::Sha256)?;
    token.digest_update(derivation_info)?;
    let digest = token.digest_final()?;
    if digest.len() != 32 {
        return Err(KldError::ProtocolInvariantViolation(format!(
            "SHA-256 returned {} bytes",
            digest.len()
        )));
    }

    let template = KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
        .with_label(labels.reincarnation_key.as_str())
        .with_value_len(AES_256_KEY_LEN)
        .persistent(false)
        .with_usage(KeyUsage::WRAP | KeyUsage::UNWRAP)
        .with_key_block_header(headers::REINCARNATION_KEY);

    let handle = token.derive_key(&Mechanism::AesEcbEncryptData { data: &digest }, master, &template)?;
    log::debug!(
        "Derived reincarnation key {} for derivation info {}",
        handle,
        fingerprint(derivation_info)
    );
    Ok(handle)
}

pub(crate) fn aes_key_check_value<S: CryptoToken + ?Sized>(
    token: &mut S,
    key: &[u8],
) -> KldResult<[u8; KCV_LEN]> {
    let mut scope = KeyScope::new(token);
    let template = KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
        .with_value(key)
        .persistent(false)
        .with_usage(KeyUsage::SIGN);
    let handle = scope.track_with(|t| t.create_object(&template))?;

    scope.sign_init(&Mechanism::AesCmac, handle)?;
    scope.sign_update(&[0u8; AES_BLOCK_LEN])?;
    let mac = scope.sign_final()?;
    if mac.len() < KCV_LEN {
        return Err(KldError::ProtocolInvariantViolation(format!(
            "AES-CMAC returned {} bytes",
            mac.len()
        )));
    }

    let mut kcv = [0u8; KCV_LEN];
    kcv.copy_from_slice(&mac[..KCV_LEN]);
    Ok(kcv)
}
