//! HSM session owner
//!
//! [`Hsm`] owns one token session exclusively for the duration of a
//! provisioning or handshake run. The session is closed by [`Hsm::close`] or,
//! on every other exit path, when the value is dropped.

use serde::{Deserialize, Serialize};

use crate::token::{CryptoToken, KeyTemplate, KeyType, ObjectClass, ObjectHandle, TokenModule};
use crate::{KldError, KldResult};

/// Labels of the provider-resident keys the flows look up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLabels {
    /// Long-term secp256r1 key pair authenticating this key loading device
    pub kld_auth: String,
    /// AES master key of the manufacturing reset secret
    pub mfg_reset_master: String,
    /// AES master key the reincarnation keys derive from
    pub reincarnation_master: String,
    /// Label given to derived reincarnation keys
    pub reincarnation_key: String,
    /// RSA application signing key transported to devices
    pub application_sign: String,
    /// Root key block protection key of the key ceremony
    pub root_kbpk: String,
}

impl Default for KeyLabels {
    fn default() -> Self {
        KeyLabels {
            kld_auth: "KLD_AUTH".to_string(),
            mfg_reset_master: "MFG_RESET_MASTER".to_string(),
            reincarnation_master: "000DEB06".to_string(),
            reincarnation_key: "X9_143_MASTER_KBPK".to_string(),
            application_sign: "APPLICATION_SIGN".to_string(),
            root_kbpk: "ROOT_HSM_KBPK".to_string(),
        }
    }
}

/// Exclusively owned token session plus the key labels in use
pub struct Hsm<S: CryptoToken> {
    pub(crate) session: S,
    pub(crate) labels: KeyLabels,
    closed: bool,
}

impl<S: CryptoToken> Hsm<S> {
    /// Take ownership of an open session
    pub fn new(session: S, labels: KeyLabels) -> Self {
        Hsm {
            session,
            labels,
            closed: false,
        }
    }

    /// Open a session on `slot` of `module`
    pub fn open<M>(module: &M, slot: u64, labels: KeyLabels) -> KldResult<Self>
    where
        M: TokenModule<Session = S>,
    {
        let session = module.open_session(slot)?;
        log::debug!("Opened token session on slot {}", slot);
        Ok(Self::new(session, labels))
    }

    /// Key labels in use
    pub fn labels(&self) -> &KeyLabels {
        &self.labels
    }

    /// Borrow the session
    pub fn session(&self) -> &S {
        &self.session
    }

    /// Mutably borrow the session
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Find the single object of the given class and type carrying `label`
    pub fn find_key(&mut self, class: ObjectClass, key_type: KeyType, label: &str) -> KldResult<ObjectHandle> {
        find_key(&mut self.session, class, key_type, label)
    }

    /// Draw `len` bytes from the token RNG
    pub fn random(&mut self, len: usize) -> KldResult<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        self.session.generate_random(&mut buffer)?;
        Ok(buffer)
    }

    /// Destroy an object
    pub fn destroy(&mut self, handle: ObjectHandle) -> KldResult<()> {
        self.session.destroy_object(handle)?;
        Ok(())
    }

    /// Close the session
    pub fn close(mut self) -> KldResult<()> {
        self.closed = true;
        self.session.close()?;
        log::debug!("Closed token session");
        Ok(())
    }
}

impl<S: CryptoToken> Drop for Hsm<S> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.session.close() {
                log::warn!("Failed to close token session: {}", e);
            }
        }
    }
}

pub(crate) fn find_key<S: CryptoToken + ?Sized>(
    token: &mut S,
    class: ObjectClass,
    key_type: KeyType,
    label: &str,
) -> KldResult<ObjectHandle> {
    let handles = token.find_objects(&KeyTemplate::search(class, key_type, label), 2)?;
    match handles.as_slice() {
        [handle] => Ok(*handle),
        [] => Err(KldError::KeyNotFound(label.to_string())),
        _ => Err(KldError::KeyNotFound(format!("{} (label is ambiguous)", label))),
    }
}
