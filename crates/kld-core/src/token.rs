//! Cryptographic token capability interface
//!
//! A synchronous, PKCS#11-shaped view of the provider: objects are addressed
//! by handle, keys are described by templates and every operation names its
//! mechanism. Streaming sign/verify/digest follow init/update/final semantics
//! with at most one active operation of each kind per session.

use std::fmt;
use std::ops::{BitOr, Deref, DerefMut};
use thiserror::Error;
use zeroize::Zeroizing;

/// Provider return code (PKCS#11 `CK_RV` numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnCode(pub u64);

#[allow(missing_docs)]
impl ReturnCode {
    pub const SLOT_ID_INVALID: Self = Self(0x03);
    pub const GENERAL_ERROR: Self = Self(0x05);
    pub const FUNCTION_FAILED: Self = Self(0x06);
    pub const ARGUMENTS_BAD: Self = Self(0x07);
    pub const ATTRIBUTE_TYPE_INVALID: Self = Self(0x12);
    pub const ATTRIBUTE_VALUE_INVALID: Self = Self(0x13);
    pub const DATA_LEN_RANGE: Self = Self(0x21);
    pub const KEY_HANDLE_INVALID: Self = Self(0x60);
    pub const KEY_SIZE_RANGE: Self = Self(0x62);
    pub const KEY_TYPE_INCONSISTENT: Self = Self(0x63);
    pub const KEY_FUNCTION_NOT_PERMITTED: Self = Self(0x68);
    pub const MECHANISM_INVALID: Self = Self(0x70);
    pub const MECHANISM_PARAM_INVALID: Self = Self(0x71);
    pub const OBJECT_HANDLE_INVALID: Self = Self(0x82);
    pub const OPERATION_ACTIVE: Self = Self(0x90);
    pub const OPERATION_NOT_INITIALIZED: Self = Self(0x91);
    pub const SESSION_CLOSED: Self = Self(0xB0);
    pub const SIGNATURE_INVALID: Self = Self(0xC0);
    pub const SIGNATURE_LEN_RANGE: Self = Self(0xC1);
    pub const TEMPLATE_INCOMPLETE: Self = Self(0xD0);
    pub const TEMPLATE_INCONSISTENT: Self = Self(0xD1);
    pub const WRAPPED_KEY_INVALID: Self = Self(0x110);
    pub const WRAPPING_KEY_TYPE_INCONSISTENT: Self = Self(0x115);
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CKR 0x{:08X}", self.0)
    }
}

/// Failure reported by the cryptographic token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct TokenError {
    /// Provider diagnostic code
    pub code: ReturnCode,
    /// Human readable context
    pub message: String,
}

impl TokenError {
    /// Create a token error
    pub fn new(code: ReturnCode, message: impl Into<String>) -> Self {
        TokenError {
            code,
            message: message.into(),
        }
    }
}

/// Result type for token operations
pub type TokenResult<T> = Result<T, TokenError>;

/// Handle of an object held by the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Object class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// Symmetric or generic secret key
    SecretKey,
    /// Private half of a key pair
    PrivateKey,
    /// Public half of a key pair
    PublicKey,
}

/// Key type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// AES key (16, 24 or 32 bytes)
    Aes,
    /// Opaque secret used only as derivation base
    GenericSecret,
    /// Elliptic curve key
    Ec,
    /// RSA key
    Rsa,
}

/// Permitted key functions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyUsage {
    /// Encrypt data
    pub encrypt: bool,
    /// Decrypt data
    pub decrypt: bool,
    /// Sign / generate MAC
    pub sign: bool,
    /// Verify signature / MAC
    pub verify: bool,
    /// Wrap other keys
    pub wrap: bool,
    /// Unwrap other keys
    pub unwrap: bool,
    /// Serve as derivation base
    pub derive: bool,
}

#[allow(missing_docs)]
impl KeyUsage {
    pub const NONE: Self = Self {
        encrypt: false,
        decrypt: false,
        sign: false,
        verify: false,
        wrap: false,
        unwrap: false,
        derive: false,
    };
    pub const ENCRYPT: Self = Self { encrypt: true, ..Self::NONE };
    pub const DECRYPT: Self = Self { decrypt: true, ..Self::NONE };
    pub const SIGN: Self = Self { sign: true, ..Self::NONE };
    pub const VERIFY: Self = Self { verify: true, ..Self::NONE };
    pub const WRAP: Self = Self { wrap: true, ..Self::NONE };
    pub const UNWRAP: Self = Self { unwrap: true, ..Self::NONE };
    pub const DERIVE: Self = Self { derive: true, ..Self::NONE };
}

impl BitOr for KeyUsage {
    type Output = KeyUsage;

    fn bitor(self, rhs: KeyUsage) -> KeyUsage {
        KeyUsage {
            encrypt: self.encrypt || rhs.encrypt,
            decrypt: self.decrypt || rhs.decrypt,
            sign: self.sign || rhs.sign,
            verify: self.verify || rhs.verify,
            wrap: self.wrap || rhs.wrap,
            unwrap: self.unwrap || rhs.unwrap,
            derive: self.derive || rhs.derive,
        }
    }
}

/// Attribute readable through [`CryptoToken::get_attribute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// DER SubjectPublicKeyInfo of a public or private key
    PublicKeyInfo,
    /// DER OCTET STRING wrapping the uncompressed EC point
    EcPoint,
    /// X9.143 key block header bound to the key
    KeyBlockHeader,
    /// Object label
    Label,
}

/// Named elliptic curves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    /// NIST P-256
    Secp256r1,
}

impl Curve {
    /// DER encoded object identifier (`CKA_EC_PARAMS`)
    pub fn oid(&self) -> &'static [u8] {
        match self {
            Curve::Secp256r1 => &[0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07],
        }
    }
}

/// KDF applied to the raw ECDH shared secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcKdf {
    /// Raw shared secret
    Null,
    /// ANSI X9.63 KDF with SHA-384
    Sha384,
}

/// Mechanism and its parameters
#[derive(Debug, Clone, Copy)]
pub enum Mechanism<'a> {
    /// AES in ECB mode (block aligned input)
    AesEcb,
    /// AES-CMAC, full 16-byte tag
    AesCmac,
    /// ECDSA over SHA-256, raw `r || s` signature
    EcdsaSha256,
    /// SHA-256 digest
    Sha256,
    /// AES key generation (length from template)
    AesKeyGen,
    /// EC key pair generation
    EcKeyPairGen {
        /// Curve of the generated pair
        curve: Curve,
    },
    /// RSA key pair generation
    RsaKeyPairGen {
        /// Modulus size in bits
        modulus_bits: usize,
        /// Big-endian public exponent
        public_exponent: &'a [u8],
    },
    /// ECDH1 key derivation
    Ecdh1Derive {
        /// KDF applied to the shared secret
        kdf: EcKdf,
        /// Shared info fed to the KDF
        shared_data: &'a [u8],
        /// Peer public key (raw or DER wrapped uncompressed point)
        public_data: &'a [u8],
    },
    /// Take `value_len` bytes of the base key starting at `bit_offset`
    ExtractKeyFromKey {
        /// Offset into the base key in bits
        bit_offset: usize,
    },
    /// Derive by AES-ECB encrypting `data` under the base key
    AesEcbEncryptData {
        /// Block aligned derivation data
        data: &'a [u8],
    },
    /// ANSI X9.143 key block wrap/unwrap
    KeyBlockWrap {
        /// Header to wrap with; on unwrap, the header the block must carry
        header: Option<&'a str>,
    },
}

impl Mechanism<'_> {
    /// Short mechanism name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::AesEcb => "AES_ECB",
            Mechanism::AesCmac => "AES_CMAC",
            Mechanism::EcdsaSha256 => "ECDSA_SHA256",
            Mechanism::Sha256 => "SHA256",
            Mechanism::AesKeyGen => "AES_KEY_GEN",
            Mechanism::EcKeyPairGen { .. } => "EC_KEY_PAIR_GEN",
            Mechanism::RsaKeyPairGen { .. } => "RSA_PKCS_KEY_PAIR_GEN",
            Mechanism::Ecdh1Derive { .. } => "ECDH1_DERIVE",
            Mechanism::ExtractKeyFromKey { .. } => "EXTRACT_KEY_FROM_KEY",
            Mechanism::AesEcbEncryptData { .. } => "AES_ECB_ENCRYPT_DATA",
            Mechanism::KeyBlockWrap { .. } => "X9_143_KEY_WRAP",
        }
    }
}

/// Object template used for creation, generation, derivation and search
#[derive(Clone, Default)]
pub struct KeyTemplate {
    /// Object class
    pub class: Option<ObjectClass>,
    /// Key type
    pub key_type: Option<KeyType>,
    /// Label
    pub label: Option<String>,
    /// Key value for import (raw secret, PKCS#8 or SPKI DER)
    pub value: Option<Zeroizing<Vec<u8>>>,
    /// Requested key length in bytes
    pub value_len: Option<usize>,
    /// Persist in the token store (`CKA_TOKEN`)
    pub persistent: bool,
    /// Permitted functions
    pub usage: KeyUsage,
    /// X9.143 key block header attribute
    pub key_block_header: Option<String>,
}

impl fmt::Debug for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyTemplate")
            .field("class", &self.class)
            .field("key_type", &self.key_type)
            .field("label", &self.label)
            .field("value", &self.value.as_ref().map(|_| "<redacted>"))
            .field("value_len", &self.value_len)
            .field("persistent", &self.persistent)
            .field("usage", &self.usage)
            .field("key_block_header", &self.key_block_header)
            .finish()
    }
}

impl KeyTemplate {
    /// Template for an object of the given class and type
    pub fn new(class: ObjectClass, key_type: KeyType) -> Self {
        KeyTemplate {
            class: Some(class),
            key_type: Some(key_type),
            ..Default::default()
        }
    }

    /// Search template matching class, type and label
    pub fn search(class: ObjectClass, key_type: KeyType, label: &str) -> Self {
        Self::new(class, key_type).with_label(label)
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the key value to import
    pub fn with_value(mut self, value: &[u8]) -> Self {
        self.value = Some(Zeroizing::new(value.to_vec()));
        self
    }

    /// Set the requested key length in bytes
    pub fn with_value_len(mut self, len: usize) -> Self {
        self.value_len = Some(len);
        self
    }

    /// Persist the object in the token store
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set permitted functions
    pub fn with_usage(mut self, usage: KeyUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Bind an X9.143 key block header
    pub fn with_key_block_header(mut self, header: &str) -> Self {
        self.key_block_header = Some(header.to_string());
        self
    }

    /// Whether an object with these properties satisfies the search fields set here
    pub fn matches(&self, class: ObjectClass, key_type: KeyType, label: Option<&str>) -> bool {
        self.class.map_or(true, |c| c == class)
            && self.key_type.map_or(true, |t| t == key_type)
            && self.label.as_deref().map_or(true, |l| Some(l) == label)
    }
}

/// Session on a cryptographic token
///
/// Implementations are exclusively owned by one caller; nothing here is
/// required to be thread safe.
pub trait CryptoToken {
    /// Find up to `max` objects matching `template`
    fn find_objects(&mut self, template: &KeyTemplate, max: usize) -> TokenResult<Vec<ObjectHandle>>;

    /// Read an attribute value
    fn get_attribute(&mut self, object: ObjectHandle, attribute: Attribute) -> TokenResult<Vec<u8>>;

    /// Fill `buffer` from the token RNG
    fn generate_random(&mut self, buffer: &mut [u8]) -> TokenResult<()>;

    /// Generate a secret key
    fn generate_key(&mut self, mechanism: &Mechanism<'_>, template: &KeyTemplate) -> TokenResult<ObjectHandle>;

    /// Generate a key pair, returning `(public, private)`
    fn generate_key_pair(
        &mut self,
        mechanism: &Mechanism<'_>,
        public_template: &KeyTemplate,
        private_template: &KeyTemplate,
    ) -> TokenResult<(ObjectHandle, ObjectHandle)>;

    /// Import an object from `template.value`
    fn create_object(&mut self, template: &KeyTemplate) -> TokenResult<ObjectHandle>;

    /// Derive a key from `base_key`
    fn derive_key(
        &mut self,
        mechanism: &Mechanism<'_>,
        base_key: ObjectHandle,
        template: &KeyTemplate,
    ) -> TokenResult<ObjectHandle>;

    /// Wrap `key` under `wrapping_key`
    fn wrap_key(
        &mut self,
        mechanism: &Mechanism<'_>,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> TokenResult<Vec<u8>>;

    /// Unwrap `wrapped` under `unwrapping_key` into a new object
    fn unwrap_key(
        &mut self,
        mechanism: &Mechanism<'_>,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &KeyTemplate,
    ) -> TokenResult<ObjectHandle>;

    /// Destroy an object
    fn destroy_object(&mut self, object: ObjectHandle) -> TokenResult<()>;

    /// Start a signature / MAC operation
    fn sign_init(&mut self, mechanism: &Mechanism<'_>, key: ObjectHandle) -> TokenResult<()>;

    /// Feed data to the active signature operation
    fn sign_update(&mut self, data: &[u8]) -> TokenResult<()>;

    /// Finish the active signature operation
    fn sign_final(&mut self) -> TokenResult<Vec<u8>>;

    /// Start a verification operation
    fn verify_init(&mut self, mechanism: &Mechanism<'_>, key: ObjectHandle) -> TokenResult<()>;

    /// Feed data to the active verification operation
    fn verify_update(&mut self, data: &[u8]) -> TokenResult<()>;

    /// Finish verification; `SIGNATURE_INVALID` on mismatch
    fn verify_final(&mut self, signature: &[u8]) -> TokenResult<()>;

    /// Start a digest operation
    fn digest_init(&mut self, mechanism: &Mechanism<'_>) -> TokenResult<()>;

    /// Feed data to the active digest
    fn digest_update(&mut self, data: &[u8]) -> TokenResult<()>;

    /// Finish the active digest
    fn digest_final(&mut self) -> TokenResult<Vec<u8>>;

    /// Single-shot encryption
    fn encrypt(&mut self, mechanism: &Mechanism<'_>, key: ObjectHandle, data: &[u8]) -> TokenResult<Vec<u8>>;

    /// Close the session; session objects are destroyed
    fn close(&mut self) -> TokenResult<()>;
}

/// Provider module exposing slots
pub trait TokenModule {
    /// Session type
    type Session: CryptoToken;

    /// Open a session on `slot`
    fn open_session(&self, slot: u64) -> TokenResult<Self::Session>;
}

/// Scoped arena of provider-resident key handles
///
/// Every handle tracked here is destroyed when the scope ends, on success and
/// on every error path. Handles that must outlive the scope are released with
/// [`KeyScope::keep`].
pub struct KeyScope<'a, S: CryptoToken + ?Sized> {
    token: &'a mut S,
    handles: Vec<ObjectHandle>,
}

impl<'a, S: CryptoToken + ?Sized> KeyScope<'a, S> {
    /// Open a scope over a session
    pub fn new(token: &'a mut S) -> Self {
        KeyScope {
            token,
            handles: Vec::new(),
        }
    }

    /// Track an existing handle
    pub fn track(&mut self, handle: ObjectHandle) -> ObjectHandle {
        self.handles.push(handle);
        handle
    }

    /// Run a creating operation and track the handle it returns
    pub fn track_with<F>(&mut self, create: F) -> TokenResult<ObjectHandle>
    where
        F: FnOnce(&mut S) -> TokenResult<ObjectHandle>,
    {
        let handle = create(&mut *self.token)?;
        Ok(self.track(handle))
    }

    /// Stop tracking a handle so it survives the scope
    pub fn keep(&mut self, handle: ObjectHandle) -> ObjectHandle {
        self.handles.retain(|h| *h != handle);
        handle
    }

    /// Destroy a tracked handle now
    pub fn destroy(&mut self, handle: ObjectHandle) -> TokenResult<()> {
        self.handles.retain(|h| *h != handle);
        self.token.destroy_object(handle)
    }

    /// Number of handles still owned by the scope
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the scope owns no handles
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<S: CryptoToken + ?Sized> Deref for KeyScope<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &*self.token
    }
}

impl<S: CryptoToken + ?Sized> DerefMut for KeyScope<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.token
    }
}

impl<S: CryptoToken + ?Sized> Drop for KeyScope<'_, S> {
    fn drop(&mut self) {
        while let Some(handle) = self.handles.pop() {
            if let Err(e) = self.token.destroy_object(handle) {
                log::warn!("Failed to destroy ephemeral key {}: {}", handle, e);
            }
        }
    }
}
