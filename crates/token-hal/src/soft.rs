//! Software cryptographic token
//!
//! An in-memory PKCS#11-style token. Persistent objects (`token = true`)
//! live in a store shared by every session of the module; session objects
//! belong to one session and are dropped when it closes. Usage flags are
//! enforced, each session runs at most one sign, one verify and one digest
//! operation at a time, and failures carry `CKR_*` return codes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kld_core::cipher::{aes_cmac, aes_ecb_encrypt, constant_time_eq};
use kld_core::keyblock::{self, KeyBlockHeader};
use kld_core::token::{
    Attribute, CryptoToken, Curve, EcKdf, KeyTemplate, KeyType, KeyUsage, Mechanism, ObjectClass, ObjectHandle,
    ReturnCode, TokenError, TokenModule, TokenResult,
};
use rand_core::{OsRng, RngCore};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto;
use crate::memory::SecureMemory;

const MIN_RSA_BITS: usize = 1024;
const MAX_RSA_BITS: usize = 4096;

fn err(code: ReturnCode, message: impl Into<String>) -> TokenError {
    TokenError::new(code, message)
}

/// Key value held by an object
#[derive(Clone)]
enum KeyMaterial {
    Secret(SecureMemory),
    EcPrivate(p256::SecretKey),
    EcPublic(p256::PublicKey),
    RsaPrivate(Box<RsaPrivateKey>),
    RsaPublic(Box<RsaPublicKey>),
}

#[derive(Clone)]
struct KeyObject {
    class: ObjectClass,
    key_type: KeyType,
    label: Option<String>,
    usage: KeyUsage,
    persistent: bool,
    key_block_header: Option<String>,
    material: KeyMaterial,
}

impl KeyObject {
    fn new(class: ObjectClass, key_type: KeyType, template: &KeyTemplate, material: KeyMaterial) -> Self {
        KeyObject {
            class,
            key_type,
            label: template.label.clone(),
            usage: template.usage,
            persistent: template.persistent,
            key_block_header: template.key_block_header.clone(),
            material,
        }
    }

    fn secret(&self) -> TokenResult<&SecureMemory> {
        match &self.material {
            KeyMaterial::Secret(value) => Ok(value),
            _ => Err(err(ReturnCode::KEY_TYPE_INCONSISTENT, "not a secret key")),
        }
    }

    fn aes_key(&self) -> TokenResult<&SecureMemory> {
        if self.key_type != KeyType::Aes {
            return Err(err(ReturnCode::KEY_TYPE_INCONSISTENT, "not an AES key"));
        }
        self.secret()
    }

    fn ec_private(&self) -> TokenResult<&p256::SecretKey> {
        match &self.material {
            KeyMaterial::EcPrivate(key) => Ok(key),
            _ => Err(err(ReturnCode::KEY_TYPE_INCONSISTENT, "not an EC private key")),
        }
    }

    fn require(&self, permitted: bool, function: &str) -> TokenResult<()> {
        if !permitted {
            return Err(err(
                ReturnCode::KEY_FUNCTION_NOT_PERMITTED,
                format!("key does not permit {}", function),
            ));
        }
        Ok(())
    }

    /// Value as carried inside a key block: raw secret, PKCS#8 or SPKI DER
    fn export(&self) -> TokenResult<Zeroizing<Vec<u8>>> {
        Ok(match &self.material {
            KeyMaterial::Secret(value) => Zeroizing::new(value.as_ref().to_vec()),
            KeyMaterial::EcPrivate(key) => crypto::ec_private_to_pkcs8(key)?,
            KeyMaterial::EcPublic(key) => Zeroizing::new(crypto::ec_public_key_info(key)?),
            KeyMaterial::RsaPrivate(key) => crypto::rsa_private_to_pkcs8(key)?,
            KeyMaterial::RsaPublic(key) => Zeroizing::new(crypto::rsa_public_key_info(key)?),
        })
    }

    fn attribute(&self, attribute: Attribute) -> TokenResult<Vec<u8>> {
        let missing = || err(ReturnCode::ATTRIBUTE_TYPE_INVALID, format!("object has no {:?}", attribute));
        match attribute {
            Attribute::PublicKeyInfo => match &self.material {
                KeyMaterial::EcPrivate(key) => Ok(crypto::ec_public_key_info(&key.public_key())?),
                KeyMaterial::EcPublic(key) => Ok(crypto::ec_public_key_info(key)?),
                KeyMaterial::RsaPrivate(key) => Ok(crypto::rsa_public_key_info(&key.to_public_key())?),
                KeyMaterial::RsaPublic(key) => Ok(crypto::rsa_public_key_info(key)?),
                KeyMaterial::Secret(_) => Err(missing()),
            },
            Attribute::EcPoint => match &self.material {
                KeyMaterial::EcPrivate(key) => Ok(crypto::ec_point_der(&key.public_key())),
                KeyMaterial::EcPublic(key) => Ok(crypto::ec_point_der(key)),
                _ => Err(missing()),
            },
            Attribute::KeyBlockHeader => self
                .key_block_header
                .as_ref()
                .map(|h| h.as_bytes().to_vec())
                .ok_or_else(missing),
            Attribute::Label => self.label.as_ref().map(|l| l.as_bytes().to_vec()).ok_or_else(missing),
        }
    }
}

fn check_aes_len(len: usize) -> TokenResult<()> {
    match len {
        16 | 24 | 32 => Ok(()),
        n => Err(err(ReturnCode::KEY_SIZE_RANGE, format!("{} bytes is not an AES key size", n))),
    }
}

/// Build an object from an imported value
fn import_object(template: &KeyTemplate, value: &[u8]) -> TokenResult<KeyObject> {
    let class = template
        .class
        .ok_or_else(|| err(ReturnCode::TEMPLATE_INCOMPLETE, "object class missing"))?;
    let key_type = template
        .key_type
        .ok_or_else(|| err(ReturnCode::TEMPLATE_INCOMPLETE, "key type missing"))?;

    let material = match (class, key_type) {
        (ObjectClass::SecretKey, KeyType::Aes) => {
            check_aes_len(value.len())?;
            KeyMaterial::Secret(SecureMemory::from_slice(value))
        }
        (ObjectClass::SecretKey, KeyType::GenericSecret) => {
            if value.is_empty() {
                return Err(err(ReturnCode::KEY_SIZE_RANGE, "empty secret"));
            }
            KeyMaterial::Secret(SecureMemory::from_slice(value))
        }
        (ObjectClass::PrivateKey, KeyType::Ec) => KeyMaterial::EcPrivate(crypto::ec_private_from_pkcs8(value)?),
        (ObjectClass::PublicKey, KeyType::Ec) => KeyMaterial::EcPublic(crypto::ec_public_from_spki(value)?),
        (ObjectClass::PrivateKey, KeyType::Rsa) => {
            KeyMaterial::RsaPrivate(Box::new(crypto::rsa_private_from_pkcs8(value)?))
        }
        (ObjectClass::PublicKey, KeyType::Rsa) => {
            KeyMaterial::RsaPublic(Box::new(crypto::rsa_public_from_spki(value)?))
        }
        (class, key_type) => {
            return Err(err(
                ReturnCode::TEMPLATE_INCONSISTENT,
                format!("cannot hold a {:?} {:?}", key_type, class),
            ))
        }
    };
    if let Some(len) = template.value_len {
        if let KeyMaterial::Secret(secret) = &material {
            if secret.len() != len {
                return Err(err(ReturnCode::TEMPLATE_INCONSISTENT, "value length does not match the value"));
            }
        }
    }
    Ok(KeyObject::new(class, key_type, template, material))
}

/// Build a secret key object from derived bytes
fn derived_secret(template: &KeyTemplate, value: &[u8]) -> TokenResult<KeyObject> {
    if template.class.map_or(false, |c| c != ObjectClass::SecretKey) {
        return Err(err(ReturnCode::TEMPLATE_INCONSISTENT, "derived objects are secret keys"));
    }
    let key_type = template.key_type.unwrap_or(KeyType::GenericSecret);
    if key_type == KeyType::Aes {
        check_aes_len(value.len())?;
    }
    Ok(KeyObject::new(
        ObjectClass::SecretKey,
        key_type,
        template,
        KeyMaterial::Secret(SecureMemory::from_slice(value)),
    ))
}

fn required_len(template: &KeyTemplate) -> TokenResult<usize> {
    template
        .value_len
        .filter(|len| *len > 0)
        .ok_or_else(|| err(ReturnCode::TEMPLATE_INCOMPLETE, "value length missing"))
}

/// Objects shared by every session of a module
#[derive(Default)]
struct ObjectStore {
    objects: HashMap<u64, KeyObject>,
    next_handle: u64,
}

impl ObjectStore {
    fn allocate(&mut self) -> ObjectHandle {
        self.next_handle += 1;
        ObjectHandle(self.next_handle)
    }
}

fn lock(store: &Mutex<ObjectStore>) -> TokenResult<MutexGuard<'_, ObjectStore>> {
    store
        .lock()
        .map_err(|_| err(ReturnCode::GENERAL_ERROR, "token store lock poisoned"))
}

/// In-memory token exposing a single slot
#[derive(Clone)]
pub struct SoftTokenModule {
    slot: u64,
    store: Arc<Mutex<ObjectStore>>,
}

impl Default for SoftTokenModule {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SoftTokenModule {
    /// Empty token on `slot`
    pub fn new(slot: u64) -> Self {
        SoftTokenModule {
            slot,
            store: Arc::new(Mutex::new(ObjectStore::default())),
        }
    }

    /// Slot this token answers on
    pub fn slot(&self) -> u64 {
        self.slot
    }

    /// Import a persistent object described by `template`
    pub fn import(&self, template: &KeyTemplate) -> TokenResult<ObjectHandle> {
        let value = template
            .value
            .as_ref()
            .ok_or_else(|| err(ReturnCode::TEMPLATE_INCOMPLETE, "key value missing"))?;
        let mut object = import_object(template, value)?;
        object.persistent = true;

        let mut store = lock(&self.store)?;
        let handle = store.allocate();
        store.objects.insert(handle.0, object);
        log::info!("Provisioned token object {} '{}'", handle, template.label.as_deref().unwrap_or(""));
        Ok(handle)
    }

    /// Provision a persistent AES key
    pub fn with_aes_key(self, label: &str, value: &[u8], usage: KeyUsage) -> TokenResult<Self> {
        self.import(
            &KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
                .with_label(label)
                .with_value(value)
                .with_usage(usage),
        )?;
        Ok(self)
    }

    /// Provision a persistent secp256r1 key pair from its PKCS#8 private key
    pub fn with_ec_key_pair(self, label: &str, pkcs8: &[u8]) -> TokenResult<Self> {
        let secret = crypto::ec_private_from_pkcs8(pkcs8)?;
        let spki = crypto::ec_public_key_info(&secret.public_key())?;
        self.import(
            &KeyTemplate::new(ObjectClass::PrivateKey, KeyType::Ec)
                .with_label(label)
                .with_value(pkcs8)
                .with_usage(KeyUsage::SIGN | KeyUsage::DERIVE),
        )?;
        self.import(
            &KeyTemplate::new(ObjectClass::PublicKey, KeyType::Ec)
                .with_label(label)
                .with_value(&spki)
                .with_usage(KeyUsage::VERIFY),
        )?;
        Ok(self)
    }

    /// Provision a persistent RSA key pair from its PKCS#8 private key
    pub fn with_rsa_key_pair(self, label: &str, pkcs8: &[u8]) -> TokenResult<Self> {
        let private = crypto::rsa_private_from_pkcs8(pkcs8)?;
        let spki = crypto::rsa_public_key_info(&private.to_public_key())?;
        self.import(
            &KeyTemplate::new(ObjectClass::PrivateKey, KeyType::Rsa)
                .with_label(label)
                .with_value(pkcs8)
                .with_usage(KeyUsage::SIGN),
        )?;
        self.import(
            &KeyTemplate::new(ObjectClass::PublicKey, KeyType::Rsa)
                .with_label(label)
                .with_value(&spki)
                .with_usage(KeyUsage::VERIFY),
        )?;
        Ok(self)
    }

    /// Number of persistent objects
    pub fn object_count(&self) -> usize {
        lock(&self.store).map(|store| store.objects.len()).unwrap_or(0)
    }
}

impl TokenModule for SoftTokenModule {
    type Session = SoftSession;

    fn open_session(&self, slot: u64) -> TokenResult<SoftSession> {
        if slot != self.slot {
            return Err(err(ReturnCode::SLOT_ID_INVALID, format!("no slot {}", slot)));
        }
        log::info!("Soft token session opened on slot {}", slot);
        Ok(SoftSession {
            store: Arc::clone(&self.store),
            objects: HashMap::new(),
            sign: None,
            verify: None,
            digest: None,
            closed: false,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Cmac,
    Ecdsa,
}

/// Active multi-part sign or verify operation
struct Operation {
    kind: OperationKind,
    key: KeyObject,
    data: Zeroizing<Vec<u8>>,
}

/// Session on a [`SoftTokenModule`]
pub struct SoftSession {
    store: Arc<Mutex<ObjectStore>>,
    objects: HashMap<u64, KeyObject>,
    sign: Option<Operation>,
    verify: Option<Operation>,
    digest: Option<Sha256>,
    closed: bool,
}

impl SoftSession {
    /// Number of live session objects
    pub fn session_object_count(&self) -> usize {
        self.objects.len()
    }

    fn ensure_open(&self) -> TokenResult<()> {
        if self.closed {
            return Err(err(ReturnCode::SESSION_CLOSED, "session is closed"));
        }
        Ok(())
    }

    fn object(&self, handle: ObjectHandle, code: ReturnCode) -> TokenResult<KeyObject> {
        self.ensure_open()?;
        if let Some(object) = self.objects.get(&handle.0) {
            return Ok(object.clone());
        }
        lock(&self.store)?
            .objects
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| err(code, format!("no object {}", handle)))
    }

    fn key(&self, handle: ObjectHandle) -> TokenResult<KeyObject> {
        self.object(handle, ReturnCode::KEY_HANDLE_INVALID)
    }

    fn insert(&mut self, object: KeyObject) -> TokenResult<ObjectHandle> {
        let mut store = lock(&self.store)?;
        let handle = store.allocate();
        log::debug!(
            "Created {} {:?} {:?} object {}",
            if object.persistent { "token" } else { "session" },
            object.key_type,
            object.class,
            handle
        );
        if object.persistent {
            store.objects.insert(handle.0, object);
        } else {
            drop(store);
            self.objects.insert(handle.0, object);
        }
        Ok(handle)
    }

    fn start(&self, mechanism: &Mechanism<'_>, key: ObjectHandle, verify: bool) -> TokenResult<Operation> {
        let key = self.key(key)?;
        let kind = match mechanism {
            Mechanism::AesCmac => {
                key.aes_key()?;
                if verify {
                    key.require(key.usage.verify || key.usage.sign, "CMAC verification")?;
                } else {
                    key.require(key.usage.sign, "CMAC generation")?;
                }
                OperationKind::Cmac
            }
            Mechanism::EcdsaSha256 => {
                if verify {
                    match key.material {
                        KeyMaterial::EcPublic(_) => {}
                        _ => return Err(err(ReturnCode::KEY_TYPE_INCONSISTENT, "not an EC public key")),
                    }
                    key.require(key.usage.verify, "verification")?;
                } else {
                    key.ec_private()?;
                    key.require(key.usage.sign, "signing")?;
                }
                OperationKind::Ecdsa
            }
            other => {
                return Err(err(
                    ReturnCode::MECHANISM_INVALID,
                    format!("{} cannot sign or verify", other.name()),
                ))
            }
        };
        Ok(Operation {
            kind,
            key,
            data: Zeroizing::new(Vec::new()),
        })
    }
}

fn not_initialized(what: &str) -> TokenError {
    err(ReturnCode::OPERATION_NOT_INITIALIZED, format!("no active {} operation", what))
}

impl CryptoToken for SoftSession {
    fn find_objects(&mut self, template: &KeyTemplate, max: usize) -> TokenResult<Vec<ObjectHandle>> {
        self.ensure_open()?;
        let store = lock(&self.store)?;
        let mut found: Vec<ObjectHandle> = store
            .objects
            .iter()
            .chain(self.objects.iter())
            .filter(|(_, o)| template.matches(o.class, o.key_type, o.label.as_deref()))
            .map(|(h, _)| ObjectHandle(*h))
            .collect();
        found.sort();
        found.truncate(max);
        Ok(found)
    }

    fn get_attribute(&mut self, object: ObjectHandle, attribute: Attribute) -> TokenResult<Vec<u8>> {
        self.object(object, ReturnCode::OBJECT_HANDLE_INVALID)?.attribute(attribute)
    }

    fn generate_random(&mut self, buffer: &mut [u8]) -> TokenResult<()> {
        self.ensure_open()?;
        OsRng.fill_bytes(buffer);
        Ok(())
    }

    fn generate_key(&mut self, mechanism: &Mechanism<'_>, template: &KeyTemplate) -> TokenResult<ObjectHandle> {
        self.ensure_open()?;
        match mechanism {
            Mechanism::AesKeyGen => {
                let len = required_len(template)?;
                check_aes_len(len)?;
                let mut value = SecureMemory::new(len);
                OsRng.fill_bytes(value.as_mut());
                let object = KeyObject::new(ObjectClass::SecretKey, KeyType::Aes, template, KeyMaterial::Secret(value));
                self.insert(object)
            }
            other => Err(err(
                ReturnCode::MECHANISM_INVALID,
                format!("{} does not generate secret keys", other.name()),
            )),
        }
    }

    fn generate_key_pair(
        &mut self,
        mechanism: &Mechanism<'_>,
        public_template: &KeyTemplate,
        private_template: &KeyTemplate,
    ) -> TokenResult<(ObjectHandle, ObjectHandle)> {
        self.ensure_open()?;
        let (key_type, public, private) = match mechanism {
            Mechanism::EcKeyPairGen { curve: Curve::Secp256r1 } => {
                let secret = crypto::generate_ec_key();
                (
                    KeyType::Ec,
                    KeyMaterial::EcPublic(secret.public_key()),
                    KeyMaterial::EcPrivate(secret),
                )
            }
            Mechanism::RsaKeyPairGen {
                modulus_bits,
                public_exponent,
            } => {
                if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(modulus_bits) {
                    return Err(err(
                        ReturnCode::KEY_SIZE_RANGE,
                        format!("RSA modulus of {} bits", modulus_bits),
                    ));
                }
                let key = crypto::generate_rsa_key(*modulus_bits, public_exponent)?;
                (
                    KeyType::Rsa,
                    KeyMaterial::RsaPublic(Box::new(key.to_public_key())),
                    KeyMaterial::RsaPrivate(Box::new(key)),
                )
            }
            other => {
                return Err(err(
                    ReturnCode::MECHANISM_INVALID,
                    format!("{} does not generate key pairs", other.name()),
                ))
            }
        };
        let public = self.insert(KeyObject::new(ObjectClass::PublicKey, key_type, public_template, public))?;
        let private = self.insert(KeyObject::new(ObjectClass::PrivateKey, key_type, private_template, private))?;
        Ok((public, private))
    }

    fn create_object(&mut self, template: &KeyTemplate) -> TokenResult<ObjectHandle> {
        self.ensure_open()?;
        let value = template
            .value
            .as_ref()
            .ok_or_else(|| err(ReturnCode::TEMPLATE_INCOMPLETE, "key value missing"))?;
        let object = import_object(template, value)?;
        self.insert(object)
    }

    fn derive_key(
        &mut self,
        mechanism: &Mechanism<'_>,
        base_key: ObjectHandle,
        template: &KeyTemplate,
    ) -> TokenResult<ObjectHandle> {
        let base = self.key(base_key)?;
        base.require(base.usage.derive, "derivation")?;

        let value = match mechanism {
            Mechanism::Ecdh1Derive {
                kdf,
                shared_data,
                public_data,
            } => {
                let secret = base.ec_private()?;
                let peer = crypto::ec_public_from_point(public_data)
                    .map_err(|e| err(ReturnCode::MECHANISM_PARAM_INVALID, e.to_string()))?;
                let len = required_len(template)?;
                match kdf {
                    EcKdf::Sha384 => crypto::ecdh_x963_sha384(secret, &peer, shared_data, len)?,
                    EcKdf::Null => {
                        let z = crypto::ecdh(secret, &peer);
                        if len > z.len() || !shared_data.is_empty() {
                            return Err(err(ReturnCode::MECHANISM_PARAM_INVALID, "raw ECDH output is 32 bytes"));
                        }
                        Zeroizing::new(z[..len].to_vec())
                    }
                }
            }
            Mechanism::ExtractKeyFromKey { bit_offset } => {
                if bit_offset % 8 != 0 {
                    return Err(err(ReturnCode::MECHANISM_PARAM_INVALID, "bit offset not byte aligned"));
                }
                let len = required_len(template)?;
                let part = base
                    .secret()?
                    .slice(bit_offset / 8, len)
                    .map_err(|e| err(ReturnCode::MECHANISM_PARAM_INVALID, e.to_string()))?;
                Zeroizing::new(part.as_ref().to_vec())
            }
            Mechanism::AesEcbEncryptData { data } => {
                let key = base.aes_key()?;
                let encrypted = aes_ecb_encrypt(key.as_ref(), data)
                    .map_err(|e| err(ReturnCode::MECHANISM_PARAM_INVALID, e.to_string()))?;
                let mut value = Zeroizing::new(encrypted);
                if let Some(len) = template.value_len {
                    if len == 0 || len > value.len() {
                        return Err(err(ReturnCode::TEMPLATE_INCONSISTENT, "value length exceeds derived data"));
                    }
                    value.truncate(len);
                }
                value
            }
            other => {
                return Err(err(
                    ReturnCode::MECHANISM_INVALID,
                    format!("{} does not derive keys", other.name()),
                ))
            }
        };
        let object = derived_secret(template, &value)?;
        self.insert(object)
    }

    fn wrap_key(
        &mut self,
        mechanism: &Mechanism<'_>,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> TokenResult<Vec<u8>> {
        let header = match mechanism {
            Mechanism::KeyBlockWrap { header } => *header,
            other => {
                return Err(err(
                    ReturnCode::MECHANISM_INVALID,
                    format!("{} does not wrap keys", other.name()),
                ))
            }
        };
        let wrapping = self.key(wrapping_key)?;
        wrapping.require(wrapping.usage.wrap, "wrapping")?;
        let kbpk = wrapping
            .aes_key()
            .map_err(|e| err(ReturnCode::WRAPPING_KEY_TYPE_INCONSISTENT, e.message))?;
        let subject = self.key(key)?;

        let header = header
            .or(subject.key_block_header.as_deref())
            .ok_or_else(|| err(ReturnCode::MECHANISM_PARAM_INVALID, "no key block header"))?
            .parse::<KeyBlockHeader>()
            .map_err(|e| err(ReturnCode::MECHANISM_PARAM_INVALID, e.to_string()))?;
        let value = subject.export()?;
        let keyblock = keyblock::wrap(kbpk.as_ref(), &header, &value)
            .map_err(|e| err(ReturnCode::FUNCTION_FAILED, e.to_string()))?;
        Ok(keyblock.into_bytes())
    }

    fn unwrap_key(
        &mut self,
        mechanism: &Mechanism<'_>,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &KeyTemplate,
    ) -> TokenResult<ObjectHandle> {
        let expected = match mechanism {
            Mechanism::KeyBlockWrap { header } => *header,
            other => {
                return Err(err(
                    ReturnCode::MECHANISM_INVALID,
                    format!("{} does not unwrap keys", other.name()),
                ))
            }
        };
        let unwrapping = self.key(unwrapping_key)?;
        unwrapping.require(unwrapping.usage.unwrap, "unwrapping")?;
        let kbpk = unwrapping
            .aes_key()
            .map_err(|e| err(ReturnCode::WRAPPING_KEY_TYPE_INCONSISTENT, e.message))?;

        let text = std::str::from_utf8(wrapped)
            .map_err(|_| err(ReturnCode::WRAPPED_KEY_INVALID, "key block is not ASCII"))?;
        let (header, value) =
            keyblock::unwrap(kbpk.as_ref(), text).map_err(|e| err(ReturnCode::WRAPPED_KEY_INVALID, e.to_string()))?;
        if let Some(expected) = expected {
            let expected = expected
                .parse::<KeyBlockHeader>()
                .map_err(|e| err(ReturnCode::MECHANISM_PARAM_INVALID, e.to_string()))?;
            if expected != header {
                return Err(err(
                    ReturnCode::WRAPPED_KEY_INVALID,
                    format!("key block header {} where {} expected", header, expected),
                ));
            }
        }

        let mut object = import_object(template, &value)?;
        object.key_block_header = Some(header.to_string());
        self.insert(object)
    }

    fn destroy_object(&mut self, object: ObjectHandle) -> TokenResult<()> {
        self.ensure_open()?;
        if self.objects.remove(&object.0).is_some() {
            log::debug!("Destroyed session object {}", object);
            return Ok(());
        }
        if lock(&self.store)?.objects.remove(&object.0).is_some() {
            log::debug!("Destroyed token object {}", object);
            return Ok(());
        }
        Err(err(ReturnCode::OBJECT_HANDLE_INVALID, format!("no object {}", object)))
    }

    fn sign_init(&mut self, mechanism: &Mechanism<'_>, key: ObjectHandle) -> TokenResult<()> {
        self.ensure_open()?;
        if self.sign.is_some() {
            return Err(err(ReturnCode::OPERATION_ACTIVE, "sign operation already active"));
        }
        self.sign = Some(self.start(mechanism, key, false)?);
        Ok(())
    }

    fn sign_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.ensure_open()?;
        let op = self.sign.as_mut().ok_or_else(|| not_initialized("sign"))?;
        op.data.extend_from_slice(data);
        Ok(())
    }

    fn sign_final(&mut self) -> TokenResult<Vec<u8>> {
        self.ensure_open()?;
        let op = self.sign.take().ok_or_else(|| not_initialized("sign"))?;
        match op.kind {
            OperationKind::Cmac => {
                let tag = aes_cmac(op.key.aes_key()?.as_ref(), &op.data)
                    .map_err(|e| err(ReturnCode::KEY_SIZE_RANGE, e.to_string()))?;
                Ok(tag.to_vec())
            }
            OperationKind::Ecdsa => Ok(crypto::ecdsa_sign(op.key.ec_private()?, &op.data)),
        }
    }

    fn verify_init(&mut self, mechanism: &Mechanism<'_>, key: ObjectHandle) -> TokenResult<()> {
        self.ensure_open()?;
        if self.verify.is_some() {
            return Err(err(ReturnCode::OPERATION_ACTIVE, "verify operation already active"));
        }
        self.verify = Some(self.start(mechanism, key, true)?);
        Ok(())
    }

    fn verify_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.ensure_open()?;
        let op = self.verify.as_mut().ok_or_else(|| not_initialized("verify"))?;
        op.data.extend_from_slice(data);
        Ok(())
    }

    fn verify_final(&mut self, signature: &[u8]) -> TokenResult<()> {
        self.ensure_open()?;
        let op = self.verify.take().ok_or_else(|| not_initialized("verify"))?;
        let valid = match (&op.kind, &op.key.material) {
            (OperationKind::Ecdsa, KeyMaterial::EcPublic(public)) => {
                if signature.len() != crypto::ECDSA_SIGNATURE_LEN {
                    return Err(err(ReturnCode::SIGNATURE_LEN_RANGE, "ECDSA signature is 64 bytes"));
                }
                crypto::ecdsa_verify(public, &op.data, signature)
            }
            (OperationKind::Ecdsa, _) => {
                return Err(err(ReturnCode::KEY_TYPE_INCONSISTENT, "not an EC public key"));
            }
            (OperationKind::Cmac, _) => {
                let tag = aes_cmac(op.key.aes_key()?.as_ref(), &op.data)
                    .map_err(|e| err(ReturnCode::KEY_SIZE_RANGE, e.to_string()))?;
                if signature.len() != tag.len() {
                    return Err(err(ReturnCode::SIGNATURE_LEN_RANGE, "AES-CMAC is 16 bytes"));
                }
                constant_time_eq(&tag, signature)
            }
        };
        if !valid {
            let what = match op.kind {
                OperationKind::Cmac => "AES-CMAC",
                OperationKind::Ecdsa => "ECDSA signature",
            };
            return Err(err(ReturnCode::SIGNATURE_INVALID, format!("{} mismatch", what)));
        }
        Ok(())
    }

    fn digest_init(&mut self, mechanism: &Mechanism<'_>) -> TokenResult<()> {
        self.ensure_open()?;
        if self.digest.is_some() {
            return Err(err(ReturnCode::OPERATION_ACTIVE, "digest operation already active"));
        }
        match mechanism {
            Mechanism::Sha256 => {
                self.digest = Some(Sha256::new());
                Ok(())
            }
            other => Err(err(
                ReturnCode::MECHANISM_INVALID,
                format!("{} is not a digest", other.name()),
            )),
        }
    }

    fn digest_update(&mut self, data: &[u8]) -> TokenResult<()> {
        self.ensure_open()?;
        self.digest
            .as_mut()
            .ok_or_else(|| not_initialized("digest"))?
            .update(data);
        Ok(())
    }

    fn digest_final(&mut self) -> TokenResult<Vec<u8>> {
        self.ensure_open()?;
        let hasher = self.digest.take().ok_or_else(|| not_initialized("digest"))?;
        Ok(hasher.finalize().to_vec())
    }

    fn encrypt(&mut self, mechanism: &Mechanism<'_>, key: ObjectHandle, data: &[u8]) -> TokenResult<Vec<u8>> {
        let key = self.key(key)?;
        match mechanism {
            Mechanism::AesEcb => {
                key.require(key.usage.encrypt, "encryption")?;
                aes_ecb_encrypt(key.aes_key()?.as_ref(), data).map_err(|e| err(ReturnCode::DATA_LEN_RANGE, e.to_string()))
            }
            other => Err(err(
                ReturnCode::MECHANISM_INVALID,
                format!("{} does not encrypt", other.name()),
            )),
        }
    }

    fn close(&mut self) -> TokenResult<()> {
        self.ensure_open()?;
        let dropped = self.objects.len();
        self.objects.clear();
        self.sign = None;
        self.verify = None;
        self.digest = None;
        self.closed = true;
        log::info!("Soft token session closed ({} session objects dropped)", dropped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SoftSession {
        SoftTokenModule::default().open_session(0).unwrap()
    }

    fn aes_template(usage: KeyUsage) -> KeyTemplate {
        KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
            .with_value(&[0u8; 32])
            .with_usage(usage)
    }

    #[test]
    fn test_slot_check() {
        let module = SoftTokenModule::new(3);
        assert_eq!(module.open_session(0).err().unwrap().code, ReturnCode::SLOT_ID_INVALID);
        assert!(module.open_session(3).is_ok());
    }

    #[test]
    fn test_cmac_key_check_value_vector() {
        let mut s = session();
        let key = s.create_object(&aes_template(KeyUsage::SIGN)).unwrap();
        s.sign_init(&Mechanism::AesCmac, key).unwrap();
        s.sign_update(&[0u8; 16]).unwrap();
        let mac = s.sign_final().unwrap();
        assert_eq!(hex::encode(&mac[..5]), "9211053c55");
    }

    #[test]
    fn test_usage_enforced() {
        let mut s = session();
        let key = s.create_object(&aes_template(KeyUsage::VERIFY)).unwrap();
        let e = s.sign_init(&Mechanism::AesCmac, key).unwrap_err();
        assert_eq!(e.code, ReturnCode::KEY_FUNCTION_NOT_PERMITTED);
        let e = s.encrypt(&Mechanism::AesEcb, key, &[0u8; 16]).unwrap_err();
        assert_eq!(e.code, ReturnCode::KEY_FUNCTION_NOT_PERMITTED);
    }

    #[test]
    fn test_single_active_operation() {
        let mut s = session();
        let key = s.create_object(&aes_template(KeyUsage::SIGN | KeyUsage::VERIFY)).unwrap();
        s.sign_init(&Mechanism::AesCmac, key).unwrap();
        assert_eq!(
            s.sign_init(&Mechanism::AesCmac, key).unwrap_err().code,
            ReturnCode::OPERATION_ACTIVE
        );
        // A verify may run alongside the sign
        s.verify_init(&Mechanism::AesCmac, key).unwrap();
        s.sign_update(b"abc").unwrap();
        let mac = s.sign_final().unwrap();
        s.verify_update(b"abc").unwrap();
        s.verify_final(&mac).unwrap();
        assert_eq!(s.sign_update(b"x").unwrap_err().code, ReturnCode::OPERATION_NOT_INITIALIZED);
    }

    #[test]
    fn test_cmac_mismatch_is_signature_invalid() {
        let mut s = session();
        let key = s.create_object(&aes_template(KeyUsage::VERIFY)).unwrap();
        s.verify_init(&Mechanism::AesCmac, key).unwrap();
        s.verify_update(b"transcript").unwrap();
        assert_eq!(s.verify_final(&[0u8; 16]).unwrap_err().code, ReturnCode::SIGNATURE_INVALID);

        s.verify_init(&Mechanism::AesCmac, key).unwrap();
        assert_eq!(s.verify_final(&[0u8; 15]).unwrap_err().code, ReturnCode::SIGNATURE_LEN_RANGE);
    }

    #[test]
    fn test_digest() {
        let mut s = session();
        s.digest_init(&Mechanism::Sha256).unwrap();
        s.digest_update(b"a").unwrap();
        s.digest_update(b"bc").unwrap();
        assert_eq!(
            hex::encode(s.digest_final().unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_extract_key_from_key() {
        let mut s = session();
        let master: Vec<u8> = (0u8..96).collect();
        let base = s
            .create_object(
                &KeyTemplate::new(ObjectClass::SecretKey, KeyType::GenericSecret)
                    .with_value(&master)
                    .with_usage(KeyUsage::DERIVE),
            )
            .unwrap();
        let template = KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
            .with_value_len(32)
            .with_usage(KeyUsage::ENCRYPT);
        let third = s
            .derive_key(&Mechanism::ExtractKeyFromKey { bit_offset: 512 }, base, &template)
            .unwrap();
        let expected = s
            .create_object(
                &KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
                    .with_value(&master[64..])
                    .with_usage(KeyUsage::ENCRYPT),
            )
            .unwrap();
        assert_eq!(
            s.encrypt(&Mechanism::AesEcb, third, &[0u8; 16]).unwrap(),
            s.encrypt(&Mechanism::AesEcb, expected, &[0u8; 16]).unwrap()
        );

        assert_eq!(
            s.derive_key(&Mechanism::ExtractKeyFromKey { bit_offset: 4 }, base, &template)
                .unwrap_err()
                .code,
            ReturnCode::MECHANISM_PARAM_INVALID
        );
        assert_eq!(
            s.derive_key(&Mechanism::ExtractKeyFromKey { bit_offset: 576 }, base, &template)
                .unwrap_err()
                .code,
            ReturnCode::MECHANISM_PARAM_INVALID
        );
        // Only DERIVE keys serve as a base
        assert_eq!(
            s.derive_key(&Mechanism::ExtractKeyFromKey { bit_offset: 0 }, third, &template)
                .unwrap_err()
                .code,
            ReturnCode::KEY_FUNCTION_NOT_PERMITTED
        );
    }

    #[test]
    fn test_wrap_unwrap_through_token() {
        let mut s = session();
        let kbpk = s
            .create_object(&aes_template(KeyUsage::WRAP | KeyUsage::UNWRAP))
            .unwrap();
        let subject = s
            .create_object(
                &KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
                    .with_value(&[0x42; 16])
                    .with_usage(KeyUsage::ENCRYPT),
            )
            .unwrap();
        let block = s
            .wrap_key(&Mechanism::KeyBlockWrap { header: Some("D0016D0AE00N0020") }, kbpk, subject)
            .unwrap();
        let (_, clear) = keyblock::unwrap(&[0u8; 32], std::str::from_utf8(&block).unwrap()).unwrap();
        assert_eq!(&clear[..], &[0x42; 16]);

        let template = KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes).with_usage(KeyUsage::ENCRYPT);
        let imported = s
            .unwrap_key(&Mechanism::KeyBlockWrap { header: None }, kbpk, &block, &template)
            .unwrap();
        assert_eq!(
            s.get_attribute(imported, Attribute::KeyBlockHeader).unwrap(),
            b"D0016D0AE00N0020".to_vec()
        );
        let a = s.encrypt(&Mechanism::AesEcb, subject, &[0u8; 16]).unwrap();
        let b = s.encrypt(&Mechanism::AesEcb, imported, &[0u8; 16]).unwrap();
        assert_eq!(a, b);

        let wrong_header = s.unwrap_key(
            &Mechanism::KeyBlockWrap { header: Some("D0016K1AD00N0000") },
            kbpk,
            &block,
            &template,
        );
        assert_eq!(wrong_header.unwrap_err().code, ReturnCode::WRAPPED_KEY_INVALID);

        let before = s.session_object_count();
        let mut tampered = block.clone();
        tampered[20] = if tampered[20] == b'0' { b'1' } else { b'0' };
        let e = s
            .unwrap_key(&Mechanism::KeyBlockWrap { header: None }, kbpk, &tampered, &template)
            .unwrap_err();
        assert_eq!(e.code, ReturnCode::WRAPPED_KEY_INVALID);
        assert_eq!(s.session_object_count(), before);
    }

    #[test]
    fn test_ec_key_pair_attributes() {
        let mut s = session();
        let (public, private) = s
            .generate_key_pair(
                &Mechanism::EcKeyPairGen { curve: Curve::Secp256r1 },
                &KeyTemplate::new(ObjectClass::PublicKey, KeyType::Ec).with_usage(KeyUsage::VERIFY),
                &KeyTemplate::new(ObjectClass::PrivateKey, KeyType::Ec).with_usage(KeyUsage::SIGN),
            )
            .unwrap();
        let point = s.get_attribute(public, Attribute::EcPoint).unwrap();
        assert_eq!(point.len(), 67);
        let info = s.get_attribute(private, Attribute::PublicKeyInfo).unwrap();
        assert_eq!(info.len(), 91);
        assert_eq!(&info[26..], &point[2..]);

        s.sign_init(&Mechanism::EcdsaSha256, private).unwrap();
        s.sign_update(b"data").unwrap();
        let signature = s.sign_final().unwrap();
        s.verify_init(&Mechanism::EcdsaSha256, public).unwrap();
        s.verify_update(b"data").unwrap();
        s.verify_final(&signature).unwrap();
    }

    #[test]
    fn test_persistent_objects_survive_sessions() {
        let module = SoftTokenModule::default()
            .with_aes_key("MFG_RESET_MASTER", &[7u8; 32], KeyUsage::ENCRYPT)
            .unwrap();
        let mut first = module.open_session(0).unwrap();
        first.create_object(&aes_template(KeyUsage::SIGN)).unwrap();
        assert_eq!(first.session_object_count(), 1);
        first.close().unwrap();
        assert_eq!(first.session_object_count(), 0);
        assert_eq!(first.find_objects(&KeyTemplate::default(), 10).unwrap_err().code, ReturnCode::SESSION_CLOSED);

        let mut second = module.open_session(0).unwrap();
        let search = KeyTemplate::search(ObjectClass::SecretKey, KeyType::Aes, "MFG_RESET_MASTER");
        assert_eq!(second.find_objects(&search, 2).unwrap().len(), 1);
        assert_eq!(second.find_objects(&KeyTemplate::default(), 10).unwrap().len(), 1);
        assert_eq!(module.object_count(), 1);
    }
}
