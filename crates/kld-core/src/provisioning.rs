//! Root provisioning service
//!
//! One-shot key ceremony flows run at manufacturing or bring-up time: import
//! of the root key block protection key, generation (or, with the
//! `debug-keys` feature, import of fixed test vectors) of the long-lived
//! signing, authentication and manufacturing reset keys, and their export
//! under the root key. Application signing key transport to a device also
//! lives here.

use crate::derivation::{aes_key_check_value, derive_reincarnation_key};
use crate::hsm::find_key;
use crate::keyblock::{headers, wrap_on_token};
use crate::token::{
    Attribute, CryptoToken, Curve, KeyScope, KeyTemplate, KeyType, KeyUsage, Mechanism, ObjectClass, ObjectHandle,
};
use crate::types::{to_colon_hex, RootHsmKeys, AES_256_KEY_LEN};
use crate::{Hsm, KldResult};

/// RSA modulus size of the firmware and application signing keys
pub const SIGNING_KEY_BITS: usize = 3072;

/// Public exponent of the signing keys (65537)
pub const SIGNING_KEY_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

const FW_SIGNING_LABEL: &str = "FW_SIGNING";
const APP_SIGNING_LABEL: &str = "APP_SIGNING";

/// Fixed key material for development devices
#[cfg(feature = "debug-keys")]
pub mod debug_keys {
    /// Firmware signing private key, PKCS#8 DER
    pub const FW_SIGNING_PRIVATE: &[u8] = include_bytes!("../keys/debug/fw_signing_private.der");
    /// Firmware validation public key, SPKI DER
    pub const FW_SIGNING_PUBLIC: &[u8] = include_bytes!("../keys/debug/fw_signing_public.der");
    /// Application signing private key, PKCS#8 DER
    pub const APP_SIGNING_PRIVATE: &[u8] = include_bytes!("../keys/debug/app_signing_private.der");
    /// Application validation public key, SPKI DER
    pub const APP_SIGNING_PUBLIC: &[u8] = include_bytes!("../keys/debug/app_signing_public.der");
    /// KLD authentication private key, PKCS#8 DER
    pub const KLD_AUTH_PRIVATE: &[u8] = include_bytes!("../keys/debug/kld_auth_private.der");
    /// KLD authentication public key, SPKI DER
    pub const KLD_AUTH_PUBLIC: &[u8] = include_bytes!("../keys/debug/kld_auth_public.der");
    /// Manufacturing reset master key
    pub const MFG_RESET_MASTER: [u8; 32] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11,
        0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F,
    ];
}

/// Handles of the keys exported by the ceremony
struct CeremonyKeys {
    fw_signing: (ObjectHandle, ObjectHandle),
    app_signing: (ObjectHandle, ObjectHandle),
    kld_auth: (ObjectHandle, ObjectHandle),
    mfg_reset_master: ObjectHandle,
}

fn kbpk_template(label: &str, value: &[u8], persistent: bool) -> KeyTemplate {
    KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
        .with_label(label)
        .with_value(value)
        .persistent(persistent)
        .with_usage(KeyUsage::WRAP | KeyUsage::UNWRAP)
        .with_key_block_header(headers::KBPK_IMPORT)
}

fn rsa_templates(label: &str, persistent: bool) -> (KeyTemplate, KeyTemplate) {
    (
        KeyTemplate::new(ObjectClass::PublicKey, KeyType::Rsa)
            .with_label(label)
            .persistent(persistent)
            .with_usage(KeyUsage::VERIFY),
        KeyTemplate::new(ObjectClass::PrivateKey, KeyType::Rsa)
            .with_label(label)
            .persistent(persistent)
            .with_usage(KeyUsage::SIGN),
    )
}

fn generate_rsa_pair<S: CryptoToken + ?Sized>(
    scope: &mut KeyScope<'_, S>,
    label: &str,
) -> KldResult<(ObjectHandle, ObjectHandle)> {
    let (public_template, private_template) = rsa_templates(label, false);
    let (public, private) = scope.generate_key_pair(
        &Mechanism::RsaKeyPairGen {
            modulus_bits: SIGNING_KEY_BITS,
            public_exponent: &SIGNING_KEY_EXPONENT,
        },
        &public_template,
        &private_template,
    )?;
    Ok((scope.track(public), scope.track(private)))
}

fn export_ceremony_keys<S: CryptoToken + ?Sized>(
    scope: &mut KeyScope<'_, S>,
    kbpk: ObjectHandle,
    root_key_kcv: String,
    keys: CeremonyKeys,
) -> KldResult<RootHsmKeys> {
    let firmware_validation_key = scope.get_attribute(keys.fw_signing.0, Attribute::PublicKeyInfo)?;
    let kld_auth_public_key = scope.get_attribute(keys.kld_auth.0, Attribute::PublicKeyInfo)?;

    let bundle = RootHsmKeys {
        root_key_kcv,
        firmware_validation_key: to_colon_hex(&firmware_validation_key),
        firmware_signing_keyblock: wrap_on_token(&mut **scope, headers::RSA_PRIVATE_EXPORT, kbpk, keys.fw_signing.1)?,
        application_validation_keyblock: wrap_on_token(
            &mut **scope,
            headers::PUBLIC_KEY_EXPORT,
            kbpk,
            keys.app_signing.0,
        )?,
        application_signing_keyblock: wrap_on_token(
            &mut **scope,
            headers::RSA_PRIVATE_EXPORT,
            kbpk,
            keys.app_signing.1,
        )?,
        kld_auth_public_key: to_colon_hex(&kld_auth_public_key),
        kld_auth_private_keyblock: wrap_on_token(&mut **scope, headers::EC_PRIVATE_EXPORT, kbpk, keys.kld_auth.1)?,
        mfg_reset_master_keyblock: wrap_on_token(
            &mut **scope,
            headers::AES_MASTER_EXPORT,
            kbpk,
            keys.mfg_reset_master,
        )?,
    };
    Ok(bundle)
}

impl<S: CryptoToken> Hsm<S> {
    /// Key ceremony: generate the root key set and export it under `root_kbpk`
    ///
    /// Every key created here is a session object and is destroyed before
    /// this returns.
    pub fn generate_root_hsm_keys(&mut self, root_kbpk: &[u8; AES_256_KEY_LEN]) -> KldResult<RootHsmKeys> {
        let kcv = aes_key_check_value(&mut self.session, root_kbpk)?;
        let mut scope = KeyScope::new(&mut self.session);
        let kbpk_template = kbpk_template(&self.labels.root_kbpk, root_kbpk, false);
        let kbpk = scope.track_with(|t| t.create_object(&kbpk_template))?;

        let fw_signing = generate_rsa_pair(&mut scope, FW_SIGNING_LABEL)?;
        let app_signing = generate_rsa_pair(&mut scope, APP_SIGNING_LABEL)?;

        let kld_auth_public_template = KeyTemplate::new(ObjectClass::PublicKey, KeyType::Ec)
            .with_label(self.labels.kld_auth.as_str())
            .with_usage(KeyUsage::VERIFY);
        let kld_auth_private_template = KeyTemplate::new(ObjectClass::PrivateKey, KeyType::Ec)
            .with_label(self.labels.kld_auth.as_str())
            .with_usage(KeyUsage::SIGN);
        let (kld_public, kld_private) = scope.generate_key_pair(
            &Mechanism::EcKeyPairGen { curve: Curve::Secp256r1 },
            &kld_auth_public_template,
            &kld_auth_private_template,
        )?;
        let kld_auth = (scope.track(kld_public), scope.track(kld_private));

        let mfg_template = KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
            .with_label(self.labels.mfg_reset_master.as_str())
            .with_value_len(AES_256_KEY_LEN)
            .with_usage(KeyUsage::ENCRYPT);
        let mfg_reset_master = scope.track_with(|t| t.generate_key(&Mechanism::AesKeyGen, &mfg_template))?;

        let keys = CeremonyKeys {
            fw_signing,
            app_signing,
            kld_auth,
            mfg_reset_master,
        };
        let bundle = export_ceremony_keys(&mut scope, kbpk, to_colon_hex(&kcv), keys)?;
        log::info!("Generated root key set, root KBPK KCV {}", bundle.root_key_kcv);
        Ok(bundle)
    }

    /// Debug key ceremony: export the fixed development key set under `root_kbpk`
    #[cfg(feature = "debug-keys")]
    pub fn create_debug_root_hsm_keys(&mut self, root_kbpk: &[u8; AES_256_KEY_LEN]) -> KldResult<RootHsmKeys> {
        let kcv = aes_key_check_value(&mut self.session, root_kbpk)?;
        let mut scope = KeyScope::new(&mut self.session);
        let kbpk_template = kbpk_template(&self.labels.root_kbpk, root_kbpk, false);
        let kbpk = scope.track_with(|t| t.create_object(&kbpk_template))?;

        let mut import = |class: ObjectClass, key_type: KeyType, label: &str, value: &[u8]| {
            let template = KeyTemplate::new(class, key_type).with_label(label).with_value(value);
            scope.track_with(|t| t.create_object(&template))
        };
        let fw_signing = (
            import(ObjectClass::PublicKey, KeyType::Rsa, FW_SIGNING_LABEL, debug_keys::FW_SIGNING_PUBLIC)?,
            import(ObjectClass::PrivateKey, KeyType::Rsa, FW_SIGNING_LABEL, debug_keys::FW_SIGNING_PRIVATE)?,
        );
        let app_signing = (
            import(ObjectClass::PublicKey, KeyType::Rsa, APP_SIGNING_LABEL, debug_keys::APP_SIGNING_PUBLIC)?,
            import(ObjectClass::PrivateKey, KeyType::Rsa, APP_SIGNING_LABEL, debug_keys::APP_SIGNING_PRIVATE)?,
        );
        let kld_auth = (
            import(ObjectClass::PublicKey, KeyType::Ec, &self.labels.kld_auth, debug_keys::KLD_AUTH_PUBLIC)?,
            import(ObjectClass::PrivateKey, KeyType::Ec, &self.labels.kld_auth, debug_keys::KLD_AUTH_PRIVATE)?,
        );
        let mfg_reset_master = import(
            ObjectClass::SecretKey,
            KeyType::Aes,
            &self.labels.mfg_reset_master,
            &debug_keys::MFG_RESET_MASTER,
        )?;

        let keys = CeremonyKeys {
            fw_signing,
            app_signing,
            kld_auth,
            mfg_reset_master,
        };
        let bundle = export_ceremony_keys(&mut scope, kbpk, to_colon_hex(&kcv), keys)?;
        log::info!("Exported debug root key set, root KBPK KCV {}", bundle.root_key_kcv);
        Ok(bundle)
    }

    /// Generate an RSA-3072 signing key pair, returning `(public, private)`
    pub fn create_signing_key_pair(&mut self, label: &str, persistent: bool) -> KldResult<(ObjectHandle, ObjectHandle)> {
        let (public_template, private_template) = rsa_templates(label, persistent);
        let pair = self.session.generate_key_pair(
            &Mechanism::RsaKeyPairGen {
                modulus_bits: SIGNING_KEY_BITS,
                public_exponent: &SIGNING_KEY_EXPONENT,
            },
            &public_template,
            &private_template,
        )?;
        log::info!("Generated RSA-{} signing key pair '{}'", SIGNING_KEY_BITS, label);
        Ok(pair)
    }

    /// Import an AES-256 key block protection key
    pub fn create_key_block_protection_key(
        &mut self,
        label: &str,
        value: &[u8; AES_256_KEY_LEN],
        persistent: bool,
    ) -> KldResult<ObjectHandle> {
        let handle = self.session.create_object(&kbpk_template(label, value, persistent))?;
        log::info!("Imported key block protection key '{}'", label);
        Ok(handle)
    }

    /// Application signing key wrapped under a device's reincarnation key
    pub fn app_key_keyblock(&mut self, derivation_info: &[u8]) -> KldResult<String> {
        let app_key = find_key(
            &mut self.session,
            ObjectClass::PrivateKey,
            KeyType::Rsa,
            &self.labels.application_sign,
        )?;
        let mut scope = KeyScope::new(&mut self.session);
        let inc_key = derive_reincarnation_key(&mut *scope, &self.labels, derivation_info)?;
        scope.track(inc_key);
        let keyblock = wrap_on_token(&mut *scope, headers::APP_KEY_TRANSPORT, inc_key, app_key)?;
        log::info!("Wrapped application signing key for device transport");
        Ok(keyblock)
    }
}
