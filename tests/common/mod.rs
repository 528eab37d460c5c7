#![allow(dead_code)]

use kld_core::cipher::aes_ecb_encrypt;
use kld_core::token::{KeyUsage, TokenModule};
use kld_core::{
    DeviceIdentity, DevicePersonality, Hsm, KeyLabels, ManufacturingInfo, OperatingMode, ReincarnationInfo,
    DDM_885_DEVICE_CLASS,
};
use kld_token_hal::{SimulatedDevice, SoftSession, SoftTokenModule};
use sha2::{Digest, Sha256};

pub const KLD_AUTH_PRIVATE: &[u8] = include_bytes!("../../crates/kld-core/keys/debug/kld_auth_private.der");
pub const KLD_AUTH_PUBLIC: &[u8] = include_bytes!("../../crates/kld-core/keys/debug/kld_auth_public.der");
pub const APP_SIGNING_PRIVATE: &[u8] = include_bytes!("../../crates/kld-core/keys/debug/app_signing_private.der");

pub const REINCARNATION_MASTER: [u8; 32] = [0x5A; 32];

pub fn mfg_reset_master() -> [u8; 32] {
    std::array::from_fn(|i| i as u8)
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity {
        manufacturing: ManufacturingInfo {
            device_class: DDM_885_DEVICE_CLASS,
            time_of_production: 1_650_000_000,
            serial_number: 100_234,
            device_type: 0x03,
            ecl: 2,
            mac_address: [0x00, 0x1B, 0x44, 0x11, 0x3A, 0xB7],
        },
        reincarnation: ReincarnationInfo {
            time_of_reincarnation: 1_700_000_000,
            personality: DevicePersonality::PciPoi,
            operating_mode: OperatingMode::Development,
            master_key_id: 0x000D_EB06,
        },
    }
}

/// Token holding the KLD authentication pair and both AES masters
pub fn provisioned_token() -> SoftTokenModule {
    let labels = KeyLabels::default();
    SoftTokenModule::default()
        .with_ec_key_pair(&labels.kld_auth, KLD_AUTH_PRIVATE)
        .and_then(|t| t.with_aes_key(&labels.reincarnation_master, &REINCARNATION_MASTER, KeyUsage::DERIVE))
        .and_then(|t| t.with_aes_key(&labels.mfg_reset_master, &mfg_reset_master(), KeyUsage::ENCRYPT))
        .unwrap()
}

pub fn open_hsm(module: &SoftTokenModule) -> Hsm<SoftSession> {
    Hsm::open(module, module.slot(), KeyLabels::default()).unwrap()
}

pub fn open_session(module: &SoftTokenModule) -> SoftSession {
    module.open_session(module.slot()).unwrap()
}

/// Device that only talks to the debug KLD authentication key
pub fn pinned_device() -> SimulatedDevice {
    SimulatedDevice::new(identity())
        .with_pinned_kld_auth(KLD_AUTH_PUBLIC)
        .unwrap()
}

/// Reincarnation key computed off-token: AES-ECB(master, SHA-256(info))
pub fn expected_reincarnation_key(identity: &DeviceIdentity) -> Vec<u8> {
    let digest = Sha256::digest(identity.derivation_info());
    aes_ecb_encrypt(&REINCARNATION_MASTER, &digest).unwrap()
}
