//! Simulated compute device
//!
//! Plays the responder side of the reincarnation key agreement and the
//! device half of the provisioning flows, so the HSM side can be exercised
//! end to end without hardware. Faults can be injected to test the abort and
//! cleanup paths.

use std::time::Duration;

use kld_core::cipher::{aes_cmac, aes_ecb_encrypt, constant_time_eq};
use kld_core::keyblock::{self, headers, KeyBlockHeader};
use kld_core::transcript::{signed_data, MacTranscript};
use kld_core::{
    ComputeDevice, DeviceIdentity, KldError, KldResult, LifecycleInfo, LifecycleState, ManufacturingInfo,
    ManufacturingResetSecret, ReincarnationInfo, Step1Response, AES_256_KEY_LEN, KEY_AGREEMENT_RANDOM_LEN,
    SECP256R1_PUBLIC_KEY_LEN,
};
use rand_core::{OsRng, RngCore};

use crate::crypto;
use crate::memory::SecureMemory;

const MASTER_SECRET_LEN: usize = 3 * AES_256_KEY_LEN;

/// Device request, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCall {
    /// `open_service_session`
    OpenSession,
    /// `set_inc_key_step1`
    Step1,
    /// `set_inc_key_step2`
    Step2,
    /// `set_inc_key_step3`
    Step3,
    /// `manufacturing_info` and `reincarnation_info`
    Identity,
    /// `lifecycle_info`
    Lifecycle,
    /// `mfg_reset_secret_derivation_input`
    MfgResetInput,
    /// `lock`
    Lock,
    /// `set_app_key`
    SetAppKey,
}

/// Injected misbehaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flip a bit of the responder CMAC returned by step 2
    CorruptResponderCmac,
    /// Fail the given request with a transport error
    TransportAt(DeviceCall),
}

/// Responder state of one handshake
struct Responder {
    initiator_random: Vec<u8>,
    initiator_auth_key: p256::PublicKey,
    initiator_auth_pub_key: Vec<u8>,
    responder_random: Vec<u8>,
    eph_secret: p256::SecretKey,
    responder_eph_pub_key: Vec<u8>,
    agreed: Option<Agreement>,
}

/// Step 2 values and the shared master secret
struct Agreement {
    initiator_eph_pub_key: Vec<u8>,
    initiator_signature: Vec<u8>,
    master: SecureMemory,
}

impl Responder {
    fn transcript<'a>(&'a self, agreed: &'a Agreement) -> MacTranscript<'a> {
        MacTranscript {
            initiator_random: &self.initiator_random,
            initiator_auth_pub_key: &self.initiator_auth_pub_key,
            responder_random: &self.responder_random,
            responder_eph_pub_key: &self.responder_eph_pub_key,
            initiator_eph_pub_key: &agreed.initiator_eph_pub_key,
            initiator_signature: &agreed.initiator_signature,
        }
    }
}

fn reject(reason: impl std::fmt::Display) -> KldError {
    KldError::Transport(format!("device rejected request: {}", reason))
}

/// In-memory compute device
pub struct SimulatedDevice {
    identity: DeviceIdentity,
    lifecycle: LifecycleInfo,
    pinned_kld_auth: Option<p256::PublicKey>,
    mfg_reset_master: Option<SecureMemory>,
    mfg_reset_input: u32,
    session_timeout: Option<Duration>,
    sessions_opened: usize,
    handshake: Option<Responder>,
    reincarnation_key: Option<SecureMemory>,
    app_key: Option<SecureMemory>,
    reset_unlocked: bool,
    faults: Vec<Fault>,
}

impl SimulatedDevice {
    /// Device with the given identity in the `Operation` state
    pub fn new(identity: DeviceIdentity) -> Self {
        SimulatedDevice {
            identity,
            lifecycle: LifecycleInfo {
                state: LifecycleState::Operation,
                timestamp: identity.reincarnation.time_of_reincarnation,
                tamper_status: 0,
            },
            pinned_kld_auth: None,
            mfg_reset_master: None,
            mfg_reset_input: 0,
            session_timeout: None,
            sessions_opened: 0,
            handshake: None,
            reincarnation_key: None,
            app_key: None,
            reset_unlocked: false,
            faults: Vec::new(),
        }
    }

    /// Accept only the key loading device whose SPKI DER public key is `spki`
    ///
    /// Without a pinned key the device trusts the key offered in step 1.
    pub fn with_pinned_kld_auth(mut self, spki: &[u8]) -> KldResult<Self> {
        let key = crypto::ec_public_from_spki(spki).map_err(|e| KldError::MalformedKeyInfo(e.to_string()))?;
        self.pinned_kld_auth = Some(key);
        Ok(self)
    }

    /// Manufacturing reset master the device checks `lock` secrets against
    pub fn with_mfg_reset_master(mut self, master: &[u8; AES_256_KEY_LEN], derivation_input: u32) -> Self {
        self.mfg_reset_master = Some(SecureMemory::from_slice(master));
        self.mfg_reset_input = derivation_input;
        self
    }

    /// Set the lifecycle state
    pub fn with_lifecycle_state(mut self, state: LifecycleState) -> Self {
        self.lifecycle.state = state;
        self
    }

    /// Inject a fault; it stays active until [`SimulatedDevice::clear_faults`]
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Remove every injected fault
    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    /// Identity records
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Reincarnation key adopted in the last completed handshake
    pub fn reincarnation_key(&self) -> Option<&[u8]> {
        self.reincarnation_key.as_ref().map(SecureMemory::as_ref)
    }

    /// Application signing key (PKCS#8 DER) installed by `set_app_key`
    pub fn app_key(&self) -> Option<&[u8]> {
        self.app_key.as_ref().map(SecureMemory::as_ref)
    }

    /// Whether a valid manufacturing reset secret has been presented
    pub fn is_reset_unlocked(&self) -> bool {
        self.reset_unlocked
    }

    /// Whether a service session is open
    pub fn session_open(&self) -> bool {
        self.session_timeout.is_some()
    }

    /// Number of service sessions opened so far
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened
    }

    /// Whether a handshake is in progress
    pub fn handshake_in_progress(&self) -> bool {
        self.handshake.is_some()
    }

    fn fail_if_injected(&self, call: DeviceCall) -> KldResult<()> {
        if self.faults.contains(&Fault::TransportAt(call)) {
            log::warn!("Simulated device: injected transport failure at {:?}", call);
            return Err(KldError::Transport(format!("injected failure at {:?}", call)));
        }
        Ok(())
    }

    fn begin(&self, call: DeviceCall) -> KldResult<()> {
        if self.session_timeout.is_none() {
            return Err(KldError::Transport(format!("{:?} outside a service session", call)));
        }
        self.fail_if_injected(call)
    }

    fn expected_reset_words(&self) -> KldResult<[u32; 2]> {
        let master = self
            .mfg_reset_master
            .as_ref()
            .ok_or_else(|| reject("no manufacturing reset master provisioned"))?;
        let mut block = [0u8; 16];
        for chunk in block.chunks_exact_mut(4) {
            chunk.copy_from_slice(&self.mfg_reset_input.to_ne_bytes());
        }
        let encrypted = aes_ecb_encrypt(master.as_ref(), &block).map_err(reject)?;
        Ok([
            u32::from_ne_bytes([encrypted[0], encrypted[1], encrypted[2], encrypted[3]]),
            u32::from_ne_bytes([encrypted[4], encrypted[5], encrypted[6], encrypted[7]]),
        ])
    }
}

impl ComputeDevice for SimulatedDevice {
    fn open_service_session(&mut self, timeout: Duration) -> KldResult<()> {
        self.fail_if_injected(DeviceCall::OpenSession)?;
        if self.session_timeout.is_some() {
            return Err(reject("service session already open"));
        }
        self.session_timeout = Some(timeout);
        self.sessions_opened += 1;
        log::info!("Simulated device: service session opened");
        Ok(())
    }

    fn close_service_session(&mut self) -> KldResult<()> {
        if self.session_timeout.take().is_none() {
            return Err(reject("no service session open"));
        }
        if self.handshake.take().is_some() {
            log::info!("Simulated device: abandoned handshake discarded");
        }
        log::info!("Simulated device: service session closed");
        Ok(())
    }

    fn set_inc_key_step1(&mut self, initiator_random: &[u8], initiator_auth_pub_key: &[u8]) -> KldResult<Step1Response> {
        self.begin(DeviceCall::Step1)?;
        self.handshake = None;
        if initiator_random.len() != KEY_AGREEMENT_RANDOM_LEN {
            return Err(reject("initiator random has the wrong length"));
        }
        if initiator_auth_pub_key.len() != SECP256R1_PUBLIC_KEY_LEN {
            return Err(reject("initiator authentication key has the wrong length"));
        }
        let initiator_auth_key = crypto::ec_public_from_point(initiator_auth_pub_key).map_err(reject)?;
        if let Some(pinned) = &self.pinned_kld_auth {
            if *pinned != initiator_auth_key {
                return Err(reject("unknown key loading device"));
            }
        }

        let mut responder_random = vec![0u8; KEY_AGREEMENT_RANDOM_LEN];
        OsRng.fill_bytes(&mut responder_random);
        let eph_secret = crypto::generate_ec_key();
        let responder_eph_pub_key = crypto::ec_point_der(&eph_secret.public_key());

        let response = Step1Response {
            responder_random: responder_random.clone(),
            responder_eph_pub_key: responder_eph_pub_key.clone(),
        };
        self.handshake = Some(Responder {
            initiator_random: initiator_random.to_vec(),
            initiator_auth_key,
            initiator_auth_pub_key: initiator_auth_pub_key.to_vec(),
            responder_random,
            eph_secret,
            responder_eph_pub_key,
            agreed: None,
        });
        log::debug!("Simulated device: step 1 answered");
        Ok(response)
    }

    fn set_inc_key_step2(&mut self, initiator_eph_pub_key: &[u8], initiator_signature: &[u8]) -> KldResult<Vec<u8>> {
        self.begin(DeviceCall::Step2)?;
        let mut responder = match self.handshake.take() {
            Some(r) if r.agreed.is_none() => r,
            _ => return Err(reject("step 2 out of sequence")),
        };

        let initiator_eph_key = crypto::ec_public_from_point(initiator_eph_pub_key).map_err(reject)?;
        let data = signed_data(
            &responder.responder_random,
            &responder.initiator_random,
            initiator_eph_pub_key,
        );
        if !crypto::ecdsa_verify(&responder.initiator_auth_key, &data, initiator_signature) {
            return Err(reject("initiator signature invalid"));
        }

        let mut shared_info = Vec::with_capacity(2 * KEY_AGREEMENT_RANDOM_LEN);
        shared_info.extend_from_slice(&responder.responder_random);
        shared_info.extend_from_slice(&responder.initiator_random);
        let master = crypto::ecdh_x963_sha384(&responder.eph_secret, &initiator_eph_key, &shared_info, MASTER_SECRET_LEN)
            .map_err(reject)?;

        let agreed = Agreement {
            initiator_eph_pub_key: initiator_eph_pub_key.to_vec(),
            initiator_signature: initiator_signature.to_vec(),
            master: SecureMemory::from_slice(&master),
        };
        let mac_key = agreed.master.slice(0, AES_256_KEY_LEN).map_err(reject)?;
        let mut cmac = aes_cmac(mac_key.as_ref(), &responder.transcript(&agreed).to_bytes()).map_err(reject)?;
        if self.faults.contains(&Fault::CorruptResponderCmac) {
            log::warn!("Simulated device: corrupting responder CMAC");
            cmac[0] ^= 0x01;
        }

        responder.agreed = Some(agreed);
        self.handshake = Some(responder);
        log::debug!("Simulated device: step 2 answered");
        Ok(cmac.to_vec())
    }

    fn set_inc_key_step3(&mut self, initiator_cmac: &[u8], initiator_keyblock: &str) -> KldResult<()> {
        self.begin(DeviceCall::Step3)?;
        let responder = self.handshake.take().ok_or_else(|| reject("step 3 out of sequence"))?;
        let agreed = responder.agreed.as_ref().ok_or_else(|| reject("step 3 out of sequence"))?;

        let mac_key = agreed.master.slice(AES_256_KEY_LEN, AES_256_KEY_LEN).map_err(reject)?;
        let expected = aes_cmac(mac_key.as_ref(), &responder.transcript(agreed).to_bytes()).map_err(reject)?;
        if !constant_time_eq(&expected, initiator_cmac) {
            return Err(reject("initiator CMAC invalid"));
        }

        let kbpk = agreed.master.slice(2 * AES_256_KEY_LEN, AES_256_KEY_LEN).map_err(reject)?;
        let (header, key) = keyblock::unwrap(kbpk.as_ref(), initiator_keyblock).map_err(reject)?;
        let expected_header: KeyBlockHeader = headers::REINCARNATION_KEY.parse()?;
        if header != expected_header || key.len() != AES_256_KEY_LEN {
            return Err(reject(format!("unexpected key block {}", header)));
        }

        self.reincarnation_key = Some(SecureMemory::from_slice(&key));
        log::info!("Simulated device: new reincarnation key adopted");
        Ok(())
    }

    fn manufacturing_info(&mut self) -> KldResult<ManufacturingInfo> {
        self.begin(DeviceCall::Identity)?;
        Ok(self.identity.manufacturing)
    }

    fn reincarnation_info(&mut self) -> KldResult<ReincarnationInfo> {
        self.begin(DeviceCall::Identity)?;
        Ok(self.identity.reincarnation)
    }

    fn lifecycle_info(&mut self) -> KldResult<LifecycleInfo> {
        self.begin(DeviceCall::Lifecycle)?;
        Ok(self.lifecycle)
    }

    fn mfg_reset_secret_derivation_input(&mut self) -> KldResult<u32> {
        self.begin(DeviceCall::MfgResetInput)?;
        Ok(self.mfg_reset_input)
    }

    fn lock(&mut self, secret: &ManufacturingResetSecret) -> KldResult<()> {
        self.begin(DeviceCall::Lock)?;
        if self.lifecycle.state != LifecycleState::Manufactured {
            return Err(reject(format!("lock not permitted in state {}", self.lifecycle.state)));
        }
        let expected = self.expected_reset_words()?;
        if expected != secret.words {
            return Err(reject("manufacturing reset secret invalid"));
        }
        self.reset_unlocked = true;
        log::info!("Simulated device: manufacturing reset unlocked");
        Ok(())
    }

    fn set_app_key(&mut self, keyblock: &str) -> KldResult<()> {
        self.begin(DeviceCall::SetAppKey)?;
        let inc_key = self
            .reincarnation_key
            .as_ref()
            .ok_or_else(|| reject("no reincarnation key installed"))?;
        let (header, key) = keyblock::unwrap(inc_key.as_ref(), keyblock).map_err(reject)?;
        let expected_header: KeyBlockHeader = headers::APP_KEY_TRANSPORT.parse()?;
        if header != expected_header {
            return Err(reject(format!("unexpected key block {}", header)));
        }
        self.app_key = Some(SecureMemory::from_slice(&key));
        log::info!("Simulated device: application signing key installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kld_core::{DevicePersonality, OperatingMode, DDM_885_DEVICE_CLASS};

    const KLD_AUTH_PUBLIC: &[u8] = include_bytes!("../../kld-core/keys/debug/kld_auth_public.der");

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            manufacturing: ManufacturingInfo {
                device_class: DDM_885_DEVICE_CLASS,
                time_of_production: 1_600_000_000,
                serial_number: 4711,
                device_type: 0x03,
                ecl: 1,
                mac_address: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            },
            reincarnation: ReincarnationInfo {
                time_of_reincarnation: 1_700_000_000,
                personality: DevicePersonality::PciPoi,
                operating_mode: OperatingMode::Development,
                master_key_id: 0x000D_EB06,
            },
        }
    }

    #[test]
    fn test_requests_need_a_session() {
        let mut device = SimulatedDevice::new(identity());
        assert!(matches!(device.lifecycle_info(), Err(KldError::Transport(_))));
        device.open_service_session(Duration::from_secs(1)).unwrap();
        assert!(device.open_service_session(Duration::from_secs(1)).is_err());
        assert_eq!(device.lifecycle_info().unwrap().state, LifecycleState::Operation);
        device.close_service_session().unwrap();
        assert!(device.close_service_session().is_err());
        assert_eq!(device.sessions_opened(), 1);
    }

    #[test]
    fn test_pinned_key_rejects_other_initiators() {
        let mut device = SimulatedDevice::new(identity())
            .with_pinned_kld_auth(KLD_AUTH_PUBLIC)
            .unwrap();
        device.open_service_session(Duration::from_secs(1)).unwrap();

        let stranger = crypto::ec_point_der(&crypto::generate_ec_key().public_key());
        let err = device.set_inc_key_step1(&[0u8; 32], &stranger).unwrap_err();
        assert!(err.to_string().contains("unknown key loading device"));

        let pinned = crypto::ec_point_der(&crypto::ec_public_from_spki(KLD_AUTH_PUBLIC).unwrap());
        let response = device.set_inc_key_step1(&[0u8; 32], &pinned).unwrap();
        assert_eq!(response.responder_random.len(), 32);
        assert_eq!(response.responder_eph_pub_key.len(), 67);
        assert!(device.handshake_in_progress());
    }

    #[test]
    fn test_out_of_sequence_steps() {
        let mut device = SimulatedDevice::new(identity());
        device.open_service_session(Duration::from_secs(1)).unwrap();
        assert!(device.set_inc_key_step2(&[0u8; 67], &[0u8; 64]).is_err());
        assert!(device.set_inc_key_step3(&[0u8; 16], "D0016K1AD00N0000").is_err());
    }

    #[test]
    fn test_lock_checks_state_and_secret() {
        let master: [u8; 32] = std::array::from_fn(|i| i as u8);
        let mut device = SimulatedDevice::new(identity())
            .with_mfg_reset_master(&master, 1)
            .with_lifecycle_state(LifecycleState::Manufactured);
        device.open_service_session(Duration::from_secs(1)).unwrap();

        let wrong = ManufacturingResetSecret { words: [0, 0] };
        assert!(device.lock(&wrong).is_err());
        assert!(!device.is_reset_unlocked());

        let words = device.expected_reset_words().unwrap();
        device.lock(&ManufacturingResetSecret { words }).unwrap();
        assert!(device.is_reset_unlocked());
    }

    #[test]
    fn test_injected_transport_fault() {
        let mut device = SimulatedDevice::new(identity());
        device.inject(Fault::TransportAt(DeviceCall::OpenSession));
        assert!(matches!(
            device.open_service_session(Duration::from_secs(1)),
            Err(KldError::Transport(_))
        ));
        device.clear_faults();
        device.open_service_session(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_app_key_requires_reincarnation_key() {
        let mut device = SimulatedDevice::new(identity());
        device.open_service_session(Duration::from_secs(1)).unwrap();
        let err = device.set_app_key("D0016S0RV00N0000").unwrap_err();
        assert!(err.to_string().contains("no reincarnation key"));
    }
}
