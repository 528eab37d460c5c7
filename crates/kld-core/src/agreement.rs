//! Reincarnation key agreement (initiator side)
//!
//! Three-step mutually authenticated ECDH handshake:
//!
//! 1. The initiator sends a random and its long-term authentication public
//!    key; the responder answers with its random and an ephemeral public key.
//! 2. The initiator sends its ephemeral public key and an ECDSA signature over
//!    `responderRandom || initiatorRandom || initiatorEphPubKey`; the responder
//!    answers with an AES-CMAC over the transcript.
//! 3. The initiator derives the shared secret, verifies the responder CMAC,
//!    returns its own CMAC and the reincarnation key wrapped under the
//!    ephemeral key block protection key.
//!
//! The [`KeyAgreementContext`] carries the protocol state between steps. A
//! context is single use: once it reaches `Complete` or `Failed` every
//! further step is rejected. Any failure, including a step or responder
//! answer that arrives out of order, moves an unfinished context to `Failed`.

use std::fmt;

use crate::derivation::derive_reincarnation_key;
use crate::hsm::find_key;
use crate::keyblock::headers;
use crate::token::{
    Attribute, CryptoToken, Curve, EcKdf, KeyScope, KeyTemplate, KeyType, KeyUsage, Mechanism, ObjectClass,
    ObjectHandle, ReturnCode,
};
use crate::transcript::{fingerprint, signed_data, MacTranscript};
use crate::types::{
    AES_256_KEY_LEN, AES_CMAC_LEN, KEY_AGREEMENT_RANDOM_LEN, SECP256R1_PUBLIC_KEY_INFO_LEN, SECP256R1_PUBLIC_KEY_LEN,
    SIGNATURE_LEN,
};
use crate::{Hsm, KldError, KldResult};

/// DER SubjectPublicKeyInfo prefix of an uncompressed secp256r1 public key,
/// up to and including the BIT STRING's unused-bits byte
const SECP256R1_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE,
    0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

/// DER OCTET STRING header of a 65-byte uncompressed point
const EC_POINT_PREFIX: [u8; 3] = [0x04, 0x41, 0x04];

const MASTER_SECRET_LEN: usize = 3 * AES_256_KEY_LEN;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Fresh context
    Idle,
    /// Step 1 produced; waiting for the responder's random and ephemeral key
    Step1Sent,
    /// Step 2 produced; waiting for the responder CMAC
    Step2Sent,
    /// Step 3 produced the key block
    Complete,
    /// Aborted; the context cannot be reused
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State of one reincarnation key handshake
#[derive(Debug)]
pub struct KeyAgreementContext {
    state: HandshakeState,
    inc_key_derivation_info: Vec<u8>,
    initiator_random: Vec<u8>,
    initiator_auth_pub_key: Vec<u8>,
    responder_random: Vec<u8>,
    responder_eph_pub_key: Vec<u8>,
    initiator_eph_pub_key: Vec<u8>,
    initiator_signature: Vec<u8>,
    responder_cmac: Vec<u8>,
    initiator_cmac: Vec<u8>,
    initiator_keyblock: String,
    auth_key: Option<ObjectHandle>,
    eph_private_key: Option<ObjectHandle>,
}

impl KeyAgreementContext {
    /// Fresh context for delivering the reincarnation key derived from
    /// `inc_key_derivation_info`
    pub fn new(inc_key_derivation_info: &[u8]) -> Self {
        KeyAgreementContext {
            state: HandshakeState::Idle,
            inc_key_derivation_info: inc_key_derivation_info.to_vec(),
            initiator_random: Vec::new(),
            initiator_auth_pub_key: Vec::new(),
            responder_random: Vec::new(),
            responder_eph_pub_key: Vec::new(),
            initiator_eph_pub_key: Vec::new(),
            initiator_signature: Vec::new(),
            responder_cmac: Vec::new(),
            initiator_cmac: Vec::new(),
            initiator_keyblock: String::new(),
            auth_key: None,
            eph_private_key: None,
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Reincarnation key derivation input
    pub fn inc_key_derivation_info(&self) -> &[u8] {
        &self.inc_key_derivation_info
    }

    /// Initiator random (step 1)
    pub fn initiator_random(&self) -> &[u8] {
        &self.initiator_random
    }

    /// Initiator authentication public key, DER OCTET STRING of the point (step 1)
    pub fn initiator_auth_pub_key(&self) -> &[u8] {
        &self.initiator_auth_pub_key
    }

    /// Responder random
    pub fn responder_random(&self) -> &[u8] {
        &self.responder_random
    }

    /// Responder ephemeral public key
    pub fn responder_eph_pub_key(&self) -> &[u8] {
        &self.responder_eph_pub_key
    }

    /// Initiator ephemeral public key (step 2)
    pub fn initiator_eph_pub_key(&self) -> &[u8] {
        &self.initiator_eph_pub_key
    }

    /// Initiator signature, raw `r || s` (step 2)
    pub fn initiator_signature(&self) -> &[u8] {
        &self.initiator_signature
    }

    /// Responder CMAC
    pub fn responder_cmac(&self) -> &[u8] {
        &self.responder_cmac
    }

    /// Initiator CMAC (step 3)
    pub fn initiator_cmac(&self) -> &[u8] {
        &self.initiator_cmac
    }

    /// Reincarnation key block (step 3)
    pub fn initiator_keyblock(&self) -> &str {
        &self.initiator_keyblock
    }

    /// Whether provider-resident ephemeral keys are still held
    pub fn holds_ephemeral_keys(&self) -> bool {
        self.eph_private_key.is_some()
    }

    /// Record the responder's answer to step 1
    pub fn accept_step1_response(&mut self, responder_random: &[u8], responder_eph_pub_key: &[u8]) -> KldResult<()> {
        self.expect_state(HandshakeState::Step1Sent, "step 1 response")?;
        if !self.responder_random.is_empty() {
            return Err(self.violation("step 1 response already recorded".to_string()));
        }
        if responder_random.len() != KEY_AGREEMENT_RANDOM_LEN {
            return Err(self.violation(format!(
                "responder random is {} bytes, expected {}",
                responder_random.len(),
                KEY_AGREEMENT_RANDOM_LEN
            )));
        }
        if responder_eph_pub_key.len() != SECP256R1_PUBLIC_KEY_LEN
            || !responder_eph_pub_key.starts_with(&EC_POINT_PREFIX)
        {
            return Err(self.violation(format!(
                "responder ephemeral public key is not a {}-byte uncompressed point",
                SECP256R1_PUBLIC_KEY_LEN
            )));
        }
        self.responder_random = responder_random.to_vec();
        self.responder_eph_pub_key = responder_eph_pub_key.to_vec();
        Ok(())
    }

    /// Record the responder's answer to step 2
    pub fn accept_step2_response(&mut self, responder_cmac: &[u8]) -> KldResult<()> {
        self.expect_state(HandshakeState::Step2Sent, "step 2 response")?;
        if !self.responder_cmac.is_empty() {
            return Err(self.violation("step 2 response already recorded".to_string()));
        }
        if responder_cmac.len() != AES_CMAC_LEN {
            return Err(self.violation(format!(
                "responder CMAC is {} bytes, expected {}",
                responder_cmac.len(),
                AES_CMAC_LEN
            )));
        }
        self.responder_cmac = responder_cmac.to_vec();
        Ok(())
    }

    /// A call out of order fails the handshake; a completed one stays `Complete`
    fn expect_state(&mut self, expected: HandshakeState, what: &str) -> KldResult<()> {
        if self.state == expected {
            return Ok(());
        }
        let message = format!("{} requires state {}, handshake is {}", what, expected, self.state);
        if self.state == HandshakeState::Complete {
            return Err(KldError::ProtocolInvariantViolation(message));
        }
        Err(self.violation(message))
    }

    fn violation(&mut self, message: String) -> KldError {
        self.state = HandshakeState::Failed;
        KldError::ProtocolInvariantViolation(message)
    }

    fn transcript(&self) -> MacTranscript<'_> {
        MacTranscript {
            initiator_random: &self.initiator_random,
            initiator_auth_pub_key: &self.initiator_auth_pub_key,
            responder_random: &self.responder_random,
            responder_eph_pub_key: &self.responder_eph_pub_key,
            initiator_eph_pub_key: &self.initiator_eph_pub_key,
            initiator_signature: &self.initiator_signature,
        }
    }

    fn settle(&mut self, result: KldResult<()>, next: HandshakeState) -> KldResult<()> {
        match result {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }
}

/// Convert a DER SubjectPublicKeyInfo of a secp256r1 key into the DER
/// OCTET STRING form used on the wire
pub fn ec_point_from_public_key_info(info: &[u8]) -> KldResult<Vec<u8>> {
    if info.len() != SECP256R1_PUBLIC_KEY_INFO_LEN {
        return Err(KldError::MalformedKeyInfo(format!(
            "public key info is {} bytes, expected {}",
            info.len(),
            SECP256R1_PUBLIC_KEY_INFO_LEN
        )));
    }
    if !info.starts_with(&SECP256R1_SPKI_PREFIX) || info[SECP256R1_SPKI_PREFIX.len()] != 0x04 {
        return Err(KldError::MalformedKeyInfo(
            "public key info is not an uncompressed secp256r1 key".to_string(),
        ));
    }
    let mut point = Vec::with_capacity(SECP256R1_PUBLIC_KEY_LEN);
    point.extend_from_slice(&EC_POINT_PREFIX[..2]);
    point.extend_from_slice(&info[SECP256R1_SPKI_PREFIX.len()..]);
    Ok(point)
}

fn split_key_template(usage: KeyUsage) -> KeyTemplate {
    KeyTemplate::new(ObjectClass::SecretKey, KeyType::Aes)
        .with_value_len(AES_256_KEY_LEN)
        .persistent(false)
        .with_usage(usage)
}

fn signature_to_auth_failure(e: crate::TokenError) -> KldError {
    match e.code {
        ReturnCode::SIGNATURE_INVALID | ReturnCode::SIGNATURE_LEN_RANGE => KldError::AuthenticationFailed,
        _ => KldError::Provider(e),
    }
}

impl<S: CryptoToken> Hsm<S> {
    /// Step 1: produce `initiatorRandom` and `initiatorAuthPubKey`
    pub fn inc_key_step1(&mut self, ctx: &mut KeyAgreementContext) -> KldResult<()> {
        if let Err(e) = ctx.expect_state(HandshakeState::Idle, "step 1") {
            self.release_ephemeral_key(ctx);
            return Err(e);
        }
        let result = self.step1(ctx);
        ctx.settle(result, HandshakeState::Step1Sent)
    }

    fn step1(&mut self, ctx: &mut KeyAgreementContext) -> KldResult<()> {
        let auth_key = find_key(
            &mut self.session,
            ObjectClass::PrivateKey,
            KeyType::Ec,
            &self.labels.kld_auth,
        )?;
        let info = self.session.get_attribute(auth_key, Attribute::PublicKeyInfo)?;
        let auth_pub_key = ec_point_from_public_key_info(&info)?;
        let random = self.random(KEY_AGREEMENT_RANDOM_LEN)?;

        ctx.auth_key = Some(auth_key);
        ctx.initiator_auth_pub_key = auth_pub_key;
        ctx.initiator_random = random;
        log::info!(
            "Key agreement step 1: auth key {}, initiator random {}",
            fingerprint(&ctx.initiator_auth_pub_key),
            fingerprint(&ctx.initiator_random)
        );
        Ok(())
    }

    /// Step 2: generate the ephemeral key pair and sign the step 2 data
    pub fn inc_key_step2(&mut self, ctx: &mut KeyAgreementContext) -> KldResult<()> {
        if let Err(e) = ctx.expect_state(HandshakeState::Step1Sent, "step 2") {
            self.release_ephemeral_key(ctx);
            return Err(e);
        }
        let result = self.step2(ctx);
        ctx.settle(result, HandshakeState::Step2Sent)
    }

    fn step2(&mut self, ctx: &mut KeyAgreementContext) -> KldResult<()> {
        if ctx.responder_random.is_empty() {
            return Err(KldError::ProtocolInvariantViolation(
                "step 2 requires the responder's step 1 response".to_string(),
            ));
        }
        let auth_key = ctx
            .auth_key
            .ok_or_else(|| KldError::ProtocolInvariantViolation("authentication key not located".to_string()))?;

        let mut scope = KeyScope::new(&mut self.session);

        let public_template = KeyTemplate::new(ObjectClass::PublicKey, KeyType::Ec)
            .persistent(false)
            .with_usage(KeyUsage::VERIFY);
        let private_template = KeyTemplate::new(ObjectClass::PrivateKey, KeyType::Ec)
            .persistent(false)
            .with_usage(KeyUsage::DERIVE);
        let (public, private) = scope.generate_key_pair(
            &Mechanism::EcKeyPairGen { curve: Curve::Secp256r1 },
            &public_template,
            &private_template,
        )?;
        scope.track(public);
        scope.track(private);

        let eph_pub_key = scope.get_attribute(public, Attribute::EcPoint)?;
        if eph_pub_key.len() != SECP256R1_PUBLIC_KEY_LEN || !eph_pub_key.starts_with(&EC_POINT_PREFIX) {
            return Err(KldError::ProtocolInvariantViolation(format!(
                "ephemeral public key is {} bytes, expected {}",
                eph_pub_key.len(),
                SECP256R1_PUBLIC_KEY_LEN
            )));
        }
        scope.destroy(public)?;

        let data = signed_data(&ctx.responder_random, &ctx.initiator_random, &eph_pub_key);
        scope.sign_init(&Mechanism::EcdsaSha256, auth_key)?;
        scope.sign_update(&data)?;
        let signature = scope.sign_final()?;
        if signature.len() != SIGNATURE_LEN {
            return Err(KldError::ProtocolInvariantViolation(format!(
                "signature is {} bytes, expected {}",
                signature.len(),
                SIGNATURE_LEN
            )));
        }

        ctx.eph_private_key = Some(scope.keep(private));
        ctx.initiator_eph_pub_key = eph_pub_key;
        ctx.initiator_signature = signature;
        log::info!(
            "Key agreement step 2: ephemeral key {}, signature {}",
            fingerprint(&ctx.initiator_eph_pub_key),
            fingerprint(&ctx.initiator_signature)
        );
        Ok(())
    }

    /// Step 3: verify the responder, produce `initiatorCMAC` and the key block
    ///
    /// Every derived key and the ephemeral private key are destroyed before
    /// this returns, whether it succeeds or not.
    pub fn inc_key_step3(&mut self, ctx: &mut KeyAgreementContext) -> KldResult<()> {
        if let Err(e) = ctx.expect_state(HandshakeState::Step2Sent, "step 3") {
            self.release_ephemeral_key(ctx);
            return Err(e);
        }
        let result = self.step3(ctx);
        ctx.settle(result, HandshakeState::Complete)
    }

    fn step3(&mut self, ctx: &mut KeyAgreementContext) -> KldResult<()> {
        let mut scope = KeyScope::new(&mut self.session);
        let eph_private = match ctx.eph_private_key.take() {
            Some(handle) => scope.track(handle),
            None => {
                return Err(KldError::ProtocolInvariantViolation(
                    "ephemeral key pair is gone".to_string(),
                ))
            }
        };
        if ctx.responder_cmac.len() != AES_CMAC_LEN {
            return Err(KldError::ProtocolInvariantViolation(
                "step 3 requires the responder's step 2 response".to_string(),
            ));
        }

        let mut shared_data = Vec::with_capacity(2 * KEY_AGREEMENT_RANDOM_LEN);
        shared_data.extend_from_slice(&ctx.responder_random);
        shared_data.extend_from_slice(&ctx.initiator_random);

        let master_template = KeyTemplate::new(ObjectClass::SecretKey, KeyType::GenericSecret)
            .with_value_len(MASTER_SECRET_LEN)
            .persistent(false)
            .with_usage(KeyUsage::DERIVE);
        let master = scope.track_with(|t| {
            t.derive_key(
                &Mechanism::Ecdh1Derive {
                    kdf: EcKdf::Sha384,
                    shared_data: &shared_data,
                    public_data: &ctx.responder_eph_pub_key,
                },
                eph_private,
                &master_template,
            )
        })?;

        let responder_mac_template = split_key_template(KeyUsage::VERIFY);
        let initiator_mac_template = split_key_template(KeyUsage::SIGN);
        let kbpk_template = split_key_template(KeyUsage::WRAP).with_key_block_header(headers::EPHEMERAL_KBPK);

        let responder_mac_key = scope.track_with(|t| {
            t.derive_key(&Mechanism::ExtractKeyFromKey { bit_offset: 0 }, master, &responder_mac_template)
        })?;
        let initiator_mac_key = scope.track_with(|t| {
            t.derive_key(&Mechanism::ExtractKeyFromKey { bit_offset: 256 }, master, &initiator_mac_template)
        })?;
        let eph_kbpk = scope.track_with(|t| {
            t.derive_key(&Mechanism::ExtractKeyFromKey { bit_offset: 512 }, master, &kbpk_template)
        })?;

        let transcript = ctx.transcript();
        scope.verify_init(&Mechanism::AesCmac, responder_mac_key)?;
        for part in transcript.parts() {
            scope.verify_update(part)?;
        }
        if let Err(e) = scope.verify_final(&ctx.responder_cmac) {
            let err = signature_to_auth_failure(e);
            if matches!(err, KldError::AuthenticationFailed) {
                log::warn!("Responder CMAC verification failed; aborting key agreement");
            }
            return Err(err);
        }

        scope.sign_init(&Mechanism::AesCmac, initiator_mac_key)?;
        for part in transcript.parts() {
            scope.sign_update(part)?;
        }
        let initiator_cmac = scope.sign_final()?;
        if initiator_cmac.len() != AES_CMAC_LEN {
            return Err(KldError::ProtocolInvariantViolation(format!(
                "initiator CMAC is {} bytes, expected {}",
                initiator_cmac.len(),
                AES_CMAC_LEN
            )));
        }

        let inc_key = derive_reincarnation_key(&mut *scope, &self.labels, &ctx.inc_key_derivation_info)?;
        scope.track(inc_key);

        let wrapped = scope.wrap_key(
            &Mechanism::KeyBlockWrap {
                header: Some(headers::REINCARNATION_KEY),
            },
            eph_kbpk,
            inc_key,
        )?;
        let keyblock = String::from_utf8(wrapped)
            .map_err(|_| KldError::ProtocolInvariantViolation("key block is not ASCII".to_string()))?;

        drop(scope);
        ctx.initiator_cmac = initiator_cmac;
        ctx.initiator_keyblock = keyblock;
        log::info!(
            "Key agreement step 3: initiator CMAC {}, key block {}",
            fingerprint(&ctx.initiator_cmac),
            fingerprint(ctx.initiator_keyblock.as_bytes())
        );
        Ok(())
    }

    /// Abandon a handshake, destroying any ephemeral key it still holds
    pub fn abort_key_agreement(&mut self, ctx: &mut KeyAgreementContext) {
        self.release_ephemeral_key(ctx);
        if ctx.state != HandshakeState::Complete {
            ctx.state = HandshakeState::Failed;
        }
        log::info!("Key agreement aborted");
    }

    fn release_ephemeral_key(&mut self, ctx: &mut KeyAgreementContext) {
        if let Some(handle) = ctx.eph_private_key.take() {
            if let Err(e) = self.session.destroy_object(handle) {
                log::warn!("Failed to destroy ephemeral key {}: {}", handle, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KLD_AUTH_SPKI: &[u8] = include_bytes!("../keys/debug/kld_auth_public.der");

    fn point() -> Vec<u8> {
        ec_point_from_public_key_info(KLD_AUTH_SPKI).unwrap()
    }

    #[test]
    fn test_public_key_info_to_point() {
        let point = point();
        assert_eq!(point.len(), SECP256R1_PUBLIC_KEY_LEN);
        assert_eq!(&point[..3], &EC_POINT_PREFIX);
        assert_eq!(&point[2..], &KLD_AUTH_SPKI[26..]);
    }

    #[test]
    fn test_malformed_public_key_info() {
        assert!(matches!(
            ec_point_from_public_key_info(&KLD_AUTH_SPKI[..90]),
            Err(KldError::MalformedKeyInfo(_))
        ));
        let mut wrong_curve = KLD_AUTH_SPKI.to_vec();
        wrong_curve[22] ^= 0x01;
        assert!(matches!(
            ec_point_from_public_key_info(&wrong_curve),
            Err(KldError::MalformedKeyInfo(_))
        ));
        let mut compressed = KLD_AUTH_SPKI.to_vec();
        compressed[26] = 0x02;
        assert!(matches!(
            ec_point_from_public_key_info(&compressed),
            Err(KldError::MalformedKeyInfo(_))
        ));
    }

    #[test]
    fn test_responses_rejected_out_of_order() {
        let mut ctx = KeyAgreementContext::new(&[0u8; 48]);
        assert_eq!(ctx.state(), HandshakeState::Idle);
        assert!(matches!(
            ctx.accept_step1_response(&[0u8; 32], &point()),
            Err(KldError::ProtocolInvariantViolation(_))
        ));
        assert!(ctx.accept_step2_response(&[0u8; 16]).is_err());
        // Out-of-order calls leave a fresh context usable
        assert_eq!(ctx.state(), HandshakeState::Idle);
    }

    #[test]
    fn test_step1_response_lengths_checked() {
        let mut ctx = KeyAgreementContext::new(&[0u8; 48]);
        ctx.state = HandshakeState::Step1Sent;
        assert!(ctx.accept_step1_response(&[0u8; 31], &point()).is_err());
        assert_eq!(ctx.state(), HandshakeState::Failed);

        let mut ctx = KeyAgreementContext::new(&[0u8; 48]);
        ctx.state = HandshakeState::Step1Sent;
        assert!(ctx.accept_step1_response(&[0u8; 32], &point()[..66]).is_err());

        let mut ctx = KeyAgreementContext::new(&[0u8; 48]);
        ctx.state = HandshakeState::Step1Sent;
        ctx.accept_step1_response(&[7u8; 32], &point()).unwrap();
        assert_eq!(ctx.responder_random(), &[7u8; 32]);
        assert!(ctx.accept_step1_response(&[7u8; 32], &point()).is_err());
    }

    #[test]
    fn test_step2_response_length_checked() {
        let mut ctx = KeyAgreementContext::new(&[0u8; 48]);
        ctx.state = HandshakeState::Step2Sent;
        assert!(ctx.accept_step2_response(&[0u8; 15]).is_err());
        assert_eq!(ctx.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_auth_failure_mapping() {
        let err = signature_to_auth_failure(crate::TokenError::new(ReturnCode::SIGNATURE_INVALID, "mismatch"));
        assert!(matches!(err, KldError::AuthenticationFailed));
        let err = signature_to_auth_failure(crate::TokenError::new(ReturnCode::GENERAL_ERROR, "boom"));
        assert!(matches!(err, KldError::Provider(_)));
    }
}
