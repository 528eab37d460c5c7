mod common;

use std::time::Duration;

use common::*;
use kld_core::device::inject_reincarnation_key;
use kld_core::keyblock::{self, headers};
use kld_core::{ComputeDevice, HandshakeState, Hsm, KeyAgreementContext, KeyBlockHeader, KldError};
use kld_token_hal::{DeviceCall, Fault, SimulatedDevice, SoftSession};

const TIMEOUT: Duration = Duration::from_millis(500);

/// Run steps 1 and 2 against `device`, returning the context and the
/// responder CMAC it has not yet been given
fn run_to_step2(hsm: &mut Hsm<SoftSession>, device: &mut SimulatedDevice) -> (KeyAgreementContext, Vec<u8>) {
    device.open_service_session(TIMEOUT).unwrap();
    let info = device.reincarnation_key_derivation_info().unwrap();
    let mut ctx = KeyAgreementContext::new(&info);

    hsm.inc_key_step1(&mut ctx).unwrap();
    let response = device
        .set_inc_key_step1(ctx.initiator_random(), ctx.initiator_auth_pub_key())
        .unwrap();
    ctx.accept_step1_response(&response.responder_random, &response.responder_eph_pub_key)
        .unwrap();

    hsm.inc_key_step2(&mut ctx).unwrap();
    let responder_cmac = device
        .set_inc_key_step2(ctx.initiator_eph_pub_key(), ctx.initiator_signature())
        .unwrap();
    (ctx, responder_cmac)
}

#[test]
fn test_reincarnation_key_delivered() {
    let module = provisioned_token();
    let persistent_before = module.object_count();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();

    inject_reincarnation_key(&mut hsm, &mut device, TIMEOUT).unwrap();

    assert_eq!(
        device.reincarnation_key().unwrap(),
        expected_reincarnation_key(&identity()).as_slice()
    );
    assert_eq!(hsm.session().session_object_count(), 0);
    assert_eq!(module.object_count(), persistent_before);
    assert!(!device.session_open());
    assert!(!device.handshake_in_progress());
}

#[test]
fn test_handshake_by_hand() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();
    device.open_service_session(TIMEOUT).unwrap();

    let info = device.reincarnation_key_derivation_info().unwrap();
    let mut ctx = KeyAgreementContext::new(&info);
    assert_eq!(ctx.state(), HandshakeState::Idle);

    hsm.inc_key_step1(&mut ctx).unwrap();
    assert_eq!(ctx.state(), HandshakeState::Step1Sent);
    assert_eq!(ctx.initiator_random().len(), 32);
    assert_eq!(ctx.initiator_auth_pub_key().len(), 67);
    assert_eq!(&ctx.initiator_auth_pub_key()[..3], &[0x04, 0x41, 0x04]);

    let response = device
        .set_inc_key_step1(ctx.initiator_random(), ctx.initiator_auth_pub_key())
        .unwrap();
    ctx.accept_step1_response(&response.responder_random, &response.responder_eph_pub_key)
        .unwrap();

    hsm.inc_key_step2(&mut ctx).unwrap();
    assert_eq!(ctx.state(), HandshakeState::Step2Sent);
    assert!(ctx.holds_ephemeral_keys());
    assert_eq!(hsm.session().session_object_count(), 1);
    assert_eq!(ctx.initiator_eph_pub_key().len(), 67);
    assert_eq!(ctx.initiator_signature().len(), 64);

    let responder_cmac = device
        .set_inc_key_step2(ctx.initiator_eph_pub_key(), ctx.initiator_signature())
        .unwrap();
    ctx.accept_step2_response(&responder_cmac).unwrap();

    hsm.inc_key_step3(&mut ctx).unwrap();
    assert_eq!(ctx.state(), HandshakeState::Complete);
    assert!(!ctx.holds_ephemeral_keys());
    assert_eq!(hsm.session().session_object_count(), 0);
    assert_eq!(ctx.initiator_cmac().len(), 16);
    assert!(ctx.initiator_keyblock().starts_with("D0144K1AD00N0000"));

    device
        .set_inc_key_step3(ctx.initiator_cmac(), ctx.initiator_keyblock())
        .unwrap();
    device.close_service_session().unwrap();
    assert_eq!(
        device.reincarnation_key().unwrap(),
        expected_reincarnation_key(&identity()).as_slice()
    );
}

#[test]
fn test_out_of_order_step_fails_context() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();
    device.open_service_session(TIMEOUT).unwrap();

    let info = device.reincarnation_key_derivation_info().unwrap();
    let mut ctx = KeyAgreementContext::new(&info);
    hsm.inc_key_step1(&mut ctx).unwrap();

    // Step 3 before step 2
    let err = hsm.inc_key_step3(&mut ctx).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    assert_eq!(ctx.state(), HandshakeState::Failed);

    // Nothing continues a failed handshake
    let err = hsm.inc_key_step2(&mut ctx).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    assert_eq!(ctx.state(), HandshakeState::Failed);
    assert_eq!(hsm.session().session_object_count(), 0);

    let err = hsm.inc_key_step1(&mut ctx).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    assert_eq!(ctx.state(), HandshakeState::Failed);
}

#[test]
fn test_out_of_order_step_releases_ephemeral_key() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();
    let (mut ctx, _) = run_to_step2(&mut hsm, &mut device);
    assert_eq!(hsm.session().session_object_count(), 1);

    let err = hsm.inc_key_step1(&mut ctx).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    assert_eq!(ctx.state(), HandshakeState::Failed);
    assert!(!ctx.holds_ephemeral_keys());
    assert_eq!(hsm.session().session_object_count(), 0);
}

#[test]
fn test_completed_context_is_single_use() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();
    let (mut ctx, responder_cmac) = run_to_step2(&mut hsm, &mut device);
    ctx.accept_step2_response(&responder_cmac).unwrap();
    hsm.inc_key_step3(&mut ctx).unwrap();
    assert_eq!(ctx.state(), HandshakeState::Complete);

    let keyblock = ctx.initiator_keyblock().to_string();
    let initiator_cmac = ctx.initiator_cmac().to_vec();

    let err = hsm.inc_key_step3(&mut ctx).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    let err = hsm.inc_key_step1(&mut ctx).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    let err = ctx.accept_step2_response(&responder_cmac).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));

    assert_eq!(ctx.state(), HandshakeState::Complete);
    assert_eq!(ctx.initiator_keyblock(), keyblock);
    assert_eq!(ctx.initiator_cmac(), &initiator_cmac[..]);
    assert_eq!(hsm.session().session_object_count(), 0);

    // The untouched result still delivers the key
    device.set_inc_key_step3(&initiator_cmac, &keyblock).unwrap();
    assert_eq!(
        device.reincarnation_key().unwrap(),
        expected_reincarnation_key(&identity()).as_slice()
    );
}

#[test]
fn test_response_in_wrong_state_fails_context() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let info = identity().derivation_info();

    // Responder answer before step 1 was sent
    let mut ctx = KeyAgreementContext::new(&info);
    let mut point = vec![0x04, 0x41, 0x04];
    point.extend_from_slice(&[0x11; 64]);
    let err = ctx.accept_step1_response(&[0u8; 32], &point).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    assert_eq!(ctx.state(), HandshakeState::Failed);
    assert!(ctx.responder_random().is_empty());
    assert!(hsm.inc_key_step1(&mut ctx).is_err());

    // Responder CMAC while step 1 is still outstanding
    let mut ctx = KeyAgreementContext::new(&info);
    hsm.inc_key_step1(&mut ctx).unwrap();
    let err = ctx.accept_step2_response(&[0u8; 16]).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    assert_eq!(ctx.state(), HandshakeState::Failed);
    assert!(ctx.responder_cmac().is_empty());
    assert_eq!(hsm.session().session_object_count(), 0);
}

#[test]
fn test_malformed_responder_values_rejected() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let mut ctx = KeyAgreementContext::new(&identity().derivation_info());
    hsm.inc_key_step1(&mut ctx).unwrap();

    let err = ctx.accept_step1_response(&[0u8; 31], &[0x04; 67]).unwrap_err();
    assert!(matches!(err, KldError::ProtocolInvariantViolation(_)));
    assert_eq!(ctx.state(), HandshakeState::Failed);
    hsm.abort_key_agreement(&mut ctx);
    assert_eq!(ctx.state(), HandshakeState::Failed);
}

#[test]
fn test_corrupted_responder_cmac() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();
    device.inject(Fault::CorruptResponderCmac);

    let err = inject_reincarnation_key(&mut hsm, &mut device, TIMEOUT).unwrap_err();
    assert!(matches!(err, KldError::AuthenticationFailed));
    assert!(device.reincarnation_key().is_none());
    assert_eq!(hsm.session().session_object_count(), 0);
    assert!(!device.session_open());

    // A fresh attempt succeeds once the fault is gone
    device.clear_faults();
    inject_reincarnation_key(&mut hsm, &mut device, TIMEOUT).unwrap();
    assert!(device.reincarnation_key().is_some());
    assert_eq!(device.sessions_opened(), 2);
}

#[test]
fn test_corrupted_responder_cmac_by_hand() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();
    let (mut ctx, mut responder_cmac) = run_to_step2(&mut hsm, &mut device);
    responder_cmac[0] ^= 0x01;
    ctx.accept_step2_response(&responder_cmac).unwrap();

    let err = hsm.inc_key_step3(&mut ctx).unwrap_err();
    assert!(matches!(err, KldError::AuthenticationFailed));
    assert_eq!(ctx.state(), HandshakeState::Failed);
    assert!(ctx.initiator_cmac().is_empty());
    assert!(ctx.initiator_keyblock().is_empty());
    assert!(!ctx.holds_ephemeral_keys());
    assert_eq!(hsm.session().session_object_count(), 0);
}

#[test]
fn test_transport_failures_clean_up() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);

    for call in [DeviceCall::Identity, DeviceCall::Step1, DeviceCall::Step2, DeviceCall::Step3] {
        let mut device = pinned_device();
        device.inject(Fault::TransportAt(call));

        let err = inject_reincarnation_key(&mut hsm, &mut device, TIMEOUT).unwrap_err();
        assert!(matches!(err, KldError::Transport(_)), "{:?}: {}", call, err);
        assert_eq!(hsm.session().session_object_count(), 0, "{:?} leaked a key", call);
        assert!(!device.session_open());
        assert!(device.reincarnation_key().is_none());
    }

    let mut device = pinned_device();
    device.inject(Fault::TransportAt(DeviceCall::OpenSession));
    let err = inject_reincarnation_key(&mut hsm, &mut device, TIMEOUT).unwrap_err();
    assert!(matches!(err, KldError::Transport(_)));
    assert_eq!(device.sessions_opened(), 0);
}

#[test]
fn test_unknown_initiator_rejected() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let stranger = kld_token_hal::crypto::generate_ec_key();
    let spki = kld_token_hal::crypto::ec_public_key_info(&stranger.public_key()).unwrap();
    let mut device = SimulatedDevice::new(identity()).with_pinned_kld_auth(&spki).unwrap();

    let err = inject_reincarnation_key(&mut hsm, &mut device, TIMEOUT).unwrap_err();
    assert!(matches!(err, KldError::Transport(ref m) if m.contains("unknown key loading device")));
    assert_eq!(hsm.session().session_object_count(), 0);
}

#[test]
fn test_missing_auth_key() {
    let module = kld_token_hal::SoftTokenModule::default();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();

    let err = inject_reincarnation_key(&mut hsm, &mut device, TIMEOUT).unwrap_err();
    assert!(matches!(err, KldError::KeyNotFound(ref label) if label == "KLD_AUTH"));
    assert!(!device.session_open());
}

#[test]
fn test_each_handshake_is_fresh() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let info = identity().derivation_info();

    let mut first = KeyAgreementContext::new(&info);
    let mut second = KeyAgreementContext::new(&info);
    hsm.inc_key_step1(&mut first).unwrap();
    hsm.inc_key_step1(&mut second).unwrap();
    assert_ne!(first.initiator_random(), second.initiator_random());
    assert_eq!(first.initiator_auth_pub_key(), second.initiator_auth_pub_key());
}

#[test]
fn test_derived_key_matches_delivered_key() {
    let module = provisioned_token();
    let mut hsm = open_hsm(&module);
    let mut device = pinned_device();
    inject_reincarnation_key(&mut hsm, &mut device, TIMEOUT).unwrap();

    // A key block wrapped under the delivered key opens with the derived one
    let header: KeyBlockHeader = headers::APP_KEY_TRANSPORT.parse().unwrap();
    let block = keyblock::wrap(device.reincarnation_key().unwrap(), &header, &[0x77; 32]).unwrap();
    let (_, key) = keyblock::unwrap(&expected_reincarnation_key(&identity()), &block).unwrap();
    assert_eq!(&key[..], &[0x77; 32]);
}
