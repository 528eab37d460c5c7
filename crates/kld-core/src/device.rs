//! Compute device collaborator and the flows that drive it
//!
//! [`ComputeDevice`] is the RPC boundary to the module being provisioned.
//! The flows open a service session, run the HSM side of an operation and
//! close the session again on every exit path.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::agreement::KeyAgreementContext;
use crate::token::CryptoToken;
use crate::types::{
    DeviceIdentity, LifecycleInfo, LifecycleState, ManufacturingInfo, ManufacturingResetSecret, ReincarnationInfo,
    DERIVATION_INFO_LEN,
};
use crate::{Hsm, KldError, KldResult};

/// Responder answer to step 1 of the reincarnation key agreement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step1Response {
    /// Responder random
    pub responder_random: Vec<u8>,
    /// Responder ephemeral public key, DER OCTET STRING of the point
    pub responder_eph_pub_key: Vec<u8>,
}

/// Secure compute module reachable over a service channel
///
/// Implementations report channel and device failures as
/// [`KldError::Transport`].
pub trait ComputeDevice {
    /// Open a service session; `timeout` bounds every subsequent request
    fn open_service_session(&mut self, timeout: Duration) -> KldResult<()>;

    /// Close the service session
    fn close_service_session(&mut self) -> KldResult<()>;

    /// Step 1 of the reincarnation key agreement
    fn set_inc_key_step1(&mut self, initiator_random: &[u8], initiator_auth_pub_key: &[u8]) -> KldResult<Step1Response>;

    /// Step 2; returns the responder CMAC
    fn set_inc_key_step2(&mut self, initiator_eph_pub_key: &[u8], initiator_signature: &[u8]) -> KldResult<Vec<u8>>;

    /// Step 3; delivers the initiator CMAC and the reincarnation key block
    fn set_inc_key_step3(&mut self, initiator_cmac: &[u8], initiator_keyblock: &str) -> KldResult<()>;

    /// Manufacturing record
    fn manufacturing_info(&mut self) -> KldResult<ManufacturingInfo>;

    /// Reincarnation record
    fn reincarnation_info(&mut self) -> KldResult<ReincarnationInfo>;

    /// Lifecycle record
    fn lifecycle_info(&mut self) -> KldResult<LifecycleInfo>;

    /// Input the manufacturing reset secret is derived from
    fn mfg_reset_secret_derivation_input(&mut self) -> KldResult<u32>;

    /// Unlock the device for a manufacturing reset
    fn lock(&mut self, secret: &ManufacturingResetSecret) -> KldResult<()>;

    /// Install an application signing key block
    fn set_app_key(&mut self, keyblock: &str) -> KldResult<()>;

    /// Reincarnation key derivation input: manufacturing || reincarnation records
    fn reincarnation_key_derivation_info(&mut self) -> KldResult<[u8; DERIVATION_INFO_LEN]> {
        let identity = DeviceIdentity {
            manufacturing: self.manufacturing_info()?,
            reincarnation: self.reincarnation_info()?,
        };
        Ok(identity.derivation_info())
    }
}

/// Open service session, closed when dropped
pub struct ServiceSession<'a, D: ComputeDevice + ?Sized> {
    device: &'a mut D,
    open: bool,
}

impl<'a, D: ComputeDevice + ?Sized> ServiceSession<'a, D> {
    /// Open a service session on `device`
    pub fn open(device: &'a mut D, timeout: Duration) -> KldResult<Self> {
        device.open_service_session(timeout).map_err(transport)?;
        log::debug!("Opened device service session (timeout {:?})", timeout);
        Ok(ServiceSession { device, open: true })
    }

    /// Close the session, reporting failure
    pub fn close(mut self) -> KldResult<()> {
        self.open = false;
        self.device.close_service_session().map_err(transport)
    }
}

impl<D: ComputeDevice + ?Sized> Deref for ServiceSession<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        &*self.device
    }
}

impl<D: ComputeDevice + ?Sized> DerefMut for ServiceSession<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut *self.device
    }
}

impl<D: ComputeDevice + ?Sized> Drop for ServiceSession<'_, D> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.device.close_service_session() {
                log::warn!("Failed to close device service session: {}", e);
            }
        }
    }
}

/// Report a device failure as a transport error
fn transport(e: KldError) -> KldError {
    match e {
        KldError::Transport(_) => e,
        other => KldError::Transport(other.to_string()),
    }
}

fn run_handshake<S, D>(hsm: &mut Hsm<S>, device: &mut D, ctx: &mut KeyAgreementContext) -> KldResult<()>
where
    S: CryptoToken,
    D: ComputeDevice + ?Sized,
{
    hsm.inc_key_step1(ctx)?;
    let response = device
        .set_inc_key_step1(ctx.initiator_random(), ctx.initiator_auth_pub_key())
        .map_err(transport)?;
    ctx.accept_step1_response(&response.responder_random, &response.responder_eph_pub_key)?;

    hsm.inc_key_step2(ctx)?;
    let responder_cmac = device
        .set_inc_key_step2(ctx.initiator_eph_pub_key(), ctx.initiator_signature())
        .map_err(transport)?;
    ctx.accept_step2_response(&responder_cmac)?;

    hsm.inc_key_step3(ctx)?;
    device
        .set_inc_key_step3(ctx.initiator_cmac(), ctx.initiator_keyblock())
        .map_err(transport)
}

/// Run the reincarnation key agreement against `device`
///
/// Any failure aborts the handshake and destroys its ephemeral keys; the
/// handshake is never resumed. Callers may retry from the start.
pub fn inject_reincarnation_key<S, D>(hsm: &mut Hsm<S>, device: &mut D, timeout: Duration) -> KldResult<()>
where
    S: CryptoToken,
    D: ComputeDevice + ?Sized,
{
    let mut session = ServiceSession::open(device, timeout)?;
    let info = session.reincarnation_key_derivation_info().map_err(transport)?;
    let mut ctx = KeyAgreementContext::new(&info);

    if let Err(e) = run_handshake(hsm, &mut *session, &mut ctx) {
        hsm.abort_key_agreement(&mut ctx);
        log::warn!("Reincarnation key injection failed: {}", e);
        return Err(e);
    }

    session.close()?;
    log::info!("Reincarnation key injected");
    Ok(())
}

/// Transport the application signing key to `device`
pub fn inject_app_key<S, D>(hsm: &mut Hsm<S>, device: &mut D, timeout: Duration) -> KldResult<()>
where
    S: CryptoToken,
    D: ComputeDevice + ?Sized,
{
    let mut session = ServiceSession::open(device, timeout)?;
    let info = session.reincarnation_key_derivation_info().map_err(transport)?;
    let keyblock = hsm.app_key_keyblock(&info)?;
    session.set_app_key(&keyblock).map_err(transport)?;
    session.close()?;
    log::info!("Application signing key injected");
    Ok(())
}

/// Unlock a `Manufactured` device for reset with its derived secret
pub fn manufacturing_reset<S, D>(hsm: &mut Hsm<S>, device: &mut D, timeout: Duration) -> KldResult<()>
where
    S: CryptoToken,
    D: ComputeDevice + ?Sized,
{
    let mut session = ServiceSession::open(device, timeout)?;
    let lifecycle = session.lifecycle_info().map_err(transport)?;
    if lifecycle.state != LifecycleState::Manufactured {
        return Err(KldError::InvalidLifecycleState {
            required: LifecycleState::Manufactured,
            actual: lifecycle.state,
        });
    }

    let input = session.mfg_reset_secret_derivation_input().map_err(transport)?;
    let secret = hsm.derive_mfg_reset_secret(input)?;
    session.lock(&secret).map_err(transport)?;
    session.close()?;
    log::info!("Manufacturing reset unlocked");
    Ok(())
}
