//! Reincarnation key loading core
//!
//! This crate implements the HSM side of device provisioning and re-keying:
//! - Three-step mutually authenticated ECDH handshake (reincarnation key agreement)
//! - Manufacturing reset secret and reincarnation key derivation
//! - ANSI X9.143 (TR-31 version D) key-block wrap/unwrap and key-check-values
//! - Root key ceremony and Shamir backup of the master encryption key
//!
//! All cryptographic work is delegated to a [`token::CryptoToken`] session so any
//! conforming provider (PKCS#11 binding, software token, test double) can be used.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod agreement;
pub mod cipher;
pub mod derivation;
pub mod device;
pub mod hsm;
pub mod keyblock;
pub mod provisioning;
pub mod shares;
pub mod token;
pub mod transcript;
pub mod types;

pub use agreement::{HandshakeState, KeyAgreementContext};
pub use device::{ComputeDevice, ServiceSession, Step1Response};
pub use hsm::{Hsm, KeyLabels};
pub use keyblock::KeyBlockHeader;
pub use shares::KeyShare;
pub use token::{CryptoToken, KeyScope, ObjectHandle, TokenError, TokenModule, TokenResult};
pub use types::*;

use thiserror::Error;

/// Key loading errors
#[derive(Error, Debug)]
pub enum KldError {
    /// A key required by the operation is not present on the token
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Public key encoding does not match the expected secp256r1 layout
    #[error("Malformed public key info: {0}")]
    MalformedKeyInfo(String),

    /// Length or shape of a protocol value is wrong (provider or device bug)
    #[error("Protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    /// MAC verification of the responder failed
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Key block header or MAC invalid on import
    #[error("Key block unwrap failed: {0}")]
    UnwrapFailed(String),

    /// Underlying cryptographic token failure
    #[error("Provider error: {0}")]
    Provider(#[from] TokenError),

    /// Device RPC failure
    #[error("Device transport error: {0}")]
    Transport(String),

    /// Invalid secret sharing parameters
    #[error("Invalid threshold: k={0}, n={1} (require 1 <= k <= n)")]
    InvalidThreshold(u8, u8),

    /// Invalid argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Device is not in the lifecycle state the operation requires
    #[error("Device lifecycle state {actual} does not permit this operation (requires {required})")]
    InvalidLifecycleState {
        /// State the operation requires
        required: LifecycleState,
        /// State reported by the device
        actual: LifecycleState,
    },
}

/// Result type for key loading operations
pub type KldResult<T> = Result<T, KldError>;
