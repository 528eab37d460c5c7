//! Software collaborators for the reincarnation key loader
//!
//! Substitutable implementations of the two external parties the protocol
//! core talks to:
//! - [`soft::SoftTokenModule`]: in-memory cryptographic token honouring the
//!   whole token capability interface
//! - [`device_sim::SimulatedDevice`]: compute module playing the responder
//!   side of the reincarnation key agreement
//!
//! Both keep their secrets in zeroizing buffers and never log key values.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod device_sim;
pub mod memory;
pub mod soft;

pub use device_sim::{DeviceCall, Fault, SimulatedDevice};
pub use memory::SecureMemory;
pub use soft::{SoftSession, SoftTokenModule};

use kld_core::token::{ReturnCode, TokenError};
use thiserror::Error;

/// Software backend errors
#[derive(Error, Debug)]
pub enum HalError {
    /// Cryptographic operation failed
    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),

    /// Key or point encoding could not be parsed or produced
    #[error("Invalid key encoding: {0}")]
    EncodingError(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type for software backend operations
pub type HalResult<T> = Result<T, HalError>;

impl From<HalError> for TokenError {
    fn from(e: HalError) -> Self {
        let code = match e {
            HalError::CryptoError(_) => ReturnCode::FUNCTION_FAILED,
            HalError::EncodingError(_) => ReturnCode::ATTRIBUTE_VALUE_INVALID,
            HalError::InvalidParameter(_) => ReturnCode::ARGUMENTS_BAD,
        };
        TokenError::new(code, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors() {
        let err = HalError::EncodingError("not a point".to_string());
        assert_eq!(err.to_string(), "Invalid key encoding: not a point");

        let token: TokenError = err.into();
        assert_eq!(token.code, ReturnCode::ATTRIBUTE_VALUE_INVALID);
    }
}
