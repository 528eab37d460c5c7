//! KLD RoT: key loading for secure compute modules
//!
//! Operator-facing layer over [`kld_core`]:
//! - [`config`]: JSON configuration of the token slot, key labels and
//!   device timeouts
//! - [`logging`]: `env_logger` initialisation
//! - [`operator`]: one call per provisioning task (root key ceremony, KBPK
//!   import, signing key generation, master key shares, device injection and
//!   manufacturing reset)

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod operator;

pub use config::{ConfigError, KeyLoaderConfig};
pub use kld_core;
