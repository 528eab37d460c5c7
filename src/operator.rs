//! Operator flows
//!
//! Each flow opens an HSM session on the configured slot, runs one
//! provisioning task and returns printable output. Hex arguments are accepted
//! in the colon separated form used by the key ceremony records.

use anyhow::{bail, Context, Result};
use kld_core::token::{Attribute, CryptoToken, TokenModule};
use kld_core::types::{from_colon_hex, to_colon_hex, AES_256_KEY_LEN};
use kld_core::device as flows;
use kld_core::{ComputeDevice, Hsm};
use zeroize::Zeroizing;

use crate::config::KeyLoaderConfig;

/// Parse a colon separated hex AES-256 key
pub fn parse_aes_key(text: &str) -> Result<Zeroizing<[u8; AES_256_KEY_LEN]>> {
    let bytes = Zeroizing::new(from_colon_hex(text)?);
    if bytes.len() != AES_256_KEY_LEN {
        bail!("key is {} bytes, expected {}", bytes.len(), AES_256_KEY_LEN);
    }
    let mut key = Zeroizing::new([0u8; AES_256_KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn open_hsm<M: TokenModule>(module: &M, config: &KeyLoaderConfig) -> Result<Hsm<M::Session>> {
    Hsm::open(module, config.slot, config.labels.clone())
        .with_context(|| format!("cannot open HSM session on slot {}", config.slot))
}

/// Root key ceremony; returns the exported key bundle as pretty JSON
pub fn generate_root_keyblocks<M: TokenModule>(module: &M, config: &KeyLoaderConfig, root_kbpk: &str) -> Result<String> {
    let kbpk = parse_aes_key(root_kbpk).context("invalid root KBPK")?;
    let mut hsm = open_hsm(module, config)?;
    let keys = hsm.generate_root_hsm_keys(&kbpk).context("root key ceremony failed")?;
    hsm.close()?;
    Ok(serde_json::to_string_pretty(&keys)?)
}

/// Debug root key ceremony exporting the fixed development key set
#[cfg(feature = "debug-keys")]
pub fn generate_debug_root_keyblocks<M: TokenModule>(
    module: &M,
    config: &KeyLoaderConfig,
    root_kbpk: &str,
) -> Result<String> {
    let kbpk = parse_aes_key(root_kbpk).context("invalid root KBPK")?;
    let mut hsm = open_hsm(module, config)?;
    let keys = hsm
        .create_debug_root_hsm_keys(&kbpk)
        .context("debug root key ceremony failed")?;
    hsm.close()?;
    Ok(serde_json::to_string_pretty(&keys)?)
}

/// Import a persistent key block protection key; returns its KCV
pub fn import_kbpk<M: TokenModule>(module: &M, config: &KeyLoaderConfig, label: &str, value: &str) -> Result<String> {
    let key = parse_aes_key(value).context("invalid KBPK")?;
    let mut hsm = open_hsm(module, config)?;
    hsm.create_key_block_protection_key(label, &key, true)
        .with_context(|| format!("cannot import KBPK '{}'", label))?;
    let kcv = hsm.compute_aes_key_check_value(&key)?;
    hsm.close()?;
    log::info!("KBPK '{}' imported, KCV {}", label, to_colon_hex(&kcv));
    Ok(to_colon_hex(&kcv))
}

/// Generate the persistent application signing key pair; returns the public
/// key as colon separated SubjectPublicKeyInfo DER
pub fn generate_app_sign_key<M: TokenModule>(module: &M, config: &KeyLoaderConfig) -> Result<String> {
    let mut hsm = open_hsm(module, config)?;
    let (public, _) = hsm
        .create_signing_key_pair(&config.labels.application_sign, true)
        .context("cannot generate application signing key")?;
    let info = hsm.session_mut().get_attribute(public, Attribute::PublicKeyInfo)?;
    hsm.close()?;
    Ok(to_colon_hex(&info))
}

/// Random master encryption key split per the configured threshold; one
/// colon separated share per entry
pub fn generate_mek_shares<M: TokenModule>(module: &M, config: &KeyLoaderConfig) -> Result<Vec<String>> {
    let mut hsm = open_hsm(module, config)?;
    let shares = hsm
        .create_random_master_encryption_key_shares(config.share_threshold, config.share_count)
        .context("cannot create master encryption key shares")?;
    hsm.close()?;
    Ok(shares.iter().map(ToString::to_string).collect())
}

/// Run the reincarnation key agreement with `device`
pub fn inject_reincarnation_key<M, D>(module: &M, config: &KeyLoaderConfig, device: &mut D) -> Result<()>
where
    M: TokenModule,
    D: ComputeDevice + ?Sized,
{
    let mut hsm = open_hsm(module, config)?;
    flows::inject_reincarnation_key(&mut hsm, device, config.device_timeout())
        .context("reincarnation key injection failed")?;
    hsm.close()?;
    Ok(())
}

/// Transport the application signing key to `device`
pub fn inject_app_key<M, D>(module: &M, config: &KeyLoaderConfig, device: &mut D) -> Result<()>
where
    M: TokenModule,
    D: ComputeDevice + ?Sized,
{
    let mut hsm = open_hsm(module, config)?;
    flows::inject_app_key(&mut hsm, device, config.device_timeout()).context("application key injection failed")?;
    hsm.close()?;
    Ok(())
}

/// Unlock a `Manufactured` device for reset
pub fn manufacturing_reset<M, D>(module: &M, config: &KeyLoaderConfig, device: &mut D) -> Result<()>
where
    M: TokenModule,
    D: ComputeDevice + ?Sized,
{
    let mut hsm = open_hsm(module, config)?;
    flows::manufacturing_reset(&mut hsm, device, config.device_timeout()).context("manufacturing reset failed")?;
    hsm.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aes_key() {
        let text = (0u8..32).map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(":");
        let key = parse_aes_key(&text).unwrap();
        assert_eq!(key[31], 0x1F);

        let compact = "00".repeat(32);
        assert_eq!(*parse_aes_key(&compact).unwrap(), [0u8; 32]);

        assert!(parse_aes_key("00:11").is_err());
        assert!(parse_aes_key("zz").is_err());
    }
}
