//! Shamir secret sharing of the master encryption key
//!
//! Shares are computed over GF(256) with the `sharks` crate. A share
//! serialises as its x-coordinate followed by the y-bytes, which is also the
//! colon-separated hex form handed to custodians.

use sharks::{Share, Sharks};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::token::CryptoToken;
use crate::types::{from_colon_hex, to_colon_hex, AES_256_KEY_LEN};
use crate::{Hsm, KldError, KldResult};

/// One custodian's share of a secret
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    /// Share x-coordinate (never zero)
    pub index: u8,
    /// Share y-values, one per secret byte
    pub value: Vec<u8>,
}

impl KeyShare {
    /// `index || value`
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(1 + self.value.len()));
        out.push(self.index);
        out.extend_from_slice(&self.value);
        out
    }

    /// Parse `index || value`
    pub fn from_bytes(bytes: &[u8]) -> KldResult<Self> {
        match bytes.split_first() {
            Some((&index, value)) if index != 0 && !value.is_empty() => Ok(KeyShare {
                index,
                value: value.to_vec(),
            }),
            _ => Err(KldError::InvalidParameter("malformed key share".to_string())),
        }
    }

    fn to_sharks(&self) -> KldResult<Share> {
        Share::try_from(self.to_bytes().as_slice())
            .map_err(|e| KldError::InvalidParameter(format!("malformed key share: {}", e)))
    }
}

impl fmt::Display for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_colon_hex(&self.to_bytes()))
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("index", &self.index)
            .field("value", &"<redacted>")
            .finish()
    }
}

impl FromStr for KeyShare {
    type Err = KldError;

    fn from_str(s: &str) -> KldResult<Self> {
        let bytes = Zeroizing::new(from_colon_hex(s)?);
        Self::from_bytes(&bytes)
    }
}

fn check_threshold(threshold: u8, count: u8) -> KldResult<()> {
    if threshold == 0 || threshold > count {
        return Err(KldError::InvalidThreshold(threshold, count));
    }
    Ok(())
}

/// Split `secret` into `count` shares, any `threshold` of which recover it
pub fn split_secret(secret: &[u8], threshold: u8, count: u8) -> KldResult<Vec<KeyShare>> {
    check_threshold(threshold, count)?;
    if secret.is_empty() {
        return Err(KldError::InvalidParameter("cannot split an empty secret".to_string()));
    }
    let dealer = Sharks(threshold).dealer(secret);
    dealer
        .take(count as usize)
        .map(|share| {
            let bytes = Zeroizing::new(Vec::from(&share));
            KeyShare::from_bytes(&bytes)
        })
        .collect()
}

/// Recover a secret from at least `threshold` shares
pub fn combine_shares(threshold: u8, shares: &[KeyShare]) -> KldResult<Zeroizing<Vec<u8>>> {
    if threshold == 0 {
        return Err(KldError::InvalidThreshold(threshold, shares.len().min(255) as u8));
    }
    let parts = shares.iter().map(KeyShare::to_sharks).collect::<KldResult<Vec<_>>>()?;
    Sharks(threshold)
        .recover(parts.as_slice())
        .map(Zeroizing::new)
        .map_err(|e| KldError::InvalidParameter(format!("cannot recover secret: {}", e)))
}

impl<S: CryptoToken> Hsm<S> {
    /// Draw a fresh AES-256 master encryption key from the token RNG and split it
    pub fn create_random_master_encryption_key_shares(&mut self, threshold: u8, count: u8) -> KldResult<Vec<KeyShare>> {
        check_threshold(threshold, count)?;
        let secret = Zeroizing::new(self.random(AES_256_KEY_LEN)?);
        let shares = split_secret(&secret, threshold, count)?;
        log::info!("Split random master encryption key into {} shares (threshold {})", count, threshold);
        Ok(shares)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_combine() {
        let secret: [u8; 32] = rand::random();
        let shares = split_secret(&secret, 2, 3).unwrap();
        assert_eq!(shares.len(), 3);

        for pair in [[0usize, 1], [0, 2], [1, 2]] {
            let subset = vec![shares[pair[0]].clone(), shares[pair[1]].clone()];
            assert_eq!(&*combine_shares(2, &subset).unwrap(), &secret);
        }
    }

    #[test]
    fn test_single_share_does_not_recover() {
        let secret = [0xA5u8; 32];
        let shares = split_secret(&secret, 2, 3).unwrap();
        assert!(combine_shares(2, &shares[..1]).is_err());
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(matches!(split_secret(&[1u8; 32], 0, 3), Err(KldError::InvalidThreshold(0, 3))));
        assert!(matches!(split_secret(&[1u8; 32], 4, 3), Err(KldError::InvalidThreshold(4, 3))));
    }

    #[test]
    fn test_share_text_form() {
        let share = KeyShare {
            index: 1,
            value: vec![0xDE, 0xAD],
        };
        assert_eq!(share.to_string(), "01:DE:AD");
        assert_eq!("01:de:ad".parse::<KeyShare>().unwrap(), share);
        assert!("00:DE:AD".parse::<KeyShare>().is_err());
        assert!(!format!("{:?}", share).contains("DE"));
    }
}
