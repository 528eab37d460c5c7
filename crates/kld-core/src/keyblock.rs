//! ANSI X9.143 (TR-31 version D) key blocks
//!
//! Layout: 16-character header, hex of the AES-CBC encrypted key data, hex of
//! the 16-byte AES-CMAC. Encryption and authentication keys are derived from
//! the key block protection key with the SP 800-108 counter-mode KDF over
//! AES-CMAC. The MAC doubles as the CBC IV.

use rand_core::{OsRng, RngCore};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::cipher::{aes_cbc_decrypt, aes_cbc_encrypt, aes_cmac, constant_time_eq, AES_BLOCK_LEN};
use crate::token::{CryptoToken, KeyTemplate, Mechanism, ObjectHandle, ReturnCode};
use crate::{Hsm, KldError, KldResult};

/// Length of the fixed header
pub const HEADER_LEN: usize = 16;

/// Header codes used by the provisioning and key agreement flows
pub mod headers {
    /// Imported key block protection key
    pub const KBPK_IMPORT: &str = "D0016K1AB00N0000";
    /// Ephemeral key block protection key of a handshake
    pub const EPHEMERAL_KBPK: &str = "D0016K1AE00N0020";
    /// Reincarnation key (attribute and wrap header)
    pub const REINCARNATION_KEY: &str = "D0016K1AD00N0000";
    /// RSA signing private key export
    pub const RSA_PRIVATE_EXPORT: &str = "D0016S0RS00N0010";
    /// Public key export
    pub const PUBLIC_KEY_EXPORT: &str = "D0016S0RV00N0010";
    /// EC private key export
    pub const EC_PRIVATE_EXPORT: &str = "D0016S0ES00N0010";
    /// AES master key export
    pub const AES_MASTER_EXPORT: &str = "D0016D0AE00N0020";
    /// Application signing key transport to a device
    pub const APP_KEY_TRANSPORT: &str = "D0016S0RV00N0000";
}

/// Parsed key block header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlockHeader {
    /// Key usage, e.g. `K1`, `S0`, `D0`
    pub key_usage: [u8; 2],
    /// Algorithm, e.g. `A` (AES), `R` (RSA), `E` (EC)
    pub algorithm: u8,
    /// Mode of use
    pub mode_of_use: u8,
    /// Key version number
    pub key_version: [u8; 2],
    /// Exportability
    pub exportability: u8,
    /// Reserved field, carried opaquely
    pub reserved: [u8; 2],
}

impl KeyBlockHeader {
    /// Render with the given total key block length in the length field
    pub fn encode(&self, total_len: usize) -> String {
        format!(
            "D{:04}{}{}{}{}{}00{}",
            total_len,
            ascii(&self.key_usage),
            self.algorithm as char,
            self.mode_of_use as char,
            ascii(&self.key_version),
            self.exportability as char,
            ascii(&self.reserved),
        )
    }

    fn parse(text: &[u8]) -> Result<(Self, usize), String> {
        if text.len() < HEADER_LEN {
            return Err(format!("header shorter than {} characters", HEADER_LEN));
        }
        let h = &text[..HEADER_LEN];
        if !h.iter().all(|c| c.is_ascii_alphanumeric()) {
            return Err("header contains non alphanumeric characters".to_string());
        }
        if h[0] != b'D' {
            return Err(format!("unsupported key block version '{}'", h[0] as char));
        }
        let length = std::str::from_utf8(&h[1..5])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| "length field is not numeric".to_string())?;
        if &h[12..14] != b"00" {
            return Err("optional blocks are not supported".to_string());
        }
        Ok((
            KeyBlockHeader {
                key_usage: [h[5], h[6]],
                algorithm: h[7],
                mode_of_use: h[8],
                key_version: [h[9], h[10]],
                exportability: h[11],
                reserved: [h[14], h[15]],
            },
            length,
        ))
    }
}

impl FromStr for KeyBlockHeader {
    type Err = KldError;

    fn from_str(s: &str) -> KldResult<Self> {
        if s.len() != HEADER_LEN {
            return Err(KldError::InvalidParameter(format!(
                "key block header must be {} characters: {:?}",
                HEADER_LEN, s
            )));
        }
        Self::parse(s.as_bytes())
            .map(|(header, _)| header)
            .map_err(KldError::InvalidParameter)
    }
}

impl fmt::Display for KeyBlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode(HEADER_LEN))
    }
}

fn ascii(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).unwrap_or("??")
}

/// Encryption and authentication keys derived from a KBPK
struct BindingKeys {
    kbek: Zeroizing<Vec<u8>>,
    kbak: Zeroizing<Vec<u8>>,
}

const USAGE_ENCRYPTION: [u8; 2] = [0x00, 0x00];
const USAGE_AUTHENTICATION: [u8; 2] = [0x00, 0x01];

fn derive_binding_key(kbpk: &[u8], usage: [u8; 2]) -> KldResult<Zeroizing<Vec<u8>>> {
    let (algorithm, bits): (u16, u16) = match kbpk.len() {
        16 => (0x0002, 128),
        24 => (0x0003, 192),
        32 => (0x0004, 256),
        n => {
            return Err(KldError::InvalidParameter(format!(
                "key block protection key must be an AES key, got {} bytes",
                n
            )))
        }
    };
    let mut out = Zeroizing::new(Vec::with_capacity(32));
    let mut counter = 1u8;
    while out.len() < kbpk.len() {
        let mut input = [0u8; 8];
        input[0] = counter;
        input[1..3].copy_from_slice(&usage);
        input[3] = 0x00;
        input[4..6].copy_from_slice(&algorithm.to_be_bytes());
        input[6..8].copy_from_slice(&bits.to_be_bytes());
        let block = aes_cmac(kbpk, &input).map_err(|e| KldError::InvalidParameter(e.to_string()))?;
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(kbpk.len());
    Ok(out)
}

fn binding_keys(kbpk: &[u8]) -> KldResult<BindingKeys> {
    Ok(BindingKeys {
        kbek: derive_binding_key(kbpk, USAGE_ENCRYPTION)?,
        kbak: derive_binding_key(kbpk, USAGE_AUTHENTICATION)?,
    })
}

fn pad_len(key_len: usize) -> usize {
    let rem = (2 + key_len) % AES_BLOCK_LEN;
    if rem == 0 {
        0
    } else {
        AES_BLOCK_LEN - rem
    }
}

/// Wrap `key` under `kbpk` with random padding
pub fn wrap(kbpk: &[u8], header: &KeyBlockHeader, key: &[u8]) -> KldResult<String> {
    let mut pad = vec![0u8; pad_len(key.len())];
    OsRng.fill_bytes(&mut pad);
    wrap_with_padding(kbpk, header, key, &pad)
}

pub(crate) fn wrap_with_padding(
    kbpk: &[u8],
    header: &KeyBlockHeader,
    key: &[u8],
    pad: &[u8],
) -> KldResult<String> {
    let bits = key
        .len()
        .checked_mul(8)
        .and_then(|b| u16::try_from(b).ok())
        .filter(|b| *b > 0)
        .ok_or_else(|| KldError::InvalidParameter(format!("cannot wrap a {} byte key", key.len())))?;
    if pad.len() != pad_len(key.len()) {
        return Err(KldError::InvalidParameter("padding length mismatch".to_string()));
    }
    let keys = binding_keys(kbpk)?;

    let mut clear = Zeroizing::new(Vec::with_capacity(2 + key.len() + pad.len()));
    clear.extend_from_slice(&bits.to_be_bytes());
    clear.extend_from_slice(key);
    clear.extend_from_slice(pad);

    let total_len = HEADER_LEN + 2 * clear.len() + 2 * AES_BLOCK_LEN;
    if total_len > 9999 {
        return Err(KldError::InvalidParameter(format!(
            "key block length {} exceeds the header length field",
            total_len
        )));
    }
    let header_text = header.encode(total_len);

    let mut mac_input = Zeroizing::new(Vec::with_capacity(HEADER_LEN + clear.len()));
    mac_input.extend_from_slice(header_text.as_bytes());
    mac_input.extend_from_slice(&clear);
    let mac = aes_cmac(&keys.kbak, &mac_input).map_err(|e| KldError::InvalidParameter(e.to_string()))?;

    let encrypted = aes_cbc_encrypt(&keys.kbek, &mac, &clear)
        .map_err(|e| KldError::InvalidParameter(e.to_string()))?;

    Ok(format!(
        "{}{}{}",
        header_text,
        hex::encode_upper(&encrypted),
        hex::encode_upper(mac)
    ))
}

/// Unwrap a key block, returning its header and the clear key
///
/// Every failure, including a MAC mismatch, is reported as
/// [`KldError::UnwrapFailed`].
pub fn unwrap(kbpk: &[u8], keyblock: &str) -> KldResult<(KeyBlockHeader, Zeroizing<Vec<u8>>)> {
    let fail = |reason: &str| KldError::UnwrapFailed(reason.to_string());
    let text = keyblock.as_bytes();

    let (header, length) = KeyBlockHeader::parse(text).map_err(|e| fail(&e))?;
    if length != text.len() {
        return Err(fail("length field does not match key block length"));
    }
    let body = hex::decode(&keyblock[HEADER_LEN..]).map_err(|_| fail("key block body is not hex"))?;
    if body.len() < 2 * AES_BLOCK_LEN || body.len() % AES_BLOCK_LEN != 0 {
        return Err(fail("encrypted key data is not block aligned"));
    }
    let (encrypted, mac) = body.split_at(body.len() - AES_BLOCK_LEN);

    let keys = binding_keys(kbpk).map_err(|e| fail(&e.to_string()))?;
    let clear = Zeroizing::new(aes_cbc_decrypt(&keys.kbek, mac, encrypted).map_err(|e| fail(&e.to_string()))?);

    let mut mac_input = Zeroizing::new(Vec::with_capacity(HEADER_LEN + clear.len()));
    mac_input.extend_from_slice(&text[..HEADER_LEN]);
    mac_input.extend_from_slice(&clear);
    let expected = aes_cmac(&keys.kbak, &mac_input).map_err(|e| fail(&e.to_string()))?;
    if !constant_time_eq(&expected, mac) {
        return Err(fail("MAC verification failed"));
    }

    let bits = u16::from_be_bytes([clear[0], clear[1]]) as usize;
    if bits == 0 || bits % 8 != 0 || bits / 8 > clear.len() - 2 {
        return Err(fail("invalid key length"));
    }
    let key = Zeroizing::new(clear[2..2 + bits / 8].to_vec());
    Ok((header, key))
}

/// Wrap a provider-resident key under a provider-resident KBPK
pub(crate) fn wrap_on_token<S: CryptoToken + ?Sized>(
    token: &mut S,
    header: &str,
    wrapping_key: ObjectHandle,
    key: ObjectHandle,
) -> KldResult<String> {
    let wrapped = token.wrap_key(&Mechanism::KeyBlockWrap { header: Some(header) }, wrapping_key, key)?;
    String::from_utf8(wrapped).map_err(|_| KldError::ProtocolInvariantViolation("key block is not ASCII".to_string()))
}

impl<S: CryptoToken> Hsm<S> {
    /// Export `key` as a key block under `wrapping_key`
    pub fn wrap_keyblock(&mut self, wrapping_key: ObjectHandle, key: ObjectHandle, header: &str) -> KldResult<String> {
        header.parse::<KeyBlockHeader>()?;
        let keyblock = wrap_on_token(&mut self.session, header, wrapping_key, key)?;
        log::debug!("Wrapped key {} under {} with header {}", key, wrapping_key, header);
        Ok(keyblock)
    }

    /// Import a key block under `unwrapping_key` as a new object described by `template`
    ///
    /// A rejected block (bad header, length or MAC) is reported as
    /// [`KldError::UnwrapFailed`] and creates no object.
    pub fn unwrap_keyblock(
        &mut self,
        unwrapping_key: ObjectHandle,
        keyblock: &str,
        template: &KeyTemplate,
    ) -> KldResult<ObjectHandle> {
        let header = keyblock.get(..HEADER_LEN).unwrap_or(keyblock);
        let mechanism = Mechanism::KeyBlockWrap { header: None };
        let handle = self
            .session
            .unwrap_key(&mechanism, unwrapping_key, keyblock.as_bytes(), template)
            .map_err(|e| match e.code {
                ReturnCode::WRAPPED_KEY_INVALID => KldError::UnwrapFailed(e.message),
                _ => KldError::Provider(e),
            })?;
        log::debug!("Unwrapped key block with header {} into {}", header, handle);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kbpk() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn test_header_constants_parse() {
        for text in [
            headers::KBPK_IMPORT,
            headers::EPHEMERAL_KBPK,
            headers::REINCARNATION_KEY,
            headers::RSA_PRIVATE_EXPORT,
            headers::PUBLIC_KEY_EXPORT,
            headers::EC_PRIVATE_EXPORT,
            headers::AES_MASTER_EXPORT,
            headers::APP_KEY_TRANSPORT,
        ] {
            let header: KeyBlockHeader = text.parse().unwrap();
            assert_eq!(header.to_string(), text);
        }
        let header: KeyBlockHeader = headers::RSA_PRIVATE_EXPORT.parse().unwrap();
        assert_eq!(&header.key_usage, b"S0");
        assert_eq!(header.algorithm, b'R');
        assert_eq!(header.mode_of_use, b'S');
        assert_eq!(header.exportability, b'N');
        assert_eq!(&header.reserved, b"10");
    }

    #[test]
    fn test_header_rejects_malformed() {
        assert!("B0016K1AB00N0000".parse::<KeyBlockHeader>().is_err());
        assert!("D0016K1AB00N01".parse::<KeyBlockHeader>().is_err());
        assert!("D0016K1AB00N0100".parse::<KeyBlockHeader>().is_err());
        assert!("DXXXXK1AB00N0000".parse::<KeyBlockHeader>().is_err());
        assert!("D0016K1A-00N0000".parse::<KeyBlockHeader>().is_err());
    }

    #[test]
    fn test_binding_key_derivation() {
        let keys = binding_keys(&kbpk()).unwrap();
        assert_eq!(
            hex::encode(&*keys.kbek),
            "90408cf5b9cb450ec1923dca3b470b08013ce1fc188c5727be7637c74eba9d4e"
        );
        assert_eq!(
            hex::encode(&*keys.kbak),
            "64969fc5132ef67668ec03385b161305b8b254873081253392332618d31efc95"
        );
    }

    #[test]
    fn test_wrap_known_answer() {
        let header: KeyBlockHeader = headers::REINCARNATION_KEY.parse().unwrap();
        let block = wrap_with_padding(&kbpk(), &header, &[0x11; 32], &[0u8; 14]).unwrap();
        assert_eq!(
            block,
            "D0144K1AD00N0000DC36771829487A4F0298ABFF11B95BD043CADF769A7F92D9D67EA62DECE5473A98401E37C69948022CA687B50BF5B58FE992E978ABD258CC002B1DEB59620813"
        );
    }

    #[test]
    fn test_unwrap_published_vector() {
        let kbpk = hex::decode("88E1AB2A2E3DD38C1FA039A536500CC8A87AB9D62DC92C01058FA79F44657DE6").unwrap();
        let block = "D0112P0AE00E0000B82679114F470F540165EDFBF7E250FCEA43F810D215F8D207E2E417C07156A27E8E31DA05F7425509593D03A457DC34";
        let (header, key) = unwrap(&kbpk, block).unwrap();
        assert_eq!(&header.key_usage, b"P0");
        assert_eq!(header.exportability, b'E');
        assert_eq!(hex::encode_upper(&*key), "3F419E1CB7079442AA37474C2EFBF8B8");
    }

    #[test]
    fn test_wrap_unwrap_all_headers() {
        let kbpk = kbpk();
        for (text, key_len) in [
            (headers::REINCARNATION_KEY, 32),
            (headers::AES_MASTER_EXPORT, 32),
            (headers::RSA_PRIVATE_EXPORT, 1794),
            (headers::PUBLIC_KEY_EXPORT, 422),
            (headers::EC_PRIVATE_EXPORT, 138),
        ] {
            let header: KeyBlockHeader = text.parse().unwrap();
            let key: Vec<u8> = (0..key_len).map(|i| (i * 7 % 251) as u8).collect();
            let block = wrap(&kbpk, &header, &key).unwrap();
            assert_eq!(block.len(), block[1..5].parse::<usize>().unwrap());
            assert_eq!(block.len() % 2, 0);
            let (parsed, unwrapped) = unwrap(&kbpk, &block).unwrap();
            assert_eq!(parsed, header);
            assert_eq!(&*unwrapped, &key);
        }
    }

    #[test]
    fn test_tampered_block_rejected() {
        let header: KeyBlockHeader = headers::REINCARNATION_KEY.parse().unwrap();
        let block = wrap(&kbpk(), &header, &[0x5A; 32]).unwrap();

        let mut tampered = block.clone().into_bytes();
        let idx = 40;
        tampered[idx] = if tampered[idx] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(matches!(unwrap(&kbpk(), &tampered), Err(KldError::UnwrapFailed(_))));

        let relabelled = block.replacen("K1AD", "K1AE", 1);
        assert!(matches!(unwrap(&kbpk(), &relabelled), Err(KldError::UnwrapFailed(_))));

        let mut wrong_kbpk = kbpk();
        wrong_kbpk[0] ^= 1;
        assert!(matches!(unwrap(&wrong_kbpk, &block), Err(KldError::UnwrapFailed(_))));

        assert!(matches!(unwrap(&kbpk(), &block[..block.len() - 2]), Err(KldError::UnwrapFailed(_))));
    }

    #[test]
    fn test_wrap_rejects_bad_kbpk() {
        let header: KeyBlockHeader = headers::REINCARNATION_KEY.parse().unwrap();
        assert!(matches!(
            wrap(&[0u8; 20], &header, &[0u8; 32]),
            Err(KldError::InvalidParameter(_))
        ));
        assert!(wrap(&kbpk(), &header, &[]).is_err());
    }
}
