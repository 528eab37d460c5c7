//! Asymmetric primitives shared by the software token and the simulated device
//!
//! secp256r1 key handling (SEC1 points, SPKI and PKCS#8 DER), ECDH1 with the
//! ANSI X9.63 SHA-384 KDF, raw `r || s` ECDSA over SHA-256, and RSA key
//! generation and encodings.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha384};
use zeroize::Zeroizing;

use crate::{HalError, HalResult};

/// Length of an uncompressed secp256r1 point
pub const EC_POINT_LEN: usize = 65;

/// DER OCTET STRING header in front of an uncompressed point
pub const EC_POINT_DER_PREFIX: [u8; 2] = [0x04, 0x41];

/// Length of a raw `r || s` ECDSA signature
pub const ECDSA_SIGNATURE_LEN: usize = 64;

/// Fresh secp256r1 private key
pub fn generate_ec_key() -> SecretKey {
    SecretKey::random(&mut OsRng)
}

/// Public key as a DER OCTET STRING of the uncompressed point (67 bytes)
pub fn ec_point_der(public: &PublicKey) -> Vec<u8> {
    let point = public.to_encoded_point(false);
    let mut out = Vec::with_capacity(EC_POINT_DER_PREFIX.len() + EC_POINT_LEN);
    out.extend_from_slice(&EC_POINT_DER_PREFIX);
    out.extend_from_slice(point.as_bytes());
    out
}

/// Parse a raw uncompressed point or its DER OCTET STRING form
pub fn ec_public_from_point(bytes: &[u8]) -> HalResult<PublicKey> {
    let raw = match bytes.len() {
        EC_POINT_LEN => bytes,
        n if n == EC_POINT_LEN + EC_POINT_DER_PREFIX.len() && bytes.starts_with(&EC_POINT_DER_PREFIX) => {
            &bytes[EC_POINT_DER_PREFIX.len()..]
        }
        n => {
            return Err(HalError::EncodingError(format!(
                "{} bytes is not an uncompressed secp256r1 point",
                n
            )))
        }
    };
    if raw[0] != 0x04 {
        return Err(HalError::EncodingError("point is not uncompressed".to_string()));
    }
    PublicKey::from_sec1_bytes(raw).map_err(|_| HalError::EncodingError("point is not on secp256r1".to_string()))
}

/// DER SubjectPublicKeyInfo of an EC public key
pub fn ec_public_key_info(public: &PublicKey) -> HalResult<Vec<u8>> {
    public
        .to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| HalError::EncodingError(e.to_string()))
}

/// Parse a DER SubjectPublicKeyInfo of a secp256r1 key
pub fn ec_public_from_spki(der: &[u8]) -> HalResult<PublicKey> {
    PublicKey::from_public_key_der(der).map_err(|e| HalError::EncodingError(e.to_string()))
}

/// PKCS#8 DER of an EC private key
pub fn ec_private_to_pkcs8(secret: &SecretKey) -> HalResult<Zeroizing<Vec<u8>>> {
    secret
        .to_pkcs8_der()
        .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
        .map_err(|e| HalError::EncodingError(e.to_string()))
}

/// Parse a PKCS#8 DER secp256r1 private key
pub fn ec_private_from_pkcs8(der: &[u8]) -> HalResult<SecretKey> {
    SecretKey::from_pkcs8_der(der).map_err(|e| HalError::EncodingError(e.to_string()))
}

/// ANSI X9.63 KDF with SHA-384:
/// `SHA-384(Z || counter || sharedInfo)` for counter = 1, 2, ... truncated to `len`
pub fn x963_kdf_sha384(z: &[u8], shared_info: &[u8], len: usize) -> HalResult<Zeroizing<Vec<u8>>> {
    if len == 0 {
        return Err(HalError::InvalidParameter("KDF output length is zero".to_string()));
    }
    let mut out = Zeroizing::new(Vec::with_capacity(len + 48));
    let mut counter = 1u32;
    while out.len() < len {
        let mut hasher = Sha384::new();
        hasher.update(z);
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_info);
        out.extend_from_slice(&hasher.finalize());
        counter = counter
            .checked_add(1)
            .ok_or_else(|| HalError::InvalidParameter("KDF output too long".to_string()))?;
    }
    out.truncate(len);
    Ok(out)
}

/// Raw ECDH shared secret (x-coordinate)
pub fn ecdh(secret: &SecretKey, peer: &PublicKey) -> Zeroizing<Vec<u8>> {
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    Zeroizing::new(shared.raw_secret_bytes().to_vec())
}

/// ECDH1 followed by the X9.63 SHA-384 KDF
pub fn ecdh_x963_sha384(
    secret: &SecretKey,
    peer: &PublicKey,
    shared_info: &[u8],
    len: usize,
) -> HalResult<Zeroizing<Vec<u8>>> {
    let z = ecdh(secret, peer);
    x963_kdf_sha384(&z, shared_info, len)
}

/// ECDSA over SHA-256, raw `r || s`
pub fn ecdsa_sign(secret: &SecretKey, data: &[u8]) -> Vec<u8> {
    let signature: Signature = SigningKey::from(secret).sign(data);
    signature.to_bytes().to_vec()
}

/// Verify a raw `r || s` ECDSA signature over SHA-256
pub fn ecdsa_verify(public: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
    match Signature::from_slice(signature) {
        Ok(signature) => VerifyingKey::from(public).verify(data, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Fresh RSA private key with the big-endian public exponent `exponent`
pub fn generate_rsa_key(modulus_bits: usize, exponent: &[u8]) -> HalResult<RsaPrivateKey> {
    RsaPrivateKey::new_with_exp(&mut OsRng, modulus_bits, &BigUint::from_bytes_be(exponent))
        .map_err(|e| HalError::CryptoError(e.to_string()))
}

/// PKCS#8 DER of an RSA private key
pub fn rsa_private_to_pkcs8(key: &RsaPrivateKey) -> HalResult<Zeroizing<Vec<u8>>> {
    rsa::pkcs8::EncodePrivateKey::to_pkcs8_der(key)
        .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
        .map_err(|e| HalError::EncodingError(e.to_string()))
}

/// Parse a PKCS#8 DER RSA private key
pub fn rsa_private_from_pkcs8(der: &[u8]) -> HalResult<RsaPrivateKey> {
    rsa::pkcs8::DecodePrivateKey::from_pkcs8_der(der).map_err(|e| HalError::EncodingError(e.to_string()))
}

/// DER SubjectPublicKeyInfo of an RSA public key
pub fn rsa_public_key_info(key: &RsaPublicKey) -> HalResult<Vec<u8>> {
    rsa::pkcs8::EncodePublicKey::to_public_key_der(key)
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| HalError::EncodingError(e.to_string()))
}

/// Parse a DER SubjectPublicKeyInfo RSA public key
pub fn rsa_public_from_spki(der: &[u8]) -> HalResult<RsaPublicKey> {
    rsa::pkcs8::DecodePublicKey::from_public_key_der(der).map_err(|e| HalError::EncodingError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KLD_AUTH_PRIVATE: &[u8] = include_bytes!("../../kld-core/keys/debug/kld_auth_private.der");
    const KLD_AUTH_PUBLIC: &[u8] = include_bytes!("../../kld-core/keys/debug/kld_auth_public.der");

    #[test]
    fn test_x963_kdf_sha384_vector() {
        let z: Vec<u8> = (0u8..32).collect();
        let out = x963_kdf_sha384(&z, &[0xAA; 64], 96).unwrap();
        assert_eq!(
            hex::encode(&*out),
            "8ff0155c34ec3d867218bfcd1457b2f98d0176843d596add3875dc8db85050dc\
             1d8cfaf75d822548a03f4b35bd5df864a263c1798bf41c56ed3500e7a26c5af7\
             2810dee98509660952b4f326d94ade4ebf7555382390acd997a8fc115db0cbb9"
        );
        // Shorter outputs are prefixes
        assert_eq!(&x963_kdf_sha384(&z, &[0xAA; 64], 40).unwrap()[..], &out[..40]);
        assert!(x963_kdf_sha384(&z, &[], 0).is_err());
    }

    #[test]
    fn test_ecdh_agreement() {
        let a = generate_ec_key();
        let b = generate_ec_key();
        let info = [1u8; 64];
        let ab = ecdh_x963_sha384(&a, &b.public_key(), &info, 96).unwrap();
        let ba = ecdh_x963_sha384(&b, &a.public_key(), &info, 96).unwrap();
        assert_eq!(&ab[..], &ba[..]);
        assert_eq!(ab.len(), 96);
    }

    #[test]
    fn test_point_encodings() {
        let key = generate_ec_key();
        let der = ec_point_der(&key.public_key());
        assert_eq!(der.len(), 67);
        assert_eq!(&der[..3], &[0x04, 0x41, 0x04]);
        assert_eq!(ec_public_from_point(&der).unwrap(), key.public_key());
        assert_eq!(ec_public_from_point(&der[2..]).unwrap(), key.public_key());
        assert!(ec_public_from_point(&der[..66]).is_err());

        let mut off_curve = der.clone();
        off_curve[66] ^= 0x01;
        assert!(ec_public_from_point(&off_curve).is_err());
    }

    #[test]
    fn test_debug_vector_encodings() {
        let secret = ec_private_from_pkcs8(KLD_AUTH_PRIVATE).unwrap();
        let public = ec_public_from_spki(KLD_AUTH_PUBLIC).unwrap();
        assert_eq!(secret.public_key(), public);
        assert_eq!(ec_public_key_info(&public).unwrap(), KLD_AUTH_PUBLIC);

        let reencoded = ec_private_to_pkcs8(&secret).unwrap();
        assert_eq!(ec_private_from_pkcs8(&reencoded).unwrap().public_key(), public);
    }

    #[test]
    fn test_ecdsa_raw_signatures() {
        let key = generate_ec_key();
        let signature = ecdsa_sign(&key, b"responder || initiator");
        assert_eq!(signature.len(), ECDSA_SIGNATURE_LEN);
        assert!(ecdsa_verify(&key.public_key(), b"responder || initiator", &signature));
        assert!(!ecdsa_verify(&key.public_key(), b"tampered", &signature));
        assert!(!ecdsa_verify(&key.public_key(), b"responder || initiator", &signature[..63]));
    }
}
