//! Handshake transcripts
//!
//! Both sides of the reincarnation key agreement must assemble the signed
//! data and the MAC transcript identically; these helpers are the single
//! definition used by the HSM side and by responders.

use sha2::{Digest, Sha256};

/// Data signed by the initiator in step 2:
/// `responderRandom || initiatorRandom || initiatorEphPubKey`
pub fn signed_data(responder_random: &[u8], initiator_random: &[u8], initiator_eph_pub_key: &[u8]) -> Vec<u8> {
    let mut data =
        Vec::with_capacity(responder_random.len() + initiator_random.len() + initiator_eph_pub_key.len());
    data.extend_from_slice(responder_random);
    data.extend_from_slice(initiator_random);
    data.extend_from_slice(initiator_eph_pub_key);
    data
}

/// Values authenticated by both CMACs in step 3
#[derive(Debug, Clone, Copy)]
pub struct MacTranscript<'a> {
    /// Initiator random (step 1)
    pub initiator_random: &'a [u8],
    /// Initiator long-term authentication public key (step 1)
    pub initiator_auth_pub_key: &'a [u8],
    /// Responder random (step 1 response)
    pub responder_random: &'a [u8],
    /// Responder ephemeral public key (step 1 response)
    pub responder_eph_pub_key: &'a [u8],
    /// Initiator ephemeral public key (step 2)
    pub initiator_eph_pub_key: &'a [u8],
    /// Initiator signature (step 2)
    pub initiator_signature: &'a [u8],
}

impl MacTranscript<'_> {
    /// Fields in MAC order
    pub fn parts(&self) -> [&[u8]; 6] {
        [
            self.initiator_random,
            self.initiator_auth_pub_key,
            self.responder_random,
            self.responder_eph_pub_key,
            self.initiator_eph_pub_key,
            self.initiator_signature,
        ]
    }

    /// Concatenated transcript
    pub fn to_bytes(&self) -> Vec<u8> {
        self.parts().concat()
    }
}

/// Short SHA-256 fingerprint for logs
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}
