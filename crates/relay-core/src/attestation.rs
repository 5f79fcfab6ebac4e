//! Hardware attestation verification.
//!
//! A relay running on registered hardware proves possession by signing a
//! canonical message with the device's secure element (ECDSA P-256). This
//! module only implements the pure signature predicate; uniqueness of the
//! serials and NFT ids is enforced by the caller against the verified-hardware
//! store.
//!
//! ## Canonical message
//!
//! ```text
//! hex(node_id utf8) || hex(nft_id as u16 little-endian) || device_serial
//!   || atec_serial || fingerprint || address
//! ```
//!
//! The concatenation is read as lowercase hex, decoded to bytes and hashed
//! with SHA-256. The signature is verified against the SEC1 compressed form
//! of the raw `X || Y` public key.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::{is_valid_address, is_valid_fingerprint, strip_hex_prefix};

pub const DEVICE_SERIAL_HEX_LEN: usize = 16;
pub const ATEC_SERIAL_HEX_LEN: usize = 18;
pub const SIGNATURE_HEX_LEN: usize = 128;
pub const PUBLIC_KEY_HEX_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationProof {
    pub node_id: String,
    pub nft_id: u16,
    pub device_serial: String,
    pub atec_serial: String,
    pub fingerprint: String,
    pub address: String,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AttestationRejection {
    #[error("fingerprint must be 40 uppercase hex characters")]
    InvalidFingerprint,
    #[error("address must be 40 hex characters")]
    InvalidAddress,
    #[error("device serial must be 16 hex characters")]
    InvalidDeviceSerial,
    #[error("atec serial must be 18 hex characters")]
    InvalidAtecSerial,
    #[error("signature must be 128 hex characters")]
    InvalidSignature,
    #[error("public key must be 128 hex characters")]
    InvalidPublicKey,
    #[error("public key is not a point on P-256")]
    MalformedPublicKey,
    #[error("signature scalars are out of range")]
    MalformedSignature,
    #[error("signature does not match the canonical message")]
    SignatureMismatch,
}

impl AttestationRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            AttestationRejection::InvalidFingerprint => "invalid_fingerprint",
            AttestationRejection::InvalidAddress => "invalid_address",
            AttestationRejection::InvalidDeviceSerial => "invalid_device_serial",
            AttestationRejection::InvalidAtecSerial => "invalid_atec_serial",
            AttestationRejection::InvalidSignature => "invalid_signature",
            AttestationRejection::InvalidPublicKey => "invalid_public_key",
            AttestationRejection::MalformedPublicKey => "malformed_public_key",
            AttestationRejection::MalformedSignature => "malformed_signature",
            AttestationRejection::SignatureMismatch => "signature_mismatch",
        }
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Checks field formats in order, stopping at the first failure.
pub fn check_format(proof: &AttestationProof) -> Result<(), AttestationRejection> {
    if !is_valid_fingerprint(&proof.fingerprint) {
        return Err(AttestationRejection::InvalidFingerprint);
    }
    if !is_valid_address(&proof.address) {
        return Err(AttestationRejection::InvalidAddress);
    }
    if !is_hex_of_len(&proof.device_serial, DEVICE_SERIAL_HEX_LEN) {
        return Err(AttestationRejection::InvalidDeviceSerial);
    }
    if !is_hex_of_len(&proof.atec_serial, ATEC_SERIAL_HEX_LEN) {
        return Err(AttestationRejection::InvalidAtecSerial);
    }
    if !is_hex_of_len(&proof.signature, SIGNATURE_HEX_LEN) {
        return Err(AttestationRejection::InvalidSignature);
    }
    if !is_hex_of_len(&proof.public_key, PUBLIC_KEY_HEX_LEN) {
        return Err(AttestationRejection::InvalidPublicKey);
    }
    Ok(())
}

/// The nft id as 4 hex digits with the two bytes swapped (u16 little-endian).
fn nft_id_hex(nft_id: u16) -> String {
    hex::encode(nft_id.to_le_bytes())
}

/// Canonical message bytes for a format-checked proof.
pub fn canonical_message(proof: &AttestationProof) -> Vec<u8> {
    let mut msg = String::with_capacity(256);
    msg.push_str(&hex::encode(proof.node_id.as_bytes()));
    msg.push_str(&nft_id_hex(proof.nft_id));
    msg.push_str(&proof.device_serial.to_ascii_lowercase());
    msg.push_str(&proof.atec_serial.to_ascii_lowercase());
    msg.push_str(&proof.fingerprint.to_ascii_lowercase());
    msg.push_str(&strip_hex_prefix(&proof.address).to_ascii_lowercase());
    // Every part is an even-length hex string once the format checks pass.
    hex::decode(msg).unwrap_or_default()
}

/// SEC1 compressed encoding of a raw `X || Y` public key.
pub fn compress_public_key(raw: &[u8; 64]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = if raw[63] & 1 == 1 { 0x03 } else { 0x02 };
    out[1..].copy_from_slice(&raw[..32]);
    out
}

/// Full check: formats, then ECDSA P-256 over SHA-256 of the canonical message.
pub fn check(proof: &AttestationProof) -> Result<(), AttestationRejection> {
    check_format(proof)?;

    let mut raw_key = [0u8; 64];
    hex::decode_to_slice(&proof.public_key, &mut raw_key)
        .map_err(|_| AttestationRejection::InvalidPublicKey)?;
    let key = VerifyingKey::from_sec1_bytes(&compress_public_key(&raw_key))
        .map_err(|_| AttestationRejection::MalformedPublicKey)?;

    let sig_bytes =
        hex::decode(&proof.signature).map_err(|_| AttestationRejection::InvalidSignature)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| AttestationRejection::MalformedSignature)?;

    let digest = Sha256::digest(canonical_message(proof));
    key.verify_prehash(&digest, &signature)
        .map_err(|_| AttestationRejection::SignatureMismatch)
}

/// Boolean attestation predicate; rejections are logged with their reason.
pub fn verify(proof: &AttestationProof) -> bool {
    match check(proof) {
        Ok(()) => true,
        Err(rejection) => {
            debug!(
                fingerprint = %proof.fingerprint,
                reason = rejection.reason(),
                "hardware attestation rejected"
            );
            false
        }
    }
}
