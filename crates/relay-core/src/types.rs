//! Relay, score and claim types shared by the distribution and claim workflows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::attestation::AttestationProof;

/// Identifier of one distribution cycle (milliseconds since the unix epoch by convention).
pub type Stamp = u64;

pub const FINGERPRINT_HEX_LEN: usize = 40;
pub const ADDRESS_HEX_LEN: usize = 40;

/// A relay fingerprint is exactly 40 uppercase hex characters.
pub fn is_valid_fingerprint(s: &str) -> bool {
    s.len() == FINGERPRINT_HEX_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

pub(crate) fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Account addresses are 40 hex characters with an optional `0x` prefix.
///
/// Checksum casing is not validated here; that is the feed's responsibility.
pub fn is_valid_address(s: &str) -> bool {
    let body = strip_hex_prefix(s);
    body.len() == ADDRESS_HEX_LEN && body.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn normalize_address(s: &str) -> String {
    format!("0x{}", strip_hex_prefix(s).to_ascii_lowercase())
}

/// A measured relay score as produced by the validation feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Score {
    pub address: String,
    pub fingerprint: String,
    pub value: u64,
}

impl Score {
    pub fn to_record(&self) -> ScoreRecord {
        ScoreRecord {
            fingerprint: self.fingerprint.to_ascii_uppercase(),
            address: normalize_address(&self.address),
            score: self.value,
        }
    }
}

/// Normalized score as emitted in an epoch result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub fingerprint: String,
    pub address: String,
    pub score: u64,
}

/// Hardware possession proof carried by a relay that runs on registered hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProof {
    pub node_id: String,
    pub nft_id: u16,
    pub device_serial: String,
    pub atec_serial: String,
    /// Raw 64-byte public key (X || Y), hex.
    pub public_key: String,
    /// Raw 64-byte signature (r || s), hex.
    pub signature: String,
}

/// A relay that passed upstream identity validation and asks to be claimable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRelay {
    pub fingerprint: String,
    pub address: String,
    #[serde(default)]
    pub family: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareProof>,
}

impl ValidatedRelay {
    pub fn plain(fingerprint: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            address: address.into(),
            family: Vec::new(),
            hardware: None,
        }
    }

    /// Builds the attestation input from the relay identity and its hardware proof.
    pub fn attestation_proof(&self) -> Option<AttestationProof> {
        let hw = self.hardware.as_ref()?;
        Some(AttestationProof {
            node_id: hw.node_id.clone(),
            nft_id: hw.nft_id,
            device_serial: hw.device_serial.clone(),
            atec_serial: hw.atec_serial.clone(),
            fingerprint: self.fingerprint.clone(),
            address: self.address.clone(),
            public_key: hw.public_key.clone(),
            signature: hw.signature.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimResult {
    #[serde(rename = "OK")]
    Ok,
    AlreadyRegistered,
    AlreadyVerified,
    HardwareProofFailed,
    AlreadySetFamily,
    Failed,
}

impl ClaimResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimResult::Ok => "ok",
            ClaimResult::AlreadyRegistered => "already_registered",
            ClaimResult::AlreadyVerified => "already_verified",
            ClaimResult::HardwareProofFailed => "hardware_proof_failed",
            ClaimResult::AlreadySetFamily => "already_set_family",
            ClaimResult::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimDecision {
    pub fingerprint: String,
    pub address: String,
    pub result: ClaimResult,
}

impl ClaimDecision {
    pub fn new(relay: &ValidatedRelay, result: ClaimResult) -> Self {
        Self {
            fingerprint: relay.fingerprint.clone(),
            address: relay.address.clone(),
            result,
        }
    }
}

/// Entry of an `addClaimableBatched` ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimableRelay {
    pub fingerprint: String,
    pub address: String,
    #[serde(default)]
    pub hardware_verified: bool,
}

/// Entry of a `setFamilies` ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyUpdate {
    pub fingerprint: String,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Finalized distribution as recorded by the ledger under `previousDistributions[stamp]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub stamp: Stamp,
    pub total_score: u64,
    pub total_distributed: u64,
    pub relay_count: u64,
}

/// Canonical state of a ledger contract.
///
/// The registry contract populates `claimable`, `verified` and `families`; the
/// distribution contract populates `previous_distributions` and `balances`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractState {
    /// fingerprint -> claiming address
    #[serde(default)]
    pub claimable: BTreeMap<String, String>,
    /// fingerprint -> verified address
    #[serde(default)]
    pub verified: BTreeMap<String, String>,
    #[serde(default)]
    pub families: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub previous_distributions: BTreeMap<Stamp, DistributionSummary>,
    /// address -> claimable reward
    #[serde(default)]
    pub balances: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_requires_uppercase_hex() {
        assert!(is_valid_fingerprint("89A5EF566C85E88391886220F7439DEDD967EF62"));
        assert!(!is_valid_fingerprint("89a5ef566c85e88391886220f7439dedd967ef62"));
        assert!(!is_valid_fingerprint("89A5EF566C85E88391886220F7439DEDD967EF6"));
        assert!(!is_valid_fingerprint("89A5EF566C85E88391886220F7439DEDD967EF6G"));
    }

    #[test]
    fn address_accepts_optional_prefix() {
        assert!(is_valid_address("0x6d454e61876334ee2ca473e3b4b66777c931886e"));
        assert!(is_valid_address("6D454E61876334EE2CA473E3B4B66777C931886E"));
        assert!(!is_valid_address("0x6d454e61876334ee2ca473e3b4b66777c931886"));
        assert!(!is_valid_address("0xzz454e61876334ee2ca473e3b4b66777c931886e"));
    }

    #[test]
    fn score_record_is_normalized() {
        let s = Score {
            address: "6D454E61876334EE2CA473E3B4B66777C931886E".to_string(),
            fingerprint: "89a5ef566c85e88391886220f7439dedd967ef62".to_string(),
            value: 42,
        };
        let r = s.to_record();
        assert_eq!(r.fingerprint, "89A5EF566C85E88391886220F7439DEDD967EF62");
        assert_eq!(r.address, "0x6d454e61876334ee2ca473e3b4b66777c931886e");
        assert_eq!(r.score, 42);
    }

    #[test]
    fn claim_result_wire_names() {
        let json = serde_json::to_string(&ClaimResult::Ok).unwrap();
        assert_eq!(json, "\"OK\"");
        let json = serde_json::to_string(&ClaimResult::HardwareProofFailed).unwrap();
        assert_eq!(json, "\"HardwareProofFailed\"");
    }

    #[test]
    fn contract_state_reads_partial_json() {
        let raw = r#"{"claimable":{"AA":"0x01"},"previousDistributions":{"1700":{"stamp":1700,"totalScore":10,"totalDistributed":100,"relayCount":2}}}"#;
        let st: ContractState = serde_json::from_str(raw).unwrap();
        assert_eq!(st.claimable.get("AA").map(String::as_str), Some("0x01"));
        assert_eq!(st.previous_distributions.get(&1700).map(|d| d.relay_count), Some(2));
        assert!(st.verified.is_empty());
    }
}
