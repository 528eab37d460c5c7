//! Core types for device identity and provisioning artifacts

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{KldError, KldResult};

/// Length of the handshake randoms
pub const KEY_AGREEMENT_RANDOM_LEN: usize = 32;
/// Length of a DER SubjectPublicKeyInfo for a secp256r1 key
pub const SECP256R1_PUBLIC_KEY_INFO_LEN: usize = 91;
/// Length of the DER OCTET STRING wrapping an uncompressed secp256r1 point
pub const SECP256R1_PUBLIC_KEY_LEN: usize = 67;
/// Length of a raw `r || s` ECDSA P-256 signature
pub const SIGNATURE_LEN: usize = 64;
/// Length of an AES-CMAC tag
pub const AES_CMAC_LEN: usize = 16;
/// Length of an AES-256 key
pub const AES_256_KEY_LEN: usize = 32;
/// Length of a key check value
pub const KCV_LEN: usize = 5;
/// Encoded length of [`ManufacturingInfo`]
pub const MANUFACTURING_INFO_LEN: usize = 32;
/// Encoded length of [`ReincarnationInfo`]
pub const REINCARNATION_INFO_LEN: usize = 16;
/// Length of the reincarnation key derivation input
pub const DERIVATION_INFO_LEN: usize = MANUFACTURING_INFO_LEN + REINCARNATION_INFO_LEN;

/// Device class UUID of the DDM 885 family
pub const DDM_885_DEVICE_CLASS: [u8; 16] = [
    0x7b, 0x34, 0x5c, 0x53, 0xdf, 0x4c, 0x56, 0x55, 0xb7, 0xd3, 0xc7, 0x8b, 0x7b, 0xca, 0x45, 0x7f,
];

/// Manufacturing record written at production time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturingInfo {
    /// Device class UUID (RFC 4122 byte order)
    pub device_class: [u8; 16],
    /// Production time, seconds since the Unix epoch
    pub time_of_production: u32,
    /// Serial number
    pub serial_number: u32,
    /// Device type code within the class
    pub device_type: u8,
    /// Engineering change level
    pub ecl: u8,
    /// Ethernet MAC address
    pub mac_address: [u8; 6],
}

impl ManufacturingInfo {
    /// Fixed-width binary encoding
    pub fn to_bytes(&self) -> [u8; MANUFACTURING_INFO_LEN] {
        let mut out = [0u8; MANUFACTURING_INFO_LEN];
        out[..16].copy_from_slice(&self.device_class);
        out[16..20].copy_from_slice(&self.time_of_production.to_le_bytes());
        out[20..24].copy_from_slice(&self.serial_number.to_le_bytes());
        out[24] = self.device_type;
        out[25] = self.ecl;
        out[26..32].copy_from_slice(&self.mac_address);
        out
    }

    /// Parse the fixed-width binary encoding
    pub fn from_bytes(bytes: &[u8]) -> KldResult<Self> {
        if bytes.len() != MANUFACTURING_INFO_LEN {
            return Err(KldError::InvalidParameter(format!(
                "manufacturing info must be {} bytes, got {}",
                MANUFACTURING_INFO_LEN,
                bytes.len()
            )));
        }
        let mut device_class = [0u8; 16];
        device_class.copy_from_slice(&bytes[..16]);
        let mut mac_address = [0u8; 6];
        mac_address.copy_from_slice(&bytes[26..32]);
        Ok(ManufacturingInfo {
            device_class,
            time_of_production: read_u32_le(&bytes[16..20]),
            serial_number: read_u32_le(&bytes[20..24]),
            device_type: bytes[24],
            ecl: bytes[25],
            mac_address,
        })
    }

    /// Device class UUID in canonical textual form
    pub fn device_class_uuid(&self) -> String {
        let h = hex::encode(self.device_class);
        format!("{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..])
    }

    /// Human readable device class
    pub fn device_class_name(&self) -> &'static str {
        if self.device_class == DDM_885_DEVICE_CLASS {
            "DDM 885"
        } else {
            "Unknown Device Class"
        }
    }

    /// Human readable device type
    pub fn device_type_name(&self) -> &'static str {
        if self.device_class != DDM_885_DEVICE_CLASS {
            return "Unknown Device Type";
        }
        match self.device_type {
            0x00 => "2-020272-06a",
            0x01 => "2-020296-06a",
            0x02 => "2-020296-06b",
            0x03 => "DDM 885-R Rev. A",
            0x04 => "DDM 885-R Rev. B",
            0x05 => "DDM 885-R Rev. C",
            0x06 => "DDM 885-R Rev. D",
            0x10 => "DDM 885-H Rev. B",
            _ => "Unknown Device Type",
        }
    }

    /// MAC address as colon separated hex
    pub fn mac_address_string(&self) -> String {
        self.mac_address
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Device personality selected at reincarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePersonality {
    /// PCI point of interaction
    PciPoi,
    /// PCI hardware security module
    PciHsm,
    /// Code not known to this tool
    Unknown(u32),
}

impl From<u32> for DevicePersonality {
    fn from(code: u32) -> Self {
        match code {
            0 => DevicePersonality::PciPoi,
            1 => DevicePersonality::PciHsm,
            other => DevicePersonality::Unknown(other),
        }
    }
}

impl From<DevicePersonality> for u32 {
    fn from(personality: DevicePersonality) -> u32 {
        match personality {
            DevicePersonality::PciPoi => 0,
            DevicePersonality::PciHsm => 1,
            DevicePersonality::Unknown(code) => code,
        }
    }
}

impl fmt::Display for DevicePersonality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DevicePersonality::PciPoi => "PCI POI",
            DevicePersonality::PciHsm => "PCI HSM",
            DevicePersonality::Unknown(_) => "Unknown Device Personality",
        })
    }
}

/// Operating mode selected at reincarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    /// Development keys and debug access
    Development,
    /// Production
    Production,
    /// Code not known to this tool
    Unknown(u32),
}

impl From<u32> for OperatingMode {
    fn from(code: u32) -> Self {
        match code {
            0 => OperatingMode::Development,
            1 => OperatingMode::Production,
            other => OperatingMode::Unknown(other),
        }
    }
}

impl From<OperatingMode> for u32 {
    fn from(mode: OperatingMode) -> u32 {
        match mode {
            OperatingMode::Development => 0,
            OperatingMode::Production => 1,
            OperatingMode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperatingMode::Development => "Development",
            OperatingMode::Production => "Production",
            OperatingMode::Unknown(_) => "Unknown Operating Mode",
        })
    }
}

/// Reincarnation record, rewritten each time the device is re-keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReincarnationInfo {
    /// Reincarnation time, seconds since the Unix epoch
    pub time_of_reincarnation: u32,
    /// Personality
    pub personality: DevicePersonality,
    /// Operating mode
    pub operating_mode: OperatingMode,
    /// Identifier of the master key the reincarnation key derives from
    pub master_key_id: u32,
}

impl ReincarnationInfo {
    /// Fixed-width binary encoding; the master key id is stored big-endian
    pub fn to_bytes(&self) -> [u8; REINCARNATION_INFO_LEN] {
        let mut out = [0u8; REINCARNATION_INFO_LEN];
        out[..4].copy_from_slice(&self.time_of_reincarnation.to_le_bytes());
        out[4..8].copy_from_slice(&u32::from(self.personality).to_le_bytes());
        out[8..12].copy_from_slice(&u32::from(self.operating_mode).to_le_bytes());
        out[12..16].copy_from_slice(&self.master_key_id.to_be_bytes());
        out
    }

    /// Parse the fixed-width binary encoding
    pub fn from_bytes(bytes: &[u8]) -> KldResult<Self> {
        if bytes.len() != REINCARNATION_INFO_LEN {
            return Err(KldError::InvalidParameter(format!(
                "reincarnation info must be {} bytes, got {}",
                REINCARNATION_INFO_LEN,
                bytes.len()
            )));
        }
        let mut master_key_id = [0u8; 4];
        master_key_id.copy_from_slice(&bytes[12..16]);
        Ok(ReincarnationInfo {
            time_of_reincarnation: read_u32_le(&bytes[..4]),
            personality: read_u32_le(&bytes[4..8]).into(),
            operating_mode: read_u32_le(&bytes[8..12]).into(),
            master_key_id: u32::from_be_bytes(master_key_id),
        })
    }

    /// Master key id as printed on key labels (`%08X`)
    pub fn master_key_id_name(&self) -> String {
        format!("{:08X}", self.master_key_id)
    }
}

/// Identity records that feed reincarnation key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Manufacturing record
    pub manufacturing: ManufacturingInfo,
    /// Reincarnation record
    pub reincarnation: ReincarnationInfo,
}

impl DeviceIdentity {
    /// Reincarnation key derivation input: manufacturing || reincarnation
    pub fn derivation_info(&self) -> [u8; DERIVATION_INFO_LEN] {
        let mut out = [0u8; DERIVATION_INFO_LEN];
        out[..MANUFACTURING_INFO_LEN].copy_from_slice(&self.manufacturing.to_bytes());
        out[MANUFACTURING_INFO_LEN..].copy_from_slice(&self.reincarnation.to_bytes());
        out
    }

    /// Parse a derivation input back into its records
    pub fn from_derivation_info(bytes: &[u8]) -> KldResult<Self> {
        if bytes.len() != DERIVATION_INFO_LEN {
            return Err(KldError::InvalidParameter(format!(
                "derivation info must be {} bytes, got {}",
                DERIVATION_INFO_LEN,
                bytes.len()
            )));
        }
        Ok(DeviceIdentity {
            manufacturing: ManufacturingInfo::from_bytes(&bytes[..MANUFACTURING_INFO_LEN])?,
            reincarnation: ReincarnationInfo::from_bytes(&bytes[MANUFACTURING_INFO_LEN..])?,
        })
    }
}

/// Device lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// State not reported or not recognised
    Unknown,
    /// Left the factory line; manufacturing reset is possible
    Manufactured,
    /// Manufacturing test
    ManufacturingTest,
    /// Personalization
    Personalization,
    /// In operation
    Operation,
    /// Forensic analysis after tamper
    ForensicAnalysis,
    /// Decommissioned
    Decommissioned,
}

impl LifecycleState {
    /// Decode the device's state code
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => LifecycleState::Manufactured,
            0 => LifecycleState::ManufacturingTest,
            1 => LifecycleState::Personalization,
            2 => LifecycleState::Operation,
            3 => LifecycleState::ForensicAnalysis,
            4 => LifecycleState::Decommissioned,
            _ => LifecycleState::Unknown,
        }
    }

    /// Device state code
    pub fn code(&self) -> i32 {
        match self {
            LifecycleState::Unknown => -2,
            LifecycleState::Manufactured => -1,
            LifecycleState::ManufacturingTest => 0,
            LifecycleState::Personalization => 1,
            LifecycleState::Operation => 2,
            LifecycleState::ForensicAnalysis => 3,
            LifecycleState::Decommissioned => 4,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Unknown => "Unknown State",
            LifecycleState::Manufactured => "Manufactured",
            LifecycleState::ManufacturingTest => "Manufacturing Test",
            LifecycleState::Personalization => "Personalization",
            LifecycleState::Operation => "Operation",
            LifecycleState::ForensicAnalysis => "Forensic Analysis",
            LifecycleState::Decommissioned => "Decommissioned",
        })
    }
}

/// Lifecycle record reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleInfo {
    /// Current state
    pub state: LifecycleState,
    /// Time of the last transition, seconds since the Unix epoch
    pub timestamp: u32,
    /// Tamper status bits
    pub tamper_status: u32,
}

/// Secret that unlocks a device in the `Manufactured` state for reset
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ManufacturingResetSecret {
    /// The two words handed to the device
    pub words: [u32; 2],
}

impl fmt::Debug for ManufacturingResetSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ManufacturingResetSecret(<redacted>)")
    }
}

/// Root key bundle exported by the key ceremony
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RootHsmKeys {
    /// Key check value of the root KBPK (colon separated hex)
    pub root_key_kcv: String,
    /// Firmware validation public key, SPKI DER (colon separated hex)
    pub firmware_validation_key: String,
    /// Firmware signing private key key block
    pub firmware_signing_keyblock: String,
    /// Application validation public key key block
    pub application_validation_keyblock: String,
    /// Application signing private key key block
    pub application_signing_keyblock: String,
    /// KLD authentication public key, SPKI DER (colon separated hex)
    pub kld_auth_public_key: String,
    /// KLD authentication private key key block
    pub kld_auth_private_keyblock: String,
    /// Manufacturing reset master key key block
    pub mfg_reset_master_keyblock: String,
}

/// Format bytes as colon separated upper-case hex
pub fn to_colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse colon separated hex (separators optional)
pub fn from_colon_hex(text: &str) -> KldResult<Vec<u8>> {
    let compact: String = text.chars().filter(|c| *c != ':' && !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|e| KldError::InvalidParameter(format!("invalid hex: {}", e)))
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}
