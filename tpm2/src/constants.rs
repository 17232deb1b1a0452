// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants, command codes and response codes

use std::fmt;

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    CreatePrimary = 0x00000131,
    PolicySecret = 0x00000151,
    Create = 0x00000153,
    Import = 0x00000156,
    Load = 0x00000157,
    Unseal = 0x0000015E,
    FlushContext = 0x00000165,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017A,
    PcrRead = 0x0000017E,
    PolicyPcr = 0x0000017F,
    PcrExtend = 0x00000182,
    PolicyGetDigest = 0x00000189,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        let cc = match v {
            0x00000131 => TpmCc::CreatePrimary,
            0x00000151 => TpmCc::PolicySecret,
            0x00000153 => TpmCc::Create,
            0x00000156 => TpmCc::Import,
            0x00000157 => TpmCc::Load,
            0x0000015E => TpmCc::Unseal,
            0x00000165 => TpmCc::FlushContext,
            0x00000173 => TpmCc::ReadPublic,
            0x00000176 => TpmCc::StartAuthSession,
            0x0000017A => TpmCc::GetCapability,
            0x0000017E => TpmCc::PcrRead,
            0x0000017F => TpmCc::PolicyPcr,
            0x00000182 => TpmCc::PcrExtend,
            0x00000189 => TpmCc::PolicyGetDigest,
            _ => return None,
        };
        Some(cc)
    }

    /// Number of handles in the command handle area, and how many of those
    /// (counted from the first) require an authorization session.
    pub fn handle_layout(self) -> (usize, usize) {
        match self {
            TpmCc::CreatePrimary
            | TpmCc::Create
            | TpmCc::Import
            | TpmCc::Load
            | TpmCc::Unseal
            | TpmCc::PcrExtend => (1, 1),
            TpmCc::PolicySecret => (2, 1),
            TpmCc::StartAuthSession => (2, 0),
            TpmCc::PolicyPcr | TpmCc::PolicyGetDigest | TpmCc::ReadPublic => (1, 0),
            // flushHandle is a parameter, not a handle
            TpmCc::FlushContext
            | TpmCc::GetCapability
            | TpmCc::PcrRead => (0, 0),
        }
    }

    /// Number of handles in the response handle area
    pub fn response_handles(self) -> usize {
        match self {
            TpmCc::CreatePrimary | TpmCc::Load | TpmCc::StartAuthSession => 1,
            _ => 0,
        }
    }

    /// Whether the first command parameter and the first response parameter
    /// are TPM2B structures, which is what session encryption applies to.
    pub fn encryptable_parameters(self) -> (bool, bool) {
        match self {
            TpmCc::CreatePrimary
            | TpmCc::Create
            | TpmCc::Import
            | TpmCc::Load
            | TpmCc::PolicySecret => (true, true),
            TpmCc::Unseal => (false, true),
            _ => (false, false),
        }
    }
}

impl fmt::Display for TpmCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TPM2_{:?}", self)
    }
}

/// Bit set on format-one response codes
const RC_FMT1: u32 = 0x080;
/// Format-one response codes carry a parameter number when set
const RC_P: u32 = 0x040;
/// Format-one response codes carry a session number when set (with RC_P clear)
const RC_S: u32 = 0x800;

/// TPM 2.0 Response Codes (TPM_RC), canonical form.
///
/// Format-one codes are listed without their parameter, handle or session
/// number; [`TpmRc::from_u32`] strips those bits before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmRc {
    Success = 0x000,
    // Format 0 errors
    Initialize = 0x100,
    Failure = 0x101,
    Sequence = 0x103,
    AuthType = 0x124,
    AuthMissing = 0x125,
    PcrChanged = 0x128,
    AuthUnavailable = 0x12F,
    CommandSize = 0x142,
    CommandCode = 0x143,
    AuthContext = 0x145,
    // Format 1 errors
    Attributes = 0x082,
    Hash = 0x083,
    Value = 0x084,
    Hierarchy = 0x085,
    Type = 0x08A,
    Handle = 0x08B,
    AuthFail = 0x08E,
    Scheme = 0x092,
    Size = 0x095,
    Symmetric = 0x096,
    Tag = 0x097,
    Key = 0x09C,
    PolicyFail = 0x09D,
    Integrity = 0x09F,
    BadAuth = 0x0A2,
    Binding = 0x0A5,
    Curve = 0x0A6,
    EccPoint = 0x0A7,
    // Warnings
    ObjectMemory = 0x902,
    SessionMemory = 0x903,
    Memory = 0x904,
    SessionHandles = 0x905,
    ObjectHandles = 0x906,
    Retry = 0x922,
}

impl TpmRc {
    /// Strip the parameter/handle/session number from a format-one code.
    pub fn canonical(code: u32) -> u32 {
        if code & RC_FMT1 != 0 {
            code & 0xBF
        } else {
            code
        }
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        let rc = match Self::canonical(code) {
            0x000 => TpmRc::Success,
            0x100 => TpmRc::Initialize,
            0x101 => TpmRc::Failure,
            0x103 => TpmRc::Sequence,
            0x124 => TpmRc::AuthType,
            0x125 => TpmRc::AuthMissing,
            0x128 => TpmRc::PcrChanged,
            0x12F => TpmRc::AuthUnavailable,
            0x142 => TpmRc::CommandSize,
            0x143 => TpmRc::CommandCode,
            0x145 => TpmRc::AuthContext,
            0x082 => TpmRc::Attributes,
            0x083 => TpmRc::Hash,
            0x084 => TpmRc::Value,
            0x085 => TpmRc::Hierarchy,
            0x08A => TpmRc::Type,
            0x08B => TpmRc::Handle,
            0x08E => TpmRc::AuthFail,
            0x092 => TpmRc::Scheme,
            0x095 => TpmRc::Size,
            0x096 => TpmRc::Symmetric,
            0x097 => TpmRc::Tag,
            0x09C => TpmRc::Key,
            0x09D => TpmRc::PolicyFail,
            0x09F => TpmRc::Integrity,
            0x0A2 => TpmRc::BadAuth,
            0x0A5 => TpmRc::Binding,
            0x0A6 => TpmRc::Curve,
            0x0A7 => TpmRc::EccPoint,
            0x902 => TpmRc::ObjectMemory,
            0x903 => TpmRc::SessionMemory,
            0x904 => TpmRc::Memory,
            0x905 => TpmRc::SessionHandles,
            0x906 => TpmRc::ObjectHandles,
            0x922 => TpmRc::Retry,
            _ => return None,
        };
        Some(rc)
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, TpmRc::Success)
    }

    /// Wire code for a format-one error attributed to parameter `n` (1-based)
    pub fn at_parameter(self, n: u32) -> u32 {
        self.to_u32() | RC_P | ((n & 0xF) << 8)
    }

    /// Wire code for a format-one error attributed to handle `n` (1-based)
    pub fn at_handle(self, n: u32) -> u32 {
        self.to_u32() | ((n & 0x7) << 8)
    }

    /// Wire code for a format-one error attributed to session `n` (1-based)
    pub fn at_session(self, n: u32) -> u32 {
        self.to_u32() | RC_S | ((n & 0x7) << 8)
    }

    /// The mnemonic used by the TPM 2.0 library specification
    pub fn name(self) -> &'static str {
        match self {
            TpmRc::Success => "TPM_RC_SUCCESS",
            TpmRc::Initialize => "TPM_RC_INITIALIZE",
            TpmRc::Failure => "TPM_RC_FAILURE",
            TpmRc::Sequence => "TPM_RC_SEQUENCE",
            TpmRc::AuthType => "TPM_RC_AUTH_TYPE",
            TpmRc::AuthMissing => "TPM_RC_AUTH_MISSING",
            TpmRc::PcrChanged => "TPM_RC_PCR_CHANGED",
            TpmRc::AuthUnavailable => "TPM_RC_AUTH_UNAVAILABLE",
            TpmRc::CommandSize => "TPM_RC_COMMAND_SIZE",
            TpmRc::CommandCode => "TPM_RC_COMMAND_CODE",
            TpmRc::AuthContext => "TPM_RC_AUTH_CONTEXT",
            TpmRc::Attributes => "TPM_RC_ATTRIBUTES",
            TpmRc::Hash => "TPM_RC_HASH",
            TpmRc::Value => "TPM_RC_VALUE",
            TpmRc::Hierarchy => "TPM_RC_HIERARCHY",
            TpmRc::Type => "TPM_RC_TYPE",
            TpmRc::Handle => "TPM_RC_HANDLE",
            TpmRc::AuthFail => "TPM_RC_AUTH_FAIL",
            TpmRc::Scheme => "TPM_RC_SCHEME",
            TpmRc::Size => "TPM_RC_SIZE",
            TpmRc::Symmetric => "TPM_RC_SYMMETRIC",
            TpmRc::Tag => "TPM_RC_TAG",
            TpmRc::Key => "TPM_RC_KEY",
            TpmRc::PolicyFail => "TPM_RC_POLICY_FAIL",
            TpmRc::Integrity => "TPM_RC_INTEGRITY",
            TpmRc::BadAuth => "TPM_RC_BAD_AUTH",
            TpmRc::Binding => "TPM_RC_BINDING",
            TpmRc::Curve => "TPM_RC_CURVE",
            TpmRc::EccPoint => "TPM_RC_ECC_POINT",
            TpmRc::ObjectMemory => "TPM_RC_OBJECT_MEMORY",
            TpmRc::SessionMemory => "TPM_RC_SESSION_MEMORY",
            TpmRc::Memory => "TPM_RC_MEMORY",
            TpmRc::SessionHandles => "TPM_RC_SESSION_HANDLES",
            TpmRc::ObjectHandles => "TPM_RC_OBJECT_HANDLES",
            TpmRc::Retry => "TPM_RC_RETRY",
        }
    }
}

impl fmt::Display for TpmRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum TpmAlgId {
    Null = 0x0010,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Ecc = 0x0023,
    Aes = 0x0006,
    Cfb = 0x0043,
    KeyedHash = 0x0008,
    Ecdh = 0x0019,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmAlgId::Null),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0005 => Some(TpmAlgId::Hmac),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0023 => Some(TpmAlgId::Ecc),
            0x0006 => Some(TpmAlgId::Aes),
            0x0043 => Some(TpmAlgId::Cfb),
            0x0008 => Some(TpmAlgId::KeyedHash),
            0x0019 => Some(TpmAlgId::Ecdh),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }
}

/// TPM 2.0 Handle Types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    /// Loaded sessions share the HMAC session handle range
    pub const LOADED_SESSION: TpmHt = TpmHt::HmacSession;
    /// Saved sessions share the policy session handle range
    pub const SAVED_SESSION: TpmHt = TpmHt::PolicySession;

    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }

    /// First handle value in this handle type's range
    pub fn first(self) -> u32 {
        (self as u32) << 24
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;

    /// Hierarchies that can host primary objects
    pub fn is_hierarchy(handle: u32) -> bool {
        matches!(handle, OWNER | ENDORSEMENT | PLATFORM | NULL)
    }
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Handles = 0x00000001,
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const ST_CLEAR: u32 = 1 << 2;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const ENCRYPTED_DUPLICATION: u32 = 1 << 11;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_admin_with_policy(mut self) -> Self {
        self.0 |= Self::ADMIN_WITH_POLICY;
        self
    }

    pub fn with_no_da(mut self) -> Self {
        self.0 |= Self::NO_DA;
        self
    }

    pub fn with_restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn is_storage_parent(self) -> bool {
        self.contains(Self::RESTRICTED | Self::DECRYPT) && self.0 & Self::SIGN_ENCRYPT == 0
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }

    pub fn continue_session(self) -> bool {
        self.0 & Self::CONTINUE_SESSION != 0
    }

    pub fn decrypt(self) -> bool {
        self.0 & Self::DECRYPT != 0
    }

    pub fn encrypt(self) -> bool {
        self.0 & Self::ENCRYPT != 0
    }
}

/// TPM structure tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    RspCommand = 0x00C4,
    Null = 0x8000,
    NoSessions = 0x8001,
    Sessions = 0x8002,
    Creation = 0x8021,
    AuthSecret = 0x8023,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C4 => Some(TpmSt::RspCommand),
            0x8000 => Some(TpmSt::Null),
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8021 => Some(TpmSt::Creation),
            0x8023 => Some(TpmSt::AuthSecret),
            _ => None,
        }
    }
}

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP256 = 0x0003,
}

impl TpmEccCurve {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(TpmEccCurve::None),
            0x0003 => Some(TpmEccCurve::NistP256),
            _ => None,
        }
    }
}

/// Number of PCRs in each bank
pub const PCR_COUNT: u32 = 24;

/// Largest data a sealed (keyed-hash) object may hold (MAX_SYM_DATA)
pub const MAX_SYM_DATA: usize = 128;

/// Policy digest of `PolicySecret(TPM_RH_ENDORSEMENT)` from an empty policy;
/// the `authPolicy` of the TCG default endorsement key templates.
pub const EK_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xB3, 0xF8, 0x1A, 0x90, 0xCC, 0x8D, 0x46, 0xA5, 0xD7,
    0x24, 0xFD, 0x52, 0xD7, 0x6E, 0x06, 0x52, 0x0B, 0x64, 0xF2, 0xA1, 0xDA, 0x1B, 0x33, 0x14,
    0x69, 0xAA,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_one_codes_are_canonicalised() {
        // AUTH_FAIL reported against session 1
        assert_eq!(TpmRc::from_u32(0x98E), Some(TpmRc::AuthFail));
        // VALUE reported against parameter 1
        assert_eq!(TpmRc::from_u32(0x1C4), Some(TpmRc::Value));
        assert_eq!(TpmRc::from_u32(TpmRc::Integrity.at_parameter(2)), Some(TpmRc::Integrity));
        assert_eq!(TpmRc::from_u32(TpmRc::Handle.at_handle(1)), Some(TpmRc::Handle));
        assert_eq!(TpmRc::from_u32(0x902), Some(TpmRc::ObjectMemory));
        assert_eq!(TpmRc::from_u32(0x128), Some(TpmRc::PcrChanged));
        assert_eq!(TpmRc::from_u32(0x7FF), None);
    }

    #[test]
    fn test_session_number_encoding() {
        assert_eq!(TpmRc::AuthFail.at_session(1), 0x98E);
        assert_eq!(TpmRc::PolicyFail.at_session(1), 0x99D);
    }

    #[test]
    fn test_handle_types() {
        assert_eq!(TpmHt::of(0x80000001), Some(TpmHt::Transient));
        assert_eq!(TpmHt::of(0x03000000), Some(TpmHt::SAVED_SESSION));
        assert_eq!(TpmHt::LOADED_SESSION.first(), 0x02000000);
    }
}
