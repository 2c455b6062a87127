use std::fmt;

/// Bit position of the non-secure flag in an encoded key.
pub const CP_REG_NS_SHIFT: u32 = 29;

const CP_SHIFT: u32 = 16;
const IS64_SHIFT: u32 = 15;
const CRN_SHIFT: u32 = 11;
const CRM_SHIFT: u32 = 7;
const OP1_SHIFT: u32 = 3;

/// Encoded system register address.
///
/// Layout: `ns << 29 | cp << 16 | is64 << 15 | crn << 11 | crm << 7 | op1 << 3 | op2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegisterKey(u32);

impl RegisterKey {
    /// Encodes a register address from its fields.
    ///
    /// Fields are truncated to their encoded widths (`crn`/`crm` 4 bits,
    /// `op1`/`op2` 3 bits); range checking happens at registration.
    #[must_use]
    pub const fn encode(cp: u8, is64: bool, ns: bool, crn: u8, crm: u8, op1: u8, op2: u8) -> Self {
        Self(
            ((ns as u32) << CP_REG_NS_SHIFT)
                | ((cp as u32) << CP_SHIFT)
                | ((is64 as u32) << IS64_SHIFT)
                | (((crn & 0xF) as u32) << CRN_SHIFT)
                | (((crm & 0xF) as u32) << CRM_SHIFT)
                | (((op1 & 0x7) as u32) << OP1_SHIFT)
                | (op2 & 0x7) as u32,
        )
    }

    /// Wraps a raw key, for callers that embed keys in generated code.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw encoded key.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Coprocessor / namespace id.
    #[must_use]
    pub const fn cp(self) -> u8 {
        ((self.0 >> CP_SHIFT) & 0xFF) as u8
    }

    /// Returns `true` for 64-bit accesses.
    #[must_use]
    pub const fn is_64bit(self) -> bool {
        (self.0 >> IS64_SHIFT) & 1 == 1
    }

    /// Returns `true` for the non-secure bank.
    #[must_use]
    pub const fn is_non_secure(self) -> bool {
        (self.0 >> CP_REG_NS_SHIFT) & 1 == 1
    }

    /// Primary register number.
    #[must_use]
    pub const fn crn(self) -> u8 {
        ((self.0 >> CRN_SHIFT) & 0xF) as u8
    }

    /// Secondary register number.
    #[must_use]
    pub const fn crm(self) -> u8 {
        ((self.0 >> CRM_SHIFT) & 0xF) as u8
    }

    /// First opcode field.
    #[must_use]
    pub const fn op1(self) -> u8 {
        ((self.0 >> OP1_SHIFT) & 0x7) as u8
    }

    /// Second opcode field.
    #[must_use]
    pub const fn op2(self) -> u8 {
        (self.0 & 0x7) as u8
    }
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cp{}:c{}:c{}:{}:{}{}",
            self.cp(),
            self.crn(),
            self.crm(),
            self.op1(),
            self.op2(),
            if self.is_64bit() { ":64" } else { "" }
        )
    }
}
