use std::fmt;
use std::ops::RangeInclusive;

use bitflags::bitflags;

/// Largest legal `crn` value.
pub const CRN_MAX: u8 = 0xF;
/// Largest legal `crm` value.
pub const CRM_MAX: u8 = 0xF;
/// Largest legal `op1` value.
pub const OP1_MAX: u8 = 0x7;
/// Largest legal `op2` value.
pub const OP2_MAX: u8 = 0x7;

/// One address field of a register template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Selector {
    /// A single concrete value.
    Exact(u8),
    /// Every legal value of the field.
    Any,
}

impl Selector {
    /// Returns `true` for [`Selector::Any`].
    #[must_use]
    pub const fn is_any(self) -> bool {
        matches!(self, Self::Any)
    }

    /// Values this selector expands to, given the field's largest legal value.
    #[must_use]
    pub const fn range(self, max: u8) -> RangeInclusive<u8> {
        match self {
            Self::Exact(value) => value..=value,
            Self::Any => 0..=max,
        }
    }

    /// Number of values this selector expands to.
    #[must_use]
    pub const fn count(self, max: u8) -> usize {
        match self {
            Self::Exact(_) => 1,
            Self::Any => max as usize + 1,
        }
    }
}

impl From<u8> for Selector {
    fn from(value: u8) -> Self {
        Self::Exact(value)
    }
}

bitflags! {
    /// Register type flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct RegisterFlags: u32 {
        /// Value is fixed at the reset value and has no backing storage.
        const CONST = 1 << 0;
        /// Accesses have side effects and are serialized.
        const IO = 1 << 1;
        /// Accessed with 64-bit width.
        const WIDE = 1 << 2;
    }
}

/// Width of a register access or of its backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum RegisterWidth {
    /// 32-bit.
    #[default]
    W32,
    /// 64-bit.
    W64,
}

impl RegisterWidth {
    /// Width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::W32 => 32,
            Self::W64 => 64,
        }
    }

    /// Mask keeping the low `bits()` bits of a value.
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Self::W32 => u32::MAX as u64,
            Self::W64 => u64::MAX,
        }
    }
}

/// Read callback; may update CPU state as a side effect.
pub type ReadFn<S> = fn(&mut S, &RegisterDescriptor<S>) -> u64;
/// Write callback; may update CPU state or trigger mode switches.
pub type WriteFn<S> = fn(&mut S, &RegisterDescriptor<S>, u64);

/// Typed access to the CPU-state field backing a register.
pub struct FieldAccessor<S> {
    width: RegisterWidth,
    get: fn(&S) -> u64,
    set: fn(&mut S, u64),
}

impl<S> FieldAccessor<S> {
    /// Binds a field through its getter and setter.
    #[must_use]
    pub const fn new(width: RegisterWidth, get: fn(&S) -> u64, set: fn(&mut S, u64)) -> Self {
        Self { width, get, set }
    }

    /// Width of the backing field.
    #[must_use]
    pub const fn width(&self) -> RegisterWidth {
        self.width
    }

    /// Loads the field.
    pub fn read(&self, state: &S) -> u64 {
        (self.get)(state) & self.width.mask()
    }

    /// Stores `value` truncated to the field width.
    pub fn write(&self, state: &mut S, value: u64) {
        (self.set)(state, value & self.width.mask());
    }
}

impl<S> Clone for FieldAccessor<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for FieldAccessor<S> {}

impl<S> fmt::Debug for FieldAccessor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessor")
            .field("width", &self.width)
            .finish_non_exhaustive()
    }
}

/// One logical system register, possibly covering several addresses.
pub struct RegisterDescriptor<S> {
    /// Human-readable register name.
    pub name: &'static str,
    /// Coprocessor / namespace id.
    pub cp: u8,
    /// Primary register number; must be concrete.
    pub crn: Selector,
    /// Secondary register number.
    pub crm: Selector,
    /// First opcode field.
    pub op1: Selector,
    /// Second opcode field.
    pub op2: Selector,
    /// Type flags.
    pub flags: RegisterFlags,
    /// Value applied at reset; the read value of `CONST` registers.
    pub reset_value: u64,
    /// Backing field in CPU state.
    pub field: Option<FieldAccessor<S>>,
    /// Read callback, preferred over `field` for reads.
    pub read: Option<ReadFn<S>>,
    /// Write callback, preferred over `field` for writes.
    pub write: Option<WriteFn<S>>,
}

impl<S> RegisterDescriptor<S> {
    /// Creates a 32-bit register template with no backing and a zero reset value.
    #[must_use]
    pub const fn new(
        name: &'static str,
        cp: u8,
        crn: Selector,
        crm: Selector,
        op1: Selector,
        op2: Selector,
    ) -> Self {
        Self {
            name,
            cp,
            crn,
            crm,
            op1,
            op2,
            flags: RegisterFlags::empty(),
            reset_value: 0,
            field: None,
            read: None,
            write: None,
        }
    }

    /// Adds type flags.
    #[must_use]
    pub fn with_flags(mut self, flags: RegisterFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Sets the reset value.
    #[must_use]
    pub fn with_reset_value(mut self, value: u64) -> Self {
        self.reset_value = value;
        self
    }

    /// Backs the register with a CPU-state field.
    #[must_use]
    pub fn with_field(mut self, field: FieldAccessor<S>) -> Self {
        self.field = Some(field);
        self
    }

    /// Installs a read callback.
    #[must_use]
    pub fn with_read(mut self, read: ReadFn<S>) -> Self {
        self.read = Some(read);
        self
    }

    /// Installs a write callback.
    #[must_use]
    pub fn with_write(mut self, write: WriteFn<S>) -> Self {
        self.write = Some(write);
        self
    }

    /// Returns `true` for `CONST` registers.
    #[must_use]
    pub const fn is_constant(&self) -> bool {
        self.flags.contains(RegisterFlags::CONST)
    }

    /// Returns `true` for `IO` registers.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        self.flags.contains(RegisterFlags::IO)
    }

    /// Returns `true` for 64-bit accesses.
    #[must_use]
    pub const fn is_64bit(&self) -> bool {
        self.flags.contains(RegisterFlags::WIDE)
    }

    /// Width used by accesses.
    #[must_use]
    pub const fn access_width(&self) -> RegisterWidth {
        if self.is_64bit() {
            RegisterWidth::W64
        } else {
            RegisterWidth::W32
        }
    }

    /// Width used when applying the reset value.
    ///
    /// 64-bit only when the access is 64-bit and the backing field, if any,
    /// is 64-bit as well.
    #[must_use]
    pub fn reset_width(&self) -> RegisterWidth {
        match (self.access_width(), self.field.map(|field| field.width())) {
            (RegisterWidth::W64, None | Some(RegisterWidth::W64)) => RegisterWidth::W64,
            _ => RegisterWidth::W32,
        }
    }

    /// Returns `true` when any expandable axis is a wildcard.
    #[must_use]
    pub const fn has_wildcard(&self) -> bool {
        self.op1.is_any() || self.op2.is_any() || self.crm.is_any()
    }

    /// Number of table entries this template expands to.
    #[must_use]
    pub const fn expanded_count(&self) -> usize {
        self.crm.count(CRM_MAX) * self.op1.count(OP1_MAX) * self.op2.count(OP2_MAX)
    }

    /// Clones this template with all expandable axes made concrete.
    #[must_use]
    pub fn concrete(&self, crm: u8, op1: u8, op2: u8) -> Self {
        Self {
            crm: Selector::Exact(crm),
            op1: Selector::Exact(op1),
            op2: Selector::Exact(op2),
            ..self.clone()
        }
    }
}

impl<S> Clone for RegisterDescriptor<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            cp: self.cp,
            crn: self.crn,
            crm: self.crm,
            op1: self.op1,
            op2: self.op2,
            flags: self.flags,
            reset_value: self.reset_value,
            field: self.field,
            read: self.read,
            write: self.write,
        }
    }
}

impl<S> fmt::Debug for RegisterDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterDescriptor")
            .field("name", &self.name)
            .field("cp", &self.cp)
            .field("crn", &self.crn)
            .field("crm", &self.crm)
            .field("op1", &self.op1)
            .field("op2", &self.op2)
            .field("flags", &self.flags)
            .field("reset_value", &format_args!("{:#x}", self.reset_value))
            .field("field", &self.field)
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldAccessor, RegisterDescriptor, RegisterFlags, RegisterWidth, Selector};
    use rstest::rstest;

    #[derive(Default)]
    struct Bank {
        narrow: u32,
        wide: u64,
    }

    fn get_narrow(bank: &Bank) -> u64 {
        u64::from(bank.narrow)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_narrow(bank: &mut Bank, value: u64) {
        bank.narrow = value as u32;
    }

    fn get_wide(bank: &Bank) -> u64 {
        bank.wide
    }

    fn set_wide(bank: &mut Bank, value: u64) {
        bank.wide = value;
    }

    const NARROW: FieldAccessor<Bank> =
        FieldAccessor::new(RegisterWidth::W32, get_narrow, set_narrow);
    const WIDE: FieldAccessor<Bank> = FieldAccessor::new(RegisterWidth::W64, get_wide, set_wide);

    fn template(crm: Selector, op1: Selector, op2: Selector) -> RegisterDescriptor<Bank> {
        RegisterDescriptor::new("T", 15, Selector::Exact(1), crm, op1, op2)
    }

    #[rstest]
    #[case(Selector::Exact(0), Selector::Exact(0), Selector::Exact(0), 1)]
    #[case(Selector::Any, Selector::Exact(0), Selector::Exact(0), 16)]
    #[case(Selector::Exact(0), Selector::Any, Selector::Exact(0), 8)]
    #[case(Selector::Exact(0), Selector::Exact(0), Selector::Any, 8)]
    #[case(Selector::Any, Selector::Any, Selector::Any, 1024)]
    fn expanded_count_multiplies_wildcard_ranges(
        #[case] crm: Selector,
        #[case] op1: Selector,
        #[case] op2: Selector,
        #[case] expected: usize,
    ) {
        let desc = template(crm, op1, op2);
        assert_eq!(desc.expanded_count(), expected);
        assert_eq!(desc.has_wildcard(), expected > 1);
    }

    #[rstest]
    #[case(RegisterFlags::WIDE, Some(WIDE), RegisterWidth::W64)]
    #[case(RegisterFlags::WIDE, Some(NARROW), RegisterWidth::W32)]
    #[case(RegisterFlags::WIDE, None, RegisterWidth::W64)]
    #[case(RegisterFlags::empty(), Some(WIDE), RegisterWidth::W32)]
    #[case(RegisterFlags::empty(), None, RegisterWidth::W32)]
    fn reset_width_requires_wide_access_and_wide_backing(
        #[case] flags: RegisterFlags,
        #[case] field: Option<FieldAccessor<Bank>>,
        #[case] expected: RegisterWidth,
    ) {
        let mut desc = template(Selector::Exact(0), Selector::Exact(0), Selector::Exact(0))
            .with_flags(flags);
        desc.field = field;
        assert_eq!(desc.reset_width(), expected);
    }

    #[test]
    fn field_accessor_truncates_to_field_width() {
        let mut bank = Bank::default();
        NARROW.write(&mut bank, 0x1_2345_6789);
        assert_eq!(bank.narrow, 0x2345_6789);
        assert_eq!(NARROW.read(&bank), 0x2345_6789);

        WIDE.write(&mut bank, u64::MAX);
        assert_eq!(WIDE.read(&bank), u64::MAX);
    }

    #[test]
    fn concrete_clone_substitutes_expanded_axes() {
        let desc = template(Selector::Any, Selector::Any, Selector::Exact(2)).with_reset_value(9);
        let clone = desc.concrete(5, 3, 2);
        assert_eq!(clone.crm, Selector::Exact(5));
        assert_eq!(clone.op1, Selector::Exact(3));
        assert_eq!(clone.op2, Selector::Exact(2));
        assert_eq!(clone.crn, Selector::Exact(1));
        assert_eq!(clone.reset_value, 9);
        assert!(!clone.has_wildcard());
    }
}
