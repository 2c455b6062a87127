use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::trace;

use super::descriptor::{RegisterDescriptor, Selector, CRM_MAX, CRN_MAX, OP1_MAX, OP2_MAX};
use super::key::RegisterKey;

// Secure-state banking is not modelled; every register lives in the
// non-secure bank.
const NON_SECURE: bool = true;

/// Register table configuration errors.
///
/// These describe bugs in the register templates or in the callers that
/// embed keys into generated code; embedders treat them as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum RegisterError {
    /// Template left `crn` as a wildcard.
    #[error("register '{name}' has a wildcard crn")]
    WildcardCrn {
        /// Template name.
        name: &'static str,
    },
    /// Concrete field value exceeds its legal range.
    #[error("register '{name}' has {field}={value}, maximum is {max}")]
    FieldOutOfRange {
        /// Template name.
        name: &'static str,
        /// Offending field.
        field: &'static str,
        /// Requested value.
        value: u8,
        /// Largest legal value.
        max: u8,
    },
    /// Key is already registered.
    #[error("register '{name}' collides with an existing entry at {key}")]
    DuplicateKey {
        /// Template name.
        name: &'static str,
        /// Colliding key.
        key: RegisterKey,
    },
    /// No register is registered under the key.
    #[error("no register registered at {0}")]
    UnknownKey(RegisterKey),
    /// Non-zero reset value with neither a backing field nor a write callback.
    #[error("register '{name}' has a reset value but no way to apply it")]
    MissingResetPath {
        /// Register name.
        name: &'static str,
    },
    /// Register has no read callback, backing field or constant value.
    #[error("register '{name}' is not readable")]
    NoReadPath {
        /// Register name.
        name: &'static str,
    },
    /// Register has no write callback or backing field.
    #[error("register '{name}' is not writable")]
    NoWritePath {
        /// Register name.
        name: &'static str,
    },
}

/// Lock serializing accesses to `IO` registers.
///
/// Clones share one lock. Give every CPU table of a machine the same
/// serializer to serialize side-effecting accesses machine-wide.
#[derive(Debug, Clone, Default)]
pub struct IoSerializer(Arc<Mutex<()>>);

impl IoSerializer {
    /// Creates an independent serializer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock. A poisoned lock is taken over, since it guards no data.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` when both handles share one lock.
    #[must_use]
    pub fn shares_lock_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Table value with explicit ownership.
pub enum TableEntry<S> {
    /// Template registered without wildcards, shared with the registrant.
    Shared(Arc<RegisterDescriptor<S>>),
    /// Concrete clone created by wildcard expansion, owned by this entry.
    Owned(Box<RegisterDescriptor<S>>),
}

impl<S> TableEntry<S> {
    /// Descriptor behind this entry.
    #[must_use]
    pub fn descriptor(&self) -> &RegisterDescriptor<S> {
        match self {
            Self::Shared(desc) => desc,
            Self::Owned(desc) => desc,
        }
    }

    /// Mutable descriptor, for owned clones and for shared templates held nowhere else.
    pub fn descriptor_mut(&mut self) -> Option<&mut RegisterDescriptor<S>> {
        match self {
            Self::Shared(desc) => Arc::get_mut(desc),
            Self::Owned(desc) => Some(desc),
        }
    }

    /// Returns `true` for clones created by wildcard expansion.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

impl<S> fmt::Debug for TableEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(desc) => f.debug_tuple("Shared").field(desc).finish(),
            Self::Owned(desc) => f.debug_tuple("Owned").field(desc).finish(),
        }
    }
}

/// Number of table entries a template sequence expands to.
pub fn expanded_count<'a, S: 'a>(
    templates: impl IntoIterator<Item = &'a RegisterDescriptor<S>>,
) -> usize {
    templates
        .into_iter()
        .map(RegisterDescriptor::expanded_count)
        .sum()
}

/// Sparse map from encoded register key to descriptor.
pub struct RegisterTable<S> {
    entries: HashMap<RegisterKey, TableEntry<S>>,
    io: IoSerializer,
}

impl<S> Default for RegisterTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for RegisterTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterTable")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<S> RegisterTable<S> {
    /// Creates an empty table with its own IO serializer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty table sized for `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            io: IoSerializer::new(),
        }
    }

    /// Builds a table from an ordered template sequence, sized by its expanded count.
    ///
    /// # Errors
    ///
    /// Returns the first [`RegisterError`] raised by [`Self::register`].
    pub fn from_templates(
        templates: impl IntoIterator<Item = Arc<RegisterDescriptor<S>>>,
    ) -> Result<Self, RegisterError> {
        let templates: Vec<_> = templates.into_iter().collect();
        let mut table = Self::with_capacity(expanded_count(templates.iter().map(Arc::as_ref)));
        table.register_all(templates)?;
        Ok(table)
    }

    /// Replaces the IO serializer, typically with one shared by sibling CPUs.
    #[must_use]
    pub fn with_io_serializer(mut self, io: IoSerializer) -> Self {
        self.io = io;
        self
    }

    /// Serializer guarding `IO` register accesses.
    #[must_use]
    pub const fn io_serializer(&self) -> &IoSerializer {
        &self.io
    }

    /// Registers one template, expanding wildcard axes.
    ///
    /// Returns the number of entries added. A template is registered entirely
    /// or not at all.
    ///
    /// # Errors
    ///
    /// [`RegisterError::WildcardCrn`] and [`RegisterError::FieldOutOfRange`]
    /// for malformed templates, [`RegisterError::DuplicateKey`] when an
    /// expanded key is already present.
    pub fn register(
        &mut self,
        template: Arc<RegisterDescriptor<S>>,
    ) -> Result<usize, RegisterError> {
        let name = template.name;
        let Selector::Exact(crn) = template.crn else {
            return Err(RegisterError::WildcardCrn { name });
        };
        check_range(name, "crn", template.crn, CRN_MAX)?;
        check_range(name, "crm", template.crm, CRM_MAX)?;
        check_range(name, "op1", template.op1, OP1_MAX)?;
        check_range(name, "op2", template.op2, OP2_MAX)?;

        let is64 = template.is_64bit();
        let expand = template.has_wildcard();
        let mut staged = Vec::with_capacity(template.expanded_count());

        for op1 in template.op1.range(OP1_MAX) {
            for op2 in template.op2.range(OP2_MAX) {
                for crm in template.crm.range(CRM_MAX) {
                    let key =
                        RegisterKey::encode(template.cp, is64, NON_SECURE, crn, crm, op1, op2);
                    if self.entries.contains_key(&key) {
                        return Err(RegisterError::DuplicateKey { name, key });
                    }
                    let entry = if expand {
                        TableEntry::Owned(Box::new(template.concrete(crm, op1, op2)))
                    } else {
                        TableEntry::Shared(Arc::clone(&template))
                    };
                    staged.push((key, entry));
                }
            }
        }

        let added = staged.len();
        self.entries.extend(staged);
        Ok(added)
    }

    /// Registers templates in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing template; earlier templates stay registered.
    pub fn register_all(
        &mut self,
        templates: impl IntoIterator<Item = Arc<RegisterDescriptor<S>>>,
    ) -> Result<usize, RegisterError> {
        templates
            .into_iter()
            .try_fold(0, |added, template| Ok(added + self.register(template)?))
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` when `key` is registered.
    #[must_use]
    pub fn contains(&self, key: RegisterKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Descriptor registered under `key`.
    #[must_use]
    pub fn lookup(&self, key: RegisterKey) -> Option<&RegisterDescriptor<S>> {
        self.entries.get(&key).map(TableEntry::descriptor)
    }

    /// Entry registered under `key`, exposing its ownership.
    #[must_use]
    pub fn entry(&self, key: RegisterKey) -> Option<&TableEntry<S>> {
        self.entries.get(&key)
    }

    /// Mutable descriptor under `key`; see [`TableEntry::descriptor_mut`].
    pub fn descriptor_mut(&mut self, key: RegisterKey) -> Option<&mut RegisterDescriptor<S>> {
        self.entries.get_mut(&key).and_then(TableEntry::descriptor_mut)
    }

    /// Removes an entry. Dropping the result frees owned clones only.
    pub fn remove(&mut self, key: RegisterKey) -> Option<TableEntry<S>> {
        self.entries.remove(&key)
    }

    /// Registered keys in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<RegisterKey> {
        let mut keys: Vec<_> = self.entries.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    fn descriptor_for(&self, key: RegisterKey) -> Result<&RegisterDescriptor<S>, RegisterError> {
        self.lookup(key).ok_or(RegisterError::UnknownKey(key))
    }

    /// Reads a 32-bit register by key.
    ///
    /// # Errors
    ///
    /// [`RegisterError::UnknownKey`] or [`RegisterError::NoReadPath`].
    pub fn read32(&self, state: &mut S, key: RegisterKey) -> Result<u32, RegisterError> {
        self.get_cp_reg(state, self.descriptor_for(key)?)
    }

    /// Reads a 64-bit register by key.
    ///
    /// # Errors
    ///
    /// [`RegisterError::UnknownKey`] or [`RegisterError::NoReadPath`].
    pub fn read64(&self, state: &mut S, key: RegisterKey) -> Result<u64, RegisterError> {
        self.get_cp_reg64(state, self.descriptor_for(key)?)
    }

    /// Writes a 32-bit register by key.
    ///
    /// # Errors
    ///
    /// [`RegisterError::UnknownKey`] or [`RegisterError::NoWritePath`].
    pub fn write32(
        &self,
        state: &mut S,
        key: RegisterKey,
        value: u32,
    ) -> Result<(), RegisterError> {
        self.set_cp_reg(state, self.descriptor_for(key)?, value)
    }

    /// Writes a 64-bit register by key.
    ///
    /// # Errors
    ///
    /// [`RegisterError::UnknownKey`] or [`RegisterError::NoWritePath`].
    pub fn write64(
        &self,
        state: &mut S,
        key: RegisterKey,
        value: u64,
    ) -> Result<(), RegisterError> {
        self.set_cp_reg64(state, self.descriptor_for(key)?, value)
    }

    /// 32-bit read through a descriptor fixed when the calling block was compiled.
    ///
    /// # Errors
    ///
    /// [`RegisterError::NoReadPath`] when the register cannot be read.
    #[allow(clippy::cast_possible_truncation)]
    pub fn get_cp_reg(
        &self,
        state: &mut S,
        desc: &RegisterDescriptor<S>,
    ) -> Result<u32, RegisterError> {
        self.serialized(desc, || dispatch_read(state, desc))
            .map(|value| value as u32)
    }

    /// 64-bit read through a descriptor fixed when the calling block was compiled.
    ///
    /// # Errors
    ///
    /// [`RegisterError::NoReadPath`] when the register cannot be read.
    pub fn get_cp_reg64(
        &self,
        state: &mut S,
        desc: &RegisterDescriptor<S>,
    ) -> Result<u64, RegisterError> {
        self.serialized(desc, || dispatch_read(state, desc))
    }

    /// 32-bit write through a descriptor fixed when the calling block was compiled.
    ///
    /// # Errors
    ///
    /// [`RegisterError::NoWritePath`] when the register cannot be written.
    pub fn set_cp_reg(
        &self,
        state: &mut S,
        desc: &RegisterDescriptor<S>,
        value: u32,
    ) -> Result<(), RegisterError> {
        self.serialized(desc, || dispatch_write(state, desc, u64::from(value)))
    }

    /// 64-bit write through a descriptor fixed when the calling block was compiled.
    ///
    /// # Errors
    ///
    /// [`RegisterError::NoWritePath`] when the register cannot be written.
    pub fn set_cp_reg64(
        &self,
        state: &mut S,
        desc: &RegisterDescriptor<S>,
        value: u64,
    ) -> Result<(), RegisterError> {
        self.serialized(desc, || dispatch_write(state, desc, value))
    }

    fn serialized<T>(&self, desc: &RegisterDescriptor<S>, access: impl FnOnce() -> T) -> T {
        if desc.is_io() {
            let _guard = self.io.lock();
            access()
        } else {
            access()
        }
    }

    /// Applies every register's reset value.
    ///
    /// Registers with a zero reset value are skipped, since backing state
    /// starts zeroed, and so are constants, which always read their reset
    /// value. Entries are visited in ascending key order.
    ///
    /// # Errors
    ///
    /// [`RegisterError::MissingResetPath`] for a register with a non-zero
    /// reset value and neither a backing field nor a write callback.
    pub fn reset(&self, state: &mut S) -> Result<(), RegisterError> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_unstable_by_key(|(key, _)| **key);

        for (key, entry) in entries {
            let desc = entry.descriptor();
            if desc.reset_value == 0 || desc.is_constant() {
                continue;
            }

            let value = desc.reset_value & desc.reset_width().mask();
            trace!("resetting value for '{}' at {}: {:#x}", desc.name, key, value);

            if let Some(field) = desc.field {
                self.serialized(desc, || field.write(state, value));
            } else if let Some(write) = desc.write {
                self.serialized(desc, || write(state, desc, value));
            } else {
                return Err(RegisterError::MissingResetPath { name: desc.name });
            }
        }
        Ok(())
    }
}

fn check_range(
    name: &'static str,
    field: &'static str,
    selector: Selector,
    max: u8,
) -> Result<(), RegisterError> {
    match selector {
        Selector::Exact(value) if value > max => Err(RegisterError::FieldOutOfRange {
            name,
            field,
            value,
            max,
        }),
        Selector::Exact(_) | Selector::Any => Ok(()),
    }
}

fn dispatch_read<S>(state: &mut S, desc: &RegisterDescriptor<S>) -> Result<u64, RegisterError> {
    if desc.is_constant() {
        return Ok(desc.reset_value & desc.access_width().mask());
    }
    if let Some(read) = desc.read {
        return Ok(read(state, desc));
    }
    if let Some(field) = desc.field {
        return Ok(field.read(state));
    }
    Err(RegisterError::NoReadPath { name: desc.name })
}

fn dispatch_write<S>(
    state: &mut S,
    desc: &RegisterDescriptor<S>,
    value: u64,
) -> Result<(), RegisterError> {
    if desc.is_constant() {
        trace!("ignoring write of {:#x} to constant '{}'", value, desc.name);
        return Ok(());
    }
    if let Some(write) = desc.write {
        write(state, desc, value);
        return Ok(());
    }
    if let Some(field) = desc.field {
        field.write(state, value);
        return Ok(());
    }
    Err(RegisterError::NoWritePath { name: desc.name })
}
