//! System and coprocessor register dispatch.
//!
//! Registers are described by [`RegisterDescriptor`] templates. A template may
//! leave `op1`, `op2` or `crm` as [`Selector::Any`]; registration expands such
//! axes into one table entry per concrete value. The resulting
//! [`RegisterTable`] maps encoded [`RegisterKey`]s to descriptors and routes
//! typed reads and writes to each register's backing.

/// Descriptor templates, selectors and backing capabilities.
pub mod descriptor;
/// Encoded register addresses.
pub mod key;
/// Sparse key-to-descriptor table with reset and access helpers.
pub mod table;

pub use descriptor::{
    FieldAccessor, ReadFn, RegisterDescriptor, RegisterFlags, RegisterWidth, Selector, WriteFn,
    CRM_MAX, CRN_MAX, OP1_MAX, OP2_MAX,
};
pub use key::{RegisterKey, CP_REG_NS_SHIFT};
pub use table::{expanded_count, IoSerializer, RegisterError, RegisterTable, TableEntry};
