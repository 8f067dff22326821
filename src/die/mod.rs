//! Access to debug-information entries.
//!
//! The parser driver is written against two small traits: [`DieCursor`], a
//! read-only view of one DIE that can move to its first child or next
//! sibling, and [`DebugSource`], a pull-style iterator over compilation
//! units. The production implementation in [`object`] decodes real object
//! files; tests run the driver against an in-memory tree.

pub mod object;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::Error;
use gimli::{DwAt, DwTag};

/// Read-only view of a single debug-information entry.
///
/// `offset` is file-global (relative to the start of the debug-information
/// section, not to the containing compilation unit). Attribute getters that
/// return numbers decode the underlying form; reference forms are rebased to
/// file-global offsets, block and exprloc forms are run through
/// [`crate::location::eval_location_block`].
pub trait DieCursor: Sized {
    fn tag(&self) -> DwTag;

    /// `DW_AT_name`, if present.
    fn name(&self) -> Option<String>;

    /// File-global offset of this DIE.
    fn offset(&self) -> u64;

    /// `DW_AT_byte_size`, if present.
    fn byte_size(&self) -> Option<u64>;

    /// `DW_AT_bit_offset`, if present.
    fn bit_offset(&self) -> Option<u64>;

    fn has_attr(&self, attr: DwAt) -> bool;

    fn attr_number(&self, attr: DwAt) -> Result<u64, Error>;

    fn attr_address(&self, attr: DwAt) -> Result<u64, Error>;

    fn attr_string(&self, attr: DwAt) -> Result<String, Error>;

    /// Flag attribute value. An absent attribute reads as `false`.
    fn attr_flag(&self, attr: DwAt) -> bool;

    fn first_child(&self) -> Result<Option<Self>, Error>;

    fn sibling(&self) -> Result<Option<Self>, Error>;
}

/// Pull-style source of compilation units of one debug-information file.
pub trait DebugSource {
    type Cursor: DieCursor;

    /// Advance to the next compilation unit. Yields the unit's file-global
    /// offset and a cursor positioned at the unit root DIE.
    fn next_cu(&mut self) -> Result<Option<(u64, Self::Cursor)>, Error>;
}
