//! Object-file backed implementation of the DIE cursor.
//!
//! Sections are located with `object`, copied into `Arc` slices and decoded
//! with `gimli`. Each compilation unit is pre-parsed into a flat vector of
//! DIE nodes with first-child/sibling links, so cursors are cheap
//! (`Arc` + index) and attribute payloads are decoded lazily on access.

use crate::die::{DebugSource, DieCursor};
use crate::error::Error;
use crate::location::eval_location_block;
use crate::weak_error;
use fallible_iterator::FallibleIterator;
use gimli::{
    AttributeValue, DW_AT_bit_offset, DW_AT_byte_size, DW_AT_name, DebugInfoUnitHeadersIter,
    Dwarf, DwAt, DwTag, Reader, RunTimeEndian, SectionId,
};
use log::warn;
use memmap2::Mmap;
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Load one debug section, uncompressed, into an `Arc` slice.
/// Missing sections load as empty slices.
fn load_section(
    id: SectionId,
    file: &object::File,
    endian: RunTimeEndian,
) -> Result<EndianArcSlice, Error> {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
}

/// Debug information of one object file, exposed as a [`DebugSource`].
///
/// The file mapping is released as soon as the sections are copied; the
/// source owns no descriptor afterwards.
pub struct ObjectDebugInfo {
    dwarf: Arc<Dwarf<EndianArcSlice>>,
    units: DebugInfoUnitHeadersIter<EndianArcSlice>,
}

impl ObjectDebugInfo {
    /// Map the file at `path` and load its debug sections.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_bytes(&mmap)
    }

    /// Load debug sections from an already read (or mapped) object file image.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let file = object::File::parse(data)?;
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = Dwarf::load(|id| load_section(id, &file, endian))?;
        let units = dwarf.units();
        Ok(Self {
            dwarf: Arc::new(dwarf),
            units,
        })
    }
}

impl DebugSource for ObjectDebugInfo {
    type Cursor = ObjectCursor;

    fn next_cu(&mut self) -> Result<Option<(u64, Self::Cursor)>, Error> {
        loop {
            let Some(header) = self.units.next()? else {
                return Ok(None);
            };

            let cu_offset = header
                .offset()
                .as_debug_info_offset()
                .map(|o| o.0 as u64)
                .unwrap_or_default();

            let unit = parse_unit(self.dwarf.clone(), header, cu_offset)?;
            if unit.nodes.is_empty() {
                warn!(target: "dwarfdb", "compilation unit at {cu_offset:#x} has no entries");
                continue;
            }

            let cursor = ObjectCursor {
                unit: Arc::new(unit),
                idx: 0,
            };
            return Ok(Some((cu_offset, cursor)));
        }
    }
}

struct DieNode {
    tag: DwTag,
    /// File-global offset.
    offset: u64,
    attrs: Box<[(DwAt, AttributeValue<EndianArcSlice>)]>,
    first_child: Option<usize>,
    sibling: Option<usize>,
}

struct ParsedUnit {
    cu_offset: u64,
    dwarf: Arc<Dwarf<EndianArcSlice>>,
    unit: gimli::Unit<EndianArcSlice>,
    nodes: Vec<DieNode>,
}

/// Flatten a unit's DIE tree into indexed nodes.
///
/// `next_dfs` reports a depth delta per entry; an explicit ancestor stack
/// turns that into parent links, from which first-child/sibling links follow.
fn parse_unit(
    dwarf: Arc<Dwarf<EndianArcSlice>>,
    header: gimli::UnitHeader<EndianArcSlice>,
    cu_offset: u64,
) -> Result<ParsedUnit, Error> {
    let unit = dwarf.unit(header)?;

    let mut nodes: Vec<DieNode> = vec![];
    let mut last_child: Vec<Option<usize>> = vec![];
    let mut ancestors: Vec<usize> = vec![];

    let mut cursor = unit.entries();
    while let Some((delta_depth, die)) = cursor.next_dfs()? {
        match delta_depth {
            // previous die is the parent
            1 if !nodes.is_empty() => ancestors.push(nodes.len() - 1),
            1 => {}
            // same parent as the previous die
            0 => {}
            // the parent of the previous die is a sibling
            mut x if x < 0 => {
                while x != 0 {
                    ancestors.pop();
                    x += 1;
                }
            }
            _ => unreachable!(),
        }

        let current = nodes.len();
        if let Some(&parent) = ancestors.last() {
            match last_child[parent] {
                Some(prev) => nodes[prev].sibling = Some(current),
                None => nodes[parent].first_child = Some(current),
            }
            last_child[parent] = Some(current);
        }

        let attrs = die.attrs().collect::<Vec<_>>()?;
        nodes.push(DieNode {
            tag: die.tag(),
            offset: cu_offset + die.offset().0 as u64,
            attrs: attrs
                .into_iter()
                .map(|attr| (attr.name(), attr.value()))
                .collect(),
            first_child: None,
            sibling: None,
        });
        last_child.push(None);
    }

    Ok(ParsedUnit {
        cu_offset,
        dwarf,
        unit,
        nodes,
    })
}

/// Cursor over a pre-parsed unit.
#[derive(Clone)]
pub struct ObjectCursor {
    unit: Arc<ParsedUnit>,
    idx: usize,
}

impl ObjectCursor {
    fn node(&self) -> &DieNode {
        &self.unit.nodes[self.idx]
    }

    fn find(&self, attr: DwAt) -> Option<&AttributeValue<EndianArcSlice>> {
        self.node()
            .attrs
            .iter()
            .find(|(name, _)| *name == attr)
            .map(|(_, value)| value)
    }

    fn at(&self, idx: Option<usize>) -> Option<Self> {
        idx.map(|idx| Self {
            unit: self.unit.clone(),
            idx,
        })
    }
}

impl DieCursor for ObjectCursor {
    fn tag(&self) -> DwTag {
        self.node().tag
    }

    fn name(&self) -> Option<String> {
        let value = self.find(DW_AT_name)?;
        let value = weak_error!(self.unit.dwarf.attr_string(&self.unit.unit, value.clone()))?;
        weak_error!(value.to_string_lossy()).map(|s| s.into_owned())
    }

    fn offset(&self) -> u64 {
        self.node().offset
    }

    fn byte_size(&self) -> Option<u64> {
        self.find(DW_AT_byte_size)?.udata_value()
    }

    fn bit_offset(&self) -> Option<u64> {
        self.find(DW_AT_bit_offset)?.udata_value()
    }

    fn has_attr(&self, attr: DwAt) -> bool {
        self.find(attr).is_some()
    }

    fn attr_number(&self, attr: DwAt) -> Result<u64, Error> {
        let value = self.find(attr).ok_or(Error::MissingAttribute(attr))?;
        match value {
            AttributeValue::Data1(v) => Ok(*v as u64),
            AttributeValue::Data2(v) => Ok(*v as u64),
            AttributeValue::Data4(v) => Ok(*v as u64),
            AttributeValue::Data8(v) => Ok(*v),
            AttributeValue::Udata(v) => Ok(*v),
            AttributeValue::Sdata(v) => Ok(*v as u64),
            AttributeValue::Addr(a) => Ok(*a),
            // unit-relative references rebase to the file-global offset
            AttributeValue::UnitRef(offset) => Ok(self.unit.cu_offset + offset.0 as u64),
            // already file-global
            AttributeValue::DebugInfoRef(offset) => Ok(offset.0 as u64),
            AttributeValue::SecOffset(v) => Ok(*v as u64),
            AttributeValue::Encoding(e) => Ok(e.0 as u64),
            AttributeValue::Exprloc(expr) => Ok(eval_location_block(&expr.0.to_slice()?)),
            AttributeValue::Block(data) => Ok(eval_location_block(&data.to_slice()?)),
            _ => {
                warn!(target: "dwarfdb", "form of attribute {attr} currently not supported");
                Err(Error::UnsupportedForm(attr))
            }
        }
    }

    fn attr_address(&self, attr: DwAt) -> Result<u64, Error> {
        let value = self.find(attr).ok_or(Error::MissingAttribute(attr))?;
        match value {
            AttributeValue::Addr(a) => Ok(*a),
            _ => Err(Error::UnsupportedForm(attr)),
        }
    }

    fn attr_string(&self, attr: DwAt) -> Result<String, Error> {
        let value = self.find(attr).ok_or(Error::MissingAttribute(attr))?;
        let value = self.unit.dwarf.attr_string(&self.unit.unit, value.clone())?;
        Ok(value.to_string_lossy()?.into_owned())
    }

    fn attr_flag(&self, attr: DwAt) -> bool {
        matches!(self.find(attr), Some(AttributeValue::Flag(true)))
    }

    fn first_child(&self) -> Result<Option<Self>, Error> {
        Ok(self.at(self.node().first_child))
    }

    fn sibling(&self) -> Result<Option<Self>, Error> {
        Ok(self.at(self.node().sibling))
    }
}
