//! Entities of the type and symbol graph.
//!
//! Every entity embeds a [`Symbol`] header and links to other entities by
//! [`SymbolId`] only; the graph is owned by the
//! [`SymbolManager`](crate::manager::SymbolManager). Until
//! `update_types` runs, stored ids encode raw `(file, die offset)` pairs and
//! may not resolve.

use crate::die::DieCursor;
use crate::error::Error;
use crate::symbol::{FileId, Symbol, SymbolId};
use gimli::{
    DW_AT_bit_size, DW_AT_data_member_location, DW_AT_encoding, DW_AT_location, DW_AT_low_pc,
    DW_AT_type, DW_AT_upper_bound, DwAte,
};
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::sync::{Arc, RwLock};
use strum_macros::Display;

/// Shared handle to an entity. The per-entity lock allows several files to
/// be parsed in parallel against one manager.
pub type SymbolRef = Arc<RwLock<Entity>>;

/// Kind discriminator of an [`Entity`].
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    BaseType,
    Typedef,
    ConstType,
    Pointer,
    Struct,
    Union,
    Array,
    Enum,
    Function,
    Variable,
}

/// Reference qualifiers: types that refer to another type without changing
/// its storage layout.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum RefModifier {
    Typedef,
    Const,
    Pointer,
}

impl RefModifier {
    pub fn kind(&self) -> EntityKind {
        match self {
            RefModifier::Typedef => EntityKind::Typedef,
            RefModifier::Const => EntityKind::ConstType,
            RefModifier::Pointer => EntityKind::Pointer,
        }
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum StructuredKind {
    Struct,
    Union,
}

/// A scalar machine type: sized, with a DWARF encoding class.
#[derive(Debug, Clone)]
pub struct BaseType {
    pub symbol: Symbol,
    pub byte_size: u64,
    pub encoding: Option<DwAte>,
}

impl BaseType {
    pub fn new<C: DieCursor>(symbol: Symbol, die: &C) -> Result<Self, Error> {
        let mut this = Self {
            symbol,
            byte_size: 0,
            encoding: None,
        };
        this.update(die)?;
        Ok(this)
    }

    pub fn update<C: DieCursor>(&mut self, die: &C) -> Result<(), Error> {
        if self.byte_size == 0 {
            if let Some(size) = die.byte_size() {
                self.byte_size = size;
            }
        }
        if self.encoding.is_none() && die.has_attr(DW_AT_encoding) {
            self.encoding = Some(DwAte(die.attr_number(DW_AT_encoding)? as u8));
        }
        Ok(())
    }
}

/// Typedef, const qualifier or pointer: qualifies another type.
///
/// Its own byte size is usually unknown until the referent resolves; pointers
/// carry their size in the DIE.
#[derive(Debug, Clone)]
pub struct RefBaseType {
    pub symbol: Symbol,
    pub modifier: RefModifier,
    pub byte_size: u64,
    pub refers_to: SymbolId,
}

impl RefBaseType {
    pub fn new<C: DieCursor>(
        symbol: Symbol,
        modifier: RefModifier,
        die: &C,
        file_id: FileId,
    ) -> Result<Self, Error> {
        let mut this = Self {
            symbol,
            modifier,
            byte_size: 0,
            refers_to: SymbolId::NONE,
        };
        this.update(die, file_id)?;
        Ok(this)
    }

    pub fn update<C: DieCursor>(&mut self, die: &C, file_id: FileId) -> Result<(), Error> {
        if self.refers_to.is_none() && die.has_attr(DW_AT_type) {
            self.refers_to = SymbolId::combine(file_id, die.attr_number(DW_AT_type)?);
        }
        if self.byte_size == 0 {
            if let Some(size) = die.byte_size() {
                self.byte_size = size;
            }
        }
        Ok(())
    }
}

/// Field of a structured type.
#[derive(Debug, Clone)]
pub struct StructuredMember {
    pub name: String,
    /// Byte offset within the parent. 0 for union members.
    pub member_location: u64,
    pub bit_offset: Option<u64>,
    pub bit_size: Option<u64>,
    pub type_ref: SymbolId,
}

/// Struct or union with its name-keyed member table.
#[derive(Debug, Clone)]
pub struct Structured {
    pub symbol: Symbol,
    pub kind: StructuredKind,
    pub byte_size: u64,
    members: IndexMap<String, StructuredMember>,
}

impl Structured {
    pub fn new<C: DieCursor>(
        symbol: Symbol,
        kind: StructuredKind,
        die: &C,
    ) -> Result<Self, Error> {
        let mut this = Self {
            symbol,
            kind,
            byte_size: 0,
            members: IndexMap::new(),
        };
        this.update(die)?;
        Ok(this)
    }

    pub fn update<C: DieCursor>(&mut self, die: &C) -> Result<(), Error> {
        if self.byte_size == 0 {
            if let Some(size) = die.byte_size() {
                self.byte_size = size;
            }
        }
        Ok(())
    }

    /// Read a member DIE into the table.
    ///
    /// The same member seen again from another translation unit is a no-op.
    /// A genuinely colliding name (anonymous unions produce them) gets the
    /// smallest numeric suffix that makes it unique.
    pub fn add_member<C: DieCursor>(
        &mut self,
        die: &C,
        name: &str,
        file_id: FileId,
    ) -> Result<&StructuredMember, Error> {
        let mut member = StructuredMember {
            name: name.to_string(),
            member_location: 0,
            bit_offset: None,
            bit_size: None,
            type_ref: SymbolId::NONE,
        };

        if die.has_attr(DW_AT_type) {
            member.type_ref = SymbolId::combine(file_id, die.attr_number(DW_AT_type)?);
        }
        if die.has_attr(DW_AT_data_member_location) {
            member.member_location = die.attr_number(DW_AT_data_member_location)?;
        }
        member.bit_offset = die.bit_offset();
        if die.has_attr(DW_AT_bit_size) {
            member.bit_size = Some(die.attr_number(DW_AT_bit_size)?);
        }

        let resighting = self
            .members
            .get(name)
            .map(|existing| {
                existing.member_location == member.member_location
                    && existing.bit_offset == member.bit_offset
                    && existing.bit_size == member.bit_size
            })
            .unwrap_or(false);
        if resighting {
            return Ok(&self.members[name]);
        }

        if self.members.contains_key(&member.name) {
            let mut n = 0;
            member.name = loop {
                let candidate = format!("{name}{n}");
                if !self.members.contains_key(&candidate) {
                    break candidate;
                }
                n += 1;
            };
        }

        let key = member.name.clone();
        Ok(self.members.entry(key).or_insert(member))
    }

    pub fn member_by_name(&self, name: &str) -> Option<&StructuredMember> {
        self.members.get(name)
    }

    /// Member with the greatest location not above `offset`.
    /// An exact hit wins immediately.
    pub fn member_by_offset(&self, offset: u64) -> Option<&StructuredMember> {
        let mut result: Option<&StructuredMember> = None;
        for member in self.members.values() {
            if member.member_location == offset {
                return Some(member);
            }
            if member.member_location < offset
                && result.map_or(true, |best| member.member_location > best.member_location)
            {
                result = Some(member);
            }
        }
        result
    }

    /// Name of the member located exactly at `offset`, or an empty string.
    pub fn member_name_by_offset(&self, offset: u64) -> String {
        self.members
            .values()
            .find(|member| member.member_location == offset)
            .map(|member| member.name.clone())
            .unwrap_or_default()
    }

    /// Byte offset of a member, `u32::MAX` when there is no such member.
    pub fn member_offset(&self, name: &str) -> u32 {
        self.members
            .get(name)
            .map(|member| member.member_location as u32)
            .unwrap_or(u32::MAX)
    }

    pub fn members(&self) -> impl Iterator<Item = &StructuredMember> {
        self.members.values()
    }

    pub(crate) fn members_mut(&mut self) -> impl Iterator<Item = &mut StructuredMember> {
        self.members.values_mut()
    }
}

/// Fixed-size sequence of one element type. Never merged across DIEs: two
/// identical array DIEs stay two entities, consumers compare element type
/// and length.
#[derive(Debug, Clone)]
pub struct ArrayType {
    pub symbol: Symbol,
    pub byte_size: u64,
    pub element_type: SymbolId,
    /// 0 means unknown or flexible.
    pub length: u64,
}

impl ArrayType {
    pub fn new<C: DieCursor>(symbol: Symbol, die: &C, file_id: FileId) -> Result<Self, Error> {
        let mut this = Self {
            symbol,
            byte_size: 0,
            element_type: SymbolId::NONE,
            length: 0,
        };
        this.update(die, file_id)?;
        Ok(this)
    }

    pub fn update<C: DieCursor>(&mut self, die: &C, file_id: FileId) -> Result<(), Error> {
        if self.element_type.is_none() && die.has_attr(DW_AT_type) {
            self.element_type = SymbolId::combine(file_id, die.attr_number(DW_AT_type)?);
        }
        if self.byte_size == 0 {
            if let Some(size) = die.byte_size() {
                self.byte_size = size;
            }
        }
        Ok(())
    }

    /// Take the length from a subrange child DIE.
    pub fn update_bounds<C: DieCursor>(&mut self, die: &C) -> Result<(), Error> {
        if die.has_attr(DW_AT_upper_bound) {
            self.length = die.attr_number(DW_AT_upper_bound)? + 1;
        }
        Ok(())
    }
}

/// C-style enumeration: a name to signed value table.
#[derive(Debug, Clone)]
pub struct EnumType {
    pub symbol: Symbol,
    pub byte_size: u64,
    enumerators: IndexMap<String, i64>,
}

impl EnumType {
    pub fn new<C: DieCursor>(symbol: Symbol, die: &C) -> Result<Self, Error> {
        let mut this = Self {
            symbol,
            byte_size: 0,
            enumerators: IndexMap::new(),
        };
        this.update(die)?;
        Ok(this)
    }

    pub fn update<C: DieCursor>(&mut self, die: &C) -> Result<(), Error> {
        if self.byte_size == 0 {
            if let Some(size) = die.byte_size() {
                self.byte_size = size;
            }
        }
        Ok(())
    }

    pub fn add_enumerator(&mut self, name: impl Into<String>, value: i64) {
        self.enumerators.insert(name.into(), value);
    }

    pub fn enumerator_value(&self, name: &str) -> Option<i64> {
        self.enumerators.get(name).copied()
    }

    pub fn enumerator_name(&self, value: i64) -> Option<&str> {
        self.enumerators
            .iter()
            .find(|(_, &v)| v == value)
            .map(|(name, _)| name.as_str())
    }

    pub fn enumerators(&self) -> impl Iterator<Item = (&str, i64)> {
        self.enumerators.iter().map(|(name, &value)| (name.as_str(), value))
    }
}

/// Subprogram with its signature and entry address.
#[derive(Debug, Clone)]
pub struct Function {
    pub symbol: Symbol,
    pub return_type: SymbolId,
    pub address: u64,
    parameters: Vec<(String, SymbolId)>,
    params_final: bool,
}

impl Function {
    pub fn new<C: DieCursor>(symbol: Symbol, die: &C, file_id: FileId) -> Result<Self, Error> {
        let mut this = Self {
            symbol,
            return_type: SymbolId::NONE,
            address: 0,
            parameters: vec![],
            params_final: false,
        };
        this.update(die, file_id)?;
        // parameters of the first sighting may still follow as child DIEs,
        // they finalize when the function is seen a second time
        this.params_final = false;
        Ok(this)
    }

    pub fn update<C: DieCursor>(&mut self, die: &C, file_id: FileId) -> Result<(), Error> {
        if self.return_type.is_none() && die.has_attr(DW_AT_type) {
            self.return_type = SymbolId::combine(file_id, die.attr_number(DW_AT_type)?);
        }
        if self.address == 0 && die.has_attr(DW_AT_low_pc) {
            self.address = die.attr_number(DW_AT_low_pc)?;
        }
        self.params_final = true;
        Ok(())
    }

    /// Append a formal parameter, unless the parameter list is already final.
    pub fn add_param<C: DieCursor>(&mut self, die: &C, file_id: FileId) -> Result<(), Error> {
        if self.params_final {
            return Ok(());
        }
        if die.has_attr(DW_AT_type) {
            let param_type = SymbolId::combine(file_id, die.attr_number(DW_AT_type)?);
            let name = die.name().unwrap_or_default();
            self.parameters.push((name, param_type));
        }
        Ok(())
    }

    pub fn params(&self) -> &[(String, SymbolId)] {
        &self.parameters
    }

    pub fn param_by_name(&self, name: &str) -> Option<SymbolId> {
        self.parameters
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, id)| *id)
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Function {}

impl PartialOrd for Function {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Function {
    /// Functions are ordered (and therefore equal) by name, return type id
    /// and parameter type id sequence; parameter names do not participate.
    fn cmp(&self, other: &Self) -> Ordering {
        self.symbol
            .name
            .cmp(&other.symbol.name)
            .then_with(|| self.return_type.cmp(&other.return_type))
            .then_with(|| {
                let own = self.parameters.iter().map(|(_, id)| *id);
                let others = other.parameters.iter().map(|(_, id)| *id);
                own.cmp(others)
            })
    }
}

/// Named data object at a virtual address.
#[derive(Debug, Clone)]
pub struct Variable {
    pub symbol: Symbol,
    pub type_ref: SymbolId,
    pub location: u64,
}

impl Variable {
    pub fn new<C: DieCursor>(symbol: Symbol, die: &C, file_id: FileId) -> Result<Self, Error> {
        let mut this = Self {
            symbol,
            type_ref: SymbolId::NONE,
            location: 0,
        };
        if die.has_attr(DW_AT_type) {
            this.type_ref = SymbolId::combine(file_id, die.attr_number(DW_AT_type)?);
        }
        this.update(die)?;
        Ok(this)
    }

    pub fn update<C: DieCursor>(&mut self, die: &C) -> Result<(), Error> {
        if self.location != 0 {
            return Ok(());
        }
        if die.has_attr(DW_AT_location) {
            self.location = die.attr_number(DW_AT_location)?;
        }
        Ok(())
    }
}

/// Sum of every entity kind the graph stores.
#[derive(Debug, Clone)]
pub enum Entity {
    Base(BaseType),
    Ref(RefBaseType),
    Structured(Structured),
    Array(ArrayType),
    Enum(EnumType),
    Function(Function),
    Variable(Variable),
}

impl Entity {
    pub fn symbol(&self) -> &Symbol {
        match self {
            Entity::Base(e) => &e.symbol,
            Entity::Ref(e) => &e.symbol,
            Entity::Structured(e) => &e.symbol,
            Entity::Array(e) => &e.symbol,
            Entity::Enum(e) => &e.symbol,
            Entity::Function(e) => &e.symbol,
            Entity::Variable(e) => &e.symbol,
        }
    }

    pub fn symbol_mut(&mut self) -> &mut Symbol {
        match self {
            Entity::Base(e) => &mut e.symbol,
            Entity::Ref(e) => &mut e.symbol,
            Entity::Structured(e) => &mut e.symbol,
            Entity::Array(e) => &mut e.symbol,
            Entity::Enum(e) => &mut e.symbol,
            Entity::Function(e) => &mut e.symbol,
            Entity::Variable(e) => &mut e.symbol,
        }
    }

    pub fn id(&self) -> SymbolId {
        self.symbol().id
    }

    pub fn name(&self) -> &str {
        &self.symbol().name
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Base(_) => EntityKind::BaseType,
            Entity::Ref(e) => e.modifier.kind(),
            Entity::Structured(e) => match e.kind {
                StructuredKind::Struct => EntityKind::Struct,
                StructuredKind::Union => EntityKind::Union,
            },
            Entity::Array(_) => EntityKind::Array,
            Entity::Enum(_) => EntityKind::Enum,
            Entity::Function(_) => EntityKind::Function,
            Entity::Variable(_) => EntityKind::Variable,
        }
    }

    /// True for everything that can stand in a type position.
    pub fn is_type(&self) -> bool {
        !matches!(self, Entity::Function(_) | Entity::Variable(_))
    }

    pub fn as_base(&self) -> Option<&BaseType> {
        match self {
            Entity::Base(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_ref_type(&self) -> Option<&RefBaseType> {
        match self {
            Entity::Ref(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_ref_type_mut(&mut self) -> Option<&mut RefBaseType> {
        match self {
            Entity::Ref(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Structured> {
        match self {
            Entity::Structured(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_structured_mut(&mut self) -> Option<&mut Structured> {
        match self {
            Entity::Structured(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayType> {
        match self {
            Entity::Array(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayType> {
        match self {
            Entity::Array(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumType> {
        match self {
            Entity::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_enum_mut(&mut self) -> Option<&mut EnumType> {
        match self {
            Entity::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Entity::Function(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut Function> {
        match self {
            Entity::Function(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Entity::Variable(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_variable_mut(&mut self) -> Option<&mut Variable> {
        match self {
            Entity::Variable(e) => Some(e),
            _ => None,
        }
    }

    /// Re-read attributes of another DIE that resolved to this entity.
    pub fn update<C: DieCursor>(&mut self, die: &C, file_id: FileId) -> Result<(), Error> {
        match self {
            Entity::Base(e) => e.update(die),
            Entity::Ref(e) => e.update(die, file_id),
            Entity::Structured(e) => e.update(die),
            Entity::Array(e) => e.update(die, file_id),
            Entity::Enum(e) => e.update(die),
            Entity::Function(e) => e.update(die, file_id),
            Entity::Variable(e) => e.update(die),
        }
    }

    /// Every stored reference id, for the terminal rewrite pass.
    pub(crate) fn referenced_ids_mut(&mut self) -> Vec<&mut SymbolId> {
        match self {
            Entity::Base(_) | Entity::Enum(_) => vec![],
            Entity::Ref(e) => vec![&mut e.refers_to],
            Entity::Structured(e) => e.members_mut().map(|m| &mut m.type_ref).collect(),
            Entity::Array(e) => vec![&mut e.element_type],
            Entity::Function(e) => {
                let mut ids = vec![&mut e.return_type];
                ids.extend(e.parameters.iter_mut().map(|(_, id)| id));
                ids
            }
            Entity::Variable(e) => vec![&mut e.type_ref],
        }
    }
}
