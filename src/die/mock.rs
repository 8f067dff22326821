//! In-memory DIE trees for tests.

use crate::die::{DebugSource, DieCursor};
use crate::error::Error;
use crate::location::eval_location_block;
use gimli::{DW_AT_bit_offset, DW_AT_byte_size, DwAt, DwTag};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) enum TestAttr {
    Number(u64),
    Address(u64),
    Text(String),
    Flag(bool),
    Block(Vec<u8>),
}

/// Builder for one DIE and its subtree. Offsets are file-global and chosen
/// by the test; reference attributes carry file-global offsets directly.
#[derive(Debug, Clone)]
pub(crate) struct TestDie {
    tag: DwTag,
    offset: u64,
    name: Option<String>,
    attrs: Vec<(DwAt, TestAttr)>,
    children: Vec<TestDie>,
}

impl TestDie {
    pub fn new(tag: DwTag, offset: u64) -> Self {
        Self {
            tag,
            offset,
            name: None,
            attrs: vec![],
            children: vec![],
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn num(mut self, attr: DwAt, value: u64) -> Self {
        self.attrs.push((attr, TestAttr::Number(value)));
        self
    }

    pub fn addr(mut self, attr: DwAt, value: u64) -> Self {
        self.attrs.push((attr, TestAttr::Address(value)));
        self
    }

    #[allow(unused)]
    pub fn text(mut self, attr: DwAt, value: &str) -> Self {
        self.attrs.push((attr, TestAttr::Text(value.to_string())));
        self
    }

    pub fn flag(mut self, attr: DwAt) -> Self {
        self.attrs.push((attr, TestAttr::Flag(true)));
        self
    }

    pub fn block(mut self, attr: DwAt, bytes: &[u8]) -> Self {
        self.attrs.push((attr, TestAttr::Block(bytes.to_vec())));
        self
    }

    pub fn child(mut self, die: TestDie) -> Self {
        self.children.push(die);
        self
    }

    /// Cursor over this DIE alone, for entity-level tests.
    pub fn into_cursor(self) -> TestCursor {
        let mut nodes = vec![];
        flatten(self, &mut nodes);
        TestCursor {
            unit: Arc::new(FlatUnit { nodes }),
            idx: 0,
        }
    }
}

#[derive(Debug)]
struct FlatNode {
    tag: DwTag,
    offset: u64,
    name: Option<String>,
    attrs: Vec<(DwAt, TestAttr)>,
    first_child: Option<usize>,
    sibling: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct FlatUnit {
    nodes: Vec<FlatNode>,
}

fn flatten(die: TestDie, nodes: &mut Vec<FlatNode>) -> usize {
    let idx = nodes.len();
    nodes.push(FlatNode {
        tag: die.tag,
        offset: die.offset,
        name: die.name,
        attrs: die.attrs,
        first_child: None,
        sibling: None,
    });

    let mut prev: Option<usize> = None;
    for child in die.children {
        let child_idx = flatten(child, nodes);
        match prev {
            Some(prev) => nodes[prev].sibling = Some(child_idx),
            None => nodes[idx].first_child = Some(child_idx),
        }
        prev = Some(child_idx);
    }
    idx
}

#[derive(Debug, Clone)]
pub(crate) struct TestCursor {
    unit: Arc<FlatUnit>,
    idx: usize,
}

impl TestCursor {
    fn node(&self) -> &FlatNode {
        &self.unit.nodes[self.idx]
    }

    fn find(&self, attr: DwAt) -> Option<&TestAttr> {
        self.node()
            .attrs
            .iter()
            .find(|(name, _)| *name == attr)
            .map(|(_, value)| value)
    }
}

impl DieCursor for TestCursor {
    fn tag(&self) -> DwTag {
        self.node().tag
    }

    fn name(&self) -> Option<String> {
        self.node().name.clone()
    }

    fn offset(&self) -> u64 {
        self.node().offset
    }

    fn byte_size(&self) -> Option<u64> {
        match self.find(DW_AT_byte_size)? {
            TestAttr::Number(v) => Some(*v),
            _ => None,
        }
    }

    fn bit_offset(&self) -> Option<u64> {
        match self.find(DW_AT_bit_offset)? {
            TestAttr::Number(v) => Some(*v),
            _ => None,
        }
    }

    fn has_attr(&self, attr: DwAt) -> bool {
        self.find(attr).is_some()
    }

    fn attr_number(&self, attr: DwAt) -> Result<u64, Error> {
        match self.find(attr).ok_or(Error::MissingAttribute(attr))? {
            TestAttr::Number(v) => Ok(*v),
            TestAttr::Address(v) => Ok(*v),
            TestAttr::Block(bytes) => Ok(eval_location_block(bytes)),
            _ => Err(Error::UnsupportedForm(attr)),
        }
    }

    fn attr_address(&self, attr: DwAt) -> Result<u64, Error> {
        match self.find(attr).ok_or(Error::MissingAttribute(attr))? {
            TestAttr::Address(v) => Ok(*v),
            _ => Err(Error::UnsupportedForm(attr)),
        }
    }

    fn attr_string(&self, attr: DwAt) -> Result<String, Error> {
        match self.find(attr).ok_or(Error::MissingAttribute(attr))? {
            TestAttr::Text(s) => Ok(s.clone()),
            _ => Err(Error::UnsupportedForm(attr)),
        }
    }

    fn attr_flag(&self, attr: DwAt) -> bool {
        matches!(self.find(attr), Some(TestAttr::Flag(true)))
    }

    fn first_child(&self) -> Result<Option<Self>, Error> {
        Ok(self.node().first_child.map(|idx| Self {
            unit: self.unit.clone(),
            idx,
        }))
    }

    fn sibling(&self) -> Result<Option<Self>, Error> {
        Ok(self.node().sibling.map(|idx| Self {
            unit: self.unit.clone(),
            idx,
        }))
    }
}

/// A debug-information source assembled from test DIE trees.
#[derive(Debug, Default)]
pub(crate) struct TestDebugInfo {
    units: VecDeque<(u64, Arc<FlatUnit>)>,
}

impl TestDebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(mut self, cu_offset: u64, root: TestDie) -> Self {
        let mut nodes = vec![];
        flatten(root, &mut nodes);
        self.units.push_back((cu_offset, Arc::new(FlatUnit { nodes })));
        self
    }
}

impl DebugSource for TestDebugInfo {
    type Cursor = TestCursor;

    fn next_cu(&mut self) -> Result<Option<(u64, Self::Cursor)>, Error> {
        Ok(self.units.pop_front().map(|(cu_offset, unit)| {
            (cu_offset, TestCursor { unit, idx: 0 })
        }))
    }
}
