//! Streaming hierarchical flattener
//!
//! Converts the BulkCM event sequence into flat [`Record`]s in one pass. The
//! state kept is the stack of open containers, one pending text buffer and
//! the file metadata. Duplicate detection adds one `u64` hash per child seen
//! under each open container (and per top-level node), so memory grows with
//! nesting depth plus the widest open sibling list, never with the rows
//! already emitted.
//!
//! Every element carrying an `id` attribute is a container [`Node`]. Leaf
//! elements inside a node's `attributes` block become its attribute map, and
//! the node is emitted when that block closes, or at its own close when it
//! has no attribute block. Vendor `VsDataContainer` nodes take their real
//! type from the `vsDataType` descriptor inside their attribute block.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{FlattenError, Result};
use crate::metadata::FileMetadata;
use crate::router::SchemaFingerprint;
use crate::xml_events::EventHandler;

const ID_ATTRIBUTE: &str = "id";
const ATTRIBUTES: &str = "attributes";
const VS_DATA_CONTAINER: &str = "VsDataContainer";
const VS_DATA_TYPE: &str = "vsDataType";
const VS_DATA_FORMAT_VERSION: &str = "vsDataFormatVersion";
const METADATA_TAGS: [&str; 4] = ["bulkCmConfigDataFile", "fileHeader", "fileFooter", "configData"];

/// Exclude-list entry meaning "everything not explicitly included"
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub type_name: String,
    pub id: String,
}

impl PathSegment {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

/// Chain of container segments from the document root
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<PathSegment>);

impl Path {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// This path extended by one more segment
    pub fn child(&self, segment: PathSegment) -> Path {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.extend(self.0.iter().cloned());
        segments.push(segment);
        Path(segments)
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Path(segments)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", segment.type_name, segment.id)?;
        }
        Ok(())
    }
}

/// An open container element
#[derive(Debug, Clone)]
pub struct Node {
    pub type_name: String,
    pub id: String,
    /// Ancestors only, the node itself is not part of it
    pub path: Path,
    pub attributes: IndexMap<String, String>,
    resolved: bool,
    virtual_container: bool,
    emitted: bool,
    /// Identity hashes of the direct children seen so far, dropped with the node
    children: HashSet<u64>,
}

impl Node {
    fn new(type_name: &str, id: &str, path: Path) -> Self {
        let virtual_container = type_name == VS_DATA_CONTAINER;
        Self {
            type_name: type_name.to_string(),
            id: id.to_string(),
            path,
            attributes: IndexMap::new(),
            resolved: !virtual_container,
            virtual_container,
            emitted: false,
            children: HashSet::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Ancestors plus the node's own segment
    pub fn identity_path(&self) -> Path {
        self.path
            .child(PathSegment::new(self.type_name.clone(), self.id.clone()))
    }
}

/// A flattened node, ready for routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub type_name: String,
    pub path: Path,
    pub attributes: IndexMap<String, String>,
}

impl Record {
    /// Path type names followed by attribute keys, in document order
    pub fn columns(&self) -> Vec<String> {
        self.path
            .segments()
            .iter()
            .map(|segment| segment.type_name.clone())
            .chain(self.attributes.keys().cloned())
            .collect()
    }

    /// Path ids followed by attribute values, aligned with [`Record::columns`]
    pub fn values(&self) -> Vec<String> {
        self.path
            .segments()
            .iter()
            .map(|segment| segment.id.clone())
            .chain(self.attributes.values().cloned())
            .collect()
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        SchemaFingerprint::of(&self.columns())
    }
}

/// Downstream receiver of flattened records
pub trait RecordSink {
    fn accept(&mut self, record: Record) -> Result<()>;

    /// Called once after the last record of a document
    fn end_of_stream(&mut self) -> Result<()> {
        Ok(())
    }
}

impl RecordSink for Vec<Record> {
    fn accept(&mut self, record: Record) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Include / exclude lists applied to resolved type names at emission time
#[derive(Debug, Clone, Default)]
pub struct ElementFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
    exclude_all: bool,
}

impl ElementFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        let include: HashSet<String> = include.iter().map(|s| s.as_ref().to_string()).collect();
        let exclude: HashSet<String> = exclude.iter().map(|s| s.as_ref().to_string()).collect();
        let exclude_all = exclude.contains(WILDCARD) || !include.is_empty();
        Self {
            include,
            exclude,
            exclude_all,
        }
    }

    pub fn allows(&self, type_name: &str) -> bool {
        if self.exclude.contains(type_name) {
            return false;
        }
        !self.exclude_all || self.include.contains(type_name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlattenStats {
    pub nodes: u64,
    pub emitted: u64,
    pub filtered: u64,
}

/// What a finished document leaves behind
#[derive(Debug, Clone, Default)]
pub struct FlattenOutcome {
    pub metadata: FileMetadata,
    pub stats: FlattenStats,
}

#[derive(Debug)]
enum Frame {
    Node(Node),
    Marker { name: String, has_children: bool },
}

fn identity_key(type_name: &str, id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    type_name.hash(&mut hasher);
    id.hash(&mut hasher);
    hasher.finish()
}

/// Index of the innermost node frame below `limit`
fn nearest_node(stack: &[Frame], limit: usize) -> Option<usize> {
    stack[..limit]
        .iter()
        .rposition(|frame| matches!(frame, Frame::Node(_)))
}

fn node_mut(stack: &mut [Frame], index: usize) -> Option<&mut Node> {
    match stack.get_mut(index) {
        Some(Frame::Node(node)) => Some(node),
        _ => None,
    }
}

pub struct Flattener<'s, S: RecordSink + ?Sized> {
    sink: &'s mut S,
    filter: ElementFilter,
    stack: Vec<Frame>,
    in_attributes: bool,
    text: String,
    roots: HashSet<u64>,
    metadata: FileMetadata,
    stats: FlattenStats,
}

impl<'s, S: RecordSink + ?Sized> Flattener<'s, S> {
    pub fn new(sink: &'s mut S, filter: ElementFilter) -> Self {
        Self {
            sink,
            filter,
            stack: Vec::new(),
            in_attributes: false,
            text: String::new(),
            roots: HashSet::new(),
            metadata: FileMetadata::new(),
            stats: FlattenStats::default(),
        }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Emit whatever resolved node is still open and signal end of stream
    pub fn close(mut self) -> Result<FlattenOutcome> {
        while let Some(frame) = self.stack.pop() {
            if let Frame::Node(mut node) = frame {
                self.finish_node(&mut node)?;
            }
        }
        self.sink.end_of_stream()?;
        info!(
            "Flattened {} nodes: {} records emitted, {} filtered",
            self.stats.nodes, self.stats.emitted, self.stats.filtered
        );
        Ok(FlattenOutcome {
            metadata: self.metadata,
            stats: self.stats,
        })
    }

    fn trail(&self) -> Path {
        self.stack
            .iter()
            .filter_map(|frame| match frame {
                Frame::Node(node) => Some(PathSegment::new(node.type_name.clone(), node.id.clone())),
                Frame::Marker { .. } => None,
            })
            .collect::<Vec<_>>()
            .into()
    }

    /// Resolved type of the virtual container directly enclosing the top
    fn deferred_type(&self) -> Option<&str> {
        let index = nearest_node(&self.stack, self.stack.len())?;
        match &self.stack[index] {
            Frame::Node(node) if node.virtual_container && node.resolved => {
                Some(node.type_name.as_str())
            }
            _ => None,
        }
    }

    fn mark_parent(&mut self) {
        if let Some(Frame::Marker { has_children, .. }) = self.stack.last_mut() {
            *has_children = true;
        }
    }

    /// Register (type, id) under the node enclosing stack position `below`
    fn register_identity(&mut self, below: usize, type_name: &str, id: &str, path: &Path) -> Result<()> {
        let key = identity_key(type_name, id);
        let fresh = match nearest_node(&self.stack, below) {
            Some(index) => match node_mut(&mut self.stack, index) {
                Some(parent) => parent.children.insert(key),
                None => true,
            },
            None => self.roots.insert(key),
        };
        if fresh {
            Ok(())
        } else {
            Err(FlattenError::DuplicateNode {
                type_name: type_name.to_string(),
                path: path
                    .child(PathSegment::new(type_name, id))
                    .to_string(),
            })
        }
    }

    fn push_node(&mut self, type_name: &str, id: &str) -> Result<()> {
        let path = self.trail();
        let node = Node::new(type_name, id, path);
        if !node.virtual_container {
            self.register_identity(self.stack.len(), type_name, id, &node.path)?;
        }
        debug!("Open {} at {}", node.type_name, node.path);
        self.stats.nodes += 1;
        self.mark_parent();
        self.stack.push(Frame::Node(node));
        Ok(())
    }

    fn emit(&mut self, node: &mut Node) -> Result<()> {
        node.emitted = true;
        let record = Record {
            type_name: node.type_name.clone(),
            path: node.identity_path(),
            attributes: std::mem::take(&mut node.attributes),
        };
        if self.filter.allows(&record.type_name) {
            debug!("Emit {} at {}", record.type_name, record.path);
            self.stats.emitted += 1;
            self.sink.accept(record)
        } else {
            self.stats.filtered += 1;
            Ok(())
        }
    }

    fn finish_node(&mut self, node: &mut Node) -> Result<()> {
        if node.emitted {
            return Ok(());
        }
        if node.resolved {
            self.emit(node)
        } else {
            warn!(
                "Dropping {} {} at {}: vsDataType never seen",
                node.type_name, node.id, node.path
            );
            Ok(())
        }
    }

    fn finish_attribute_block(&mut self) -> Result<()> {
        self.in_attributes = false;
        self.text.clear();
        let index = nearest_node(&self.stack, self.stack.len())
            .ok_or_else(|| FlattenError::structural("attribute block outside of any container"))?;
        let Some(Frame::Node(mut node)) = self
            .stack
            .get_mut(index)
            .map(|frame| std::mem::replace(frame, Frame::Marker { name: String::new(), has_children: false }))
        else {
            return Err(FlattenError::structural("attribute block outside of any container"));
        };
        let result = if node.resolved { self.emit(&mut node) } else { Ok(()) };
        self.stack[index] = Frame::Node(node);
        result
    }

    fn resolve_virtual_container(&mut self) -> Result<()> {
        let resolved = std::mem::take(&mut self.text);
        let index = nearest_node(&self.stack, self.stack.len())
            .ok_or_else(|| FlattenError::structural("vsDataType outside of any container"))?;
        let (id, path) = match node_mut(&mut self.stack, index) {
            Some(node) if node.virtual_container && !node.resolved => {
                if resolved.is_empty() {
                    return Err(FlattenError::structural(format!(
                        "empty vsDataType in {} {} at {}",
                        node.type_name, node.id, node.path
                    )));
                }
                debug!("Resolved {} {} to {}", node.type_name, node.id, resolved);
                node.type_name = resolved.clone();
                node.resolved = true;
                (node.id.clone(), node.path.clone())
            }
            Some(node) => {
                return Err(FlattenError::structural(format!(
                    "vsDataType inside {} {} at {}, which is not an unresolved {}",
                    node.type_name, node.id, node.path, VS_DATA_CONTAINER
                )));
            }
            None => {
                return Err(FlattenError::structural("vsDataType outside of any container"));
            }
        };
        self.register_identity(index, &resolved, &id, &path)
    }

    fn close_virtual_container(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(Frame::Node(mut node)) if node.virtual_container => self.finish_node(&mut node),
            Some(frame) => Err(FlattenError::structural(format!(
                "</{}> closes {:?}",
                VS_DATA_CONTAINER, frame
            ))),
            None => Err(FlattenError::structural(format!(
                "</{}> with nothing open",
                VS_DATA_CONTAINER
            ))),
        }
    }

    fn pop_frame(&mut self, name: &str) -> Result<()> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| FlattenError::structural(format!("</{}> with nothing open", name)))?;

        match frame {
            Frame::Marker { name: marker, has_children } => {
                if marker != name {
                    return Err(FlattenError::structural(format!(
                        "</{}> closes <{}>",
                        name, marker
                    )));
                }
                let wrapper = has_children || self.deferred_type() == Some(marker.as_str());
                if self.in_attributes && !wrapper {
                    let value = std::mem::take(&mut self.text);
                    let index = nearest_node(&self.stack, self.stack.len()).ok_or_else(|| {
                        FlattenError::structural(format!("attribute {} outside of any container", marker))
                    })?;
                    if let Some(node) = node_mut(&mut self.stack, index) {
                        node.attributes.insert(marker, value);
                    }
                }
                self.text.clear();
                Ok(())
            }
            Frame::Node(mut node) => {
                if node.type_name != name {
                    return Err(FlattenError::structural(format!(
                        "</{}> closes {} {}",
                        name, node.type_name, node.id
                    )));
                }
                self.text.clear();
                self.finish_node(&mut node)
            }
        }
    }
}

impl<S: RecordSink + ?Sized> EventHandler for Flattener<'_, S> {
    fn on_start(&mut self, name: &str, attributes: &[(String, String)]) -> Result<()> {
        match name {
            ATTRIBUTES => {
                self.in_attributes = true;
                self.text.clear();
                Ok(())
            }
            VS_DATA_TYPE | VS_DATA_FORMAT_VERSION => {
                self.text.clear();
                Ok(())
            }
            _ if METADATA_TAGS.contains(&name) => {
                self.metadata.merge(attributes);
                Ok(())
            }
            _ => match attributes.iter().find(|(key, _)| key == ID_ATTRIBUTE) {
                Some((_, id)) => self.push_node(name, id.trim()),
                None => {
                    self.mark_parent();
                    self.stack.push(Frame::Marker {
                        name: name.to_string(),
                        has_children: false,
                    });
                    Ok(())
                }
            },
        }
    }

    fn on_text(&mut self, chunk: &str) -> Result<()> {
        self.text.push_str(chunk.trim());
        Ok(())
    }

    fn on_end(&mut self, name: &str) -> Result<()> {
        match name {
            ATTRIBUTES => self.finish_attribute_block(),
            VS_DATA_TYPE => self.resolve_virtual_container(),
            VS_DATA_FORMAT_VERSION => {
                self.text.clear();
                Ok(())
            }
            VS_DATA_CONTAINER => self.close_virtual_container(),
            _ if METADATA_TAGS.contains(&name) => Ok(()),
            _ => self.pop_frame(name),
        }
    }
}
