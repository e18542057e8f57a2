//! Binary XML documents as an editable node tree.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Strings are
//! resolved out of the string pool on parse and interned back into a copy of
//! the original pool on serialization, so a document that was not edited
//! serializes to the exact bytes it was parsed from.
use super::res::{
    Chunk, ResValue, ResValueType, ResXmlAttribute, ResXmlCdata, ResXmlEndElement,
    ResXmlNamespace, ResXmlNodeHeader, ResXmlStartElement, StringPool,
};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;

pub type NodeId = usize;

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
    pool: StringPool,
    resource_map: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Namespace declarations scoped to this node.
    pub namespaces: Vec<NamespaceDecl>,
    pub line: u32,
    pub comment: Option<String>,
    pub end_line: u32,
    pub end_comment: Option<String>,
    pub kind: NodeKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Element(Element),
    Text(Text),
}

#[derive(Clone, Debug, PartialEq)]
pub struct NamespaceDecl {
    pub prefix: Option<String>,
    pub uri: String,
    pub line: u32,
    pub comment: Option<String>,
    pub end_line: u32,
    pub end_comment: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Element {
    pub namespace: Option<String>,
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub id_index: u16,
    pub class_index: u16,
    pub style_index: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Text {
    pub text: String,
    pub typed: ResValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub namespace: Option<String>,
    pub name: String,
    pub resource_id: Option<u32>,
    pub value: AttrValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Literal(String),
    Typed {
        data_type: u8,
        data: u32,
        raw: Option<String>,
    },
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Literal(s) => Some(s),
            Self::Typed { .. } => None,
        }
    }

    /// Target of a resource reference.
    pub fn reference(&self) -> Option<u32> {
        match self {
            Self::Typed {
                data_type, data, ..
            } if *data_type == ResValueType::Reference as u8 => Some(*data),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Typed {
                data_type, data, ..
            } => match ResValueType::from_u8(*data_type)? {
                ResValueType::IntDec | ResValueType::IntHex => Some(*data as i32 as i64),
                _ => None,
            },
            Self::Literal(s) => s.trim().parse().ok(),
        }
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Literal(s) => write!(f, "{}", s),
            Self::Typed { raw: Some(raw), .. } => write!(f, "{}", raw),
            Self::Typed {
                data_type, data, ..
            } => match ResValueType::from_u8(*data_type) {
                Some(ResValueType::IntDec) => write!(f, "{}", *data as i32),
                Some(ResValueType::IntHex) => write!(f, "0x{:x}", data),
                Some(ResValueType::IntBoolean) => write!(f, "{}", *data != 0),
                Some(ResValueType::Reference) => write!(f, "@0x{:08x}", data),
                Some(ResValueType::Attribute) => write!(f, "?0x{:08x}", data),
                Some(ResValueType::Float) => write!(f, "{}", f32::from_bits(*data)),
                _ => write!(f, "0x{:x}", data),
            },
        }
    }
}

impl Element {
    /// Looks up an attribute by local name. `namespace` of `None` matches
    /// only attributes without a namespace.
    pub fn attribute(&self, namespace: Option<&str>, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name && attr.namespace.as_deref() == namespace)
    }

    pub fn attribute_mut(&mut self, namespace: Option<&str>, name: &str) -> Option<&mut Attribute> {
        self.attributes
            .iter_mut()
            .find(|attr| attr.name == name && attr.namespace.as_deref() == namespace)
    }
}

impl Document {
    pub fn new(utf8: bool) -> Self {
        let flags = if utf8 {
            super::res::ResStringPoolHeader::UTF8_FLAG
        } else {
            0
        };
        Self {
            nodes: vec![],
            roots: vec![],
            pool: StringPool {
                flags,
                ..Default::default()
            },
            resource_map: vec![],
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let chunk = Chunk::parse(&mut Cursor::new(bytes)).context("invalid binary xml")?;
        let Chunk::Xml(chunks) = chunk else {
            anyhow::bail!("not a binary xml document");
        };
        let mut doc = Self::new(false);
        let mut open: Vec<NodeId> = vec![];
        let mut pending_namespaces: Vec<NamespaceDecl> = vec![];
        // (owner, index into its namespaces) in declaration order
        let mut open_namespaces: Vec<(NodeId, usize)> = vec![];
        let mut unclaimed_namespaces = 0;

        for chunk in chunks {
            match chunk {
                Chunk::StringPool(pool) => doc.pool = pool,
                Chunk::XmlResourceMap(map) => doc.resource_map = map,
                Chunk::XmlStartNamespace(header, ns) => {
                    pending_namespaces.push(NamespaceDecl {
                        prefix: doc.optional_string(ns.prefix)?,
                        uri: doc.string(ns.uri)?,
                        line: header.line_number,
                        comment: doc.optional_string(header.comment)?,
                        end_line: header.line_number,
                        end_comment: None,
                    });
                }
                Chunk::XmlEndNamespace(header, _) => {
                    if let Some((owner, index)) = open_namespaces.pop() {
                        let end_comment = doc.optional_string(header.comment)?;
                        let decl = &mut doc.nodes[owner].namespaces[index];
                        decl.end_line = header.line_number;
                        decl.end_comment = end_comment;
                    } else if pending_namespaces.pop().is_some() {
                        unclaimed_namespaces += 1;
                    }
                }
                Chunk::XmlStartElement(header, start, attributes) => {
                    let mut element = Element {
                        namespace: doc.optional_string(start.namespace)?,
                        name: doc.string(start.name)?,
                        attributes: Vec::with_capacity(attributes.len()),
                        id_index: start.id_index,
                        class_index: start.class_index,
                        style_index: start.style_index,
                    };
                    for attr in attributes {
                        element.attributes.push(doc.attribute(&attr)?);
                    }
                    let id = doc.push_node(
                        open.last().copied(),
                        header.line_number,
                        doc.optional_string(header.comment)?,
                        NodeKind::Element(element),
                    );
                    for (index, decl) in pending_namespaces.drain(..).enumerate() {
                        doc.nodes[id].namespaces.push(decl);
                        open_namespaces.push((id, index));
                    }
                    open.push(id);
                }
                Chunk::XmlEndElement(header, _) => {
                    let id = open.pop().context("unbalanced end element")?;
                    doc.nodes[id].end_line = header.line_number;
                    doc.nodes[id].end_comment = doc.optional_string(header.comment)?;
                }
                Chunk::XmlCdata(header, cdata) => {
                    let text = Text {
                        text: doc.string(cdata.data)?,
                        typed: cdata.typed_data,
                    };
                    doc.push_node(
                        open.last().copied(),
                        header.line_number,
                        doc.optional_string(header.comment)?,
                        NodeKind::Text(text),
                    );
                }
                other => log::debug!("skipping chunk {:?} in binary xml", other),
            }
        }
        anyhow::ensure!(open.is_empty(), "unterminated element");
        if unclaimed_namespaces > 0 || !pending_namespaces.is_empty() {
            log::debug!("dropped namespace declarations without an element");
        }
        anyhow::ensure!(
            doc.resource_map.len() <= doc.pool.strings.len(),
            "resource map longer than the string pool"
        );
        Ok(doc)
    }

    fn push_node(
        &mut self,
        parent: Option<NodeId>,
        line: u32,
        comment: Option<String>,
        kind: NodeKind,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent,
            children: vec![],
            namespaces: vec![],
            line,
            comment,
            end_line: line,
            end_comment: None,
            kind,
        });
        match parent {
            Some(parent) => self.nodes[parent].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    fn string(&self, index: i32) -> Result<String> {
        self.pool
            .get(index)
            .map(str::to_string)
            .with_context(|| format!("string index {} out of range", index))
    }

    fn optional_string(&self, index: i32) -> Result<Option<String>> {
        if index < 0 {
            return Ok(None);
        }
        self.string(index).map(Some)
    }

    fn attribute(&self, attr: &ResXmlAttribute) -> Result<Attribute> {
        let resource_id = if attr.name >= 0 {
            self.resource_map.get(attr.name as usize).copied()
        } else {
            None
        };
        let value = if attr.typed_value.data_type == ResValueType::String as u8 {
            AttrValue::Literal(self.string(attr.typed_value.data as i32)?)
        } else {
            AttrValue::Typed {
                data_type: attr.typed_value.data_type,
                data: attr.typed_value.data,
                raw: self.optional_string(attr.raw_value)?,
            }
        };
        Ok(Attribute {
            namespace: self.optional_string(attr.namespace)?,
            name: self.string(attr.name)?,
            resource_id,
            value,
        })
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes.get(id)?.kind {
            NodeKind::Element(element) => Some(element),
            NodeKind::Text(_) => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes.get_mut(id)?.kind {
            NodeKind::Element(element) => Some(element),
            NodeKind::Text(_) => None,
        }
    }

    /// Top-level elements with the given name.
    pub fn find_roots<'a>(&'a self, name: &'a str) -> impl Iterator<Item = NodeId> + 'a {
        self.roots
            .iter()
            .copied()
            .filter(move |id| self.element(*id).map(|e| e.name == name).unwrap_or(false))
    }

    pub fn children_named<'a>(
        &'a self,
        parent: NodeId,
        name: &'a str,
    ) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .filter(move |id| self.element(*id).map(|e| e.name == name).unwrap_or(false))
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children_named(parent, name).next()
    }

    pub fn append_element(
        &mut self,
        parent: Option<NodeId>,
        namespace: Option<&str>,
        name: &str,
    ) -> NodeId {
        let line = self.nodes.len() as u32 + 1;
        let element = Element {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            ..Default::default()
        };
        self.push_node(parent, line, None, NodeKind::Element(element))
    }

    pub fn declare_namespace(&mut self, node: NodeId, prefix: &str, uri: &str) {
        let line = self.nodes[node].line;
        self.nodes[node].namespaces.push(NamespaceDecl {
            prefix: Some(prefix.to_string()),
            uri: uri.to_string(),
            line,
            comment: None,
            end_line: line,
            end_comment: None,
        });
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut interner = Interner::new(&self.pool.strings, &self.resource_map);
        for node in &self.nodes {
            if let NodeKind::Element(element) = &node.kind {
                for attr in &element.attributes {
                    if let Some(id) = attr.resource_id {
                        interner.require_mapped(&attr.name, id);
                    }
                }
            }
        }
        for node in &self.nodes {
            self.require_node_strings(&mut interner, node);
        }
        let (strings, resource_map) = interner.finish();

        let index = Index::new(&strings, &resource_map);
        let mut chunks = vec![];
        for root in &self.roots {
            self.write_node(&index, *root, &mut chunks)?;
        }
        drop(index);

        let mut all = Vec::with_capacity(chunks.len() + 2);
        all.push(Chunk::StringPool(StringPool {
            strings,
            styles: self.pool.styles.clone(),
            flags: self.pool.flags,
        }));
        if !resource_map.is_empty() {
            all.push(Chunk::XmlResourceMap(resource_map));
        }
        all.extend(chunks);

        let mut out = Cursor::new(vec![]);
        Chunk::Xml(all).write(&mut out)?;
        Ok(out.into_inner())
    }

    fn require_node_strings(&self, interner: &mut Interner, node: &Node) {
        for decl in &node.namespaces {
            if let Some(prefix) = &decl.prefix {
                interner.require(prefix);
            }
            interner.require(&decl.uri);
            for comment in [&decl.comment, &decl.end_comment].into_iter().flatten() {
                interner.require(comment);
            }
        }
        for comment in [&node.comment, &node.end_comment].into_iter().flatten() {
            interner.require(comment);
        }
        match &node.kind {
            NodeKind::Element(element) => {
                if let Some(ns) = &element.namespace {
                    interner.require(ns);
                }
                interner.require(&element.name);
                for attr in &element.attributes {
                    if let Some(ns) = &attr.namespace {
                        interner.require(ns);
                    }
                    if attr.resource_id.is_none() {
                        interner.require_unmapped(&attr.name);
                    }
                    match &attr.value {
                        AttrValue::Literal(s) => interner.require(s),
                        AttrValue::Typed { raw: Some(raw), .. } => interner.require(raw),
                        AttrValue::Typed { raw: None, .. } => {}
                    }
                }
            }
            NodeKind::Text(text) => interner.require(&text.text),
        }
    }

    fn write_node(&self, index: &Index, id: NodeId, out: &mut Vec<Chunk>) -> Result<()> {
        let node = &self.nodes[id];
        let header = ResXmlNodeHeader {
            line_number: node.line,
            comment: index.optional(node.comment.as_deref())?,
        };
        match &node.kind {
            NodeKind::Text(text) => {
                out.push(Chunk::XmlCdata(
                    header,
                    ResXmlCdata {
                        data: index.any(&text.text)?,
                        typed_data: text.typed,
                    },
                ));
            }
            NodeKind::Element(element) => {
                let mut namespaces = Vec::with_capacity(node.namespaces.len());
                for decl in &node.namespaces {
                    let ns = ResXmlNamespace {
                        prefix: index.optional(decl.prefix.as_deref())?,
                        uri: index.any(&decl.uri)?,
                    };
                    out.push(Chunk::XmlStartNamespace(
                        ResXmlNodeHeader {
                            line_number: decl.line,
                            comment: index.optional(decl.comment.as_deref())?,
                        },
                        ns,
                    ));
                    namespaces.push(ns);
                }

                let mut attributes = Vec::with_capacity(element.attributes.len());
                for attr in &element.attributes {
                    attributes.push(index.attribute(attr)?);
                }
                let namespace = index.optional(element.namespace.as_deref())?;
                let name = index.any(&element.name)?;
                out.push(Chunk::XmlStartElement(
                    header,
                    ResXmlStartElement {
                        namespace,
                        name,
                        attribute_count: attributes.len() as u16,
                        id_index: element.id_index,
                        class_index: element.class_index,
                        style_index: element.style_index,
                        ..Default::default()
                    },
                    attributes,
                ));

                for child in &node.children {
                    self.write_node(index, *child, out)?;
                }

                out.push(Chunk::XmlEndElement(
                    ResXmlNodeHeader {
                        line_number: node.end_line,
                        comment: index.optional(node.end_comment.as_deref())?,
                    },
                    ResXmlEndElement { namespace, name },
                ));
                for (decl, ns) in node.namespaces.iter().zip(namespaces).rev() {
                    out.push(Chunk::XmlEndNamespace(
                        ResXmlNodeHeader {
                            line_number: decl.end_line,
                            comment: index.optional(decl.end_comment.as_deref())?,
                        },
                        ns,
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Grows a copy of the original pool with whatever the tree references.
/// Resource-bound attribute names go to the end of the mapped prefix, all
/// other new strings go to the end of the pool.
struct Interner {
    strings: Vec<String>,
    resource_map: Vec<u32>,
    mapped: HashSet<(String, u32)>,
    unmapped: HashSet<String>,
    all: HashSet<String>,
}

impl Interner {
    fn new(strings: &[String], resource_map: &[u32]) -> Self {
        let mapped = strings
            .iter()
            .zip(resource_map)
            .map(|(s, id)| (s.clone(), *id))
            .collect();
        let unmapped = strings[resource_map.len()..].iter().cloned().collect();
        let all = strings.iter().cloned().collect();
        Self {
            strings: strings.to_vec(),
            resource_map: resource_map.to_vec(),
            mapped,
            unmapped,
            all,
        }
    }

    fn require_mapped(&mut self, name: &str, id: u32) {
        if self.mapped.insert((name.to_string(), id)) {
            let at = self.resource_map.len();
            self.strings.insert(at, name.to_string());
            self.resource_map.push(id);
            self.all.insert(name.to_string());
        }
    }

    fn require_unmapped(&mut self, s: &str) {
        if !self.unmapped.contains(s) {
            self.push(s);
        }
    }

    fn require(&mut self, s: &str) {
        if !self.all.contains(s) {
            self.push(s);
        }
    }

    fn push(&mut self, s: &str) {
        self.strings.push(s.to_string());
        self.unmapped.insert(s.to_string());
        self.all.insert(s.to_string());
    }

    fn finish(self) -> (Vec<String>, Vec<u32>) {
        (self.strings, self.resource_map)
    }
}

/// First-occurrence lookups over a finished pool.
struct Index<'a> {
    strings: &'a [String],
    resource_map: &'a [u32],
    mapped_len: usize,
    unmapped: HashMap<&'a str, usize>,
    mapped: HashMap<&'a str, usize>,
}

impl<'a> Index<'a> {
    fn new(strings: &'a [String], resource_map: &'a [u32]) -> Self {
        let mapped_len = resource_map.len();
        let mut unmapped = HashMap::new();
        let mut mapped = HashMap::new();
        for (i, s) in strings.iter().enumerate() {
            let region = if i < mapped_len {
                &mut mapped
            } else {
                &mut unmapped
            };
            region.entry(s.as_str()).or_insert(i);
        }
        Self {
            strings,
            resource_map,
            mapped_len,
            unmapped,
            mapped,
        }
    }

    fn any(&self, s: &str) -> Result<i32> {
        self.unmapped
            .get(s)
            .or_else(|| self.mapped.get(s))
            .map(|i| *i as i32)
            .with_context(|| format!("string {:?} missing from pool", s))
    }

    fn optional(&self, s: Option<&str>) -> Result<i32> {
        s.map(|s| self.any(s)).unwrap_or(Ok(-1))
    }

    fn attribute_name(&self, name: &str, resource_id: Option<u32>) -> Result<i32> {
        match resource_id {
            Some(id) => (0..self.mapped_len)
                .find(|i| self.strings[*i] == name && self.resource_map[*i] == id)
                .map(|i| i as i32)
                .with_context(|| format!("attribute {} not mapped to 0x{:08x}", name, id)),
            None => self
                .unmapped
                .get(name)
                .map(|i| *i as i32)
                .with_context(|| format!("attribute {} missing from pool", name)),
        }
    }

    fn attribute(&self, attr: &Attribute) -> Result<ResXmlAttribute> {
        let (raw_value, typed_value) = match &attr.value {
            AttrValue::Literal(s) => {
                let i = self.any(s)?;
                (i, ResValue::new(ResValueType::String, i as u32))
            }
            AttrValue::Typed {
                data_type,
                data,
                raw,
            } => (
                self.optional(raw.as_deref())?,
                ResValue {
                    size: 8,
                    res0: 0,
                    data_type: *data_type,
                    data: *data,
                },
            ),
        };
        Ok(ResXmlAttribute {
            namespace: self.optional(attr.namespace.as_deref())?,
            name: self.attribute_name(&attr.name, attr.resource_id)?,
            raw_value,
            typed_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::testutil::{sample_manifest, ANDROID_NS};

    const UTF16_MANIFEST: &[u8] = include_bytes!("../../testdata/manifest_utf16.axml");
    const UTF8_MANIFEST: &[u8] = include_bytes!("../../testdata/manifest_utf8.axml");

    #[test]
    fn should_reserialize_unedited_documents_byte_identically() {
        let bytes = sample_manifest("com.old.app", Some("Old App"));
        let doc = Document::parse(&bytes).unwrap();
        assert_eq!(doc.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn should_reserialize_tool_built_manifests_byte_identically() {
        for (bytes, utf8) in [(UTF16_MANIFEST, false), (UTF8_MANIFEST, true)] {
            let doc = Document::parse(bytes).unwrap();
            assert_eq!(doc.pool.is_utf8(), utf8);
            assert_eq!(doc.to_bytes().unwrap(), bytes, "utf8: {}", utf8);
        }
    }

    #[test]
    fn should_read_tool_built_manifests() {
        let doc = Document::parse(UTF16_MANIFEST).unwrap();
        let manifest = doc.find_roots("manifest").next().unwrap();
        assert_eq!(doc.node(manifest).line, 2);
        let element = doc.element(manifest).unwrap();
        assert_eq!(
            element.attribute(None, "package").unwrap().value.as_str(),
            Some("com.example.notes")
        );
        let version = element.attribute(Some(ANDROID_NS), "versionCode").unwrap();
        assert_eq!(version.resource_id, Some(0x0101_021b));
        assert_eq!(version.value.as_int(), Some(7));
        assert!(matches!(&version.value, AttrValue::Typed { raw: Some(raw), .. } if raw == "7"));

        let application = doc.find_child(manifest, "application").unwrap();
        let label = doc
            .element(application)
            .unwrap()
            .attribute(Some(ANDROID_NS), "label")
            .unwrap();
        assert_eq!(label.resource_id, Some(0x0101_0001));
        assert_eq!(label.value.reference(), Some(0x7f0b_0000));

        let activity = doc.find_child(application, "activity").unwrap();
        let filter = doc.find_child(activity, "intent-filter").unwrap();
        assert_eq!(doc.children_named(filter, "action").count(), 1);
        assert_eq!(doc.node(filter).end_line, 27);
    }

    #[test]
    fn should_resolve_attributes_with_resource_ids() {
        let bytes = sample_manifest("com.old.app", Some("Old App"));
        let doc = Document::parse(&bytes).unwrap();
        let manifest = doc.find_roots("manifest").next().unwrap();
        let element = doc.element(manifest).unwrap();
        assert_eq!(
            element.attribute(None, "package").unwrap().value.as_str(),
            Some("com.old.app")
        );
        let version = element.attribute(Some(ANDROID_NS), "versionCode").unwrap();
        assert_eq!(version.resource_id, Some(0x0101_021b));
        assert_eq!(version.value.as_int(), Some(7));
        assert_eq!(doc.node(manifest).namespaces[0].prefix.as_deref(), Some("android"));
    }

    #[test]
    fn should_place_new_mapped_names_in_the_mapped_prefix() {
        let bytes = sample_manifest("com.old.app", None);
        let mut doc = Document::parse(&bytes).unwrap();
        let manifest = doc.find_roots("manifest").next().unwrap();
        let application = doc.find_child(manifest, "application").unwrap();
        doc.element_mut(application).unwrap().attributes.push(Attribute {
            namespace: Some(ANDROID_NS.to_string()),
            name: "roundIcon".to_string(),
            resource_id: Some(0x0101_052c),
            value: AttrValue::Typed {
                data_type: ResValueType::Reference as u8,
                data: 0x7f02_0001,
                raw: None,
            },
        });

        let reparsed = Document::parse(&doc.to_bytes().unwrap()).unwrap();
        let application = reparsed
            .find_child(reparsed.find_roots("manifest").next().unwrap(), "application")
            .unwrap();
        let attr = reparsed
            .element(application)
            .unwrap()
            .attribute(Some(ANDROID_NS), "roundIcon")
            .unwrap();
        assert_eq!(attr.resource_id, Some(0x0101_052c));
        assert_eq!(attr.value.reference(), Some(0x7f02_0001));
        // untouched attributes keep their bindings
        let manifest = reparsed.element(reparsed.roots()[0]).unwrap();
        assert_eq!(
            manifest
                .attribute(Some(ANDROID_NS), "versionCode")
                .unwrap()
                .resource_id,
            Some(0x0101_021b)
        );
    }

    #[test]
    fn should_keep_text_nodes() {
        let mut doc = Document::new(true);
        let root = doc.append_element(None, None, "resources");
        let id = doc.nodes.len();
        doc.nodes.push(Node {
            parent: Some(root),
            children: vec![],
            namespaces: vec![],
            line: 2,
            comment: Some("note".into()),
            end_line: 2,
            end_comment: None,
            kind: NodeKind::Text(Text {
                text: "hello".into(),
                typed: ResValue::new(ResValueType::Null, 0),
            }),
        });
        doc.nodes[root].children.push(id);

        let bytes = doc.to_bytes().unwrap();
        let reparsed = Document::parse(&bytes).unwrap();
        assert_eq!(reparsed, Document::parse(&reparsed.to_bytes().unwrap()).unwrap());
        let text = reparsed.node(reparsed.node(0).children[0]);
        assert_eq!(text.comment.as_deref(), Some("note"));
        assert!(matches!(&text.kind, NodeKind::Text(t) if t.text == "hello"));
    }

    #[test]
    fn should_reject_non_xml_input() {
        assert!(Document::parse(b"PK\x03\x04 definitely not xml").is_err());
    }
}
