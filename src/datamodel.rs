//! The root container owning an element graph.
//!
//! The datamodel is an arena: every element lives in its insertion-ordered,
//! GUID-keyed registry, and element references inside attribute values are
//! GUIDs resolved through it. A detached [`Element`] belongs to nobody
//! until it is adopted; adoption is one-shot, and a reference naming an id
//! this registry does not hold is rejected as a foreign element.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use indexmap::IndexMap;
use log::{debug, trace};
use uuid::Uuid as UUID;

use crate::attribute::{Attribute, Value};
use crate::codec::{lookup_codec, CodecBinding, DeferredMode, Header};
use crate::element::{Element, ElementArray};
use crate::error::{DmError, Result};

/// Callback used to materialize stub elements on first access.
pub type StubResolver = Box<dyn Fn(UUID) -> Option<Element> + Send>;

/// How [`Datamodel::import_element`] treats the source subgraph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportMode {
    /// Create only a stub carrying the source id.
    Stub,
    /// Copy the element; its element references become stubs.
    Shallow,
    /// Copy the entire reachable subgraph, cycles included.
    Deep,
}

pub struct Datamodel {
    format: String,
    format_version: i32,
    root: Option<UUID>,
    registry: IndexMap<UUID, Element>,
    codec: Option<CodecBinding>,
    stub_resolver: Option<StubResolver>,
}

impl Datamodel {
    pub fn new(format: impl Into<String>, format_version: i32) -> Self {
        Self {
            format: format.into(),
            format_version,
            root: None,
            registry: IndexMap::new(),
            codec: None,
            stub_resolver: None,
        }
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn format_version(&self) -> i32 {
        self.format_version
    }

    pub fn set_format(&mut self, format: impl Into<String>, format_version: i32) {
        self.format = format.into();
        self.format_version = format_version;
    }

    pub fn root(&self) -> Option<UUID> {
        self.root
    }

    pub fn set_root(&mut self, id: UUID) -> Result<()> {
        if !self.registry.contains_key(&id) {
            return Err(DmError::ElementOwnership { element: id });
        }
        self.root = Some(id);
        Ok(())
    }

    /// The encoding this datamodel was decoded from, while a codec is bound.
    pub fn encoding(&self) -> Option<(&str, i32)> {
        self.codec.as_ref().map(|binding| (binding.encoding(), binding.version()))
    }

    // ---- registry ----------------------------------------------------

    /// Create a fresh element and adopt it.
    pub fn create_element(&mut self, class: impl Into<String>, name: impl Into<String>) -> UUID {
        let element = Element::new(class.into(), name.into());
        let id = element.id();
        self.registry.insert(id, element);
        id
    }

    /// Create an element under a caller-chosen id.
    pub fn create_element_with_id(&mut self, class: impl Into<String>, name: impl Into<String>, id: UUID) -> Result<UUID> {
        if self.registry.contains_key(&id) {
            return Err(DmError::ElementIdInUse(id));
        }
        self.registry.insert(id, Element::with_id(class.into(), name.into(), id));
        Ok(id)
    }

    /// Register a stub known only by id. Idempotent for existing stubs;
    /// colliding with a real element is an error.
    pub fn create_stub(&mut self, id: UUID) -> Result<UUID> {
        match self.registry.get(&id) {
            None => {
                self.registry.insert(id, Element::stub(id));
                Ok(id)
            }
            Some(existing) if existing.is_stub() => Ok(id),
            Some(_) => Err(DmError::ElementIdInUse(id)),
        }
    }

    /// Adopt a detached element. Every element reference it carries must
    /// already resolve inside this registry. Adopting over an existing
    /// stub back-fills the stub in place, keeping the id.
    pub fn adopt(&mut self, element: Element) -> Result<UUID> {
        let id = element.id();
        let replacing_stub = match self.registry.get(&id) {
            None => false,
            Some(existing) if existing.is_stub() && !element.is_stub() => true,
            Some(_) => return Err(DmError::ElementIdInUse(id)),
        };

        for referenced in element.referenced_elements() {
            if referenced != id && !self.registry.contains_key(&referenced) {
                return Err(DmError::ElementOwnership { element: referenced });
            }
        }

        if replacing_stub {
            trace!("back-filling stub element {id}");
        }
        self.registry.insert(id, element);
        Ok(id)
    }

    pub fn element(&self, id: UUID) -> Option<&Element> {
        self.registry.get(&id)
    }

    pub fn element_mut(&mut self, id: UUID) -> Option<&mut Element> {
        self.registry.get_mut(&id)
    }

    /// All owned elements in registration order.
    pub fn all_elements(&self) -> impl Iterator<Item = &Element> {
        self.registry.values()
    }

    pub fn element_count(&self) -> usize {
        self.registry.len()
    }

    pub fn contains(&self, id: UUID) -> bool {
        self.registry.contains_key(&id)
    }

    /// Remove an element. References to it elsewhere are left dangling;
    /// callers rewrite them if they care.
    pub fn remove_element(&mut self, id: UUID) -> Option<Element> {
        if self.root == Some(id) {
            self.root = None;
        }
        self.registry.shift_remove(&id)
    }

    // ---- attribute access --------------------------------------------

    /// Set an attribute on an owned element. Validation happens before any
    /// mutation: a foreign element reference fails the whole call.
    pub fn set(&mut self, element: UUID, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let mut value = value.into();
        if !self.registry.contains_key(&element) {
            return Err(DmError::ElementOwnership { element });
        }
        self.validate_value(&value)?;

        if let Value::ElementArray(array) = &mut value {
            array.attach(element)?;
        }

        self.registry
            .get_mut(&element)
            .expect("checked above")
            .set_raw(name.into(), Attribute::new(value));
        Ok(())
    }

    /// Adopt a detached element and link it under an attribute in one step.
    pub fn attach_element(&mut self, owner: UUID, name: impl Into<String>, child: Element) -> Result<UUID> {
        if !self.registry.contains_key(&owner) {
            return Err(DmError::ElementOwnership { element: owner });
        }
        let child_id = self.adopt(child)?;
        self.set(owner, name, Value::Element(Some(child_id)))?;
        Ok(child_id)
    }

    /// Append a reference to an element-array attribute, enforcing the
    /// same ownership rule as assignment.
    pub fn push_element(&mut self, owner: UUID, name: &str, reference: Option<UUID>) -> Result<()> {
        if let Some(id) = reference {
            if !self.registry.contains_key(&id) {
                return Err(DmError::ElementOwnership { element: id });
            }
        }
        let element = self
            .registry
            .get_mut(&owner)
            .ok_or(DmError::ElementOwnership { element: owner })?;
        let attribute = element
            .attribute_mut(name)
            .ok_or_else(|| DmError::invalid(format!("element {owner} has no attribute \"{name}\"")))?;
        match attribute.value_mut() {
            Some(Value::ElementArray(array)) => {
                array.push(reference);
                Ok(())
            }
            Some(other) => Err(DmError::type_mismatch("element_array", other.type_name())),
            None => Err(DmError::invalid("attribute is deferred and must be loaded before mutation")),
        }
    }

    fn validate_value(&self, value: &Value) -> Result<()> {
        match value {
            Value::Element(Some(id)) => {
                if !self.registry.contains_key(id) {
                    return Err(DmError::ElementOwnership { element: *id });
                }
            }
            Value::ElementArray(array) => {
                for id in array.iter().filter_map(|reference| *reference) {
                    if !self.registry.contains_key(&id) {
                        return Err(DmError::ElementOwnership { element: id });
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Read an attribute value: loads it through the bound codec if it is
    /// still deferred, then swaps any resolvable stub references for their
    /// resolved elements before returning.
    pub fn get(&mut self, element: UUID, name: &str) -> Result<Value> {
        let attribute = self
            .registry
            .get(&element)
            .ok_or(DmError::ElementOwnership { element })?
            .attribute(name)
            .ok_or_else(|| DmError::invalid(format!("element {element} has no attribute \"{name}\"")))?;

        if attribute.is_deferred() {
            self.materialize_attribute(element, name)?;
        }

        let value = self
            .registry
            .get(&element)
            .and_then(|el| el.attribute(name))
            .and_then(|attr| attr.value())
            .cloned()
            .expect("attribute was just materialized");

        match &value {
            Value::Element(Some(id)) => {
                self.resolve_stub(*id)?;
            }
            Value::ElementArray(array) => {
                for id in array.refs().iter().filter_map(|reference| *reference) {
                    self.resolve_stub(id)?;
                }
            }
            _ => {}
        }

        Ok(value)
    }

    /// Force-load one deferred attribute. Calling this on an attribute
    /// that is already materialized is a state error.
    pub fn deferred_load(&mut self, element: UUID, name: &str) -> Result<()> {
        let attribute = self
            .registry
            .get(&element)
            .ok_or(DmError::ElementOwnership { element })?
            .attribute(name)
            .ok_or_else(|| DmError::invalid(format!("element {element} has no attribute \"{name}\"")))?;
        if !attribute.is_deferred() {
            return Err(DmError::invalid(format!("attribute \"{name}\" is already materialized")));
        }
        self.materialize_attribute(element, name)
    }

    fn materialize_attribute(&mut self, element: UUID, name: &str) -> Result<()> {
        let binding = self
            .codec
            .as_ref()
            .ok_or_else(|| DmError::invalid("no codec is bound to this datamodel"))?;
        let offset = self
            .registry
            .get(&element)
            .and_then(|el| el.attribute(name))
            .map(|attr| attr.offset())
            .unwrap_or(0);

        trace!("deferred load of \"{name}\" on {element} at offset {offset}");
        // A failure leaves the attribute deferred so the load can be
        // retried once the codec binding is fixed.
        let value = binding.decode_deferred(offset).map_err(|source| DmError::DeferredLoad {
            codec: binding.identity(),
            attribute: name.to_string(),
            element,
            source,
        })?;

        self.validate_value(&value)?;
        self.registry
            .get_mut(&element)
            .and_then(|el| el.attribute_mut(name))
            .expect("attribute existed before the codec call")
            .materialize(value);
        Ok(())
    }

    /// True while any attribute still points back into the source stream.
    pub fn has_deferred(&self) -> bool {
        self.registry
            .values()
            .any(|element| element.attributes().any(|(_, attribute)| attribute.is_deferred()))
    }

    /// Eagerly load every deferred attribute, e.g. before handing the
    /// model to parallel readers.
    pub fn materialize_all(&mut self) -> Result<()> {
        let pending: Vec<(UUID, String)> = self
            .registry
            .iter()
            .flat_map(|(id, element)| {
                element
                    .attributes()
                    .filter(|(_, attribute)| attribute.is_deferred())
                    .map(|(name, _)| (*id, name.to_string()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (element, name) in pending {
            self.materialize_attribute(element, &name)?;
        }
        Ok(())
    }

    // ---- stubs -------------------------------------------------------

    pub fn set_stub_resolver(&mut self, resolver: StubResolver) {
        self.stub_resolver = Some(resolver);
    }

    pub fn clear_stub_resolver(&mut self) {
        self.stub_resolver = None;
    }

    /// Ask the resolver to materialize a stub in place. Returns whether
    /// the registry entry changed. Without a resolver, or when it answers
    /// `None`, the stub stays.
    pub fn resolve_stub(&mut self, id: UUID) -> Result<bool> {
        let is_stub = matches!(self.registry.get(&id), Some(element) if element.is_stub());
        if !is_stub {
            return Ok(false);
        }

        let resolved = match &self.stub_resolver {
            Some(resolver) => resolver(id),
            None => return Ok(false),
        };
        let Some(mut resolved) = resolved else {
            return Ok(false);
        };

        resolved.set_id(id);
        resolved.clear_stub_flag();
        for referenced in resolved.referenced_elements() {
            if referenced != id && !self.registry.contains_key(&referenced) {
                return Err(DmError::ElementOwnership { element: referenced });
            }
        }

        debug!("resolved stub element {id}");
        self.registry.insert(id, resolved);
        Ok(true)
    }

    // ---- import ------------------------------------------------------

    /// Copy an element (and per `mode` its subgraph) from another
    /// datamodel. With `preserve_ids` the source ids are kept and any
    /// collision fails before this registry is touched; otherwise fresh
    /// ids are assigned throughout.
    pub fn import_element(&mut self, source: &Datamodel, id: UUID, mode: ImportMode, preserve_ids: bool) -> Result<UUID> {
        let src = source
            .element(id)
            .ok_or_else(|| DmError::invalid(format!("source datamodel has no element {id}")))?;

        match mode {
            ImportMode::Stub => self.create_stub(id),
            ImportMode::Shallow => {
                let new_id = self.pick_import_id(id, preserve_ids)?;
                let mut copy = Element::with_id(src.class().to_string(), src.name().to_string(), new_id);
                let mut stubs = Vec::new();
                for (name, attribute) in src.attributes() {
                    let value = attribute
                        .value()
                        .ok_or_else(|| DmError::invalid("source attribute is deferred; materialize before importing"))?;
                    let mut value = Self::stub_out_references(value, &mut stubs);
                    if let Value::ElementArray(array) = &mut value {
                        array.attach(new_id)?;
                    }
                    copy.set_raw(name.to_string(), Attribute::new(value));
                }
                for stub in stubs {
                    if !self.registry.contains_key(&stub) {
                        self.create_stub(stub)?;
                    }
                }
                self.adopt(copy)
            }
            ImportMode::Deep => self.import_deep(source, id, preserve_ids),
        }
    }

    fn pick_import_id(&self, id: UUID, preserve_ids: bool) -> Result<UUID> {
        if !preserve_ids {
            return Ok(UUID::new_v4());
        }
        if self.registry.contains_key(&id) {
            return Err(DmError::ElementIdInUse(id));
        }
        Ok(id)
    }

    /// Rewrite element references to stand-alone stub references,
    /// collecting the ids that need stub entries.
    fn stub_out_references(value: &Value, stubs: &mut Vec<UUID>) -> Value {
        match value {
            Value::Element(Some(id)) => {
                stubs.push(*id);
                Value::Element(Some(*id))
            }
            Value::ElementArray(array) => {
                stubs.extend(array.refs().iter().filter_map(|reference| *reference));
                Value::ElementArray(ElementArray::from_refs(array.refs().iter().copied()))
            }
            other => other.clone(),
        }
    }

    fn import_deep(&mut self, source: &Datamodel, start: UUID, preserve_ids: bool) -> Result<UUID> {
        // Walk the reachable set and fix the id mapping up front so the
        // whole import fails before any mutation on collision.
        let mut mapping: IndexMap<UUID, UUID> = IndexMap::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if mapping.contains_key(&current) {
                continue;
            }
            let element = source
                .element(current)
                .ok_or_else(|| DmError::invalid(format!("source datamodel has no element {current}")))?;
            mapping.insert(current, self.pick_import_id(current, preserve_ids)?);
            stack.extend(element.referenced_elements());
        }

        for (&src_id, &new_id) in &mapping {
            let src = source.element(src_id).expect("walked above");
            if src.is_stub() {
                self.create_stub(new_id)?;
                continue;
            }

            let mut copy = Element::with_id(src.class().to_string(), src.name().to_string(), new_id);
            for (name, attribute) in src.attributes() {
                let value = attribute
                    .value()
                    .ok_or_else(|| DmError::invalid("source attribute is deferred; materialize before importing"))?;
                let mut value = Self::remap_references(value, &mapping);
                if let Value::ElementArray(array) = &mut value {
                    array.attach(new_id)?;
                }
                copy.set_raw(name.to_string(), Attribute::new(value));
            }
            // References may point at elements adopted later in this loop;
            // insert directly and rely on the mapping for validity.
            self.registry.insert(new_id, copy);
        }

        Ok(mapping[&start])
    }

    fn remap_references(value: &Value, mapping: &IndexMap<UUID, UUID>) -> Value {
        match value {
            Value::Element(Some(id)) => Value::Element(Some(mapping[id])),
            Value::ElementArray(array) => {
                ElementArray::from_refs(array.refs().iter().map(|reference| reference.map(|id| mapping[&id]))).into()
            }
            other => other.clone(),
        }
    }

    // ---- codec binding -----------------------------------------------

    /// Bind the codec that produced this datamodel. Decoders installing
    /// deferred offsets call this before returning.
    pub fn bind_codec(&mut self, binding: CodecBinding) {
        self.codec = Some(binding);
    }

    /// Install a deferred attribute pointing at `offset` in the bound
    /// codec's source stream.
    pub fn set_deferred(&mut self, element: UUID, name: impl Into<String>, offset: u64) -> Result<()> {
        let attribute = Attribute::deferred(offset)?;
        self.registry
            .get_mut(&element)
            .ok_or(DmError::ElementOwnership { element })?
            .set_raw(name.into(), attribute);
        Ok(())
    }

    /// Drop the decoder (and the stream it holds). Deferred attributes
    /// that were never loaded fail on access from here on.
    pub fn release_codec(&mut self) {
        if let Some(binding) = &self.codec {
            binding.release();
        }
    }

    // ---- load/save ---------------------------------------------------

    /// Sniff the header line, pick a registered codec and decode. Nothing
    /// past the header is consumed when no codec matches.
    pub fn load(source: &mut impl BufRead, mode: DeferredMode) -> Result<Datamodel> {
        let header = Header::read_from(source)?;
        let codec = lookup_codec(&header.encoding, header.encoding_version)?;
        debug!(
            "loading format \"{}\" {} via {} {}",
            header.format, header.format_version, header.encoding, header.encoding_version
        );
        codec.decode(&header, source, mode)
    }

    pub fn load_path(path: impl AsRef<Path>, mode: DeferredMode) -> Result<Datamodel> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::load(&mut reader, mode)
    }

    /// Encode under the named encoding and version. Deferred attributes
    /// are materialized first; the codec sees a fully loaded model.
    pub fn save(&mut self, sink: &mut dyn Write, encoding: &str, version: i32) -> Result<()> {
        let codec = lookup_codec(encoding, version)?;
        if self.root.is_none() {
            return Err(DmError::invalid("datamodel has no root element"));
        }
        if self.has_deferred() {
            self.materialize_all()?;
        }

        let header = Header::new(encoding, version, self.format.clone(), self.format_version);
        debug!("saving format \"{}\" {} as {encoding} {version}", self.format, self.format_version);
        codec.encode(self, &header, sink)
    }

    pub fn save_path(&mut self, path: impl AsRef<Path>, encoding: &str, version: i32) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.save(&mut writer, encoding, version)?;
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for Datamodel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datamodel")
            .field("format", &self.format)
            .field("format_version", &self.format_version)
            .field("root", &self.root)
            .field("elements", &self.registry.len())
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
