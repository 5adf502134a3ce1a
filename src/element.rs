//! Elements and element arrays.

use indexmap::IndexMap;
use uuid::Uuid as UUID;

use crate::attribute::{Attribute, AttributeValue, ElementRef, Value};
use crate::error::{DmError, Result};

/// A node in the datamodel graph: a GUID identity, a display name, a class
/// tag and an insertion-ordered attribute map. Elements are built detached
/// and adopted into a datamodel's registry, which then owns them.
#[derive(Clone, Debug)]
pub struct Element {
    id: UUID,
    name: String,
    class: String,
    attributes: IndexMap<String, Attribute>,
    stub: bool,
}

impl Element {
    /// Create a detached element with a fresh v4 id.
    pub fn new<S: Into<String>>(class: S, name: S) -> Self {
        Self::with_id(class, name, UUID::new_v4())
    }

    /// Create a detached element under a caller-chosen id.
    pub fn with_id<S: Into<String>>(class: S, name: S, id: UUID) -> Self {
        Self {
            id,
            name: name.into(),
            class: class.into(),
            attributes: IndexMap::new(),
            stub: false,
        }
    }

    /// An element known only by its id; attributes arrive later through a
    /// stub resolver or a back-filling reader.
    pub(crate) fn stub(id: UUID) -> Self {
        Self {
            id,
            name: "unnamed".to_string(),
            class: "DmElement".to_string(),
            attributes: IndexMap::new(),
            stub: true,
        }
    }

    /// The element id. Stable for the element's lifetime.
    pub fn id(&self) -> UUID {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: UUID) {
        self.id = id;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = name.into();
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn set_class<S: Into<String>>(&mut self, class: S) {
        self.class = class.into();
    }

    pub fn is_stub(&self) -> bool {
        self.stub
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub(crate) fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.get_mut(name)
    }

    /// Attributes in insertion order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.attributes.iter().map(|(name, attribute)| (name.as_str(), attribute))
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Typed accessor over a materialized attribute.
    pub fn get<T: AttributeValue>(&self, name: &str) -> Result<&T> {
        self.attribute(name)
            .ok_or_else(|| DmError::invalid(format!("element {} has no attribute \"{name}\"", self.id)))?
            .get::<T>()
    }

    /// Typed accessor over a materialized array attribute.
    pub fn get_array<T>(&self, name: &str) -> Result<&[T]>
    where
        Vec<T>: AttributeValue,
    {
        self.get::<Vec<T>>(name).map(Vec::as_slice)
    }

    /// Set an attribute, creating it if absent, keeping its slot in the
    /// enumeration order if present. Any deferred state is discarded.
    ///
    /// This is the unchecked write path for building detached elements;
    /// element references are validated when the element is adopted, or
    /// when writing through a datamodel.
    pub fn set<S: Into<String>, V: Into<Value>>(&mut self, name: S, value: V) {
        self.set_raw(name.into(), Attribute::new(value.into()));
    }

    pub(crate) fn set_raw(&mut self, name: String, attribute: Attribute) {
        // IndexMap keeps the original slot on overwrite, which is exactly
        // the enumeration-order contract.
        self.attributes.insert(name, attribute);
    }

    /// Remove an attribute, preserving the order of the rest.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        self.attributes.shift_remove(name)
    }

    /// Every element id referenced by this element's attributes.
    pub fn referenced_elements(&self) -> Vec<UUID> {
        let mut ids = Vec::new();
        for (_, attribute) in self.attributes() {
            match attribute.value() {
                Some(Value::Element(Some(id))) => ids.push(*id),
                Some(Value::ElementArray(array)) => ids.extend(array.iter().filter_map(|reference| *reference)),
                _ => {}
            }
        }
        ids
    }

    pub(crate) fn clear_stub_flag(&mut self) {
        self.stub = false;
    }
}

/// An ordered sequence of element references. The array remembers the
/// element it is attached to; attaching is one-shot, so a value lifted out
/// of one attribute cannot be re-parented under another element.
#[derive(Clone, Debug, Default)]
pub struct ElementArray {
    items: Vec<ElementRef>,
    owner: Option<UUID>,
}

impl ElementArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_refs<I: IntoIterator<Item = ElementRef>>(refs: I) -> Self {
        Self {
            items: refs.into_iter().collect(),
            owner: None,
        }
    }

    /// The element this array is attached to, if any.
    pub fn owner(&self) -> Option<UUID> {
        self.owner
    }

    pub(crate) fn attach(&mut self, owner: UUID) -> Result<()> {
        match self.owner {
            None => {
                self.owner = Some(owner);
                Ok(())
            }
            Some(current) if current == owner => Ok(()),
            Some(_) => Err(DmError::invalid("element array is already attached to another element")),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ElementRef> {
        self.items.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElementRef> {
        self.items.iter()
    }

    pub fn push(&mut self, reference: ElementRef) {
        self.items.push(reference);
    }

    pub fn insert(&mut self, index: usize, reference: ElementRef) {
        self.items.insert(index, reference);
    }

    pub fn set(&mut self, index: usize, reference: ElementRef) -> Result<()> {
        let slot = self
            .items
            .get_mut(index)
            .ok_or_else(|| DmError::invalid(format!("element array index {index} out of bounds")))?;
        *slot = reference;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn refs(&self) -> &[ElementRef] {
        &self.items
    }
}

impl FromIterator<ElementRef> for ElementArray {
    fn from_iter<I: IntoIterator<Item = ElementRef>>(refs: I) -> Self {
        Self::from_refs(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_enumerate_in_insertion_order() {
        let mut element = Element::new("DmeModel", "test");
        element.set("zeta", 1);
        element.set("alpha", 2);
        element.set("mid", 3);
        element.set("zeta", 10);

        let names: Vec<&str> = element.attributes().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(*element.get::<i32>("zeta").unwrap(), 10);
    }

    #[test]
    fn typed_accessors_enforce_kinds() {
        let mut element = Element::new("DmeModel", "test");
        element.set("mass", 1.5f32);
        assert_eq!(*element.get::<f32>("mass").unwrap(), 1.5);
        assert!(matches!(element.get::<i32>("mass"), Err(DmError::AttributeType { .. })));
        assert!(matches!(element.get::<f32>("missing"), Err(DmError::InvalidOperation(_))));
    }

    #[test]
    fn array_accessor_returns_slices() {
        let mut element = Element::new("DmeModel", "test");
        element.set("weights", vec![1.0f32, 2.0, 3.0]);
        assert_eq!(element.get_array::<f32>("weights").unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn element_array_attach_is_one_shot() {
        let first = UUID::new_v4();
        let second = UUID::new_v4();

        let mut array = ElementArray::new();
        array.push(None);
        array.attach(first).unwrap();
        array.attach(first).unwrap();
        assert!(array.attach(second).is_err());
    }

    #[test]
    fn referenced_elements_walks_scalars_and_arrays() {
        let a = UUID::new_v4();
        let b = UUID::new_v4();

        let mut element = Element::new("DmeModel", "test");
        element.set("child", Some(a));
        element.set("children", ElementArray::from_refs([Some(b), None]));
        element.set("other", 4);

        let referenced = element.referenced_elements();
        assert_eq!(referenced, vec![a, b]);
    }
}
