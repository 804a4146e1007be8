//! Representations of the entity producing telemetry.
//!
//! A [`Resource`] is an immutable set of attributes describing the process
//! emitting spans and metrics, e.g. its service name. It is captured when
//! the pipeline is built and stamped onto every export batch.

use crate::{Key, KeyValue, Value};
use std::borrow::Cow;
use std::collections::{hash_map, HashMap};

/// An immutable representation of the entity producing telemetry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resource {
    attrs: HashMap<Key, Value>,
}

impl Resource {
    /// Creates a [`ResourceBuilder`] for constructing a `Resource`.
    pub fn builder() -> ResourceBuilder {
        ResourceBuilder {
            resource: Resource::empty(),
        }
    }

    /// Creates an empty resource.
    pub fn empty() -> Self {
        Resource::default()
    }

    /// Creates a resource from the given attributes. Later entries win when
    /// keys collide.
    pub fn new(attrs: impl IntoIterator<Item = KeyValue>) -> Self {
        Resource {
            attrs: attrs
                .into_iter()
                .map(|kv| (kv.key, kv.value))
                .collect(),
        }
    }

    /// Returns the number of attributes for this resource.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Returns `true` if the resource contains no attributes.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Returns an iterator over the resource's attributes.
    pub fn iter(&self) -> Iter<'_> {
        Iter(self.attrs.iter())
    }

    /// Retrieves the value for the given key, if it exists.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.attrs.get(key)
    }
}

/// An iterator over a [`Resource`]'s attributes.
#[derive(Debug)]
pub struct Iter<'a>(hash_map::Iter<'a, Key, Value>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a Key, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl<'a> IntoIterator for &'a Resource {
    type Item = (&'a Key, &'a Value);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A builder for [`Resource`].
#[derive(Debug)]
pub struct ResourceBuilder {
    resource: Resource,
}

impl ResourceBuilder {
    /// Add a `service.name` attribute.
    pub fn with_service_name(self, name: impl Into<Cow<'static, str>>) -> Self {
        self.with_attribute(KeyValue::new("service.name", name.into()))
    }

    /// Add a single attribute, replacing any existing value for its key.
    pub fn with_attribute(mut self, kv: KeyValue) -> Self {
        self.resource.attrs.insert(kv.key, kv.value);
        self
    }

    /// Add multiple attributes, replacing existing values for their keys.
    pub fn with_attributes(mut self, attrs: impl IntoIterator<Item = KeyValue>) -> Self {
        self.resource
            .attrs
            .extend(attrs.into_iter().map(|kv| (kv.key, kv.value)));
        self
    }

    /// Build the [`Resource`].
    pub fn build(self) -> Resource {
        self.resource
    }
}
