//! RPC method sets
//!
//! A node's methods travel on the wire as a JSON object of `method -> true`
//! but are held in memory as an ordered set, so ownership recomputation is a
//! plain set union.

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::btree_set::{self, BTreeSet};
use std::fmt;

/// Set of fully-qualified RPC method names (`/pkg.Service/Method`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodSet(BTreeSet<String>);

impl MethodSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, method: S) -> bool {
        self.0.insert(method.into())
    }

    pub fn contains(&self, method: &str) -> bool {
        self.0.contains(method)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, String> {
        self.0.iter()
    }

    /// Build the method set served by a list of gRPC service descriptors.
    pub fn from_descriptors(descriptors: &[ServiceDescriptor]) -> Self {
        descriptors
            .iter()
            .flat_map(|desc| desc.qualified_methods())
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for MethodSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a MethodSet {
    type Item = &'a String;
    type IntoIter = btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for MethodSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for method in &self.0 {
            map.serialize_entry(method, &true)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MethodSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MethodMapVisitor;

        impl<'de> Visitor<'de> for MethodMapVisitor {
            type Value = MethodSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of method name to bool")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(MethodSet::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut set = BTreeSet::new();
                while let Some((method, enabled)) = access.next_entry::<String, bool>()? {
                    if enabled {
                        set.insert(method);
                    }
                }
                Ok(MethodSet(set))
            }
        }

        deserializer.deserialize_any(MethodMapVisitor)
    }
}

/// Minimal description of a gRPC service: its full name and method names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Fully-qualified service name, e.g. `helloworld.Greeter`.
    pub service_name: String,
    /// Bare method names, e.g. `SayHello`.
    pub methods: Vec<String>,
}

impl ServiceDescriptor {
    pub fn new<S: Into<String>>(service_name: S, methods: &[&str]) -> Self {
        Self {
            service_name: service_name.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Method paths as a gateway sees them: `/{service}/{method}`.
    pub fn qualified_methods(&self) -> impl Iterator<Item = String> + '_ {
        self.methods
            .iter()
            .map(move |m| format!("/{}/{}", self.service_name, m))
    }
}
