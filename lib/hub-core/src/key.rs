//! Hierarchical keys for cached objects

use std::fmt;

use crate::{HubError, RequestContext, Result};

/// Key of a cached object or collection root
///
/// Laid out as `{component}/{resource}[/{namespace}][/{name}]`. A key without
/// a name is a collection root; every object below it shares its prefix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    pub component: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl StorageKey {
    /// Key of a single object
    pub fn object(component: &str, resource: &str, namespace: Option<&str>, name: &str) -> Result<Self> {
        let key = Self {
            component: component.to_string(),
            resource: resource.to_string(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: Some(name.to_string()),
        };
        key.validate()?;
        Ok(key)
    }

    /// Key of a collection root, optionally scoped to a namespace
    pub fn collection(component: &str, resource: &str, namespace: Option<&str>) -> Result<Self> {
        let key = Self {
            component: component.to_string(),
            resource: resource.to_string(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: None,
        };
        key.validate()?;
        Ok(key)
    }

    /// Key addressed by a request: an object for `get`, a root otherwise
    pub fn for_request(ctx: &RequestContext) -> Result<Self> {
        let info = &ctx.info;
        match &info.name {
            Some(name) if info.resource == "namespaces" => {
                Self::object(&ctx.component, &info.resource, None, name)
            }
            Some(name) => Self::object(&ctx.component, &info.resource, info.namespace.as_deref(), name),
            None => Self::collection(&ctx.component, &info.resource, info.namespace.as_deref()),
        }
    }

    /// Rebuild an object key from the path segments below the cache root
    pub fn from_object_segments(segments: &[&str]) -> Result<Self> {
        match segments {
            [component, resource, name] => Self::object(component, resource, None, name),
            [component, resource, namespace, name] => {
                Self::object(component, resource, Some(namespace), name)
            }
            _ => Err(HubError::InvalidRequest(format!(
                "not an object key: {}",
                segments.join("/")
            ))),
        }
    }

    /// The same object or collection as seen by another component
    pub fn with_component(&self, component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..self.clone()
        }
    }

    pub fn is_root(&self) -> bool {
        self.name.is_none()
    }

    /// Path segments in hierarchical order
    pub fn segments(&self) -> Vec<&str> {
        let mut segments = vec![self.component.as_str(), self.resource.as_str()];
        if let Some(ns) = &self.namespace {
            segments.push(ns);
        }
        if let Some(name) = &self.name {
            segments.push(name);
        }
        segments
    }

    /// Whether `other` lies at or below this key
    pub fn contains(&self, other: &StorageKey) -> bool {
        let mine = self.segments();
        let theirs = other.segments();
        // A cluster-wide root contains namespaced objects too.
        theirs.len() >= mine.len() && mine.iter().zip(theirs.iter()).all(|(a, b)| a == b)
    }

    fn validate(&self) -> Result<()> {
        for segment in self.segments() {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
                return Err(HubError::InvalidRequest(format!(
                    "invalid key segment {:?} in {}",
                    segment, self
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments().join("/"))
    }
}
