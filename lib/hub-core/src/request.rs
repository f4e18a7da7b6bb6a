//! Kubernetes request-info resolution
//!
//! Splits an API path into group, version, namespace, resource, name and
//! subresource, and derives the verb from the method, the presence of a name
//! and the `watch` query parameter.

use hyper::{Method, Uri};
use std::fmt;
use std::str::FromStr;

use crate::HubError;

/// Kubernetes API verb
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Patch,
    Delete,
    DeleteCollection,
    #[default]
    Other,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
            Verb::DeleteCollection => "deletecollection",
            Verb::Other => "other",
        }
    }

    /// Read verbs are the only ones the cache ever answers
    pub fn is_read(&self) -> bool {
        matches!(self, Verb::Get | Verb::List | Verb::Watch)
    }

    fn from_method(method: &Method) -> Self {
        match *method {
            Method::GET | Method::HEAD => Verb::Get,
            Method::POST => Verb::Create,
            Method::PUT => Verb::Update,
            Method::PATCH => Verb::Patch,
            Method::DELETE => Verb::Delete,
            _ => Verb::Other,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "get" => Ok(Verb::Get),
            "list" => Ok(Verb::List),
            "watch" => Ok(Verb::Watch),
            "create" => Ok(Verb::Create),
            "update" => Ok(Verb::Update),
            "patch" => Ok(Verb::Patch),
            "delete" => Ok(Verb::Delete),
            "deletecollection" => Ok(Verb::DeleteCollection),
            other => Err(HubError::InvalidRequest(format!("unknown verb {}", other))),
        }
    }
}

/// Resolved (group, version, resource, verb) of an API request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestInfo {
    pub is_resource_request: bool,
    pub path: String,
    pub verb: Verb,
    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    pub namespace: Option<String>,
    pub resource: String,
    pub subresource: Option<String>,
    pub name: Option<String>,
}

/// Sub-paths of a namespace that address the namespace object itself
const NAMESPACE_SUBRESOURCES: &[&str] = &["status", "finalize"];

impl RequestInfo {
    /// Resolve request info from a method and URI
    pub fn resolve(method: &Method, uri: &Uri) -> Self {
        let path = uri.path().to_string();
        let mut info = RequestInfo {
            is_resource_request: false,
            path: path.clone(),
            verb: Verb::from_method(method),
            api_prefix: String::new(),
            api_group: String::new(),
            api_version: String::new(),
            namespace: None,
            resource: String::new(),
            subresource: None,
            name: None,
        };

        let parts: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() < 3 || (parts[0] != "api" && parts[0] != "apis") {
            return info;
        }

        info.api_prefix = parts[0].to_string();
        let mut current = &parts[1..];

        if info.api_prefix == "apis" {
            if current.len() < 3 {
                return info;
            }
            info.api_group = current[0].to_string();
            current = &current[1..];
        }

        info.is_resource_request = true;
        info.api_version = current[0].to_string();
        current = &current[1..];

        let mut legacy_watch = false;
        if current.first() == Some(&"watch") {
            if current.len() < 2 {
                info.is_resource_request = false;
                return info;
            }
            legacy_watch = true;
            current = &current[1..];
        }

        if current.first() == Some(&"namespaces") {
            if current.len() > 1 {
                info.namespace = Some(current[1].to_string());
                if current.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&current[2]) {
                    current = &current[2..];
                }
            }
        }

        if current.len() >= 3 {
            info.subresource = Some(current[2].to_string());
        }
        if current.len() >= 2 {
            info.name = Some(current[1].to_string());
        }
        if let Some(resource) = current.first() {
            info.resource = resource.to_string();
        }

        if legacy_watch {
            info.verb = Verb::Watch;
        } else {
            if info.verb == Verb::Get && info.name.is_none() {
                info.verb = Verb::List;
            }
            if info.verb == Verb::List && watch_requested(uri) {
                info.verb = Verb::Watch;
            }
            if info.verb == Verb::Delete && info.name.is_none() {
                info.verb = Verb::DeleteCollection;
            }
        }

        info
    }

    /// Group/version string as used in `apiVersion`
    pub fn group_version(&self) -> String {
        if self.api_group.is_empty() {
            self.api_version.clone()
        } else {
            format!("{}/{}", self.api_group, self.api_version)
        }
    }
}

/// Look up a query parameter, percent-decoded
pub fn query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn watch_requested(uri: &Uri) -> bool {
    matches!(query_param(uri, "watch").as_deref(), Some("true") | Some("1"))
}
