//! Query identity and dependency tags.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of a cached read: endpoint name plus canonical arguments.
///
/// Two logically equal argument objects always produce the same key,
/// regardless of field order or of optional fields left unset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  endpoint: &'static str,
  args: String,
}

impl QueryKey {
  /// Build a key from any serializable argument value.
  pub fn new<A: Serialize + ?Sized>(endpoint: &'static str, args: &A) -> Self {
    // Argument structs are plain data; serialization only fails for maps with
    // non-string keys, which we never use as query arguments.
    let value = serde_json::to_value(args).unwrap_or(Value::Null);
    Self::from_value(endpoint, value)
  }

  pub fn from_value(endpoint: &'static str, args: Value) -> Self {
    let args = match canonicalize(args) {
      Value::Null => String::new(),
      Value::Object(map) if map.is_empty() => String::new(),
      other => other.to_string(),
    };
    Self { endpoint, args }
  }

  /// Key for an endpoint that takes no arguments.
  pub fn bare(endpoint: &'static str) -> Self {
    Self {
      endpoint,
      args: String::new(),
    }
  }

  pub fn endpoint(&self) -> &'static str {
    self.endpoint
  }

  /// Canonical JSON of the arguments (empty when there are none).
  pub fn args(&self) -> &str {
    &self.args
  }

  /// Short stable digest, used as a log field.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.endpoint.as_bytes());
    hasher.update([0u8]);
    hasher.update(self.args.as_bytes());
    hex::encode(&hasher.finalize()[..6])
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({})", self.endpoint, self.args)
  }
}

/// Sort object keys recursively and drop null-valued fields.
fn canonicalize(value: Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(String, Value)> = map
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k, canonicalize(v)))
        .collect();
      entries.sort_by(|a, b| a.0.cmp(&b.0));
      let mut sorted = Map::new();
      for (k, v) in entries {
        sorted.insert(k, v);
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
    other => other,
  }
}

/// Kind of remote resource a tag refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
  Project,
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResourceKind::Project => f.write_str("Project"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagId {
  Id(u64),
  /// Any active listing of the resource.
  List,
  /// Listings of soft-deleted resources.
  DeletedList,
}

/// Dependency label attached to cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
  pub kind: ResourceKind,
  pub id: TagId,
}

impl Tag {
  pub const fn project(id: u64) -> Self {
    Self {
      kind: ResourceKind::Project,
      id: TagId::Id(id),
    }
  }

  pub const fn project_list() -> Self {
    Self {
      kind: ResourceKind::Project,
      id: TagId::List,
    }
  }

  pub const fn project_deleted_list() -> Self {
    Self {
      kind: ResourceKind::Project,
      id: TagId::DeletedList,
    }
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.id {
      TagId::Id(id) => write!(f, "{}:{}", self.kind, id),
      TagId::List => write!(f, "{}:LIST", self.kind),
      TagId::DeletedList => write!(f, "{}:DELETED_LIST", self.kind),
    }
  }
}
