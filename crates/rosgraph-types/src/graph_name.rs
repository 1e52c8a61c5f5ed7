//! Graph names: validated, slash-delimited identifiers for nodes, topics and
//! services, plus the resolver that turns relative and private names into
//! global ones.

use crate::error::{RosError, RosResult};
use crate::identity::IdSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ROOT: &str = "/";
const SEPARATOR: char = '/';
const PRIVATE_PREFIX: char = '~';
const ANONYMOUS_PREFIX: &str = "anonymous_";

/// A canonical graph name.
///
/// Canonical form has no trailing separator (except the root itself) and
/// private names are written `~name` rather than `~/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GraphName(String);

impl GraphName {
    /// Validate and canonicalize a name.
    pub fn new(name: &str) -> RosResult<Self> {
        if !Self::is_valid(name) {
            return Err(RosError::InvalidGraphName(name.to_string()));
        }
        Ok(Self(canonicalize(name)))
    }

    /// The root namespace `/`.
    pub fn root() -> Self {
        Self(ROOT.to_string())
    }

    /// A fresh anonymous relative name drawn from `ids`.
    pub fn anonymous(ids: &dyn IdSource) -> Self {
        Self(format!("{ANONYMOUS_PREFIX}{}", ids.next_id()))
    }

    /// Whether `name` matches `^[~/A-Za-z][\w/]*$`.
    pub fn is_valid(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c == PRIVATE_PREFIX || c == SEPARATOR || c.is_ascii_alphabetic() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == SEPARATOR)
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0.starts_with(SEPARATOR)
    }

    pub fn is_private(&self) -> bool {
        self.0.starts_with(PRIVATE_PREFIX)
    }

    pub fn is_relative(&self) -> bool {
        !self.is_global() && !self.is_private()
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT
    }

    /// The enclosing namespace, or `None` for the root and for single-segment
    /// relative or private names.
    pub fn parent(&self) -> Option<GraphName> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// The last segment of the name.
    pub fn basename(&self) -> GraphName {
        if self.is_root() {
            return self.clone();
        }
        let tail = match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => self.0.trim_start_matches(PRIVATE_PREFIX),
        };
        Self(tail.to_string())
    }

    /// Strip any global or private prefix.
    pub fn to_relative(&self) -> GraphName {
        if self.is_root() {
            return self.clone();
        }
        if self.is_global() || self.is_private() {
            Self(self.0[1..].to_string())
        } else {
            self.clone()
        }
    }

    /// Prefix with `/` if not already global; private names lose their `~`.
    pub fn to_global(&self) -> GraphName {
        if self.is_global() {
            self.clone()
        } else {
            Self(format!("{ROOT}{}", self.to_relative().0))
        }
    }

    /// Append `other` to this namespace. A global `other` is returned as-is.
    pub fn join(&self, other: &GraphName) -> GraphName {
        if other.is_global() {
            return other.clone();
        }
        let tail = other.to_relative();
        if self.is_root() {
            Self(format!("{ROOT}{}", tail.0))
        } else {
            Self(format!("{}{SEPARATOR}{}", self.0, tail.0))
        }
    }

    /// Whether this name lies at or below `namespace`.
    pub fn is_within(&self, namespace: &GraphName) -> bool {
        if namespace.is_root() {
            return self.is_global();
        }
        self.0 == namespace.0
            || (self.0.starts_with(&namespace.0)
                && self.0[namespace.0.len()..].starts_with(SEPARATOR))
    }

    /// Path segments, root excluded.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0
            .trim_start_matches([SEPARATOR, PRIVATE_PREFIX])
            .split(SEPARATOR)
            .filter(|s| !s.is_empty())
    }
}

fn canonicalize(name: &str) -> String {
    let mut name = name.to_string();
    while name != ROOT && name.ends_with(SEPARATOR) {
        name.pop();
    }
    if let Some(rest) = name.strip_prefix("~/") {
        name = format!("{PRIVATE_PREFIX}{rest}");
    }
    name
}

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GraphName {
    type Err = RosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GraphName::new(s)
    }
}

impl TryFrom<String> for GraphName {
    type Error = RosError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GraphName::new(&value)
    }
}

impl From<GraphName> for String {
    fn from(name: GraphName) -> Self {
        name.0
    }
}

/// Resolves names relative to a namespace and a node's private namespace.
#[derive(Debug, Clone)]
pub struct NameResolver {
    namespace: GraphName,
    node_name: GraphName,
}

impl NameResolver {
    /// Build a resolver for `node_name` living in `namespace`.
    ///
    /// A relative node name is placed inside the namespace.
    pub fn new(namespace: GraphName, node_name: &GraphName) -> Self {
        let namespace = namespace.to_global();
        let node_name = namespace.join(node_name);
        Self {
            namespace,
            node_name,
        }
    }

    pub fn namespace(&self) -> &GraphName {
        &self.namespace
    }

    /// The fully resolved node name.
    pub fn node_name(&self) -> &GraphName {
        &self.node_name
    }

    /// Resolve `name` to a global name.
    pub fn resolve(&self, name: &GraphName) -> GraphName {
        if name.is_global() {
            name.clone()
        } else if name.is_private() {
            self.node_name.join(&name.to_relative())
        } else {
            self.namespace.join(name)
        }
    }

    /// Parse and resolve in one step.
    pub fn resolve_str(&self, name: &str) -> RosResult<GraphName> {
        Ok(self.resolve(&GraphName::new(name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SequentialIds;

    fn gn(s: &str) -> GraphName {
        GraphName::new(s).unwrap()
    }

    #[test]
    fn test_validation() {
        assert!(GraphName::is_valid("/chatter"));
        assert!(GraphName::is_valid("~private"));
        assert!(GraphName::is_valid("relative/name_2"));
        assert!(!GraphName::is_valid(""));
        assert!(!GraphName::is_valid("1abc"));
        assert!(!GraphName::is_valid("/with space"));
        assert!(!GraphName::is_valid("/dash-name"));
        assert!(GraphName::new("").is_err());
    }

    #[test]
    fn test_canonical_form() {
        assert_eq!(gn("/foo/").as_str(), "/foo");
        assert_eq!(gn("/").as_str(), "/");
        assert_eq!(gn("~/foo").as_str(), "~foo");
        assert_eq!(gn("foo//").as_str(), "foo");
    }

    #[test]
    fn test_kinds() {
        assert!(gn("/a").is_global());
        assert!(gn("~a").is_private());
        assert!(gn("a/b").is_relative());
        assert!(gn("/").is_root());
    }

    #[test]
    fn test_parent_and_basename() {
        assert_eq!(gn("/a/b").parent(), Some(gn("/a")));
        assert_eq!(gn("/a").parent(), Some(GraphName::root()));
        assert_eq!(GraphName::root().parent(), None);
        assert_eq!(gn("a").parent(), None);
        assert_eq!(gn("/a/b").basename(), gn("b"));
        assert_eq!(gn("~b").basename(), gn("b"));
    }

    #[test]
    fn test_join_and_globalize() {
        assert_eq!(GraphName::root().join(&gn("a")), gn("/a"));
        assert_eq!(gn("/ns").join(&gn("a/b")), gn("/ns/a/b"));
        assert_eq!(gn("/ns").join(&gn("/abs")), gn("/abs"));
        assert_eq!(gn("a").to_global(), gn("/a"));
        assert_eq!(gn("~a").to_global(), gn("/a"));
        assert_eq!(gn("/a/b").to_relative(), gn("a/b"));
    }

    #[test]
    fn test_is_within() {
        assert!(gn("/a/b").is_within(&gn("/a")));
        assert!(gn("/a").is_within(&gn("/a")));
        assert!(!gn("/ab").is_within(&gn("/a")));
        assert!(gn("/x").is_within(&GraphName::root()));
    }

    #[test]
    fn test_resolver() {
        let resolver = NameResolver::new(gn("/wg"), &gn("node2"));
        assert_eq!(resolver.node_name(), &gn("/wg/node2"));
        assert_eq!(resolver.resolve(&gn("/foo")), gn("/foo"));
        assert_eq!(resolver.resolve(&gn("foo/bar")), gn("/wg/foo/bar"));
        assert_eq!(resolver.resolve(&gn("~foo")), gn("/wg/node2/foo"));
        assert_eq!(resolver.resolve_str("~foo/bar").unwrap(), gn("/wg/node2/foo/bar"));
    }

    #[test]
    fn test_anonymous_names_are_distinct() {
        let ids = SequentialIds::new();
        let a = GraphName::anonymous(&ids);
        let b = GraphName::anonymous(&ids);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(ANONYMOUS_PREFIX));
    }

    #[test]
    fn test_serde_round_trip_rejects_invalid() {
        let name: GraphName = serde_json::from_str("\"/chatter\"").unwrap();
        assert_eq!(name, gn("/chatter"));
        assert!(serde_json::from_str::<GraphName>("\"9bad\"").is_err());
    }
}
