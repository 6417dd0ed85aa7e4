use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A platform independent relative path: an ordered sequence of components.
///
/// The wire form joins components with `/` regardless of the host OS
/// separator. Components may not be empty, `.`, `..`, or contain `?` or `*`;
/// a wire form starting with `/` is invalid. The empty path addresses the
/// provider root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct RelPath(Vec<String>);

fn check_component(component: &str) -> Result<(), SyncError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('?')
        || component.contains('*')
        || component.contains('/')
        || component.contains(std::path::MAIN_SEPARATOR)
    {
        return Err(SyncError::InvalidPath(format!(
            "forbidden path component: {component:?}"
        )));
    }
    Ok(())
}

impl RelPath {
    /// The empty path, addressing the provider root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from pre-split components, validating each one.
    pub fn from_components<I, S>(components: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut items = Vec::new();
        for component in components {
            let component = component.into();
            check_component(&component)?;
            items.push(component);
        }
        Ok(Self(items))
    }

    /// Parse the wire form (components joined by `/`). The empty string is
    /// the root path.
    pub fn parse(wire: &str) -> Result<Self, SyncError> {
        if wire.is_empty() {
            return Ok(Self::root());
        }
        if wire.starts_with('/') {
            return Err(SyncError::InvalidPath(format!(
                "path must be relative: {wire:?}"
            )));
        }
        Self::from_components(wire.split('/'))
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Append a single (already validated) component.
    pub fn child(&self, name: &str) -> Self {
        let mut items = self.0.clone();
        items.push(name.to_string());
        Self(items)
    }

    /// Concatenate two paths.
    pub fn join(&self, other: &RelPath) -> Self {
        let mut items = self.0.clone();
        items.extend(other.0.iter().cloned());
        Self(items)
    }

    /// The path without its last component; the root maps to itself.
    pub fn parent(&self) -> Self {
        let mut items = self.0.clone();
        items.pop();
        Self(items)
    }

    pub fn starts_with(&self, prefix: &RelPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// The first `n` components as a path.
    pub fn prefix(&self, n: usize) -> Self {
        Self(self.0[..n].to_vec())
    }

    /// The wire form: components joined by `/`.
    pub fn to_wire(&self) -> String {
        self.0.join("/")
    }

    /// Resolve against a local root directory.
    pub fn to_local(&self, root: &std::path::Path) -> std::path::PathBuf {
        let mut path = root.to_path_buf();
        for component in &self.0 {
            path.push(component);
        }
        path
    }
}

impl std::fmt::Display for RelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

impl std::str::FromStr for RelPath {
    type Err = SyncError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<Vec<String>> for RelPath {
    type Error = SyncError;
    fn try_from(components: Vec<String>) -> Result<Self, Self::Error> {
        Self::from_components(components)
    }
}

impl From<RelPath> for Vec<String> {
    fn from(path: RelPath) -> Self {
        path.0
    }
}
