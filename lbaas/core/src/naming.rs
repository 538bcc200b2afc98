use std::fmt;

/// The reserved partition that exists on every device and is never prefixed.
pub const COMMON_FOLDER: &str = "Common";

pub const DEFAULT_PREFIX: &str = "uuid_";

/// Applies the agent's object-naming convention.
///
/// Every folder other than `Common`, and every object name not already qualified into
/// `/Common/`, carries a uniform prefix so that agent-managed objects never collide with objects
/// an administrator created on the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Naming {
    prefix: String,
}

/// A device object name fully qualified with its folder, e.g. `/uuid_tenant/uuid_pool`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub folder: String,
    pub name: String,
}

// === impl Naming ===

impl Default for Naming {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Naming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefixes `name` unless it already carries the prefix.
    pub fn prefixed(&self, name: &str) -> String {
        if name.starts_with(&self.prefix) {
            name.to_string()
        } else {
            format!("{}{}", self.prefix, name)
        }
    }

    /// Strips the prefix from `name`, if present.
    pub fn unprefixed<'n>(&self, name: &'n str) -> &'n str {
        name.strip_prefix(self.prefix.as_str()).unwrap_or(name)
    }

    /// Returns the device folder for a tenant or an already-named folder.
    pub fn folder(&self, folder: &str) -> String {
        let folder = folder.trim_matches('/');
        if folder == COMMON_FOLDER {
            return COMMON_FOLDER.to_string();
        }
        self.prefixed(folder)
    }

    /// Qualifies `name` into `folder`.
    ///
    /// Names that are already fully qualified into `/Common/` are left in `Common` untouched;
    /// every other name is prefixed (once) and placed in the prefixed target folder.
    pub fn qualify(&self, name: &str, folder: &str) -> QualifiedName {
        if let Some(rest) = name.strip_prefix("/Common/") {
            return QualifiedName::new(COMMON_FOLDER, rest);
        }
        let name = name.rsplit('/').next().unwrap_or(name);
        QualifiedName::new(self.folder(folder), self.prefixed(name))
    }
}

// === impl QualifiedName ===

impl QualifiedName {
    pub fn new(folder: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
        }
    }

    pub fn is_common(&self) -> bool {
        self.folder == COMMON_FOLDER
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.folder, self.name)
    }
}
