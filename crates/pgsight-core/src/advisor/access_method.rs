//! Index access methods and what they can serve.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::qual::OperatorClass;

/// An index access method (`pg_am.amname` with `amtype = 'i'`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccessMethod {
    Btree,
    Hash,
    Gist,
    Gin,
    Brin,
    Spgist,
    /// Extension-provided method (bloom, rum, ...).
    Other(String),
}

impl AccessMethod {
    pub fn name(&self) -> &str {
        match self {
            AccessMethod::Btree => "btree",
            AccessMethod::Hash => "hash",
            AccessMethod::Gist => "gist",
            AccessMethod::Gin => "gin",
            AccessMethod::Brin => "brin",
            AccessMethod::Spgist => "spgist",
            AccessMethod::Other(name) => name,
        }
    }

    /// Whether the method can serve predicates of the given operator class.
    pub fn supports(&self, class: OperatorClass) -> bool {
        use OperatorClass::*;
        match self {
            AccessMethod::Btree => matches!(class, Equality | Range),
            AccessMethod::Hash => matches!(class, Equality),
            AccessMethod::Gist | AccessMethod::Spgist => {
                matches!(class, Equality | Range | Containment | Pattern)
            }
            AccessMethod::Gin => matches!(class, Equality | Containment | Pattern),
            AccessMethod::Brin => matches!(class, Equality | Range | Containment),
            AccessMethod::Other(_) => !matches!(class, Inequality | Unsupported),
        }
    }

    /// Hash and SP-GiST indexes are single-column only.
    pub fn supports_multicolumn(&self) -> bool {
        !matches!(self, AccessMethod::Hash | AccessMethod::Spgist)
    }

    /// Methods assumed for an operator when the catalog could not be consulted.
    /// Hash is never assumed.
    pub fn defaults_for(class: OperatorClass) -> Vec<AccessMethod> {
        match class {
            OperatorClass::Equality | OperatorClass::Range => vec![AccessMethod::Btree],
            OperatorClass::Containment => vec![AccessMethod::Gin, AccessMethod::Gist],
            OperatorClass::Pattern | OperatorClass::Inequality | OperatorClass::Unsupported => {
                Vec::new()
            }
        }
    }
}

impl From<String> for AccessMethod {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "btree" => AccessMethod::Btree,
            "hash" => AccessMethod::Hash,
            "gist" => AccessMethod::Gist,
            "gin" => AccessMethod::Gin,
            "brin" => AccessMethod::Brin,
            "spgist" => AccessMethod::Spgist,
            _ => AccessMethod::Other(s),
        }
    }
}

impl From<&str> for AccessMethod {
    fn from(s: &str) -> Self {
        AccessMethod::from(s.to_string())
    }
}

impl From<AccessMethod> for String {
    fn from(am: AccessMethod) -> Self {
        am.name().to_string()
    }
}

impl std::fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Index access methods installed on a target server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    access_methods: BTreeSet<AccessMethod>,
}

impl CapabilitySet {
    pub fn new(access_methods: impl IntoIterator<Item = AccessMethod>) -> Self {
        Self {
            access_methods: access_methods.into_iter().collect(),
        }
    }

    /// Built-in methods of every supported PostgreSQL release.
    pub fn builtin() -> Self {
        Self::new([
            AccessMethod::Btree,
            AccessMethod::Hash,
            AccessMethod::Gist,
            AccessMethod::Gin,
            AccessMethod::Brin,
            AccessMethod::Spgist,
        ])
    }

    pub fn contains(&self, am: &AccessMethod) -> bool {
        self.access_methods.contains(am)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessMethod> {
        self.access_methods.iter()
    }

    pub fn len(&self) -> usize {
        self.access_methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.access_methods.is_empty()
    }
}
