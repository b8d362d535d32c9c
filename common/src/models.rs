// Value-typed identities for storage accounts, containers and blobs.
// Client handles are never used as map keys; these structs are.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Account name used by the local storage emulator
pub const EMULATOR_ACCOUNT_NAME: &str = "devstoreaccount1";

/// A storage account, identified by name only
///
/// Names compare case-insensitively, so two handles built from different
/// connection strings for the same account resolve to one listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountIdentity {
    name: String,
    #[serde(default)]
    emulated: bool,
}

impl AccountIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let emulated = name.eq_ignore_ascii_case(EMULATOR_ACCOUNT_NAME);
        Self { name, emulated }
    }

    /// An account served by a local emulator, which has no analytics logging
    pub fn emulated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            emulated: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_emulated(&self) -> bool {
        self.emulated
    }

    fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

impl PartialEq for AccountIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for AccountIdentity {}

impl Hash for AccountIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A container within an account. Names are kept in lower case, the form
/// the storage service reports them in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub account: AccountIdentity,
    pub name: String,
}

impl ContainerIdentity {
    pub fn new(account: AccountIdentity, name: impl Into<String>) -> Self {
        Self {
            account,
            name: name.into().to_ascii_lowercase(),
        }
    }

    pub fn blob(&self, name: impl Into<String>) -> BlobIdentity {
        BlobIdentity {
            container: self.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.name)
    }
}

/// A blob within a container
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobIdentity {
    pub container: ContainerIdentity,
    pub name: String,
}

impl BlobIdentity {
    pub fn new(
        account: AccountIdentity,
        container: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            container: ContainerIdentity::new(account, container),
            name: name.into(),
        }
    }

    pub fn account(&self) -> &AccountIdentity {
        &self.container.account
    }

    pub fn container_name(&self) -> &str {
        &self.container.name
    }

    /// `container/blob`, the path form matched by blob path patterns
    pub fn path(&self) -> String {
        format!("{}/{}", self.container.name, self.name)
    }
}

impl fmt::Display for BlobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Properties returned by a listing or a metadata fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub identity: BlobIdentity,
    pub last_modified: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl BlobProperties {
    pub fn new(identity: BlobIdentity, last_modified: DateTime<Utc>) -> Self {
        Self {
            identity,
            last_modified,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}
