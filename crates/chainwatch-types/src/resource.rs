//! Watchable resource types and the registry mapping them to collections.
//!
//! Every [`CursorType`] resolves through a [`ResourceRegistry`] to a
//! [`ResourceKey`], which names the backing collection(s) and the chain
//! collection holding the resource's change events. Composite resources
//! share one logical watch stream across several backing collections.

use serde::{Deserialize, Serialize};

use crate::error::WatchError;

/// Retention window of every chain collection: five days, in seconds.
pub const CHAIN_TTL_SECONDS: i64 = 5 * 24 * 60 * 60;

/// Suffix appended to a collection key to name its chain collection.
const CHAIN_COLLECTION_SUFFIX: &str = "WatchChain";

/// Host base data.
pub const TABLE_HOST_BASE: &str = "cc_HostBase";
/// Host to module assignment.
pub const TABLE_MODULE_HOST_CONFIG: &str = "cc_ModuleHostConfig";
/// Business base data.
pub const TABLE_BIZ_BASE: &str = "cc_ApplicationBase";
/// Set base data.
pub const TABLE_SET_BASE: &str = "cc_SetBase";
/// Module base data.
pub const TABLE_MODULE_BASE: &str = "cc_ModuleBase";
/// Process data.
pub const TABLE_PROCESS: &str = "cc_Process";
/// Object instances of user-defined models.
pub const TABLE_OBJECT_BASE: &str = "cc_ObjectBase";
/// Instances of user-defined mainline levels.
pub const TABLE_MAINLINE_INSTANCE: &str = "cc_MainlineInstance";
/// Instance associations.
pub const TABLE_INST_ASST: &str = "cc_InstAsst";
/// Business-set base data.
pub const TABLE_BIZ_SET_BASE: &str = "cc_BizSetBase";
/// Cloud area base data.
pub const TABLE_PLAT_BASE: &str = "cc_PlatBase";
/// Project base data.
pub const TABLE_PROJECT_BASE: &str = "cc_ProjectBase";

/// Logical collection key of the host identity stream.
pub const KEY_HOST_IDENTITY: &str = "cc_HostIdentity";
/// Logical collection key of the business-set relation stream.
pub const KEY_BIZ_SET_RELATION: &str = "cc_BizSetRelation";

/// Closed set of watchable resource (cursor) types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorType {
    /// Host base data.
    Host,
    /// Host to module relations.
    HostRelation,
    /// Businesses.
    Biz,
    /// Sets.
    Set,
    /// Modules.
    Module,
    /// Processes.
    Process,
    /// Object instances, partitioned by object id.
    ObjectInstance,
    /// Mainline instances, partitioned by object id.
    MainlineInstance,
    /// Instance associations, partitioned by object id.
    InstAsst,
    /// Business sets.
    BizSet,
    /// Business-set to business relations (composite).
    BizSetRelation,
    /// Host identity (composite).
    HostIdentifier,
    /// Cloud areas.
    Plat,
    /// Projects.
    Project,
}

impl CursorType {
    /// Every cursor type, in registry order.
    pub const ALL: [CursorType; 14] = [
        Self::Host,
        Self::HostRelation,
        Self::Biz,
        Self::Set,
        Self::Module,
        Self::Process,
        Self::ObjectInstance,
        Self::MainlineInstance,
        Self::InstAsst,
        Self::BizSet,
        Self::BizSetRelation,
        Self::HostIdentifier,
        Self::Plat,
        Self::Project,
    ];

    /// Returns the wire tag for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::HostRelation => "host_relation",
            Self::Biz => "biz",
            Self::Set => "set",
            Self::Module => "module",
            Self::Process => "process",
            Self::ObjectInstance => "object_instance",
            Self::MainlineInstance => "mainline_instance",
            Self::InstAsst => "inst_asst",
            Self::BizSet => "biz_set",
            Self::BizSetRelation => "biz_set_relation",
            Self::HostIdentifier => "host_identifier",
            Self::Plat => "plat",
            Self::Project => "project",
        }
    }

    /// Whether events of this type are partitioned by a sub resource
    /// (the object id of the instance's model).
    pub fn is_partitioned(self) -> bool {
        matches!(
            self,
            Self::ObjectInstance | Self::MainlineInstance | Self::InstAsst
        )
    }
}

impl std::fmt::Display for CursorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CursorType {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| WatchError::UnknownResourceType(s.to_string()))
    }
}

/// How a resource key maps onto backing collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    /// One backing collection.
    Simple {
        /// The backing collection name.
        collection: String,
    },
    /// Several backing collections feeding one logical stream.
    Composite {
        /// Backing collection names, one token sub-entry each.
        collections: Vec<String>,
        /// Whether the token document also tracks a shared `id`/`token`
        /// position for the combined stream.
        shared_position: bool,
    },
}

/// A registered watchable resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    cursor_type: CursorType,
    collection_key: String,
    chain_collection: String,
    kind: KeyKind,
    ttl_seconds: i64,
}

impl ResourceKey {
    /// Creates a key backed by a single collection.
    pub fn simple(cursor_type: CursorType, collection: &str) -> Self {
        Self {
            cursor_type,
            collection_key: collection.to_string(),
            chain_collection: chain_collection_name(collection),
            kind: KeyKind::Simple {
                collection: collection.to_string(),
            },
            ttl_seconds: CHAIN_TTL_SECONDS,
        }
    }

    /// Creates a key whose stream is fed by several collections.
    ///
    /// `key` is the logical collection key used for the token document id
    /// and the chain collection name.
    pub fn composite(
        cursor_type: CursorType,
        key: &str,
        collections: &[&str],
        shared_position: bool,
    ) -> Self {
        Self {
            cursor_type,
            collection_key: key.to_string(),
            chain_collection: chain_collection_name(key),
            kind: KeyKind::Composite {
                collections: collections.iter().map(|c| c.to_string()).collect(),
                shared_position,
            },
            ttl_seconds: CHAIN_TTL_SECONDS,
        }
    }

    /// The cursor type this key serves.
    pub fn cursor_type(&self) -> CursorType {
        self.cursor_type
    }

    /// The collection key: the backing collection of a simple key, or the
    /// logical name of a composite key.
    pub fn collection(&self) -> &str {
        &self.collection_key
    }

    /// All backing collections.
    pub fn collections(&self) -> Vec<&str> {
        match &self.kind {
            KeyKind::Simple { collection } => vec![collection.as_str()],
            KeyKind::Composite { collections, .. } => {
                collections.iter().map(String::as_str).collect()
            }
        }
    }

    /// Name of the dedicated chain collection.
    pub fn chain_collection(&self) -> &str {
        &self.chain_collection
    }

    /// Whether the key is simple or composite.
    pub fn kind(&self) -> &KeyKind {
        &self.kind
    }

    /// Whether chain nodes carry a sub resource partition.
    pub fn is_partitioned(&self) -> bool {
        self.cursor_type.is_partitioned()
    }

    /// Retention window of the chain, in seconds.
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }
}

fn chain_collection_name(key: &str) -> String {
    format!("{key}{CHAIN_COLLECTION_SUFFIX}")
}

fn builtin_key(cursor_type: CursorType) -> ResourceKey {
    match cursor_type {
        CursorType::Host => ResourceKey::simple(cursor_type, TABLE_HOST_BASE),
        CursorType::HostRelation => ResourceKey::simple(cursor_type, TABLE_MODULE_HOST_CONFIG),
        CursorType::Biz => ResourceKey::simple(cursor_type, TABLE_BIZ_BASE),
        CursorType::Set => ResourceKey::simple(cursor_type, TABLE_SET_BASE),
        CursorType::Module => ResourceKey::simple(cursor_type, TABLE_MODULE_BASE),
        CursorType::Process => ResourceKey::simple(cursor_type, TABLE_PROCESS),
        CursorType::ObjectInstance => ResourceKey::simple(cursor_type, TABLE_OBJECT_BASE),
        CursorType::MainlineInstance => ResourceKey::simple(cursor_type, TABLE_MAINLINE_INSTANCE),
        CursorType::InstAsst => ResourceKey::simple(cursor_type, TABLE_INST_ASST),
        CursorType::BizSet => ResourceKey::simple(cursor_type, TABLE_BIZ_SET_BASE),
        CursorType::Plat => ResourceKey::simple(cursor_type, TABLE_PLAT_BASE),
        CursorType::Project => ResourceKey::simple(cursor_type, TABLE_PROJECT_BASE),
        CursorType::HostIdentifier => ResourceKey::composite(
            cursor_type,
            KEY_HOST_IDENTITY,
            &[TABLE_HOST_BASE, TABLE_MODULE_HOST_CONFIG, TABLE_PROCESS],
            false,
        ),
        CursorType::BizSetRelation => ResourceKey::composite(
            cursor_type,
            KEY_BIZ_SET_RELATION,
            &[TABLE_BIZ_BASE, TABLE_BIZ_SET_BASE],
            true,
        ),
    }
}

/// Lookup table from cursor type to resource key.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    keys: Vec<ResourceKey>,
}

impl ResourceRegistry {
    /// A registry containing every built-in resource type.
    pub fn builtin() -> Self {
        Self::with_types(&CursorType::ALL)
    }

    /// A registry restricted to the given types, in the given order.
    /// Duplicates are ignored.
    pub fn with_types(types: &[CursorType]) -> Self {
        let mut keys: Vec<ResourceKey> = Vec::with_capacity(types.len());
        for ty in types {
            if keys.iter().any(|k| k.cursor_type == *ty) {
                continue;
            }
            keys.push(builtin_key(*ty));
        }
        Self { keys }
    }

    /// Resolves the key for a cursor type.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::UnknownResourceType` when the type is not in
    /// this registry.
    pub fn key_for(&self, cursor_type: CursorType) -> Result<&ResourceKey, WatchError> {
        self.keys
            .iter()
            .find(|k| k.cursor_type == cursor_type)
            .ok_or_else(|| WatchError::UnknownResourceType(cursor_type.to_string()))
    }

    /// Resolves the key for a wire tag.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::UnknownResourceType` for unknown tags or types
    /// not in this registry.
    pub fn key_for_tag(&self, tag: &str) -> Result<&ResourceKey, WatchError> {
        self.key_for(tag.parse()?)
    }

    /// Iterates the registered keys in registry order.
    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.keys.iter()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
