//! VCD URN identifiers.
//!
//! Every first-class VCD object is identified by `urn:vcloud:<kind>:<uuid>`.
//! The engine stores that string as the resource ID and forwards any
//! attribute ending in `_id` verbatim, so the only thing parsed out of a URN
//! is its kind (to tell a VDC group owner from a VDC owner) and its UUID.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::ProviderError;

/// Prefix shared by every VCD URN.
pub const URN_PREFIX: &str = "urn:vcloud:";

/// Entity kinds emitted by the bundled resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// An organization.
    Org,
    /// An organization VDC.
    Vdc,
    /// A VDC group.
    VdcGroup,
    /// An NSX-T edge gateway.
    Gateway,
    /// An org VDC network.
    Network,
    /// A registered NSX-T manager.
    NsxtManager,
    /// A provider VDC.
    ProviderVdc,
    /// A provider VDC storage profile.
    ProviderVdcStorageProfile,
    /// A vCenter server.
    VimServer,
    /// An ESXi host.
    Host,
    /// An RDE interface.
    Interface,
    /// An RDE type.
    Type,
    /// An RDE type behavior.
    Behavior,
    /// A Runtime Defined Entity instance.
    Entity,
    /// An ALB controller.
    LoadBalancerController,
    /// An ALB service engine group.
    ServiceEngineGroup,
    /// An assignment of a service engine group to an edge gateway.
    ServiceEngineGroupAssignment,
    /// A service account.
    ServiceAccount,
}

impl EntityKind {
    /// The kind segment as it appears in the URN.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Org => "org",
            Self::Vdc => "vdc",
            Self::VdcGroup => "vdcgroup",
            Self::Gateway => "gateway",
            Self::Network => "network",
            Self::NsxtManager => "nsxtmanager",
            Self::ProviderVdc => "providervdc",
            Self::ProviderVdcStorageProfile => "providervdcstorageprofile",
            Self::VimServer => "vimserver",
            Self::Host => "host",
            Self::Interface => "interface",
            Self::Type => "type",
            Self::Behavior => "behavior",
            Self::Entity => "entity",
            Self::LoadBalancerController => "loadbalancercontroller",
            Self::ServiceEngineGroup => "serviceenginegroup",
            Self::ServiceEngineGroupAssignment => "serviceenginegroupassignment",
            Self::ServiceAccount => "serviceaccount",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `urn:vcloud:<kind>:<uuid>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Urn {
    kind: String,
    uuid: Uuid,
}

impl Urn {
    /// Build a URN from a kind and UUID.
    pub fn new(kind: EntityKind, uuid: Uuid) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            uuid,
        }
    }

    /// Build a URN with a fresh random UUID.
    pub fn generate(kind: EntityKind) -> Self {
        Self::new(kind, Uuid::new_v4())
    }

    /// Parse a URN string.
    ///
    /// The kind is normalised to lowercase (VCD itself writes `vdcGroup`).
    pub fn parse(input: &str) -> Result<Self, ProviderError> {
        let invalid = || {
            ProviderError::Validation(format!(
                "'{}' is not a valid URN (expected urn:vcloud:<kind>:<uuid>)",
                input
            ))
        };

        let rest = input.strip_prefix(URN_PREFIX).ok_or_else(invalid)?;
        let (kind, uuid) = rest.split_once(':').ok_or_else(invalid)?;
        if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid());
        }
        if uuid.len() != 36 {
            return Err(invalid());
        }
        let uuid = Uuid::parse_str(uuid).map_err(|_| invalid())?;

        Ok(Self {
            kind: kind.to_ascii_lowercase(),
            uuid,
        })
    }

    /// Build a URN from a bare UUID, as returned by the legacy XML API.
    pub fn from_bare_id(kind: EntityKind, id: &str) -> Result<Self, ProviderError> {
        if is_urn(id) {
            return Self::parse(id);
        }
        let uuid = Uuid::parse_str(id)
            .map_err(|_| ProviderError::Validation(format!("'{}' is not a valid UUID", id)))?;
        Ok(Self::new(kind, uuid))
    }

    /// The kind segment, lowercase.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The UUID segment.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether this URN has the given kind.
    pub fn is_kind(&self, kind: EntityKind) -> bool {
        self.kind == kind.as_str()
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", URN_PREFIX, self.kind, self.uuid.hyphenated())
    }
}

impl FromStr for Urn {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Urn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Urn::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Whether the string looks like a VCD URN.
pub fn is_urn(s: &str) -> bool {
    Urn::parse(s).is_ok()
}

/// Whether the ID names a VDC group.
pub fn is_vdc_group_urn(id: &str) -> bool {
    Urn::parse(id)
        .map(|urn| urn.is_kind(EntityKind::VdcGroup))
        .unwrap_or(false)
}
