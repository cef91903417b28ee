//! The SDK seam.
//!
//! The VCD HTTP/OpenAPI client lives outside this crate. The engine only
//! needs the generic OpenAPI verbs (`get`, `list`, `create`, `update`, `put`,
//! `delete`, `action`) plus the metadata API, all addressed by an endpoint
//! path and an object ID. Authentication, pagination and wire serialization
//! stay with the implementation of [`VcdClient`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ProviderError};
use crate::metadata::MetadataEntry;
use crate::urn::EntityKind;

/// Negotiated VCD API version, e.g. `36.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
}

impl ApiVersion {
    /// Create a version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProviderError::Validation(format!("'{}' is not an API version", s));
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// The authenticated session, read-only after startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// User name.
    pub user: String,
    /// Organization the user logged into (`System` for providers).
    pub org: String,
    /// Whether the user is a system administrator.
    pub is_sysadmin: bool,
}

impl Session {
    /// A system administrator session.
    pub fn sysadmin(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            org: "System".to_string(),
            is_sysadmin: true,
        }
    }

    /// A tenant session.
    pub fn tenant(user: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            org: org.into(),
            is_sysadmin: false,
        }
    }
}

/// The object owning a set of metadata entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Endpoint of the owning object.
    pub endpoint: String,
    /// ID of the owning object.
    pub id: String,
}

impl ObjectRef {
    /// Create an object reference.
    pub fn new(endpoint: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            id: id.into(),
        }
    }
}

/// Operations the engine needs from the VCD SDK.
#[async_trait]
pub trait VcdClient: Send + Sync + 'static {
    /// The authenticated session.
    fn session(&self) -> Session;

    /// The API version negotiated at login.
    fn api_version(&self) -> ApiVersion;

    /// Fetch one object.
    async fn get(&self, endpoint: &str, id: &str) -> Result<Value, ApiError>;

    /// List objects, optionally narrowed by a FIQL filter such as `name==net1;ownerRef.id==urn`.
    async fn list(&self, endpoint: &str, filter: Option<&str>) -> Result<Vec<Value>, ApiError>;

    /// Create an object and return it with its assigned `id`.
    async fn create(&self, endpoint: &str, body: Value) -> Result<Value, ApiError>;

    /// Replace an existing object.
    async fn update(&self, endpoint: &str, id: &str, body: Value) -> Result<Value, ApiError>;

    /// Replace a sub-resource addressed by its parent's ID (DHCP, route advertisement, ACL lists).
    async fn put(&self, endpoint: &str, id: &str, body: Value) -> Result<Value, ApiError>;

    /// Delete an object.
    async fn delete(&self, endpoint: &str, id: &str) -> Result<(), ApiError>;

    /// Invoke a named action on an object.
    async fn action(
        &self,
        endpoint: &str,
        id: &str,
        action: &str,
        body: Value,
    ) -> Result<Value, ApiError>;

    /// List all metadata entries of an object.
    async fn list_metadata(&self, object: &ObjectRef) -> Result<Vec<MetadataEntry>, ApiError>;

    /// Add a metadata entry.
    async fn add_metadata(&self, object: &ObjectRef, entry: &MetadataEntry)
        -> Result<(), ApiError>;

    /// Update an existing metadata entry.
    async fn update_metadata(
        &self,
        object: &ObjectRef,
        entry: &MetadataEntry,
    ) -> Result<(), ApiError>;

    /// Delete a metadata entry.
    async fn delete_metadata(
        &self,
        object: &ObjectRef,
        namespace: &str,
        key: &str,
    ) -> Result<(), ApiError>;
}

/// OpenAPI endpoint paths used by the bundled resources.
pub mod endpoints {
    use crate::urn::EntityKind;

    pub const ORGS: &str = "1.0.0/orgs/";
    pub const VDCS: &str = "1.0.0/vdcs/";
    pub const VDC_GROUPS: &str = "1.0.0/vdcGroups/";
    pub const EDGE_GATEWAYS: &str = "1.0.0/edgeGateways/";
    pub const EDGE_GATEWAY_ALB: &str = "1.0.0/edgeGateways/loadBalancer/";
    pub const EDGE_GATEWAY_ROUTE_ADVERTISEMENT: &str = "1.0.0/edgeGateways/routing/advertisement/";
    pub const ORG_VDC_NETWORKS: &str = "1.0.0/orgVdcNetworks/";
    pub const ORG_VDC_NETWORK_DHCP: &str = "1.0.0/orgVdcNetworks/dhcp/";
    pub const NSXT_MANAGERS: &str = "1.0.0/nsxTManagers/";
    pub const ALB_CONTROLLERS: &str = "1.0.0/loadBalancer/controllers/";
    pub const ALB_SERVICE_ENGINE_GROUPS: &str = "1.0.0/loadBalancer/serviceEngineGroups/";
    pub const ALB_SERVICE_ENGINE_GROUP_ASSIGNMENTS: &str =
        "1.0.0/loadBalancer/serviceEngineGroups/assignments/";
    pub const ENTITY_TYPES: &str = "1.0.0/entityTypes/";
    pub const ENTITY_TYPE_BEHAVIORS: &str = "1.0.0/entityTypes/behaviors/";
    pub const ENTITY_TYPE_BEHAVIOR_ACCESS: &str = "1.0.0/entityTypes/behaviorAccessControls/";
    pub const ENTITIES: &str = "1.0.0/entities/";
    pub const SERVICE_ACCOUNTS: &str = "1.0.0/serviceAccounts/";

    /// Entity kind of objects created at `endpoint`, if it creates first-class objects.
    pub fn kind_of(endpoint: &str) -> Option<EntityKind> {
        let kind = match endpoint {
            ORGS => EntityKind::Org,
            VDCS => EntityKind::Vdc,
            VDC_GROUPS => EntityKind::VdcGroup,
            EDGE_GATEWAYS => EntityKind::Gateway,
            ORG_VDC_NETWORKS => EntityKind::Network,
            NSXT_MANAGERS => EntityKind::NsxtManager,
            ALB_CONTROLLERS => EntityKind::LoadBalancerController,
            ALB_SERVICE_ENGINE_GROUPS => EntityKind::ServiceEngineGroup,
            ALB_SERVICE_ENGINE_GROUP_ASSIGNMENTS => EntityKind::ServiceEngineGroupAssignment,
            ENTITY_TYPES => EntityKind::Type,
            ENTITY_TYPE_BEHAVIORS => EntityKind::Behavior,
            ENTITIES => EntityKind::Entity,
            SERVICE_ACCOUNTS => EntityKind::ServiceAccount,
            _ => return None,
        };
        Some(kind)
    }
}

/// Convenience: the kind of objects at `endpoint`, or a validation error.
pub fn kind_for_endpoint(endpoint: &str) -> Result<EntityKind, ProviderError> {
    endpoints::kind_of(endpoint).ok_or_else(|| {
        ProviderError::Validation(format!("endpoint '{}' does not create objects", endpoint))
    })
}
