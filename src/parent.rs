//! Parent resolution.
//!
//! Maps a resource's parent references onto the named mutex that guards
//! them. An edge gateway owned by a VDC group is locked through the group,
//! since every edge gateway of that group shares its network context.
//! Resolution failures surface before any lock is taken.

use serde_json::Value;
use tracing::debug;

use crate::client::endpoints;
use crate::engine::OpContext;
use crate::error::{ProviderError, Result};
use crate::lookup::{find_unique, fiql};
use crate::mapping::{pointer, pointer_str};
use crate::mutex::{lock_order, ParentLockKey};
use crate::urn::is_vdc_group_urn;

/// A reference to an owning VDC or VDC group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    /// URN of the owner.
    pub id: String,
    /// Name of the owner.
    pub name: String,
    /// Whether the owner is backed by NSX-T.
    pub is_nsxt: bool,
}

/// The owner of an edge gateway or network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentOwner {
    /// A single VDC.
    Vdc(OwnerRef),
    /// A VDC group.
    VdcGroup(OwnerRef),
}

impl ParentOwner {
    /// Classify an owner reference by the kind in its URN.
    pub fn from_ref(owner: OwnerRef) -> Self {
        if is_vdc_group_urn(&owner.id) {
            Self::VdcGroup(owner)
        } else {
            Self::Vdc(owner)
        }
    }

    fn owner(&self) -> &OwnerRef {
        match self {
            Self::Vdc(owner) | Self::VdcGroup(owner) => owner,
        }
    }

    /// URN of the owner.
    pub fn id(&self) -> &str {
        &self.owner().id
    }

    /// Name of the owner.
    pub fn name(&self) -> &str {
        &self.owner().name
    }

    /// Whether the owner is a VDC group.
    pub fn is_vdc_group(&self) -> bool {
        matches!(self, Self::VdcGroup(_))
    }

    /// Whether the owner is backed by NSX-T.
    pub fn is_nsxt(&self) -> bool {
        self.owner().is_nsxt
    }

    /// Find an edge gateway owned by this VDC or group.
    pub async fn lookup_edge_gateway(&self, ctx: &OpContext, name: &str) -> Result<EdgeGateway> {
        let filter = fiql(&[("name", name), ("ownerRef.id", self.id())]);
        let raw = find_unique(ctx, endpoints::EDGE_GATEWAYS, &filter, "edge gateway").await?;
        EdgeGateway::from_value(&raw)
    }

    /// Find an org VDC network owned by this VDC or group.
    pub async fn lookup_network(&self, ctx: &OpContext, name: &str) -> Result<Value> {
        let filter = fiql(&[("name", name), ("ownerRef.id", self.id())]);
        find_unique(ctx, endpoints::ORG_VDC_NETWORKS, &filter, "network").await
    }

    fn from_value(raw: &Value) -> Result<Self> {
        let id = required_str(raw, "id", "owner")?;
        Ok(Self::from_ref(OwnerRef {
            id: id.to_string(),
            name: pointer_str(raw, "name").unwrap_or_default().to_string(),
            is_nsxt: pointer_str(raw, "networkProviderType") == Some("NSX_T"),
        }))
    }
}

/// An NSX-T edge gateway as seen by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeGateway {
    /// URN of the edge gateway.
    pub id: String,
    /// Name of the edge gateway.
    pub name: String,
    /// URN of the owning VDC or group.
    pub owner_id: String,
    /// Whether the first uplink is in dedicated mode.
    pub dedicated: bool,
}

impl EdgeGateway {
    /// Decode an edge gateway object.
    pub fn from_value(raw: &Value) -> Result<Self> {
        Ok(Self {
            id: required_str(raw, "id", "edge gateway")?.to_string(),
            name: pointer_str(raw, "name").unwrap_or_default().to_string(),
            owner_id: required_str(raw, "ownerRef.id", "edge gateway")?.to_string(),
            dedicated: pointer(raw, "edgeGatewayUplinks.0.dedicated")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Whether the owner is a VDC group.
    pub fn owned_by_vdc_group(&self) -> bool {
        is_vdc_group_urn(&self.owner_id)
    }

    /// The mutex guarding children of this edge gateway.
    pub fn lock_key(&self) -> ParentLockKey {
        if self.owned_by_vdc_group() {
            ParentLockKey::new(&self.owner_id)
        } else {
            ParentLockKey::new(&self.id)
        }
    }

    /// Fail unless the edge gateway uplink is dedicated.
    pub fn ensure_dedicated(&self) -> Result<()> {
        if self.dedicated {
            return Ok(());
        }
        Err(ProviderError::Precondition(format!(
            "edge gateway '{}' ({}) must use a dedicated Tier-0 gateway or VRF",
            self.name, self.id
        )))
    }
}

fn required_str<'a>(raw: &'a Value, path: &str, what: &str) -> Result<&'a str> {
    pointer_str(raw, path).ok_or_else(|| {
        ProviderError::Validation(format!("{} object has no '{}' field", what, path))
    })
}

/// A parent a resource must lock before mutating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTarget {
    /// An edge gateway, locked through its VDC group owner when it has one.
    EdgeGateway(String),
    /// The parent of an org VDC network.
    Network(String),
    /// A vApp, identified by org, VDC and name.
    VApp {
        /// Org name.
        org: String,
        /// VDC name.
        vdc: String,
        /// vApp name.
        name: String,
    },
    /// A resource kind scoped to one parent, e.g. ACLs of one RDE type.
    Scoped {
        /// Resource kind.
        kind: String,
        /// Parent ID.
        parent: String,
    },
    /// A fixed key.
    Key(ParentLockKey),
}

impl LockTarget {
    /// The key used when the parent can no longer be looked up.
    pub fn fallback_key(&self) -> ParentLockKey {
        match self {
            Self::EdgeGateway(id) | Self::Network(id) => ParentLockKey::new(id),
            Self::VApp { org, vdc, name } => vapp_key(org, vdc, name),
            Self::Scoped { kind, parent } => ParentLockKey::scoped(kind, parent),
            Self::Key(key) => key.clone(),
        }
    }
}

fn vapp_key(org: &str, vdc: &str, name: &str) -> ParentLockKey {
    ParentLockKey::new(format!("org:{}|vdc:{}|vapp:{}", org, vdc, name))
}

/// Resolves parent references through the SDK.
pub struct ParentResolver<'a> {
    ctx: &'a OpContext,
}

impl<'a> ParentResolver<'a> {
    /// Create a resolver bound to one operation.
    pub fn new(ctx: &'a OpContext) -> Self {
        Self { ctx }
    }

    /// Find an organization by name and return its URN.
    pub async fn org(&self, name: &str) -> Result<String> {
        let raw = find_unique(self.ctx, endpoints::ORGS, &fiql(&[("name", name)]), "org").await?;
        Ok(required_str(&raw, "id", "org")?.to_string())
    }

    /// Find a VDC, or failing that a VDC group, by name within an org.
    pub async fn vdc_or_group(&self, org_id: &str, name: &str) -> Result<ParentOwner> {
        let filter = fiql(&[("name", name), ("org.id", org_id)]);
        match find_unique(self.ctx, endpoints::VDCS, &filter, "VDC").await {
            Ok(raw) => ParentOwner::from_value(&raw),
            Err(err) if err.is_not_found() => {
                let raw =
                    find_unique(self.ctx, endpoints::VDC_GROUPS, &filter, "VDC or VDC group")
                        .await?;
                ParentOwner::from_value(&raw)
            },
            Err(err) => Err(err),
        }
    }

    /// Fetch an edge gateway.
    pub async fn edge_gateway(&self, id: &str) -> Result<EdgeGateway> {
        let raw = self.ctx.get(endpoints::EDGE_GATEWAYS, id).await?;
        EdgeGateway::from_value(&raw)
    }

    /// The edge gateway a network is connected to, if any.
    pub async fn network_edge_gateway(&self, network_id: &str) -> Result<Option<String>> {
        let raw = self.ctx.get(endpoints::ORG_VDC_NETWORKS, network_id).await?;
        Ok(pointer_str(&raw, "connection.routerRef.id").map(str::to_string))
    }

    /// Resolve one target to its mutex key.
    pub async fn resolve(&self, target: &LockTarget) -> Result<ParentLockKey> {
        let key = match target {
            LockTarget::EdgeGateway(id) => self.edge_gateway(id).await?.lock_key(),
            LockTarget::Network(id) => {
                let raw = self.ctx.get(endpoints::ORG_VDC_NETWORKS, id).await?;
                match pointer_str(&raw, "connection.routerRef.id") {
                    Some(edge_id) => self.edge_gateway(edge_id).await?.lock_key(),
                    None => match pointer_str(&raw, "ownerRef.id") {
                        Some(owner) if is_vdc_group_urn(owner) => ParentLockKey::new(owner),
                        _ => ParentLockKey::new(id),
                    },
                }
            },
            other => other.fallback_key(),
        };
        debug!(resource = %self.ctx.resource(), key = %key, "resolved parent lock");
        Ok(key)
    }

    /// Resolve every target, returning keys in acquisition order.
    pub async fn resolve_all(&self, targets: &[LockTarget]) -> Result<Vec<ParentLockKey>> {
        let mut keys = Vec::with_capacity(targets.len());
        for target in targets {
            keys.push(self.resolve(target).await?);
        }
        Ok(lock_order(keys))
    }

    /// Like [`resolve_all`], but a vanished parent falls back to its raw ID.
    ///
    /// Used on delete, where the parent may already be gone.
    ///
    /// [`resolve_all`]: ParentResolver::resolve_all
    pub async fn resolve_all_or_fallback(&self, targets: &[LockTarget]) -> Result<Vec<ParentLockKey>> {
        let mut keys = Vec::with_capacity(targets.len());
        for target in targets {
            match self.resolve(target).await {
                Ok(key) => keys.push(key),
                Err(err) if err.is_not_found() => keys.push(target.fallback_key()),
                Err(err) => return Err(err),
            }
        }
        Ok(lock_order(keys))
    }
}

/// Fail when the stored parent reference no longer matches the observed one.
pub fn check_parent_unchanged(attribute: &str, stored: &str, observed: &str) -> Result<()> {
    if stored.is_empty() || observed.is_empty() || stored == observed {
        return Ok(());
    }
    Err(ProviderError::Validation(format!(
        "\"{}\" is stale: state has '{}' but VCD reports '{}'; refresh before changing this resource",
        attribute, stored, observed
    )))
}
