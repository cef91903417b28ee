//! `vcd_nsxt_network_dhcp`: DHCP service on an NSX-T org VDC network.
//!
//! DHCP is a sub-resource of the network: its ID is the network ID and it is
//! written with a PUT. Disabling it counts as deletion.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::{endpoints, ApiVersion};
use crate::engine::{OpContext, ResourceHandler};
use crate::error::{ProviderError, Result};
use crate::import::{ImportPath, ImportShape};
use crate::mapping::{pointer, AttributeMap, VersionGate};
use crate::parent::LockTarget;
use crate::schema::{Attribute, AttributeFlags, AttributeType, Block, NestedBlock, Schema, Validator};
use crate::types::ImportedResource;

use super::{copy_str, object_id, pool_blocks, pool_ranges};

const DEFAULT_LEASE_TIME: i64 = 86400;

/// NSX-T network DHCP resource.
pub struct NetworkDhcp;

fn dns_servers_gate() -> VersionGate {
    VersionGate::new(ApiVersion::new(36, 1), "10.3.1")
}

fn payload(desired: &AttributeMap) -> Result<Value> {
    let pools: Vec<Value> = pool_ranges(desired, "pool")?
        .into_iter()
        .map(|range| json!({ "enabled": true, "ipRange": range }))
        .collect();
    let mut body = json!({
        "enabled": true,
        "mode": desired.opt_string("mode").unwrap_or_else(|| "EDGE".to_string()),
        "leaseTime": desired.opt_int("lease_time").unwrap_or(DEFAULT_LEASE_TIME),
        "dhcpPools": pools,
    });
    if let Some(listener) = desired.opt_string("listener_ip_address") {
        body["ipAddress"] = Value::String(listener);
    }
    let dns = desired.string_list("dns_servers");
    if !dns.is_empty() {
        body["dnsServers"] = json!(dns);
    }
    Ok(body)
}

fn dhcp_attrs(id: &str, raw: &Value) -> AttributeMap {
    let mut attrs = AttributeMap::new();
    attrs.set("org_network_id", id);
    copy_str(&mut attrs, "mode", raw, "mode");
    copy_str(&mut attrs, "listener_ip_address", raw, "ipAddress");
    attrs.set(
        "lease_time",
        pointer(raw, "leaseTime")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_LEASE_TIME),
    );
    let dns: Vec<Value> = pointer(raw, "dnsServers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    attrs.set("dns_servers", Value::Array(dns));

    let ranges: Vec<Value> = pointer(raw, "dhcpPools")
        .and_then(Value::as_array)
        .map(|pools| pools.iter().filter_map(|p| p.get("ipRange").cloned()).collect())
        .unwrap_or_default();
    attrs.set("pool", pool_blocks(Some(&Value::Array(ranges))));
    attrs
}

#[async_trait]
impl ResourceHandler for NetworkDhcp {
    fn type_name(&self) -> &'static str {
        "vcd_nsxt_network_dhcp"
    }

    fn schema(&self) -> Schema {
        let pool = Block::new()
            .with_attribute("start_address", Attribute::required_string())
            .with_attribute("end_address", Attribute::required_string());
        Schema::v0()
            .with_attribute("org", Attribute::optional_string().with_force_new())
            .with_attribute(
                "org_network_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("Parent Org VDC network ID"),
            )
            .with_attribute(
                "mode",
                Attribute::optional_computed_string()
                    .with_force_new()
                    .with_validator(Validator::one_of(["EDGE", "NETWORK", "RELAY"])),
            )
            .with_attribute(
                "listener_ip_address",
                Attribute::optional_computed_string().with_force_new(),
            )
            .with_attribute(
                "lease_time",
                Attribute::new(AttributeType::Int64, AttributeFlags::optional_computed()),
            )
            .with_attribute(
                "dns_servers",
                Attribute::new(
                    AttributeType::list(AttributeType::String),
                    AttributeFlags::optional(),
                )
                .with_description("The DNS server IPs to be assigned by this DHCP service")
                .since(dns_servers_gate()),
            )
            .with_block("pool", NestedBlock::set(pool))
            .with_import(ImportShape::new(["org-name", "vdc-or-vdc-group-name", "network-name"]))
    }

    fn lock_targets(&self, attrs: &AttributeMap) -> Result<Vec<LockTarget>> {
        Ok(vec![LockTarget::Network(attrs.id_ref("org_network_id")?)])
    }

    async fn check_preconditions(&self, _ctx: &OpContext, attrs: &AttributeMap) -> Result<()> {
        let mode = attrs.opt_string("mode").unwrap_or_else(|| "EDGE".to_string());
        if mode == "NETWORK" && attrs.opt_string("listener_ip_address").is_none() {
            return Err(ProviderError::Validation(
                "\"listener_ip_address\": required when mode is NETWORK".to_string(),
            ));
        }
        if attrs.string_list("dns_servers").len() > 2 {
            return Err(ProviderError::Validation(
                "\"dns_servers\": at most 2 DNS servers can be set".to_string(),
            ));
        }
        Ok(())
    }

    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
        let network_id = desired.id_ref("org_network_id")?;
        ctx.put(endpoints::ORG_VDC_NETWORK_DHCP, &network_id, payload(desired)?)
            .await?;
        Ok(network_id)
    }

    async fn read(&self, ctx: &OpContext, id: &str, _known: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx.get(endpoints::ORG_VDC_NETWORK_DHCP, id).await?;
        if pointer(&raw, "enabled").and_then(Value::as_bool) == Some(false) {
            return Err(ProviderError::NotFound(format!(
                "DHCP is disabled on network {}",
                id
            )));
        }
        Ok(dhcp_attrs(id, &raw))
    }

    async fn update(
        &self,
        ctx: &OpContext,
        id: &str,
        _prior: &AttributeMap,
        desired: &AttributeMap,
        _changed: &BTreeSet<String>,
    ) -> Result<()> {
        ctx.put(endpoints::ORG_VDC_NETWORK_DHCP, id, payload(desired)?)
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str, _state: &AttributeMap) -> Result<()> {
        ctx.delete(endpoints::ORG_VDC_NETWORK_DHCP, id).await
    }

    async fn import(&self, ctx: &OpContext, path: &ImportPath) -> Result<ImportedResource> {
        let org = path.get("org-name")?;
        let resolver = ctx.resolver();
        let org_id = resolver.org(org).await?;
        let owner = resolver
            .vdc_or_group(&org_id, path.get("vdc-or-vdc-group-name")?)
            .await?;
        let network = owner.lookup_network(ctx, path.get("network-name")?).await?;
        let id = object_id(&network, "network")?;

        let mut attrs = AttributeMap::new();
        attrs.set("org", org);
        attrs.set("org_network_id", id.as_str());
        Ok(ImportedResource::new(id, attrs))
    }
}
