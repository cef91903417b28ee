//! `vcd_network_routed_v2`: an NSX-T routed org VDC network.
//!
//! The network hangs off an edge gateway, so writes lock the edge gateway
//! (or its VDC group). Networks owned by a VDC group cannot carry metadata;
//! asking for it produces a warning instead of an error.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::{endpoints, ObjectRef};
use crate::engine::{DataSourceHandler, OpContext, ResourceHandler};
use crate::error::{ProviderError, Result};
use crate::import::{ImportPath, ImportShape};
use crate::lookup::{fiql, find_unique, Candidate, IpRange, FILTER};
use crate::mapping::{pointer, pointer_str, AttributeMap};
use crate::metadata::{with_computed_metadata_schema, with_metadata_schema, MetadataTarget};
use crate::parent::{EdgeGateway, LockTarget};
use crate::schema::{Attribute, AttributeFlags, AttributeType, Block, NestedBlock, Schema};
use crate::types::ImportedResource;
use crate::urn::is_vdc_group_urn;

use super::{copy_str, object_id, pool_blocks, pool_ranges};

const TYPE_NAME: &str = "vcd_network_routed_v2";

/// Routed network resource.
pub struct RoutedNetwork;

/// Routed network data source.
pub struct RoutedNetworkDataSource;

fn pool_block() -> Block {
    Block::new()
        .with_attribute("start_address", Attribute::required_string())
        .with_attribute("end_address", Attribute::required_string())
}

fn import_shape() -> ImportShape {
    ImportShape::new(["org-name", "vdc-name", "network-name"])
}

fn payload(desired: &AttributeMap, edge: &EdgeGateway) -> Result<Value> {
    Ok(json!({
        "name": desired.string("name")?,
        "description": desired.opt_string("description").unwrap_or_default(),
        "networkType": "NAT_ROUTED",
        "ownerRef": { "id": edge.owner_id },
        "connection": {
            "routerRef": { "id": edge.id, "name": edge.name },
            "connectionType": "INTERNAL",
        },
        "subnets": {
            "values": [{
                "gateway": desired.string("gateway")?,
                "prefixLength": desired.int("prefix_length")?,
                "dnsServer1": desired.opt_string("dns1").unwrap_or_default(),
                "dnsServer2": desired.opt_string("dns2").unwrap_or_default(),
                "dnsSuffix": desired.opt_string("dns_suffix").unwrap_or_default(),
                "ipRanges": { "values": pool_ranges(desired, "static_ip_pool")? },
            }],
        },
    }))
}

/// Attributes shared by the resource and the data source.
fn network_attrs(raw: &Value) -> AttributeMap {
    let mut attrs = AttributeMap::new();
    copy_str(&mut attrs, "name", raw, "name");
    copy_str(&mut attrs, "description", raw, "description");
    copy_str(&mut attrs, "edge_gateway_id", raw, "connection.routerRef.id");
    copy_str(&mut attrs, "owner_id", raw, "ownerRef.id");
    copy_str(&mut attrs, "gateway", raw, "subnets.values.0.gateway");
    attrs.set_opt(
        "prefix_length",
        pointer(raw, "subnets.values.0.prefixLength").and_then(Value::as_i64),
    );
    copy_str(&mut attrs, "dns1", raw, "subnets.values.0.dnsServer1");
    copy_str(&mut attrs, "dns2", raw, "subnets.values.0.dnsServer2");
    copy_str(&mut attrs, "dns_suffix", raw, "subnets.values.0.dnsSuffix");
    attrs.set(
        "static_ip_pool",
        pool_blocks(pointer(raw, "subnets.values.0.ipRanges.values")),
    );
    attrs
}

fn ensure_routed(raw: &Value, name: &str) -> Result<()> {
    match pointer_str(raw, "networkType") {
        Some("NAT_ROUTED") => Ok(()),
        other => Err(ProviderError::Validation(format!(
            "network '{}' is not a routed network (type {})",
            name,
            other.unwrap_or("unknown")
        ))),
    }
}

#[async_trait]
impl ResourceHandler for RoutedNetwork {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn schema(&self) -> Schema {
        let schema = Schema::v0()
            .with_attribute(
                "org",
                Attribute::optional_string()
                    .with_force_new()
                    .with_description("The name of organization to use"),
            )
            .with_attribute(
                "edge_gateway_id",
                Attribute::required_string().with_description("Edge gateway ID"),
            )
            .with_attribute(
                "owner_id",
                Attribute::computed_string().with_description("ID of the VDC or VDC group"),
            )
            .with_attribute("name", Attribute::required_string())
            .with_attribute("description", Attribute::optional_string())
            .with_attribute("gateway", Attribute::required_string().with_force_new())
            .with_attribute("prefix_length", Attribute::required_int64().with_force_new())
            .with_attribute("dns1", Attribute::optional_string())
            .with_attribute("dns2", Attribute::optional_string())
            .with_attribute("dns_suffix", Attribute::optional_string())
            .with_block("static_ip_pool", NestedBlock::set(pool_block()))
            .with_import(import_shape());
        with_metadata_schema(schema)
    }

    fn parent_attribute(&self) -> Option<&'static str> {
        Some("edge_gateway_id")
    }

    fn lock_targets(&self, attrs: &AttributeMap) -> Result<Vec<LockTarget>> {
        Ok(vec![LockTarget::EdgeGateway(attrs.id_ref("edge_gateway_id")?)])
    }

    async fn observed_parent(&self, ctx: &OpContext, id: &str) -> Result<Option<String>> {
        let raw = ctx.get(endpoints::ORG_VDC_NETWORKS, id).await?;
        Ok(pointer_str(&raw, "connection.routerRef.id").map(str::to_string))
    }

    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
        let edge = ctx
            .resolver()
            .edge_gateway(&desired.id_ref("edge_gateway_id")?)
            .await?;
        let created = ctx
            .create(endpoints::ORG_VDC_NETWORKS, payload(desired, &edge)?)
            .await?;
        object_id(&created, "routed network")
    }

    async fn read(&self, ctx: &OpContext, id: &str, _known: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx.get(endpoints::ORG_VDC_NETWORKS, id).await?;
        Ok(network_attrs(&raw))
    }

    async fn update(
        &self,
        ctx: &OpContext,
        id: &str,
        _prior: &AttributeMap,
        desired: &AttributeMap,
        _changed: &BTreeSet<String>,
    ) -> Result<()> {
        let edge = ctx
            .resolver()
            .edge_gateway(&desired.id_ref("edge_gateway_id")?)
            .await?;
        let mut body = payload(desired, &edge)?;
        body["id"] = Value::String(id.to_string());
        ctx.update(endpoints::ORG_VDC_NETWORKS, id, body).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str, _state: &AttributeMap) -> Result<()> {
        ctx.delete(endpoints::ORG_VDC_NETWORKS, id).await
    }

    async fn import(&self, ctx: &OpContext, path: &ImportPath) -> Result<ImportedResource> {
        let org = path.get("org-name")?;
        let name = path.get("network-name")?;
        let resolver = ctx.resolver();
        let org_id = resolver.org(org).await?;
        let owner = resolver.vdc_or_group(&org_id, path.get("vdc-name")?).await?;
        let raw = owner.lookup_network(ctx, name).await?;
        ensure_routed(&raw, name)?;

        let mut attrs = AttributeMap::new();
        attrs.set("org", org);
        attrs.set("name", name);
        copy_str(&mut attrs, "edge_gateway_id", &raw, "connection.routerRef.id");
        Ok(ImportedResource::new(object_id(&raw, "routed network")?, attrs))
    }

    async fn metadata_target(
        &self,
        ctx: &OpContext,
        id: &str,
        attrs: &AttributeMap,
    ) -> Result<MetadataTarget> {
        network_metadata_target(ctx, id, attrs).await
    }
}

/// Networks owned by a VDC group cannot carry metadata.
async fn network_metadata_target(
    ctx: &OpContext,
    id: &str,
    attrs: &AttributeMap,
) -> Result<MetadataTarget> {
    let owner = match attrs.opt_string("owner_id") {
        Some(owner) => owner,
        None => {
            let raw = ctx.get(endpoints::ORG_VDC_NETWORKS, id).await?;
            pointer_str(&raw, "ownerRef.id").unwrap_or_default().to_string()
        },
    };
    if is_vdc_group_urn(&owner) {
        return Ok(MetadataTarget::Unsupported(format!(
            "metadata is not supported on networks owned by a VDC group (network {})",
            id
        )));
    }
    Ok(MetadataTarget::Object(ObjectRef::new(
        endpoints::ORG_VDC_NETWORKS,
        id,
    )))
}

fn list_filter(config: &AttributeMap, extra: &[(&str, &str)]) -> String {
    let edge = config.opt_string("edge_gateway_id");
    let mut terms: Vec<(&str, &str)> = vec![("networkType", "NAT_ROUTED")];
    if let Some(edge) = edge.as_deref() {
        terms.push(("connection.routerRef.id", edge));
    }
    terms.extend_from_slice(extra);
    fiql(&terms)
}

#[async_trait]
impl DataSourceHandler for RoutedNetworkDataSource {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn schema(&self) -> Schema {
        let pool = AttributeType::object(HashMap::from([
            ("start_address".to_string(), AttributeType::String),
            ("end_address".to_string(), AttributeType::String),
        ]));
        let filter = Block::new()
            .with_attribute("name_regex", Attribute::optional_string())
            .with_attribute("ip", Attribute::optional_string());
        let schema = Schema::v0()
            .with_attribute("org", Attribute::optional_string())
            .with_attribute("edge_gateway_id", Attribute::optional_computed_string())
            .with_attribute(
                "name",
                Attribute::optional_string().conflicts_with([FILTER]),
            )
            .with_block(
                FILTER,
                NestedBlock::list(filter)
                    .with_max_items(1)
                    .conflicts_with(["name"]),
            )
            .with_attribute("owner_id", Attribute::computed_string())
            .with_attribute("description", Attribute::computed_string())
            .with_attribute("gateway", Attribute::computed_string())
            .with_attribute("prefix_length", Attribute::computed_int64())
            .with_attribute("dns1", Attribute::computed_string())
            .with_attribute("dns2", Attribute::computed_string())
            .with_attribute("dns_suffix", Attribute::computed_string())
            .with_attribute(
                "static_ip_pool",
                Attribute::new(AttributeType::set(pool), AttributeFlags::computed()),
            );
        with_computed_metadata_schema(schema)
    }

    async fn find_by_name(&self, ctx: &OpContext, config: &AttributeMap, name: &str) -> Result<String> {
        let filter = list_filter(config, &[("name", name)]);
        let raw = find_unique(ctx, endpoints::ORG_VDC_NETWORKS, &filter, "routed network").await?;
        object_id(&raw, "routed network")
    }

    async fn candidates(&self, ctx: &OpContext, config: &AttributeMap) -> Result<Vec<Candidate>> {
        let filter = list_filter(config, &[]);
        let networks = ctx.list(endpoints::ORG_VDC_NETWORKS, Some(&filter)).await?;
        networks.iter().map(candidate).collect()
    }

    async fn read(&self, ctx: &OpContext, id: &str, _config: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx.get(endpoints::ORG_VDC_NETWORKS, id).await?;
        Ok(network_attrs(&raw))
    }

    async fn metadata_target(
        &self,
        ctx: &OpContext,
        id: &str,
        attrs: &AttributeMap,
    ) -> Result<MetadataTarget> {
        network_metadata_target(ctx, id, attrs).await
    }
}

/// A network as a filter candidate: its subnet plus its static pools.
fn candidate(raw: &Value) -> Result<Candidate> {
    let mut candidate = Candidate::new(
        object_id(raw, "routed network")?,
        pointer_str(raw, "name").unwrap_or_default(),
    );
    let gateway = pointer_str(raw, "subnets.values.0.gateway");
    let prefix = pointer(raw, "subnets.values.0.prefixLength").and_then(Value::as_u64);
    if let (Some(gateway), Some(prefix)) = (gateway, prefix) {
        let prefix = u32::try_from(prefix).unwrap_or(u32::MAX);
        candidate = candidate.with_range(IpRange::from_cidr(gateway, prefix)?);
    }
    let pools = pointer(raw, "subnets.values.0.ipRanges.values")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for pool in &pools {
        if let (Some(start), Some(end)) = (
            pointer_str(pool, "startAddress"),
            pointer_str(pool, "endAddress"),
        ) {
            candidate = candidate.with_range(IpRange::parse(start, end)?);
        }
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_network() -> Value {
        json!({
            "id": "urn:vcloud:network:11111111-1111-1111-1111-111111111111",
            "name": "net1",
            "networkType": "NAT_ROUTED",
            "ownerRef": { "id": "urn:vcloud:vdc:22222222-2222-2222-2222-222222222222" },
            "connection": { "routerRef": { "id": "urn:vcloud:gateway:33333333-3333-3333-3333-333333333333" } },
            "subnets": { "values": [{
                "gateway": "10.10.0.1",
                "prefixLength": 24,
                "ipRanges": { "values": [{ "startAddress": "10.10.0.10", "endAddress": "10.10.0.20" }] },
            }]},
        })
    }

    #[test]
    fn test_network_attrs() {
        let attrs = network_attrs(&raw_network());
        assert_eq!(attrs.string("name").unwrap(), "net1");
        assert_eq!(attrs.int("prefix_length").unwrap(), 24);
        assert_eq!(
            attrs.string("edge_gateway_id").unwrap(),
            "urn:vcloud:gateway:33333333-3333-3333-3333-333333333333"
        );
        assert_eq!(attrs.objects("static_ip_pool").len(), 1);
        assert_eq!(attrs.opt_string("dns1"), None);
    }

    #[test]
    fn test_candidate_ranges() {
        let candidate = candidate(&raw_network()).unwrap();
        assert_eq!(candidate.ranges.len(), 2);
        assert!(candidate.ranges[1].contains("10.10.0.15".parse().unwrap()));
    }

    #[test]
    fn test_only_routed_networks_import() {
        assert!(ensure_routed(&raw_network(), "net1").is_ok());
        let isolated = json!({ "networkType": "ISOLATED" });
        assert!(ensure_routed(&isolated, "iso").is_err());
    }

    #[test]
    fn test_import_shape_message() {
        let err = import_shape().parse("orgA.vdcB", ".").unwrap_err();
        assert!(err
            .to_string()
            .contains("resource name must be specified as org-name.vdc-name.network-name"));
    }

    #[test]
    fn test_list_filter() {
        let config = AttributeMap::from_value(json!({ "edge_gateway_id": "urn:e" })).unwrap();
        assert_eq!(
            list_filter(&config, &[("name", "n")]),
            "networkType==NAT_ROUTED;connection.routerRef.id==urn%3Ae;name==n"
        );
    }
}
