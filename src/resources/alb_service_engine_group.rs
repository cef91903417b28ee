//! `vcd_nsxt_alb_edgegateway_service_engine_group`: assigns an ALB service
//! engine group to an edge gateway.
//!
//! The assignment touches two parents, so it locks both the edge gateway
//! key and the service engine group key, in sorted order.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::endpoints;
use crate::engine::{OpContext, ResourceHandler};
use crate::error::{ProviderError, Result};
use crate::import::{ImportPath, ImportShape};
use crate::lookup::{fiql, find_unique};
use crate::mapping::{int_to_string_attr, pointer, pointer_str, AttributeMap};
use crate::mutex::ParentLockKey;
use crate::parent::LockTarget;
use crate::schema::{Attribute, Schema};
use crate::types::ImportedResource;

use super::{copy_str, object_id};

/// ALB service engine group assignment resource.
pub struct AlbServiceEngineGroupAssignment;

fn payload(desired: &AttributeMap) -> Result<Value> {
    Ok(json!({
        "gatewayRef": { "id": desired.id_ref("edge_gateway_id")? },
        "serviceEngineGroupRef": { "id": desired.id_ref("service_engine_group_id")? },
        "maxVirtualServices": desired.int_from_string("max_virtual_services")?,
        "minVirtualServices": desired.int_from_string("reserved_virtual_services")?,
    }))
}

fn assignment_attrs(raw: &Value) -> AttributeMap {
    let mut attrs = AttributeMap::new();
    copy_str(&mut attrs, "edge_gateway_id", raw, "gatewayRef.id");
    copy_str(&mut attrs, "service_engine_group_id", raw, "serviceEngineGroupRef.id");
    copy_str(&mut attrs, "service_engine_group_name", raw, "serviceEngineGroupRef.name");
    let int = |path: &str| pointer(raw, path).and_then(Value::as_i64);
    attrs.set(
        "max_virtual_services",
        int_to_string_attr(int("maxVirtualServices")),
    );
    attrs.set(
        "reserved_virtual_services",
        int_to_string_attr(int("minVirtualServices")),
    );
    attrs.set(
        "deployed_virtual_services",
        int("numDeployedVirtualServices").unwrap_or(0),
    );
    attrs
}

#[async_trait]
impl ResourceHandler for AlbServiceEngineGroupAssignment {
    fn type_name(&self) -> &'static str {
        "vcd_nsxt_alb_edgegateway_service_engine_group"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("org", Attribute::optional_string().with_force_new())
            .with_attribute(
                "edge_gateway_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("Edge Gateway ID in which ALB Service Engine Group should be located"),
            )
            .with_attribute(
                "service_engine_group_id",
                Attribute::required_string().with_force_new(),
            )
            .with_attribute("service_engine_group_name", Attribute::computed_string())
            .with_attribute(
                "max_virtual_services",
                Attribute::optional_int_string()
                    .with_description("Maximum number of virtual services to be used in this Service Engine Group"),
            )
            .with_attribute(
                "reserved_virtual_services",
                Attribute::optional_int_string()
                    .with_description("Number of reserved virtual services for this Service Engine Group"),
            )
            .with_attribute("deployed_virtual_services", Attribute::computed_int64())
            .with_import(ImportShape::new([
                "org-name",
                "vdc-or-vdc-group-name",
                "nsxt-edge-gw-name",
                "se-group-name",
            ]))
    }

    fn parent_attribute(&self) -> Option<&'static str> {
        Some("edge_gateway_id")
    }

    fn lock_targets(&self, attrs: &AttributeMap) -> Result<Vec<LockTarget>> {
        Ok(vec![
            LockTarget::EdgeGateway(attrs.id_ref("edge_gateway_id")?),
            LockTarget::Key(ParentLockKey::new(attrs.id_ref("service_engine_group_id")?)),
        ])
    }

    async fn check_preconditions(&self, ctx: &OpContext, attrs: &AttributeMap) -> Result<()> {
        let edge_id = attrs.id_ref("edge_gateway_id")?;
        let enabled = match ctx.get(endpoints::EDGE_GATEWAY_ALB, &edge_id).await {
            Ok(raw) => pointer(&raw, "enabled").and_then(Value::as_bool).unwrap_or(false),
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(err),
        };
        if !enabled {
            return Err(ProviderError::Precondition(format!(
                "ALB is not enabled on edge gateway {}",
                edge_id
            )));
        }
        Ok(())
    }

    async fn observed_parent(&self, ctx: &OpContext, id: &str) -> Result<Option<String>> {
        let raw = ctx
            .get(endpoints::ALB_SERVICE_ENGINE_GROUP_ASSIGNMENTS, id)
            .await?;
        Ok(pointer_str(&raw, "gatewayRef.id").map(str::to_string))
    }

    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
        let created = ctx
            .create(endpoints::ALB_SERVICE_ENGINE_GROUP_ASSIGNMENTS, payload(desired)?)
            .await?;
        object_id(&created, "service engine group assignment")
    }

    async fn read(&self, ctx: &OpContext, id: &str, _known: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx
            .get(endpoints::ALB_SERVICE_ENGINE_GROUP_ASSIGNMENTS, id)
            .await?;
        Ok(assignment_attrs(&raw))
    }

    async fn update(
        &self,
        ctx: &OpContext,
        id: &str,
        _prior: &AttributeMap,
        desired: &AttributeMap,
        _changed: &BTreeSet<String>,
    ) -> Result<()> {
        let mut body = payload(desired)?;
        body["id"] = Value::String(id.to_string());
        ctx.update(endpoints::ALB_SERVICE_ENGINE_GROUP_ASSIGNMENTS, id, body)
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str, _state: &AttributeMap) -> Result<()> {
        ctx.delete(endpoints::ALB_SERVICE_ENGINE_GROUP_ASSIGNMENTS, id)
            .await
    }

    async fn import(&self, ctx: &OpContext, path: &ImportPath) -> Result<ImportedResource> {
        let org = path.get("org-name")?;
        let resolver = ctx.resolver();
        let org_id = resolver.org(org).await?;
        let owner = resolver
            .vdc_or_group(&org_id, path.get("vdc-or-vdc-group-name")?)
            .await?;
        let edge = owner
            .lookup_edge_gateway(ctx, path.get("nsxt-edge-gw-name")?)
            .await?;

        let se_group = find_unique(
            ctx,
            endpoints::ALB_SERVICE_ENGINE_GROUPS,
            &fiql(&[("name", path.get("se-group-name")?)]),
            "service engine group",
        )
        .await?;
        let se_group_id = object_id(&se_group, "service engine group")?;

        let filter = fiql(&[
            ("gatewayRef.id", edge.id.as_str()),
            ("serviceEngineGroupRef.id", se_group_id.as_str()),
        ]);
        let assignment = find_unique(
            ctx,
            endpoints::ALB_SERVICE_ENGINE_GROUP_ASSIGNMENTS,
            &filter,
            "service engine group assignment",
        )
        .await?;

        let mut attrs = AttributeMap::new();
        attrs.set("org", org);
        attrs.set("edge_gateway_id", edge.id.as_str());
        attrs.set("service_engine_group_id", se_group_id.as_str());
        Ok(ImportedResource::new(
            object_id(&assignment, "service engine group assignment")?,
            attrs,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_strings_map_to_optional_ints() {
        let desired = AttributeMap::from_value(json!({
            "edge_gateway_id": "urn:vcloud:gateway:1",
            "service_engine_group_id": "urn:vcloud:serviceenginegroup:2",
            "max_virtual_services": "0",
        }))
        .unwrap();
        let body = payload(&desired).unwrap();
        assert_eq!(body["maxVirtualServices"], json!(0));
        assert_eq!(body["minVirtualServices"], Value::Null);
    }

    #[test]
    fn test_absent_and_zero_read_differently() {
        let attrs = assignment_attrs(&json!({
            "gatewayRef": { "id": "urn:e" },
            "serviceEngineGroupRef": { "id": "urn:s", "name": "seg" },
            "maxVirtualServices": 0,
            "minVirtualServices": null,
        }));
        assert_eq!(attrs.get("max_virtual_services"), Some(&json!("0")));
        assert_eq!(attrs.get("reserved_virtual_services"), Some(&json!("")));
        assert_eq!(attrs.opt_int("deployed_virtual_services"), Some(0));
    }

    #[test]
    fn test_locks_both_parents() {
        let attrs = AttributeMap::from_value(json!({
            "edge_gateway_id": "urn:e",
            "service_engine_group_id": "urn:s",
        }))
        .unwrap();
        let targets = AlbServiceEngineGroupAssignment.lock_targets(&attrs).unwrap();
        assert_eq!(targets.len(), 2);
    }
}
