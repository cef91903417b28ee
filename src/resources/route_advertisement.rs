//! `vcd_nsxt_route_advertisement`: subnets an edge gateway advertises.
//!
//! Only edge gateways on a dedicated Tier-0 gateway can advertise routes.
//! The resource ID is the edge gateway ID.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::endpoints;
use crate::engine::{OpContext, ResourceHandler};
use crate::error::Result;
use crate::import::{ImportPath, ImportShape};
use crate::mapping::{pointer, AttributeMap};
use crate::parent::LockTarget;
use crate::schema::{Attribute, Schema};
use crate::types::ImportedResource;

use super::copy_bool;

/// Route advertisement resource.
pub struct RouteAdvertisement;

impl RouteAdvertisement {
    fn payload(&self, desired: &AttributeMap) -> Result<Value> {
        let subnets: Vec<String> = desired.string_set("subnets").into_iter().collect();
        Ok(json!({
            "enable": desired.bool_or_default("enabled", &self.schema())?,
            "subnets": subnets,
        }))
    }
}

#[async_trait]
impl ResourceHandler for RouteAdvertisement {
    fn type_name(&self) -> &'static str {
        "vcd_nsxt_route_advertisement"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("org", Attribute::optional_string().with_force_new())
            .with_attribute(
                "edge_gateway_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("NSX-T Edge Gateway ID in which route advertisement is located"),
            )
            .with_attribute(
                "enabled",
                Attribute::optional_bool().with_default(json!(true)),
            )
            .with_attribute("subnets", Attribute::optional_string_set())
            .with_import(ImportShape::new([
                "org-name",
                "vdc-or-vdc-group-name",
                "nsxt-edge-gw-name",
            ]))
    }

    fn lock_targets(&self, attrs: &AttributeMap) -> Result<Vec<LockTarget>> {
        Ok(vec![LockTarget::EdgeGateway(attrs.id_ref("edge_gateway_id")?)])
    }

    async fn check_preconditions(&self, ctx: &OpContext, attrs: &AttributeMap) -> Result<()> {
        ctx.resolver()
            .edge_gateway(&attrs.id_ref("edge_gateway_id")?)
            .await?
            .ensure_dedicated()
    }

    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
        let edge_id = desired.id_ref("edge_gateway_id")?;
        ctx.put(
            endpoints::EDGE_GATEWAY_ROUTE_ADVERTISEMENT,
            &edge_id,
            self.payload(desired)?,
        )
        .await?;
        Ok(edge_id)
    }

    async fn read(&self, ctx: &OpContext, id: &str, _known: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx
            .get(endpoints::EDGE_GATEWAY_ROUTE_ADVERTISEMENT, id)
            .await?;
        let mut attrs = AttributeMap::new();
        attrs.set("edge_gateway_id", id);
        copy_bool(&mut attrs, "enabled", &raw, "enable", false);
        attrs.set(
            "subnets",
            pointer(&raw, "subnets").cloned().unwrap_or_else(|| json!([])),
        );
        Ok(attrs)
    }

    async fn update(
        &self,
        ctx: &OpContext,
        id: &str,
        _prior: &AttributeMap,
        desired: &AttributeMap,
        _changed: &BTreeSet<String>,
    ) -> Result<()> {
        ctx.put(
            endpoints::EDGE_GATEWAY_ROUTE_ADVERTISEMENT,
            id,
            self.payload(desired)?,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str, _state: &AttributeMap) -> Result<()> {
        ctx.delete(endpoints::EDGE_GATEWAY_ROUTE_ADVERTISEMENT, id)
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

        let mut attrs = AttributeMap::new();
        attrs.set("org", org);
        attrs.set("edge_gateway_id", edge.id.as_str());
        Ok(ImportedResource::new(edge.id, attrs))
    }
}
