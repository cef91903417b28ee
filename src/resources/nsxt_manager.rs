//! `vcd_nsxt_manager` data source. System administrators only.

use async_trait::async_trait;

use crate::client::endpoints;
use crate::engine::{DataSourceHandler, OpContext};
use crate::error::Result;
use crate::lookup::{fiql, find_unique};
use crate::mapping::AttributeMap;
use crate::schema::{Attribute, Schema};
use crate::urn::{is_urn, EntityKind, Urn};

use super::{copy_str, object_id};

/// NSX-T manager data source.
pub struct NsxtManagerDataSource;

/// Some listings carry a bare UUID; the state always holds the URN.
fn manager_urn(id: &str) -> Result<String> {
    if is_urn(id) {
        return Ok(id.to_string());
    }
    Ok(Urn::from_bare_id(EntityKind::NsxtManager, id)?.to_string())
}

#[async_trait]
impl DataSourceHandler for NsxtManagerDataSource {
    fn type_name(&self) -> &'static str {
        "vcd_nsxt_manager"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "name",
                Attribute::required_string().with_description("Name of NSX-T Manager"),
            )
            .with_attribute("description", Attribute::computed_string())
            .with_attribute("url", Attribute::computed_string())
            .with_attribute("href", Attribute::computed_string())
    }

    fn requires_sysadmin(&self) -> bool {
        true
    }

    async fn find_by_name(&self, ctx: &OpContext, _config: &AttributeMap, name: &str) -> Result<String> {
        let raw = find_unique(
            ctx,
            endpoints::NSXT_MANAGERS,
            &fiql(&[("name", name)]),
            "NSX-T manager",
        )
        .await?;
        manager_urn(&object_id(&raw, "NSX-T manager")?)
    }

    async fn read(&self, ctx: &OpContext, id: &str, _config: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx.get(endpoints::NSXT_MANAGERS, id).await?;
        let mut attrs = AttributeMap::new();
        copy_str(&mut attrs, "name", &raw, "name");
        copy_str(&mut attrs, "description", &raw, "description");
        copy_str(&mut attrs, "url", &raw, "url");
        attrs.set("href", format!("{}{}", endpoints::NSXT_MANAGERS, id));
        Ok(attrs)
    }
}
