//! `vcd_nsxt_alb_controller`: registers an NSX-T ALB controller.
//!
//! Provider-level object; only system administrators can manage it. The
//! password is write-only and is never read back from VCD.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::endpoints;
use crate::engine::{OpContext, ResourceHandler};
use crate::error::Result;
use crate::import::{ImportPath, ImportShape};
use crate::lookup::{fiql, find_unique};
use crate::mapping::AttributeMap;
use crate::schema::{Attribute, Schema, Validator};
use crate::types::ImportedResource;

use super::{copy_str, object_id};

/// ALB controller resource.
pub struct AlbController;

fn payload(desired: &AttributeMap) -> Result<Value> {
    let mut body = json!({
        "name": desired.string("name")?,
        "description": desired.opt_string("description").unwrap_or_default(),
        "url": desired.string("url")?,
        "username": desired.string("username")?,
        "password": desired.string("password")?,
    });
    if let Some(license) = desired.opt_string("license_type") {
        body["licenseType"] = Value::String(license);
    }
    Ok(body)
}

#[async_trait]
impl ResourceHandler for AlbController {
    fn type_name(&self) -> &'static str {
        "vcd_nsxt_alb_controller"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("description", Attribute::optional_string())
            .with_attribute("url", Attribute::required_string())
            .with_attribute("username", Attribute::required_string())
            .with_attribute("password", Attribute::required_string().sensitive())
            .with_attribute(
                "license_type",
                Attribute::optional_computed_string()
                    .with_validator(Validator::one_of(["BASIC", "ENTERPRISE"])),
            )
            .with_attribute("version", Attribute::computed_string())
            .with_import(ImportShape::new(["controller-name"]))
    }

    fn requires_sysadmin(&self) -> bool {
        true
    }

    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
        let created = ctx
            .create(endpoints::ALB_CONTROLLERS, payload(desired)?)
            .await?;
        object_id(&created, "ALB controller")
    }

    async fn read(&self, ctx: &OpContext, id: &str, _known: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx.get(endpoints::ALB_CONTROLLERS, id).await?;
        let mut attrs = AttributeMap::new();
        for (name, path) in [
            ("name", "name"),
            ("description", "description"),
            ("url", "url"),
            ("username", "username"),
            ("license_type", "licenseType"),
            ("version", "version"),
        ] {
            copy_str(&mut attrs, name, &raw, path);
        }
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
        let mut body = payload(desired)?;
        body["id"] = Value::String(id.to_string());
        ctx.update(endpoints::ALB_CONTROLLERS, id, body).await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str, _state: &AttributeMap) -> Result<()> {
        ctx.delete(endpoints::ALB_CONTROLLERS, id).await
    }

    async fn import(&self, ctx: &OpContext, path: &ImportPath) -> Result<ImportedResource> {
        let name = path.get("controller-name")?;
        let raw = find_unique(
            ctx,
            endpoints::ALB_CONTROLLERS,
            &fiql(&[("name", name)]),
            "ALB controller",
        )
        .await?;
        let mut attrs = AttributeMap::new();
        attrs.set("name", name);
        Ok(ImportedResource::new(object_id(&raw, "ALB controller")?, attrs))
    }
}
