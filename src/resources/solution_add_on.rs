//! `vcd_solution_add_on_instance`: an instance of a Solution Add-On.
//!
//! `delete_input` is only read when the instance is removed, so changing it
//! alone never reaches VCD.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::endpoints;
use crate::engine::{OpContext, ResourceHandler};
use crate::error::{ProviderError, Result};
use crate::import::{ImportPath, ImportShape};
use crate::lookup::{fiql, find_unique};
use crate::mapping::{pointer, AttributeMap};
use crate::parent::LockTarget;
use crate::schema::{Attribute, AttributeFlags, AttributeType, Schema};
use crate::types::ImportedResource;

use super::{copy_str, object_id};

const TYPE_NAME: &str = "vcd_solution_add_on_instance";
const INSTANCE_ENTITY: &str = "solutionAddOnInstance";

/// Solution Add-On instance resource.
pub struct SolutionAddOnInstance;

fn string_map() -> Attribute {
    Attribute::new(
        AttributeType::map(AttributeType::String),
        AttributeFlags::optional(),
    )
}

#[async_trait]
impl ResourceHandler for SolutionAddOnInstance {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "add_on_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("Solution Add-On ID"),
            )
            .with_attribute(
                "accept_eula",
                Attribute::required_bool()
                    .with_description("Accept the EULA of the Solution Add-On"),
            )
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("input", string_map().with_force_new())
            .with_attribute(
                "delete_input",
                string_map().with_description("Inputs used when removing the instance"),
            )
            .with_attribute("state", Attribute::computed_string())
            .with_import(ImportShape::new(["instance-name"]))
    }

    fn delete_time_only(&self) -> &'static [&'static str] {
        &["delete_input"]
    }

    fn lock_targets(&self, attrs: &AttributeMap) -> Result<Vec<LockTarget>> {
        Ok(vec![LockTarget::Scoped {
            kind: TYPE_NAME.to_string(),
            parent: attrs.id_ref("add_on_id")?,
        }])
    }

    async fn check_preconditions(&self, _ctx: &OpContext, attrs: &AttributeMap) -> Result<()> {
        if attrs.opt_bool("accept_eula") != Some(true) {
            return Err(ProviderError::Precondition(
                "the EULA of the Solution Add-On must be accepted (accept_eula = true)".to_string(),
            ));
        }
        Ok(())
    }

    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
        let body = json!({
            "name": desired.string("name")?,
            "entityType": INSTANCE_ENTITY,
            "addOnId": desired.id_ref("add_on_id")?,
            "inputs": Value::Object(desired.string_map("input")),
            "state": "READY",
        });
        let created = ctx.create(endpoints::ENTITIES, body).await?;
        object_id(&created, "Solution Add-On instance")
    }

    async fn read(&self, ctx: &OpContext, id: &str, _known: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx.get(endpoints::ENTITIES, id).await?;
        let mut attrs = AttributeMap::new();
        copy_str(&mut attrs, "name", &raw, "name");
        copy_str(&mut attrs, "add_on_id", &raw, "addOnId");
        copy_str(&mut attrs, "state", &raw, "state");
        attrs.set(
            "input",
            pointer(&raw, "inputs").cloned().unwrap_or_else(|| json!({})),
        );
        Ok(attrs)
    }

    async fn update(
        &self,
        _ctx: &OpContext,
        _id: &str,
        _prior: &AttributeMap,
        _desired: &AttributeMap,
        _changed: &BTreeSet<String>,
    ) -> Result<()> {
        // Everything else is force-new; accepting the EULA has no remote state.
        Ok(())
    }

    async fn delete(&self, ctx: &OpContext, id: &str, state: &AttributeMap) -> Result<()> {
        let body = json!({ "inputs": Value::Object(state.string_map("delete_input")) });
        ctx.action(endpoints::ENTITIES, id, "delete", body).await?;
        Ok(())
    }

    async fn import(&self, ctx: &OpContext, path: &ImportPath) -> Result<ImportedResource> {
        let name = path.get("instance-name")?;
        let filter = fiql(&[("name", name), ("entityType", INSTANCE_ENTITY)]);
        let raw = find_unique(ctx, endpoints::ENTITIES, &filter, "Solution Add-On instance").await?;
        let mut attrs = AttributeMap::new();
        attrs.set("name", name);
        attrs.set("accept_eula", true);
        Ok(ImportedResource::new(
            object_id(&raw, "Solution Add-On instance")?,
            attrs,
        ))
    }
}
