//! `vcd_rde_type_behavior_acl`: access levels for one behavior of an RDE type.
//!
//! VCD keeps every behavior ACL of a type in a single list, so changing one
//! behavior's entry is a read-modify-write of the whole list. Writers of the
//! same type are serialized on `rde_type_behavior_acl.<type id>`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::endpoints;
use crate::engine::{OpContext, ResourceHandler};
use crate::error::{ProviderError, Result};
use crate::import::{ImportPath, ImportSegment, ImportShape};
use crate::lookup::{fiql, find_unique};
use crate::mapping::{pointer, pointer_str, AttributeMap};
use crate::parent::LockTarget;
use crate::schema::{Attribute, AttributeFlags, AttributeType, Schema};
use crate::types::ImportedResource;

use super::object_id;

const TYPE_NAME: &str = "vcd_rde_type_behavior_acl";
const LOCK_SCOPE: &str = "rde_type_behavior_acl";

/// RDE type behavior ACL resource.
pub struct RdeTypeBehaviorAcl;

async fn access_list(ctx: &OpContext, type_id: &str) -> Result<Vec<Value>> {
    match ctx.get(endpoints::ENTITY_TYPE_BEHAVIOR_ACCESS, type_id).await {
        Ok(raw) => Ok(pointer(&raw, "values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()),
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

/// Replace the entries of `behavior_id` with `levels`, keeping every other behavior's.
fn merge_entries(current: Vec<Value>, behavior_id: &str, levels: &BTreeSet<String>) -> Vec<Value> {
    let mut merged: Vec<Value> = current
        .into_iter()
        .filter(|entry| pointer_str(entry, "behaviorId") != Some(behavior_id))
        .collect();
    merged.extend(
        levels
            .iter()
            .map(|level| json!({ "behaviorId": behavior_id, "accessLevelId": level })),
    );
    merged
}

fn levels_of(entries: &[Value], behavior_id: &str) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| pointer_str(entry, "behaviorId") == Some(behavior_id))
        .filter_map(|entry| pointer_str(entry, "accessLevelId").map(str::to_string))
        .collect()
}

async fn write_levels(
    ctx: &OpContext,
    type_id: &str,
    behavior_id: &str,
    levels: &BTreeSet<String>,
) -> Result<()> {
    let current = access_list(ctx, type_id).await?;
    let merged = merge_entries(current, behavior_id, levels);
    ctx.put(
        endpoints::ENTITY_TYPE_BEHAVIOR_ACCESS,
        type_id,
        json!({ "values": merged }),
    )
    .await?;
    Ok(())
}

#[async_trait]
impl ResourceHandler for RdeTypeBehaviorAcl {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "rde_type_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("ID of the RDE Type that owns the Behavior"),
            )
            .with_attribute("behavior_id", Attribute::required_string().with_force_new())
            .with_attribute(
                "access_level_ids",
                Attribute::new(
                    AttributeType::set(AttributeType::String),
                    AttributeFlags::required(),
                ),
            )
            .with_import(ImportShape::from_segments(vec![
                ImportSegment::new("vendor"),
                ImportSegment::new("nss"),
                ImportSegment::dotted("version", 3),
                ImportSegment::new("behavior-id"),
            ]))
    }

    fn lock_targets(&self, attrs: &AttributeMap) -> Result<Vec<LockTarget>> {
        Ok(vec![LockTarget::Scoped {
            kind: LOCK_SCOPE.to_string(),
            parent: attrs.id_ref("rde_type_id")?,
        }])
    }

    async fn check_preconditions(&self, ctx: &OpContext, attrs: &AttributeMap) -> Result<()> {
        let type_id = attrs.id_ref("rde_type_id")?;
        match ctx.get(endpoints::ENTITY_TYPES, &type_id).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Err(ProviderError::Precondition(format!(
                "RDE type {} does not exist",
                type_id
            ))),
            Err(err) => Err(err),
        }
    }

    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
        let behavior_id = desired.id_ref("behavior_id")?;
        write_levels(
            ctx,
            &desired.id_ref("rde_type_id")?,
            &behavior_id,
            &desired.string_set("access_level_ids"),
        )
        .await?;
        Ok(behavior_id)
    }

    async fn read(&self, ctx: &OpContext, id: &str, known: &AttributeMap) -> Result<AttributeMap> {
        let type_id = known.id_ref("rde_type_id")?;
        let entries = access_list(ctx, &type_id).await?;
        let levels = levels_of(&entries, id);
        if levels.is_empty() {
            return Err(ProviderError::NotFound(format!(
                "no access levels for behavior {} of RDE type {}",
                id, type_id
            )));
        }

        let mut attrs = AttributeMap::new();
        attrs.set("rde_type_id", type_id);
        attrs.set("behavior_id", id);
        attrs.set("access_level_ids", levels);
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
        write_levels(
            ctx,
            &desired.id_ref("rde_type_id")?,
            id,
            &desired.string_set("access_level_ids"),
        )
        .await
    }

    async fn delete(&self, ctx: &OpContext, id: &str, state: &AttributeMap) -> Result<()> {
        write_levels(ctx, &state.id_ref("rde_type_id")?, id, &BTreeSet::new()).await
    }

    async fn import(&self, ctx: &OpContext, path: &ImportPath) -> Result<ImportedResource> {
        let filter = fiql(&[
            ("vendor", path.get("vendor")?),
            ("nss", path.get("nss")?),
            ("version", path.get("version")?),
        ]);
        let rde_type = find_unique(ctx, endpoints::ENTITY_TYPES, &filter, "RDE type").await?;
        let type_id = object_id(&rde_type, "RDE type")?;

        let behavior_id = path.get("behavior-id")?;
        let behavior = ctx.get(endpoints::ENTITY_TYPE_BEHAVIORS, behavior_id).await?;
        if pointer_str(&behavior, "ref") != Some(type_id.as_str()) {
            return Err(ProviderError::NotFound(format!(
                "behavior {} does not belong to RDE type {}",
                behavior_id, type_id
            )));
        }

        let mut attrs = AttributeMap::new();
        attrs.set("rde_type_id", type_id);
        attrs.set("behavior_id", behavior_id);
        Ok(ImportedResource::new(behavior_id, attrs))
    }
}
