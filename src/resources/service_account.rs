//! `vcd_service_account`: an API service account.
//!
//! Activating the account yields a refresh token that can only be obtained
//! once. It is written to `file_name`, which requires `allow_token_file`.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::client::endpoints;
use crate::engine::{OpContext, ResourceHandler};
use crate::error::{ProviderError, Result};
use crate::import::{ImportPath, ImportShape};
use crate::lookup::{fiql, find_unique};
use crate::mapping::{pointer_str, AttributeMap};
use crate::schema::{Attribute, Schema};
use crate::token::{ensure_allowed, write_token_file, TokenFile};
use crate::types::ImportedResource;

use super::{copy_str, object_id};

const STATUS_ACTIVE: &str = "ACTIVE";

/// Service account resource.
pub struct ServiceAccount;

fn payload(desired: &AttributeMap, org_id: Option<&str>) -> Result<Value> {
    let mut body = json!({
        "name": desired.string("name")?,
        "softwareId": desired.string("software_id")?,
        "softwareVersion": desired.opt_string("software_version").unwrap_or_default(),
        "uri": desired.opt_string("uri").unwrap_or_default(),
        "role": { "id": desired.id_ref("role_id")? },
    });
    if let Some(org_id) = org_id {
        body["org"] = json!({ "id": org_id });
    }
    Ok(body)
}

/// Activate the account and write its token to `file_name`.
async fn activate(ctx: &OpContext, id: &str, desired: &AttributeMap) -> Result<()> {
    let file_name = desired.string("file_name")?;
    let granted = ctx
        .action(endpoints::SERVICE_ACCOUNTS, id, "activate", json!({}))
        .await?;
    let refresh_token = pointer_str(&granted, "refresh_token").ok_or_else(|| {
        ProviderError::remote(ctx.resource(), ctx.phase().as_str(), "activation returned no refresh token")
    })?;

    let token = TokenFile {
        token_type: "Service Account".to_string(),
        refresh_token: refresh_token.to_string(),
        updated_by: ctx.session().user.clone(),
        updated_on: pointer_str(&granted, "updated_on").unwrap_or_default().to_string(),
    };
    write_token_file(Path::new(&file_name), &token)?;
    info!(id = %id, "service account activated");
    Ok(())
}

#[async_trait]
impl ResourceHandler for ServiceAccount {
    fn type_name(&self) -> &'static str {
        "vcd_service_account"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("org", Attribute::optional_string().with_force_new())
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute(
                "software_id",
                Attribute::required_string()
                    .with_force_new()
                    .with_description("UUID of the client software"),
            )
            .with_attribute("software_version", Attribute::optional_string())
            .with_attribute("uri", Attribute::optional_string())
            .with_attribute("role_id", Attribute::required_string())
            .with_attribute(
                "active",
                Attribute::optional_bool().with_default(json!(false)),
            )
            .with_attribute(
                "file_name",
                Attribute::optional_string()
                    .with_description("File that receives the API token on activation"),
            )
            .with_attribute(
                "allow_token_file",
                Attribute::optional_bool()
                    .with_default(json!(false))
                    .with_description("Acknowledge that the token file contains sensitive information"),
            )
            .with_attribute("status", Attribute::computed_string())
            .with_import(ImportShape::new(["org-name", "service-account-name"]))
    }

    async fn check_preconditions(&self, _ctx: &OpContext, attrs: &AttributeMap) -> Result<()> {
        if !attrs.bool_or_default("active", &self.schema())? {
            return Ok(());
        }
        let file_name = attrs.opt_string("file_name").ok_or_else(|| {
            ProviderError::Validation(
                "\"file_name\": required when the service account is active".to_string(),
            )
        })?;
        ensure_allowed(
            attrs.bool_or_default("allow_token_file", &self.schema())?,
            &file_name,
        )
    }

    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
        let org_id = match desired.opt_string("org") {
            Some(org) => Some(ctx.resolver().org(&org).await?),
            None => None,
        };
        let mut body = payload(desired, org_id.as_deref())?;
        body["status"] = json!("CREATED");
        let created = ctx.create(endpoints::SERVICE_ACCOUNTS, body).await?;
        object_id(&created, "service account")
    }

    async fn after_create(&self, ctx: &OpContext, id: &str, desired: &AttributeMap) -> Result<()> {
        if desired.bool_or_default("active", &self.schema())? {
            activate(ctx, id, desired).await?;
        }
        Ok(())
    }

    async fn read(&self, ctx: &OpContext, id: &str, _known: &AttributeMap) -> Result<AttributeMap> {
        let raw = ctx.get(endpoints::SERVICE_ACCOUNTS, id).await?;
        let mut attrs = AttributeMap::new();
        copy_str(&mut attrs, "name", &raw, "name");
        copy_str(&mut attrs, "software_id", &raw, "softwareId");
        copy_str(&mut attrs, "software_version", &raw, "softwareVersion");
        copy_str(&mut attrs, "uri", &raw, "uri");
        copy_str(&mut attrs, "role_id", &raw, "role.id");
        copy_str(&mut attrs, "status", &raw, "status");
        attrs.set("active", pointer_str(&raw, "status") == Some(STATUS_ACTIVE));
        Ok(attrs)
    }

    async fn update(
        &self,
        ctx: &OpContext,
        id: &str,
        prior: &AttributeMap,
        desired: &AttributeMap,
        changed: &BTreeSet<String>,
    ) -> Result<()> {
        let descriptive = ["software_version", "uri", "role_id"];
        if changed.iter().any(|name| descriptive.contains(&name.as_str())) {
            let mut body = payload(desired, None)?;
            body["id"] = Value::String(id.to_string());
            ctx.update(endpoints::SERVICE_ACCOUNTS, id, body).await?;
        }

        let schema = self.schema();
        let was_active = prior.bool_or_default("active", &schema)?;
        let is_active = desired.bool_or_default("active", &schema)?;
        match (was_active, is_active) {
            (false, true) => activate(ctx, id, desired).await,
            (true, false) => {
                ctx.action(endpoints::SERVICE_ACCOUNTS, id, "revoke", json!({}))
                    .await?;
                Ok(())
            },
            _ => Ok(()),
        }
    }

    async fn delete(&self, ctx: &OpContext, id: &str, _state: &AttributeMap) -> Result<()> {
        ctx.delete(endpoints::SERVICE_ACCOUNTS, id).await
    }

    async fn import(&self, ctx: &OpContext, path: &ImportPath) -> Result<ImportedResource> {
        let org = path.get("org-name")?;
        let name = path.get("service-account-name")?;
        let org_id = ctx.resolver().org(org).await?;
        let raw = find_unique(
            ctx,
            endpoints::SERVICE_ACCOUNTS,
            &fiql(&[("name", name), ("org.id", org_id.as_str())]),
            "service account",
        )
        .await?;
        let mut attrs = AttributeMap::new();
        attrs.set("org", org);
        attrs.set("name", name);
        Ok(ImportedResource::new(object_id(&raw, "service account")?, attrs))
    }
}
