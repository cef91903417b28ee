//! The reconciliation engine.
//!
//! [`Engine`] is the handle the host talks to. It owns the provider
//! configuration, the SDK client and the named mutex registry, and drives
//! every lifecycle operation through the same sequence:
//!
//! 1. schema validation and privilege preflight (no lock, no SDK call),
//! 2. parent resolution and ordered lock acquisition,
//! 3. the handler's SDK calls under the operation deadline,
//! 4. lock release, then a read-back that refreshes the stored state.
//!
//! Resource kinds plug in through [`ResourceHandler`] and
//! [`DataSourceHandler`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use vcd_provider::{config::ProviderConfig, engine::Engine};
//!
//! let engine = Engine::with_bundled(client, ProviderConfig::from_env()?);
//! let outcome = engine
//!     .create("vcd_network_routed_v2", desired, &CancellationToken::new())
//!     .await;
//! for diagnostic in outcome.diagnostics.as_slice() {
//!     eprintln!("{}", diagnostic.summary);
//! }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::ensure_sysadmin;
use crate::client::{ApiVersion, Session, VcdClient};
use crate::config::ProviderConfig;
use crate::error::{ApiError, ProviderError, Result};
use crate::import::ImportPath;
use crate::lookup::{select_one, Candidate, LookupCriteria};
use crate::mapping::{changed_keys, check_version_gates, AttributeMap};
use crate::metadata::{self, MetadataPlan, MetadataTarget};
use crate::mutex::{LockSet, MutexRegistry, ParentLockKey};
use crate::parent::{check_parent_unchanged, LockTarget, ParentResolver};
use crate::schema::{Diagnostic, Diagnostics, ProviderSchema, Schema};
use crate::types::{ImportedResource, ProviderMetadata, ResourceInstance};
use crate::validation;

/// Lifecycle phase, used to tag errors and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Creating an object.
    Create,
    /// Reading an object or data source.
    Read,
    /// Updating an object in place.
    Update,
    /// Deleting an object.
    Delete,
    /// Locating an object by import path.
    Import,
}

impl Phase {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Import => "import",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a handler needs during one lifecycle operation.
///
/// SDK calls made through the context have their errors classified and
/// tagged with the resource kind and phase.
pub struct OpContext {
    client: Arc<dyn VcdClient>,
    resource: String,
    phase: Phase,
    session: Session,
    api_version: ApiVersion,
    deadline: Option<Instant>,
    warnings: Mutex<Vec<Diagnostic>>,
}

impl OpContext {
    /// Create a context for one operation.
    pub fn new(client: Arc<dyn VcdClient>, resource: impl Into<String>, phase: Phase) -> Self {
        let session = client.session();
        let api_version = client.api_version();
        Self {
            client,
            resource: resource.into(),
            phase,
            session,
            api_version,
            deadline: None,
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Bound every step of the operation by one instant.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The instant the operation must finish by, if bounded.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The raw SDK client.
    pub fn client(&self) -> &dyn VcdClient {
        self.client.as_ref()
    }

    /// Resource or data source type name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The authenticated session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Negotiated API version.
    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    /// A parent resolver bound to this operation.
    pub fn resolver(&self) -> ParentResolver<'_> {
        ParentResolver::new(self)
    }

    /// Classify an SDK error for this resource and phase.
    pub fn api_error(&self, err: ApiError) -> ProviderError {
        let err = err.classify(&self.resource, self.phase.as_str());
        if err.is_not_found() {
            debug!(resource = %self.resource, phase = %self.phase, error = %err, "object not found");
        } else {
            error!(resource = %self.resource, phase = %self.phase, error = %err, "SDK call failed");
        }
        err
    }

    /// Record a warning for the host.
    pub fn warn(&self, summary: impl Into<String>, detail: impl Into<String>) {
        let diagnostic = Diagnostic::warning(summary).with_detail(detail);
        warn!(resource = %self.resource, summary = %diagnostic.summary, "warning");
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }

    fn take_warnings(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.warnings.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Fetch one object.
    pub async fn get(&self, endpoint: &str, id: &str) -> Result<Value> {
        self.client
            .get(endpoint, id)
            .await
            .map_err(|e| self.api_error(e))
    }

    /// List objects matching an optional FIQL filter.
    pub async fn list(&self, endpoint: &str, filter: Option<&str>) -> Result<Vec<Value>> {
        self.client
            .list(endpoint, filter)
            .await
            .map_err(|e| self.api_error(e))
    }

    /// Create an object.
    pub async fn create(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.client
            .create(endpoint, body)
            .await
            .map_err(|e| self.api_error(e))
    }

    /// Replace an object.
    pub async fn update(&self, endpoint: &str, id: &str, body: Value) -> Result<Value> {
        self.client
            .update(endpoint, id, body)
            .await
            .map_err(|e| self.api_error(e))
    }

    /// Replace a sub-resource addressed by its parent's ID.
    pub async fn put(&self, endpoint: &str, id: &str, body: Value) -> Result<Value> {
        self.client
            .put(endpoint, id, body)
            .await
            .map_err(|e| self.api_error(e))
    }

    /// Delete an object.
    pub async fn delete(&self, endpoint: &str, id: &str) -> Result<()> {
        self.client
            .delete(endpoint, id)
            .await
            .map_err(|e| self.api_error(e))
    }

    /// Invoke a named action.
    pub async fn action(&self, endpoint: &str, id: &str, action: &str, body: Value) -> Result<Value> {
        self.client
            .action(endpoint, id, action, body)
            .await
            .map_err(|e| self.api_error(e))
    }
}

/// One managed resource kind.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    // =========================================================================
    // Schema
    // =========================================================================

    /// Type name, e.g. `vcd_network_routed_v2`.
    fn type_name(&self) -> &'static str;

    /// Attribute schema, including the import shape.
    fn schema(&self) -> Schema;

    /// Whether every mutating operation needs a system administrator.
    fn requires_sysadmin(&self) -> bool {
        false
    }

    /// Attributes only consulted at delete time; changing them alone is a no-op.
    fn delete_time_only(&self) -> &'static [&'static str] {
        &[]
    }

    /// Attribute naming the parent that must not change behind the engine's back.
    fn parent_attribute(&self) -> Option<&'static str> {
        None
    }

    // =========================================================================
    // Parents
    // =========================================================================

    /// Parents to lock, derived from configuration or stored state.
    fn lock_targets(&self, attrs: &AttributeMap) -> Result<Vec<LockTarget>> {
        let _ = attrs;
        Ok(Vec::new())
    }

    /// Checks on the parent, run while its lock is held.
    async fn check_preconditions(&self, ctx: &OpContext, attrs: &AttributeMap) -> Result<()> {
        let _ = (ctx, attrs);
        Ok(())
    }

    /// The parent VCD currently reports for the object, if tracked.
    async fn observed_parent(&self, ctx: &OpContext, id: &str) -> Result<Option<String>> {
        let _ = (ctx, id);
        Ok(None)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create the object and return its ID.
    async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String>;

    /// Follow-up work once the ID is recorded; a failure keeps the ID.
    async fn after_create(&self, ctx: &OpContext, id: &str, desired: &AttributeMap) -> Result<()> {
        let _ = (ctx, id, desired);
        Ok(())
    }

    /// Read the object. A not-found error means it no longer exists.
    async fn read(&self, ctx: &OpContext, id: &str, known: &AttributeMap) -> Result<AttributeMap>;

    /// Apply `changed` attributes in place.
    async fn update(
        &self,
        ctx: &OpContext,
        id: &str,
        prior: &AttributeMap,
        desired: &AttributeMap,
        changed: &BTreeSet<String>,
    ) -> Result<()>;

    /// Delete the object. A not-found error counts as success.
    async fn delete(&self, ctx: &OpContext, id: &str, state: &AttributeMap) -> Result<()>;

    /// Locate an existing object from its import path.
    async fn import(&self, ctx: &OpContext, path: &ImportPath) -> Result<ImportedResource> {
        let _ = (ctx, path);
        Err(ProviderError::Validation(format!(
            "{} does not support import",
            self.type_name()
        )))
    }

    /// Where the object's metadata lives.
    async fn metadata_target(
        &self,
        ctx: &OpContext,
        id: &str,
        attrs: &AttributeMap,
    ) -> Result<MetadataTarget> {
        let _ = (ctx, id, attrs);
        Ok(MetadataTarget::None)
    }
}

/// One data source kind.
#[async_trait]
pub trait DataSourceHandler: Send + Sync + 'static {
    /// Type name, e.g. `vcd_nsxt_manager`.
    fn type_name(&self) -> &'static str;

    /// Attribute schema.
    fn schema(&self) -> Schema;

    /// Whether reads need a system administrator.
    fn requires_sysadmin(&self) -> bool {
        false
    }

    /// Resolve a name to an ID.
    async fn find_by_name(&self, ctx: &OpContext, config: &AttributeMap, name: &str)
        -> Result<String>;

    /// Objects a `filter` block is evaluated against.
    async fn candidates(&self, ctx: &OpContext, config: &AttributeMap) -> Result<Vec<Candidate>> {
        let _ = (ctx, config);
        Err(ProviderError::Validation(format!(
            "{} does not support filter",
            self.type_name()
        )))
    }

    /// Read the located object.
    async fn read(&self, ctx: &OpContext, id: &str, config: &AttributeMap) -> Result<AttributeMap>;

    /// Where the located object's metadata lives.
    async fn metadata_target(
        &self,
        ctx: &OpContext,
        id: &str,
        attrs: &AttributeMap,
    ) -> Result<MetadataTarget> {
        let _ = (ctx, id, attrs);
        Ok(MetadataTarget::None)
    }
}

/// What a not-found error means to the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundPolicy {
    /// The object is gone; forget the instance.
    Tombstone,
    /// The lookup failed; report an error.
    Fail,
}

/// Result of a read under a [`NotFoundPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    /// The object exists.
    Found(AttributeMap),
    /// The object no longer exists.
    Gone,
}

/// Shared reader for resources and data sources.
pub async fn read_with_policy<F>(
    ctx: &OpContext,
    id: &str,
    policy: NotFoundPolicy,
    fetch: F,
) -> Result<ReadResult>
where
    F: Future<Output = Result<AttributeMap>>,
{
    match fetch.await {
        Ok(attrs) => Ok(ReadResult::Found(attrs)),
        Err(err) if err.is_not_found() && policy == NotFoundPolicy::Tombstone => {
            warn!(resource = %ctx.resource(), id = %id, "object no longer exists; removing it from state");
            Ok(ReadResult::Gone)
        },
        Err(err) => Err(err),
    }
}

/// Result of a lifecycle operation.
///
/// `state` is `None` only when nothing needs persisting (a create that
/// failed before an ID existed). A tombstoned instance means the object is
/// gone. Errors in `diagnostics` may accompany a state when the operation
/// partially succeeded.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// State to persist.
    pub state: Option<ResourceInstance>,
    /// Errors and warnings.
    pub diagnostics: Diagnostics,
}

impl Outcome {
    fn failed(state: Option<ResourceInstance>, mut diagnostics: Diagnostics, err: &ProviderError) -> Self {
        diagnostics.push_error(err);
        Self { state, diagnostics }
    }

    /// Whether any error diagnostic is present.
    pub fn has_errors(&self) -> bool {
        self.diagnostics.has_errors()
    }

    /// ID of the persisted state, if the object exists.
    pub fn id(&self) -> Option<&str> {
        self.state
            .as_ref()
            .filter(|s| s.is_present())
            .map(ResourceInstance::id)
    }

    /// Whether the outcome tombstones the instance.
    pub fn is_gone(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.is_present())
    }

    /// The state, or the diagnostics if any error occurred.
    pub fn into_result(self) -> std::result::Result<ResourceInstance, Diagnostics> {
        match self.state {
            Some(state) if !self.diagnostics.has_errors() => Ok(state),
            _ => Err(self.diagnostics),
        }
    }
}

/// Handle owning configuration, session and locks for one provider process.
pub struct Engine {
    client: Arc<dyn VcdClient>,
    config: ProviderConfig,
    mutexes: MutexRegistry,
    resources: HashMap<String, Arc<dyn ResourceHandler>>,
    data_sources: HashMap<String, Arc<dyn DataSourceHandler>>,
}

impl Engine {
    /// Create an engine with no handlers registered.
    pub fn new(client: Arc<dyn VcdClient>, config: ProviderConfig) -> Self {
        Self {
            client,
            config,
            mutexes: MutexRegistry::new(),
            resources: HashMap::new(),
            data_sources: HashMap::new(),
        }
    }

    /// Create an engine with every bundled resource and data source.
    pub fn with_bundled(client: Arc<dyn VcdClient>, config: ProviderConfig) -> Self {
        let mut engine = Self::new(client, config);
        crate::resources::register_all(&mut engine);
        engine
    }

    /// Register a resource handler under its type name.
    pub fn register_resource(&mut self, handler: Arc<dyn ResourceHandler>) {
        self.resources
            .insert(handler.type_name().to_string(), handler);
    }

    /// Register a data source handler under its type name.
    pub fn register_data_source(&mut self, handler: Arc<dyn DataSourceHandler>) {
        self.data_sources
            .insert(handler.type_name().to_string(), handler);
    }

    /// Provider configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The named mutex registry.
    pub fn mutexes(&self) -> &MutexRegistry {
        &self.mutexes
    }

    /// Schemas of the provider block and every registered type.
    pub fn schema(&self) -> ProviderSchema {
        let mut schema = ProviderSchema::new().with_provider_config(ProviderConfig::schema());
        for (name, handler) in &self.resources {
            schema = schema.with_resource(name.clone(), handler.schema());
        }
        for (name, handler) in &self.data_sources {
            schema = schema.with_data_source(name.clone(), handler.schema());
        }
        schema
    }

    /// Registered type names.
    pub fn metadata(&self) -> ProviderMetadata {
        let mut resources: Vec<_> = self.resources.keys().cloned().collect();
        let mut data_sources: Vec<_> = self.data_sources.keys().cloned().collect();
        resources.sort();
        data_sources.sort();
        ProviderMetadata {
            resources,
            data_sources,
        }
    }

    /// Validate a resource configuration without touching VCD.
    pub fn validate_resource_config(&self, kind: &str, config: &AttributeMap) -> Diagnostics {
        match self.resource(kind) {
            Ok(handler) => validate_attrs(&handler.schema(), config),
            Err(err) => {
                let mut diagnostics = Diagnostics::new();
                diagnostics.push_error(&err);
                diagnostics
            },
        }
    }

    fn resource(&self, kind: &str) -> Result<Arc<dyn ResourceHandler>> {
        self.resources
            .get(kind)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(kind.to_string()))
    }

    fn data_source(&self, kind: &str) -> Result<Arc<dyn DataSourceHandler>> {
        self.data_sources
            .get(kind)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(kind.to_string()))
    }

    fn context(&self, kind: &str, phase: Phase) -> OpContext {
        let ctx = OpContext::new(Arc::clone(&self.client), kind, phase);
        match self.config.timeout_for(kind) {
            Some(limit) => ctx.with_deadline(Instant::now() + limit),
            None => ctx,
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create an object from its desired attributes.
    #[instrument(skip(self, desired, cancel), name = "engine.create")]
    pub async fn create(
        &self,
        kind: &str,
        desired: AttributeMap,
        cancel: &CancellationToken,
    ) -> Outcome {
        let handler = match self.resource(kind) {
            Ok(handler) => handler,
            Err(err) => return Outcome::failed(None, Diagnostics::new(), &err),
        };
        let mut diagnostics = validate_attrs(&handler.schema(), &desired);
        if diagnostics.has_errors() {
            return Outcome {
                state: None,
                diagnostics,
            };
        }

        info!("create started");
        let ctx = self.context(kind, Phase::Create);
        let mut instance = ResourceInstance::planned(desired.clone());
        let result = self
            .create_locked(handler.as_ref(), &ctx, &desired, &mut instance, cancel)
            .await;
        diagnostics.extend(ctx.take_warnings());

        if let Err(err) = result {
            error!(error = %err, id = %instance.id(), "create failed");
            let state = instance.is_present().then_some(instance);
            return Outcome::failed(state, diagnostics, &err);
        }

        match self
            .refresh(handler.as_ref(), instance.clone(), &mut diagnostics, ctx.deadline())
            .await
        {
            Ok(state) => {
                info!(id = %state.id(), "create finished");
                Outcome {
                    state: Some(state),
                    diagnostics,
                }
            },
            Err(err) => Outcome::failed(Some(instance), diagnostics, &err),
        }
    }

    async fn create_locked(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &OpContext,
        desired: &AttributeMap,
        instance: &mut ResourceInstance,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.preflight(handler, ctx, desired)?;
        let targets = handler.lock_targets(desired)?;
        let keys = resolve_for_create(ctx, &targets).await?;
        let locks = self.lock(ctx, keys, cancel).await?;

        handler.check_preconditions(ctx, desired).await?;
        ensure_not_cancelled(cancel, ctx)?;

        let id = self.deadline(ctx, handler.create(ctx, desired)).await?;
        instance.set_id(id.clone())?;
        info!(id = %id, "object created");

        handler.after_create(ctx, &id, desired).await?;
        self.apply_metadata(handler, ctx, &id, desired).await?;
        drop(locks);

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled(format!(
                "{} was created as '{}' before the operation was cancelled",
                ctx.resource(),
                id
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Refresh a stored instance. A vanished object yields a tombstone.
    #[instrument(skip(self, instance, cancel), name = "engine.read")]
    pub async fn read(
        &self,
        kind: &str,
        instance: ResourceInstance,
        cancel: &CancellationToken,
    ) -> Outcome {
        let handler = match self.resource(kind) {
            Ok(handler) => handler,
            Err(err) => return Outcome::failed(Some(instance), Diagnostics::new(), &err),
        };
        if !instance.is_present() {
            return Outcome {
                state: Some(instance),
                diagnostics: Diagnostics::new(),
            };
        }
        if cancel.is_cancelled() {
            let err = ProviderError::Cancelled(format!("read of {} was cancelled", kind));
            return Outcome::failed(Some(instance), Diagnostics::new(), &err);
        }

        debug!(id = %instance.id(), "read started");
        let mut diagnostics = Diagnostics::new();
        match self.refresh(handler.as_ref(), instance.clone(), &mut diagnostics, None).await {
            Ok(state) => Outcome {
                state: Some(state),
                diagnostics,
            },
            Err(err) => Outcome::failed(Some(instance), diagnostics, &err),
        }
    }

    /// Read back an instance, inside `deadline` when the read follows a write.
    async fn refresh(
        &self,
        handler: &dyn ResourceHandler,
        instance: ResourceInstance,
        diagnostics: &mut Diagnostics,
        deadline: Option<Instant>,
    ) -> Result<ResourceInstance> {
        let mut ctx = self.context(handler.type_name(), Phase::Read);
        if let Some(deadline) = deadline {
            ctx = ctx.with_deadline(deadline);
        }
        let result = self.read_resource(handler, &ctx, instance).await;
        diagnostics.extend(ctx.take_warnings());
        result
    }

    async fn read_resource(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &OpContext,
        mut instance: ResourceInstance,
    ) -> Result<ResourceInstance> {
        let id = instance.id().to_string();
        let fetch = self.deadline(ctx, handler.read(ctx, &id, &instance.attributes));
        match read_with_policy(ctx, &id, NotFoundPolicy::Tombstone, fetch).await? {
            ReadResult::Gone => {
                instance.tombstone();
                Ok(instance)
            },
            ReadResult::Found(mut observed) => {
                carry_forward(&handler.schema(), &instance.attributes, &mut observed);
                if let MetadataTarget::Object(object) =
                    handler.metadata_target(ctx, &id, &observed).await?
                {
                    let entries = ctx
                        .client()
                        .list_metadata(&object)
                        .await
                        .map_err(|e| ctx.api_error(e))?;
                    metadata::populate(&mut observed, &entries);
                }
                let mut fresh = ResourceInstance::present(id, observed);
                fresh.changed = std::mem::take(&mut instance.changed);
                Ok(fresh)
            },
        }
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Apply the desired attributes to an existing object.
    #[instrument(skip(self, prior, desired, cancel), name = "engine.update")]
    pub async fn update(
        &self,
        kind: &str,
        prior: ResourceInstance,
        desired: AttributeMap,
        cancel: &CancellationToken,
    ) -> Outcome {
        let handler = match self.resource(kind) {
            Ok(handler) => handler,
            Err(err) => return Outcome::failed(Some(prior), Diagnostics::new(), &err),
        };
        let schema = handler.schema();
        let mut diagnostics = validate_attrs(&schema, &desired);
        if diagnostics.has_errors() {
            return Outcome {
                state: Some(prior),
                diagnostics,
            };
        }
        if !prior.is_present() {
            let err = ProviderError::Validation(format!("{} has no ID to update", kind));
            return Outcome::failed(Some(prior), diagnostics, &err);
        }

        let changed = changed_keys(&schema, &prior.attributes, &desired);
        let forced: Vec<&str> = changed
            .iter()
            .map(String::as_str)
            .filter(|name| schema.attribute(name).is_some_and(|a| a.force_new))
            .collect();
        if !forced.is_empty() {
            let err = ProviderError::Validation(format!(
                "changing {} requires replacing {}",
                forced.join(", "),
                prior.id()
            ));
            return Outcome::failed(Some(prior), diagnostics, &err);
        }

        let mut working = prior.clone();
        for name in &changed {
            match desired.get(name) {
                Some(value) => working.attributes.set(name.clone(), value.clone()),
                None => {
                    working.attributes.remove(name);
                },
            }
        }
        working.changed = changed.clone();

        let delete_time_only = handler.delete_time_only();
        let remote = changed
            .iter()
            .any(|name| !delete_time_only.contains(&name.as_str()));

        let ctx = self.context(kind, Phase::Update);
        let mut trailing = None;
        if remote {
            info!(id = %prior.id(), changed = ?changed, "update started");
            let result = self
                .update_locked(handler.as_ref(), &ctx, &prior, &desired, &changed, cancel)
                .await;
            diagnostics.extend(ctx.take_warnings());
            match result {
                Ok(late) => trailing = late,
                Err(err) => {
                    error!(id = %prior.id(), error = %err, "update failed");
                    return Outcome::failed(Some(prior), diagnostics, &err);
                },
            }
        } else {
            debug!(id = %prior.id(), "nothing to change remotely");
        }

        let mut outcome = match self
            .refresh(handler.as_ref(), working.clone(), &mut diagnostics, ctx.deadline())
            .await
        {
            Ok(state) => Outcome {
                state: Some(state),
                diagnostics,
            },
            Err(err) => Outcome::failed(Some(working), diagnostics, &err),
        };
        if let Some(err) = trailing {
            outcome.diagnostics.push_error(&err);
        } else if remote {
            info!(id = %prior.id(), "update finished");
        }
        outcome
    }

    /// Returns an error that occurred after the remote change was applied.
    async fn update_locked(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &OpContext,
        prior: &ResourceInstance,
        desired: &AttributeMap,
        changed: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<ProviderError>> {
        self.preflight(handler, ctx, desired)?;
        self.check_parent(handler, ctx, prior).await?;

        // Moving to another parent mutates both the old and the new one.
        let targets = handler.lock_targets(desired)?;
        let mut keys = resolve_for_create(ctx, &targets).await?;
        let previous: Vec<LockTarget> = handler
            .lock_targets(&prior.attributes)
            .unwrap_or_default()
            .into_iter()
            .filter(|target| !targets.contains(target))
            .collect();
        if !previous.is_empty() {
            keys.extend(ctx.resolver().resolve_all_or_fallback(&previous).await?);
        }
        let locks = self.lock(ctx, keys, cancel).await?;

        handler.check_preconditions(ctx, desired).await?;
        ensure_not_cancelled(cancel, ctx)?;

        let id = prior.id();
        self.deadline(
            ctx,
            handler.update(ctx, id, &prior.attributes, desired, changed),
        )
        .await?;

        let metadata_changed =
            changed.contains(metadata::METADATA) || changed.contains(metadata::METADATA_ENTRY);
        let mut late = None;
        if metadata_changed && self.config.ignore_metadata_changes {
            ctx.warn(
                "Metadata changes ignored",
                "ignore_metadata_changes is set on the provider; metadata was left as is",
            );
        } else if metadata_changed {
            if let Err(err) = self.apply_metadata(handler, ctx, id, desired).await {
                late = Some(err);
            }
        }
        drop(locks);

        if late.is_none() && cancel.is_cancelled() {
            late = Some(ProviderError::Cancelled(format!(
                "update of '{}' completed before the operation was cancelled",
                id
            )));
        }
        Ok(late)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete an object. Deleting something already gone succeeds.
    #[instrument(skip(self, instance, cancel), name = "engine.delete")]
    pub async fn delete(
        &self,
        kind: &str,
        instance: ResourceInstance,
        cancel: &CancellationToken,
    ) -> Outcome {
        let handler = match self.resource(kind) {
            Ok(handler) => handler,
            Err(err) => return Outcome::failed(Some(instance), Diagnostics::new(), &err),
        };
        if !instance.is_present() {
            return Outcome {
                state: Some(instance),
                diagnostics: Diagnostics::new(),
            };
        }

        info!(id = %instance.id(), "delete started");
        let ctx = self.context(kind, Phase::Delete);
        let result = self.delete_locked(handler.as_ref(), &ctx, &instance, cancel).await;
        let mut diagnostics = Diagnostics::from(ctx.take_warnings());

        match result {
            Ok(late) => {
                let mut gone = instance;
                gone.tombstone();
                if let Some(err) = late {
                    diagnostics.push_error(&err);
                } else {
                    info!("delete finished");
                }
                Outcome {
                    state: Some(gone),
                    diagnostics,
                }
            },
            Err(err) => {
                error!(id = %instance.id(), error = %err, "delete failed");
                Outcome::failed(Some(instance), diagnostics, &err)
            },
        }
    }

    async fn delete_locked(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &OpContext,
        instance: &ResourceInstance,
        cancel: &CancellationToken,
    ) -> Result<Option<ProviderError>> {
        if handler.requires_sysadmin() {
            ensure_sysadmin(ctx.session(), ctx.resource())?;
        }
        self.check_parent(handler, ctx, instance).await?;

        let targets = handler.lock_targets(&instance.attributes)?;
        let keys = ctx.resolver().resolve_all_or_fallback(&targets).await?;
        let locks = self.lock(ctx, keys, cancel).await?;
        ensure_not_cancelled(cancel, ctx)?;

        match self
            .deadline(ctx, handler.delete(ctx, instance.id(), &instance.attributes))
            .await
        {
            Ok(()) => {},
            Err(err) if err.is_not_found() => {
                warn!(id = %instance.id(), "object was already deleted");
            },
            Err(err) => return Err(err),
        }
        drop(locks);

        if cancel.is_cancelled() {
            return Ok(Some(ProviderError::Cancelled(format!(
                "'{}' was deleted before the operation was cancelled",
                instance.id()
            ))));
        }
        Ok(None)
    }

    // =========================================================================
    // Import
    // =========================================================================

    /// Locate an existing object from an import path and read it.
    #[instrument(skip(self, cancel), name = "engine.import")]
    pub async fn import(&self, kind: &str, path: &str, cancel: &CancellationToken) -> Outcome {
        let handler = match self.resource(kind) {
            Ok(handler) => handler,
            Err(err) => return Outcome::failed(None, Diagnostics::new(), &err),
        };
        let ctx = self.context(kind, Phase::Import);
        let mut diagnostics = Diagnostics::new();
        let result = self.import_path(handler.as_ref(), &ctx, path, cancel).await;
        diagnostics.extend(ctx.take_warnings());

        let imported = match result {
            Ok(imported) => imported,
            Err(err) => return Outcome::failed(None, diagnostics, &err),
        };
        info!(id = %imported.id, "import located object");

        let instance = ResourceInstance::present(imported.id, imported.attributes);
        match self
            .refresh(handler.as_ref(), instance, &mut diagnostics, ctx.deadline())
            .await
        {
            Ok(state) if state.is_present() => Outcome {
                state: Some(state),
                diagnostics,
            },
            Ok(_) => {
                let err = ProviderError::NotFound(format!("{} '{}' vanished during import", kind, path));
                Outcome::failed(None, diagnostics, &err)
            },
            Err(err) => Outcome::failed(None, diagnostics, &err),
        }
    }

    async fn import_path(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &OpContext,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<ImportedResource> {
        let shape = handler.schema().import.ok_or_else(|| {
            ProviderError::Validation(format!("{} does not support import", ctx.resource()))
        })?;
        let path = shape.parse(path, self.config.import_separator())?;
        if handler.requires_sysadmin() {
            ensure_sysadmin(ctx.session(), ctx.resource())?;
        }
        ensure_not_cancelled(cancel, ctx)?;
        self.deadline(ctx, handler.import(ctx, &path)).await
    }

    // =========================================================================
    // Data sources
    // =========================================================================

    /// Locate and read a data source.
    #[instrument(skip(self, config, cancel), name = "engine.read_data_source")]
    pub async fn read_data_source(
        &self,
        kind: &str,
        config: AttributeMap,
        cancel: &CancellationToken,
    ) -> Outcome {
        let handler = match self.data_source(kind) {
            Ok(handler) => handler,
            Err(err) => return Outcome::failed(None, Diagnostics::new(), &err),
        };
        let mut diagnostics = validate_attrs(&handler.schema(), &config);
        if diagnostics.has_errors() {
            return Outcome {
                state: None,
                diagnostics,
            };
        }

        let ctx = self.context(kind, Phase::Read);
        let result = self.lookup(handler.as_ref(), &ctx, &config, cancel).await;
        diagnostics.extend(ctx.take_warnings());
        match result {
            Ok(state) => {
                debug!(id = %state.id(), "data source read");
                Outcome {
                    state: Some(state),
                    diagnostics,
                }
            },
            Err(err) => Outcome::failed(None, diagnostics, &err),
        }
    }

    async fn lookup(
        &self,
        handler: &dyn DataSourceHandler,
        ctx: &OpContext,
        config: &AttributeMap,
        cancel: &CancellationToken,
    ) -> Result<ResourceInstance> {
        if handler.requires_sysadmin() {
            ensure_sysadmin(ctx.session(), ctx.resource())?;
        }
        ensure_not_cancelled(cancel, ctx)?;

        let id = match LookupCriteria::from_attrs(config)? {
            LookupCriteria::Name(name) => handler.find_by_name(ctx, config, &name).await?,
            LookupCriteria::Filter(filter) => {
                let candidates = handler.candidates(ctx, config).await?;
                select_one(candidates, &filter, ctx.resource())?.id
            },
        };

        let fetch = self.deadline(ctx, handler.read(ctx, &id, config));
        match read_with_policy(ctx, &id, NotFoundPolicy::Fail, fetch).await? {
            ReadResult::Found(mut attrs) => {
                if let MetadataTarget::Object(object) =
                    handler.metadata_target(ctx, &id, &attrs).await?
                {
                    let entries = ctx
                        .client()
                        .list_metadata(&object)
                        .await
                        .map_err(|e| ctx.api_error(e))?;
                    metadata::populate(&mut attrs, &entries);
                }
                for (key, value) in config.as_map() {
                    if attrs.get(key).is_none() {
                        attrs.set(key.clone(), value.clone());
                    }
                }
                Ok(ResourceInstance::present(id, attrs))
            },
            ReadResult::Gone => Err(ProviderError::NotFound(id)),
        }
    }

    // =========================================================================
    // Shared steps
    // =========================================================================

    fn preflight(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &OpContext,
        attrs: &AttributeMap,
    ) -> Result<()> {
        if handler.requires_sysadmin() {
            ensure_sysadmin(ctx.session(), ctx.resource())?;
        }
        check_version_gates(&handler.schema(), attrs, ctx.api_version())
    }

    async fn check_parent(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &OpContext,
        stored: &ResourceInstance,
    ) -> Result<()> {
        let Some(attribute) = handler.parent_attribute() else {
            return Ok(());
        };
        // A vanished object has no parent to compare; the operation itself handles it.
        let observed = match handler.observed_parent(ctx, stored.id()).await {
            Ok(Some(observed)) => observed,
            Ok(None) => return Ok(()),
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        let recorded = stored.attributes.opt_string(attribute).unwrap_or_default();
        check_parent_unchanged(attribute, &recorded, &observed)
    }

    async fn lock(
        &self,
        ctx: &OpContext,
        keys: Vec<ParentLockKey>,
        cancel: &CancellationToken,
    ) -> Result<LockSet> {
        if keys.is_empty() {
            return Ok(LockSet::empty());
        }
        let acquire = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProviderError::Cancelled(format!(
                    "{} {} was cancelled while waiting for a parent lock",
                    ctx.resource(),
                    ctx.phase()
                ))),
                set = self.mutexes.lock_all(keys) => Ok(set),
            }
        };
        self.deadline(ctx, acquire).await
    }

    async fn deadline<T, F>(&self, ctx: &OpContext, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(at) = ctx.deadline() else {
            return fut.await;
        };
        match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => {
                let limit = self
                    .config
                    .timeout_for(ctx.resource())
                    .map_or(0, |limit| limit.as_secs());
                Err(ProviderError::Timeout(format!(
                    "{} {} did not finish within {}s",
                    ctx.resource(),
                    ctx.phase(),
                    limit
                )))
            },
        }
    }

    async fn apply_metadata(
        &self,
        handler: &dyn ResourceHandler,
        ctx: &OpContext,
        id: &str,
        desired: &AttributeMap,
    ) -> Result<()> {
        let wanted = metadata::desired_entries(desired)?;
        if wanted.is_empty() && ctx.phase() == Phase::Create {
            return Ok(());
        }
        match handler.metadata_target(ctx, id, desired).await? {
            MetadataTarget::None => Ok(()),
            MetadataTarget::Unsupported(reason) => {
                if !wanted.is_empty() {
                    ctx.warn("Metadata was not applied", reason);
                }
                Ok(())
            },
            MetadataTarget::Object(object) => {
                let observed = ctx
                    .client()
                    .list_metadata(&object)
                    .await
                    .map_err(|e| ctx.api_error(e))?;
                let observed = metadata::managed_entries(desired, observed);
                let plan = MetadataPlan::diff(&wanted, &observed);
                if plan.is_empty() {
                    return Ok(());
                }
                debug!(id = %id, calls = plan.len(), "reconciling metadata");
                plan.apply(ctx.client(), &object)
                    .await
                    .map_err(|e| ctx.api_error(e))
            },
        }
    }
}

fn validate_attrs(schema: &Schema, attrs: &AttributeMap) -> Diagnostics {
    validation::validate(schema, &Value::Object(attrs.as_map().clone()))
}

async fn resolve_for_create(ctx: &OpContext, targets: &[LockTarget]) -> Result<Vec<ParentLockKey>> {
    ctx.resolver().resolve_all(targets).await.map_err(|err| match err {
        ProviderError::NotFound(msg) => {
            ProviderError::Precondition(format!("parent of {} not found: {}", ctx.resource(), msg))
        },
        other => other,
    })
}

fn ensure_not_cancelled(cancel: &CancellationToken, ctx: &OpContext) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled(format!(
            "{} {} was cancelled before any change was made",
            ctx.resource(),
            ctx.phase()
        )));
    }
    Ok(())
}

/// Keep configured values the read did not report, such as write-only secrets.
fn carry_forward(schema: &Schema, before: &AttributeMap, after: &mut AttributeMap) {
    let configurable = schema
        .block
        .attributes
        .iter()
        .filter(|(_, attr)| !attr.flags.is_computed_only())
        .map(|(name, _)| name)
        .chain(schema.block.blocks.keys());
    for name in configurable {
        if after.get(name).is_none() {
            if let Some(value) = before.get(name) {
                after.set(name.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::endpoints;
    use crate::schema::Attribute;
    use crate::testing::InMemoryVcd;
    use serde_json::json;
    use std::time::Duration;

    const ORG_LOCK: &str = "test_orgs";

    /// A minimal handler over the org endpoint.
    struct OrgHandler;

    #[async_trait]
    impl ResourceHandler for OrgHandler {
        fn type_name(&self) -> &'static str {
            "test_org"
        }

        fn schema(&self) -> Schema {
            Schema::v0()
                .with_attribute("name", Attribute::required_string().with_force_new())
                .with_attribute("description", Attribute::optional_string())
                .with_attribute("delete_note", Attribute::optional_string())
                .with_attribute("password", Attribute::optional_string().sensitive())
        }

        fn delete_time_only(&self) -> &'static [&'static str] {
            &["delete_note"]
        }

        fn lock_targets(&self, _attrs: &AttributeMap) -> Result<Vec<LockTarget>> {
            Ok(vec![LockTarget::Key(ParentLockKey::new(ORG_LOCK))])
        }

        async fn create(&self, ctx: &OpContext, desired: &AttributeMap) -> Result<String> {
            let body = json!({
                "name": desired.string("name")?,
                "description": desired.opt_string("description").unwrap_or_default(),
            });
            let created = ctx.create(endpoints::ORGS, body).await?;
            Ok(created["id"].as_str().unwrap_or_default().to_string())
        }

        async fn read(&self, ctx: &OpContext, id: &str, _known: &AttributeMap) -> Result<AttributeMap> {
            let raw = ctx.get(endpoints::ORGS, id).await?;
            let mut attrs = AttributeMap::new();
            attrs.set("name", raw["name"].clone());
            attrs.set("description", raw["description"].clone());
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
            let body = json!({
                "name": desired.string("name")?,
                "description": desired.opt_string("description").unwrap_or_default(),
            });
            ctx.update(endpoints::ORGS, id, body).await.map(|_| ())
        }

        async fn delete(&self, ctx: &OpContext, id: &str, _state: &AttributeMap) -> Result<()> {
            ctx.delete(endpoints::ORGS, id).await
        }
    }

    fn engine(vcd: &Arc<InMemoryVcd>, config: ProviderConfig) -> Engine {
        let mut engine = Engine::new(vcd.clone(), config);
        engine.register_resource(Arc::new(OrgHandler));
        engine
    }

    fn attrs(value: Value) -> AttributeMap {
        AttributeMap::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_resource_type() {
        let vcd = Arc::new(InMemoryVcd::sysadmin());
        let engine = engine(&vcd, ProviderConfig::default());
        let outcome = engine
            .create("test_nope", AttributeMap::new(), &CancellationToken::new())
            .await;
        assert!(outcome.has_errors());
        assert!(outcome.state.is_none());
    }

    #[tokio::test]
    async fn test_create_read_delete_cycle() {
        let vcd = Arc::new(InMemoryVcd::sysadmin());
        let engine = engine(&vcd, ProviderConfig::default());
        let cancel = CancellationToken::new();

        let created = engine
            .create("test_org", attrs(json!({"name": "o1", "password": "s3cret"})), &cancel)
            .await
            .into_result()
            .unwrap();
        assert!(created.is_present());
        // Write-only values survive the read-back.
        assert_eq!(created.attributes.opt_string("password").as_deref(), Some("s3cret"));

        let read = engine.read("test_org", created.clone(), &cancel).await;
        assert_eq!(read.id(), Some(created.id()));

        let deleted = engine.delete("test_org", created.clone(), &cancel).await;
        assert!(deleted.is_gone());
        assert!(!deleted.has_errors());

        let reread = engine.read("test_org", created, &cancel).await;
        assert!(reread.is_gone());
    }

    #[tokio::test]
    async fn test_force_new_change_is_rejected() {
        let vcd = Arc::new(InMemoryVcd::sysadmin());
        let engine = engine(&vcd, ProviderConfig::default());
        let cancel = CancellationToken::new();
        let created = engine
            .create("test_org", attrs(json!({"name": "o1"})), &cancel)
            .await
            .into_result()
            .unwrap();

        let outcome = engine
            .update("test_org", created, attrs(json!({"name": "o2"})), &cancel)
            .await;
        assert!(outcome.has_errors());
        assert!(outcome.diagnostics.as_slice()[0].summary.contains("requires replacing"));
    }

    #[tokio::test]
    async fn test_delete_time_only_change_makes_no_calls() {
        let vcd = Arc::new(InMemoryVcd::sysadmin());
        let engine = engine(&vcd, ProviderConfig::default());
        let cancel = CancellationToken::new();
        let created = engine
            .create("test_org", attrs(json!({"name": "o1"})), &cancel)
            .await
            .into_result()
            .unwrap();

        let writes = vcd.write_count();
        let updated = engine
            .update(
                "test_org",
                created,
                attrs(json!({"name": "o1", "delete_note": "bye"})),
                &cancel,
            )
            .await
            .into_result()
            .unwrap();
        assert_eq!(vcd.write_count(), writes);
        assert_eq!(updated.attributes.opt_string("delete_note").as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn test_cancel_before_create_makes_no_calls() {
        let vcd = Arc::new(InMemoryVcd::sysadmin());
        let engine = engine(&vcd, ProviderConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine
            .create("test_org", attrs(json!({"name": "o1"})), &cancel)
            .await;
        assert!(outcome.state.is_none());
        assert!(outcome.diagnostics.as_slice()[0].summary.contains("Cancelled"));
        assert_eq!(vcd.write_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let vcd = Arc::new(InMemoryVcd::sysadmin());
        vcd.set_delay(Duration::from_secs(3));
        let engine = engine(&vcd, ProviderConfig::default().with_timeout("test_org", 1));

        let outcome = engine
            .create("test_org", attrs(json!({"name": "o1"})), &CancellationToken::new())
            .await;
        assert!(outcome.has_errors());
        assert!(outcome.diagnostics.as_slice()[0].summary.contains("Timeout"));
    }

    #[tokio::test]
    async fn test_lock_wait_counts_against_the_deadline() {
        let vcd = Arc::new(InMemoryVcd::sysadmin());
        vcd.set_delay(Duration::from_millis(600));
        let engine = engine(&vcd, ProviderConfig::default().with_timeout("test_org", 1));

        let held = engine.mutexes().lock(&ParentLockKey::new(ORG_LOCK)).await;
        let holder = async {
            tokio::time::sleep(Duration::from_millis(700)).await;
            drop(held);
        };
        let cancel = CancellationToken::new();
        let create = engine.create("test_org", attrs(json!({"name": "o1"})), &cancel);
        let ((), outcome) = tokio::join!(holder, create);

        // 700ms waiting plus 600ms in the SDK overruns the one-second budget.
        assert!(outcome.state.is_none());
        assert!(outcome.diagnostics.as_slice()[0].summary.contains("Timeout"));
        assert_eq!(engine.mutexes().held_count(), 0);
        assert!(vcd.items(endpoints::ORGS).is_empty());
    }

    #[tokio::test]
    async fn test_read_policy() {
        let vcd: Arc<InMemoryVcd> = Arc::new(InMemoryVcd::sysadmin());
        let ctx = OpContext::new(vcd, "test_org", Phase::Read);
        let missing = async { Err(ProviderError::NotFound("gone".into())) };
        assert_eq!(
            read_with_policy(&ctx, "x", NotFoundPolicy::Tombstone, missing).await.unwrap(),
            ReadResult::Gone
        );
        let missing = async { Err(ProviderError::NotFound("gone".into())) };
        assert!(read_with_policy(&ctx, "x", NotFoundPolicy::Fail, missing).await.is_err());
    }

    #[tokio::test]
    async fn test_metadata_and_schema_listing() {
        let vcd = Arc::new(InMemoryVcd::sysadmin());
        let engine = engine(&vcd, ProviderConfig::default());
        assert_eq!(engine.metadata().resources, vec!["test_org".to_string()]);
        assert!(engine.schema().resources.contains_key("test_org"));
        assert!(engine
            .validate_resource_config("test_org", &AttributeMap::new())
            .has_errors());
    }
}
