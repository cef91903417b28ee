//! Testing utilities for the engine and resource handlers.
//!
//! [`InMemoryVcd`] is a [`VcdClient`] that keeps objects in memory, assigns
//! URNs, evaluates FIQL filters, stores metadata and records every call.
//! [`EngineTester`] wraps an [`Engine`] over it with lifecycle helpers.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vcd_provider::testing::{assert_no_errors, EngineTester, InMemoryVcd};
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_create_network() {
//!     let vcd = Arc::new(InMemoryVcd::sysadmin());
//!     let org = vcd.seed_org("org1");
//!     let vdc = vcd.seed_vdc(&org, "vdc1");
//!     let edge = vcd.seed_edge_gateway(&vdc, "edge1", true);
//!
//!     let tester = EngineTester::new(vcd);
//!     let outcome = tester
//!         .create("vcd_network_routed_v2", json!({
//!             "edge_gateway_id": edge,
//!             "name": "net1",
//!             "gateway": "10.0.0.1",
//!             "prefix_length": 24,
//!         }))
//!         .await;
//!     assert_no_errors(outcome.diagnostics.as_slice());
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{endpoints, ApiVersion, ObjectRef, Session, VcdClient};
use crate::config::ProviderConfig;
use crate::engine::{Engine, Outcome};
use crate::error::{ApiError, ProviderError};
use crate::mapping::{pointer, AttributeMap};
use crate::metadata::MetadataEntry;
use crate::schema::{Diagnostic, DiagnosticSeverity, Diagnostics, ProviderSchema};
use crate::types::ResourceInstance;
use crate::urn::Urn;

/// One recorded SDK call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Method name, e.g. `create` or `add_metadata`.
    pub method: &'static str,
    /// Endpoint the call addressed.
    pub endpoint: String,
    /// Object ID, when the call addressed one.
    pub id: Option<String>,
}

impl Call {
    /// Whether the call changes state in VCD.
    pub fn is_write(&self) -> bool {
        !matches!(self.method, "get" | "list" | "list_metadata")
    }

    /// Whether the call changes metadata.
    pub fn is_metadata_write(&self) -> bool {
        matches!(self.method, "add_metadata" | "update_metadata" | "delete_metadata")
    }
}

#[derive(Default)]
struct State {
    objects: HashMap<String, BTreeMap<String, Value>>,
    metadata: HashMap<ObjectRef, Vec<MetadataEntry>>,
    calls: Vec<Call>,
    failures: Vec<(&'static str, String, ApiError)>,
}

impl State {
    fn object(&self, endpoint: &str, id: &str) -> Option<&Value> {
        self.objects.get(endpoint).and_then(|items| items.get(id))
    }

    fn object_mut(&mut self, endpoint: &str, id: &str) -> Result<&mut Value, ApiError> {
        self.objects
            .get_mut(endpoint)
            .and_then(|items| items.get_mut(id))
            .ok_or_else(|| not_found(endpoint, id))
    }

    fn insert(&mut self, endpoint: &str, id: &str, mut body: Value) -> Value {
        body["id"] = Value::String(id.to_string());
        self.objects
            .entry(endpoint.to_string())
            .or_default()
            .insert(id.to_string(), body.clone());
        body
    }

    fn remove(&mut self, endpoint: &str, id: &str) -> Option<Value> {
        self.objects
            .get_mut(endpoint)
            .and_then(|items| items.remove(id))
    }
}

fn not_found(endpoint: &str, id: &str) -> ApiError {
    ApiError::not_found(format!("[ENF] entity {} not found at {}", id, endpoint))
}

/// Whether `item` satisfies a FIQL filter such as `name==a;ownerRef.id==b`.
fn fiql_matches(item: &Value, filter: &str) -> bool {
    filter
        .split(';')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once("==") {
            Some((path, raw)) => {
                let Ok(want) = urlencoding::decode(raw) else {
                    return false;
                };
                match pointer(item, path) {
                    Some(Value::String(have)) => *have == want,
                    Some(other) => other.to_string() == want,
                    None => false,
                }
            },
            None => false,
        })
}

/// Decrements the in-flight counter when a mutation ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-memory VCD.
pub struct InMemoryVcd {
    state: Mutex<State>,
    session: Mutex<Session>,
    api_version: Mutex<ApiVersion>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryVcd {
    /// Create a fake with the given session and API version.
    pub fn new(session: Session, api_version: ApiVersion) -> Self {
        Self {
            state: Mutex::new(State::default()),
            session: Mutex::new(session),
            api_version: Mutex::new(api_version),
            delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// A system administrator session on API 37.0.
    pub fn sysadmin() -> Self {
        Self::new(Session::sysadmin("administrator"), ApiVersion::new(37, 0))
    }

    /// A tenant session on API 37.0.
    pub fn tenant(org: &str) -> Self {
        Self::new(Session::tenant("tenant-admin", org), ApiVersion::new(37, 0))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Knobs
    // =========================================================================

    /// Change the negotiated API version.
    pub fn set_api_version(&self, version: ApiVersion) {
        *self.api_version.lock().unwrap_or_else(PoisonError::into_inner) = version;
    }

    /// Toggle system administrator privileges on the session.
    pub fn set_sysadmin(&self, is_sysadmin: bool) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_sysadmin = is_sysadmin;
    }

    /// Delay every mutating call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Fail the next `method` call on `endpoint` with `err`.
    pub fn fail_next(&self, method: &'static str, endpoint: &str, err: ApiError) {
        self.state()
            .failures
            .push((method, endpoint.to_string(), err));
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every call made so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Forget recorded calls.
    pub fn reset_calls(&self) {
        self.state().calls.clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    /// Number of calls that changed state.
    pub fn write_count(&self) -> usize {
        self.state().calls.iter().filter(|c| c.is_write()).count()
    }

    /// Number of calls that changed metadata.
    pub fn metadata_write_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.is_metadata_write())
            .count()
    }

    /// Highest number of mutating calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// An object, if present.
    pub fn get_item(&self, endpoint: &str, id: &str) -> Option<Value> {
        self.state().object(endpoint, id).cloned()
    }

    /// Every object at `endpoint`.
    pub fn items(&self, endpoint: &str) -> Vec<Value> {
        self.state()
            .objects
            .get(endpoint)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete an object behind the engine's back.
    pub fn remove_item(&self, endpoint: &str, id: &str) -> Option<Value> {
        self.state().remove(endpoint, id)
    }

    /// Metadata of an object.
    pub fn metadata_of(&self, endpoint: &str, id: &str) -> Vec<MetadataEntry> {
        self.state()
            .metadata
            .get(&ObjectRef::new(endpoint, id))
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Store an object, assigning a URN when it has no `id`.
    pub fn insert(&self, endpoint: &str, body: Value) -> String {
        let id = match body.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => new_id(endpoint),
        };
        self.state().insert(endpoint, &id, body);
        id
    }

    /// Seed an organization.
    pub fn seed_org(&self, name: &str) -> String {
        self.insert(endpoints::ORGS, json!({ "name": name }))
    }

    /// Seed an NSX-T backed VDC.
    pub fn seed_vdc(&self, org_id: &str, name: &str) -> String {
        self.insert(
            endpoints::VDCS,
            json!({ "name": name, "org": { "id": org_id }, "networkProviderType": "NSX_T" }),
        )
    }

    /// Seed an NSX-T backed VDC group.
    pub fn seed_vdc_group(&self, org_id: &str, name: &str) -> String {
        self.insert(
            endpoints::VDC_GROUPS,
            json!({ "name": name, "org": { "id": org_id }, "networkProviderType": "NSX_T" }),
        )
    }

    /// Seed an edge gateway owned by a VDC or VDC group.
    pub fn seed_edge_gateway(&self, owner_id: &str, name: &str, dedicated: bool) -> String {
        self.insert(
            endpoints::EDGE_GATEWAYS,
            json!({
                "name": name,
                "ownerRef": { "id": owner_id },
                "edgeGatewayUplinks": [{ "dedicated": dedicated }],
            }),
        )
    }

    /// Seed a routed network attached to an edge gateway.
    pub fn seed_routed_network(&self, owner_id: &str, edge_id: &str, name: &str) -> String {
        self.insert(
            endpoints::ORG_VDC_NETWORKS,
            json!({
                "name": name,
                "networkType": "NAT_ROUTED",
                "ownerRef": { "id": owner_id },
                "connection": { "routerRef": { "id": edge_id } },
                "subnets": { "values": [{
                    "gateway": "192.168.1.1",
                    "prefixLength": 24,
                    "ipRanges": { "values": [] },
                }]},
            }),
        )
    }

    /// Seed a registered NSX-T manager.
    pub fn seed_nsxt_manager(&self, name: &str) -> String {
        self.insert(
            endpoints::NSXT_MANAGERS,
            json!({ "name": name, "url": format!("https://{}.example.com", name) }),
        )
    }

    /// Seed an ALB service engine group.
    pub fn seed_service_engine_group(&self, name: &str) -> String {
        self.insert(endpoints::ALB_SERVICE_ENGINE_GROUPS, json!({ "name": name }))
    }

    /// Enable ALB on an edge gateway.
    pub fn enable_alb(&self, edge_id: &str) {
        self.insert(
            endpoints::EDGE_GATEWAY_ALB,
            json!({ "id": edge_id, "enabled": true }),
        );
    }

    /// Seed an RDE type.
    pub fn seed_rde_type(&self, vendor: &str, nss: &str, version: &str) -> String {
        self.insert(
            endpoints::ENTITY_TYPES,
            json!({ "vendor": vendor, "nss": nss, "version": version }),
        )
    }

    /// Seed a behavior of an RDE type.
    pub fn seed_behavior(&self, type_id: &str, name: &str) -> String {
        self.insert(
            endpoints::ENTITY_TYPE_BEHAVIORS,
            json!({ "name": name, "ref": type_id }),
        )
    }

    /// Seed a Solution Add-On.
    pub fn seed_add_on(&self, name: &str) -> String {
        self.insert(
            endpoints::ENTITIES,
            json!({ "name": name, "entityType": "solutionAddOn" }),
        )
    }

    // =========================================================================
    // Call plumbing
    // =========================================================================

    fn record(&self, method: &'static str, endpoint: &str, id: Option<&str>) -> Result<(), ApiError> {
        let mut state = self.state();
        state.calls.push(Call {
            method,
            endpoint: endpoint.to_string(),
            id: id.map(str::to_string),
        });
        let position = state
            .failures
            .iter()
            .position(|(m, e, _)| *m == method && e == endpoint);
        match position {
            Some(index) => Err(state.failures.remove(index).2),
            None => Ok(()),
        }
    }

    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut State) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        apply(&mut *self.state())
    }
}

fn new_id(endpoint: &str) -> String {
    match endpoints::kind_of(endpoint) {
        Some(kind) => Urn::generate(kind).to_string(),
        None => Uuid::new_v4().to_string(),
    }
}

#[async_trait]
impl VcdClient for InMemoryVcd {
    fn session(&self) -> Session {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn api_version(&self) -> ApiVersion {
        *self.api_version.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn get(&self, endpoint: &str, id: &str) -> Result<Value, ApiError> {
        self.record("get", endpoint, Some(id))?;
        self.state()
            .object(endpoint, id)
            .cloned()
            .ok_or_else(|| not_found(endpoint, id))
    }

    async fn list(&self, endpoint: &str, filter: Option<&str>) -> Result<Vec<Value>, ApiError> {
        self.record("list", endpoint, None)?;
        Ok(self
            .items(endpoint)
            .into_iter()
            .filter(|item| filter.map_or(true, |f| fiql_matches(item, f)))
            .collect())
    }

    async fn create(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        self.record("create", endpoint, None)?;
        let id = new_id(endpoint);
        self.mutate(|state| Ok(state.insert(endpoint, &id, body)))
            .await
    }

    async fn update(&self, endpoint: &str, id: &str, body: Value) -> Result<Value, ApiError> {
        self.record("update", endpoint, Some(id))?;
        self.mutate(|state| {
            state.object_mut(endpoint, id)?;
            Ok(state.insert(endpoint, id, body))
        })
        .await
    }

    async fn put(&self, endpoint: &str, id: &str, body: Value) -> Result<Value, ApiError> {
        self.record("put", endpoint, Some(id))?;
        self.mutate(|state| Ok(state.insert(endpoint, id, body)))
            .await
    }

    async fn delete(&self, endpoint: &str, id: &str) -> Result<(), ApiError> {
        self.record("delete", endpoint, Some(id))?;
        self.mutate(|state| {
            state
                .remove(endpoint, id)
                .map(|_| ())
                .ok_or_else(|| not_found(endpoint, id))
        })
        .await
    }

    async fn action(
        &self,
        endpoint: &str,
        id: &str,
        action: &str,
        _body: Value,
    ) -> Result<Value, ApiError> {
        self.record("action", endpoint, Some(id))?;
        self.mutate(|state| {
            let object = state.object_mut(endpoint, id)?;
            match action {
                "activate" => {
                    object["status"] = json!("ACTIVE");
                    Ok(json!({
                        "token_type": "Bearer",
                        "refresh_token": Uuid::new_v4().simple().to_string(),
                        "updated_on": "2024-01-01T00:00:00Z",
                    }))
                },
                "revoke" => {
                    object["status"] = json!("CREATED");
                    Ok(object.clone())
                },
                "delete" => {
                    state.remove(endpoint, id);
                    Ok(json!({}))
                },
                _ => Ok(object.clone()),
            }
        })
        .await
    }

    async fn list_metadata(&self, object: &ObjectRef) -> Result<Vec<MetadataEntry>, ApiError> {
        self.record("list_metadata", &object.endpoint, Some(&object.id))?;
        Ok(self
            .state()
            .metadata
            .get(object)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_metadata(&self, object: &ObjectRef, entry: &MetadataEntry) -> Result<(), ApiError> {
        self.record("add_metadata", &object.endpoint, Some(&object.id))?;
        let mut state = self.state();
        let entries = state.metadata.entry(object.clone()).or_default();
        if entries.iter().any(|e| e.identity() == entry.identity()) {
            return Err(ApiError::new(409, format!("metadata key '{}' already exists", entry.key)));
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn update_metadata(
        &self,
        object: &ObjectRef,
        entry: &MetadataEntry,
    ) -> Result<(), ApiError> {
        self.record("update_metadata", &object.endpoint, Some(&object.id))?;
        let mut state = self.state();
        let existing = state
            .metadata
            .get_mut(object)
            .and_then(|entries| entries.iter_mut().find(|e| e.identity() == entry.identity()))
            .ok_or_else(|| ApiError::not_found(format!("metadata key '{}' not found", entry.key)))?;
        *existing = entry.clone();
        Ok(())
    }

    async fn delete_metadata(
        &self,
        object: &ObjectRef,
        namespace: &str,
        key: &str,
    ) -> Result<(), ApiError> {
        self.record("delete_metadata", &object.endpoint, Some(&object.id))?;
        let mut state = self.state();
        let entries = state.metadata.entry(object.clone()).or_default();
        let before = entries.len();
        entries.retain(|e| e.identity() != (namespace, key));
        if entries.len() == before {
            return Err(ApiError::not_found(format!("metadata key '{}' not found", key)));
        }
        Ok(())
    }
}

/// A test harness around an [`Engine`] with every bundled handler.
pub struct EngineTester {
    vcd: Arc<InMemoryVcd>,
    engine: Engine,
}

impl EngineTester {
    /// Create a tester with the default configuration.
    pub fn new(vcd: Arc<InMemoryVcd>) -> Self {
        Self::with_config(vcd, ProviderConfig::default())
    }

    /// Create a tester with a specific configuration.
    pub fn with_config(vcd: Arc<InMemoryVcd>, config: ProviderConfig) -> Self {
        let engine = Engine::with_bundled(vcd.clone(), config);
        Self { vcd, engine }
    }

    /// The engine under test.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The fake VCD.
    pub fn vcd(&self) -> &InMemoryVcd {
        &self.vcd
    }

    // =========================================================================
    // Schema & Metadata
    // =========================================================================

    /// The provider schema.
    pub fn schema(&self) -> ProviderSchema {
        self.engine.schema()
    }

    /// Registered resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.engine.metadata().resources
    }

    /// Registered data source type names.
    pub fn data_source_types(&self) -> Vec<String> {
        self.engine.metadata().data_sources
    }

    // =========================================================================
    // Resource Operations
    // =========================================================================

    /// Create from a JSON configuration.
    pub async fn create(&self, resource_type: &str, config: Value) -> Outcome {
        match AttributeMap::from_value(config) {
            Ok(desired) => {
                self.engine
                    .create(resource_type, desired, &CancellationToken::new())
                    .await
            },
            Err(err) => invalid(&err),
        }
    }

    /// Refresh a stored instance.
    pub async fn read(&self, resource_type: &str, state: &ResourceInstance) -> Outcome {
        self.engine
            .read(resource_type, state.clone(), &CancellationToken::new())
            .await
    }

    /// Update a stored instance to a new JSON configuration.
    pub async fn update(&self, resource_type: &str, prior: &ResourceInstance, config: Value) -> Outcome {
        match AttributeMap::from_value(config) {
            Ok(desired) => {
                self.engine
                    .update(resource_type, prior.clone(), desired, &CancellationToken::new())
                    .await
            },
            Err(err) => invalid(&err),
        }
    }

    /// Delete a stored instance.
    pub async fn delete(&self, resource_type: &str, state: &ResourceInstance) -> Outcome {
        self.engine
            .delete(resource_type, state.clone(), &CancellationToken::new())
            .await
    }

    /// Import by path.
    pub async fn import(&self, resource_type: &str, path: &str) -> Outcome {
        self.engine
            .import(resource_type, path, &CancellationToken::new())
            .await
    }

    /// Read a data source from a JSON configuration.
    pub async fn read_data_source(&self, data_source_type: &str, config: Value) -> Outcome {
        match AttributeMap::from_value(config) {
            Ok(config) => {
                self.engine
                    .read_data_source(data_source_type, config, &CancellationToken::new())
                    .await
            },
            Err(err) => invalid(&err),
        }
    }

    // =========================================================================
    // Lifecycle Helpers
    // =========================================================================

    /// Run create → read and return the refreshed state.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<ResourceInstance, TestError> {
        let created = state_of(self.create(resource_type, config).await)?;
        state_of(self.read(resource_type, &created).await)
    }

    /// Run create → update → read → delete → read.
    ///
    /// Returns the state after the update. Fails if the final read still
    /// finds the object.
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_config: Value,
        updated_config: Value,
    ) -> Result<ResourceInstance, TestError> {
        let created = self.lifecycle_create(resource_type, initial_config).await?;
        let updated = state_of(self.update(resource_type, &created, updated_config).await)?;
        let updated = state_of(self.read(resource_type, &updated).await)?;

        state_of(self.delete(resource_type, &updated).await)?;
        let after = self.read(resource_type, &updated).await;
        if !after.is_gone() {
            return Err(TestError::Diagnostics(vec![Diagnostic::error(format!(
                "{} '{}' still exists after delete",
                resource_type,
                updated.id()
            ))]));
        }
        Ok(updated)
    }
}

fn invalid(err: &ProviderError) -> Outcome {
    let mut diagnostics = Diagnostics::new();
    diagnostics.push_error(err);
    Outcome {
        state: None,
        diagnostics,
    }
}

fn state_of(outcome: Outcome) -> Result<ResourceInstance, TestError> {
    let errors: Vec<Diagnostic> = outcome.diagnostics.errors().cloned().collect();
    if !errors.is_empty() {
        return Err(TestError::Diagnostics(errors));
    }
    outcome
        .state
        .ok_or_else(|| TestError::Provider(ProviderError::NotFound("operation produced no state".to_string())))
}

/// Error type for test operations that may fail with diagnostics.
#[derive(Debug)]
pub enum TestError {
    /// The operation failed with diagnostics.
    Diagnostics(Vec<Diagnostic>),
    /// The operation failed with a provider error.
    Provider(ProviderError),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Diagnostics(diags) => {
                writeln!(f, "Operation failed with {} diagnostic(s):", diags.len())?;
                for diag in diags {
                    write!(f, "  [{:?}] {}", diag.severity, diag.summary)?;
                    if let Some(detail) = &diag.detail {
                        write!(f, ": {}", detail)?;
                    }
                    if let Some(attr) = &diag.attribute {
                        write!(f, " (at {})", attr)?;
                    }
                    writeln!(f)?;
                }
                Ok(())
            },
            TestError::Provider(e) => write!(f, "Provider error: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ProviderError> for TestError {
    fn from(e: ProviderError) -> Self {
        TestError::Provider(e)
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if there are any error diagnostics.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
        .collect();

    assert!(
        errors.is_empty(),
        "Expected no errors, but got {} error(s): {:?}",
        errors.len(),
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that diagnostics contain at least one error.
///
/// # Panics
///
/// Panics if there are no error diagnostics.
pub fn assert_has_errors(diagnostics: &[Diagnostic]) {
    let has_errors = diagnostics
        .iter()
        .any(|d| matches!(d.severity, DiagnosticSeverity::Error));

    assert!(has_errors, "Expected at least one error, but got none");
}

/// Assert that diagnostics contain an error with the given summary substring.
///
/// # Panics
///
/// Panics if no error diagnostic contains the given substring.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    let has_matching_error = diagnostics
        .iter()
        .any(|d| matches!(d.severity, DiagnosticSeverity::Error) && d.summary.contains(substring));

    assert!(
        has_matching_error,
        "Expected an error containing '{}', but no matching error found. Errors: {:?}",
        substring,
        diagnostics
            .iter()
            .filter(|d| matches!(d.severity, DiagnosticSeverity::Error))
            .map(|d| &d.summary)
            .collect::<Vec<_>>()
    );
}

/// Assert that a warning mentions the given substring in its summary or detail.
///
/// # Panics
///
/// Panics if no warning matches.
pub fn assert_has_warning(diagnostics: &[Diagnostic], substring: &str) {
    let found = diagnostics.iter().any(|d| {
        matches!(d.severity, DiagnosticSeverity::Warning)
            && (d.summary.contains(substring)
                || d.detail.as_deref().is_some_and(|detail| detail.contains(substring)))
    });

    assert!(
        found,
        "Expected a warning containing '{}', but got: {:?}",
        substring,
        diagnostics
            .iter()
            .map(|d| (&d.severity, &d.summary, &d.detail))
            .collect::<Vec<_>>()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urn::is_urn;

    #[tokio::test]
    async fn test_create_assigns_urn() {
        let vcd = InMemoryVcd::sysadmin();
        let created = vcd
            .create(endpoints::ORG_VDC_NETWORKS, json!({ "name": "n" }))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();
        assert!(id.starts_with("urn:vcloud:network:"));
        assert!(is_urn(id));
    }

    #[tokio::test]
    async fn test_fiql_list() {
        let vcd = InMemoryVcd::sysadmin();
        let org = vcd.seed_org("org1");
        vcd.seed_vdc(&org, "vdc1");
        vcd.seed_vdc(&org, "vdc2");

        let filter = format!("name==vdc2;org.id=={}", org);
        let found = vcd.list(endpoints::VDCS, Some(&filter)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], "vdc2");
        assert_eq!(vcd.list(endpoints::VDCS, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fiql_list_with_reserved_characters() {
        let vcd = InMemoryVcd::sysadmin();
        let org = vcd.seed_org("org1");
        vcd.seed_vdc(&org, "a");
        vcd.seed_vdc(&org, "a;b,c");

        let filter = crate::lookup::fiql(&[("name", "a;b,c"), ("org.id", org.as_str())]);
        let found = vcd.list(endpoints::VDCS, Some(&filter)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], "a;b,c");
    }

    #[tokio::test]
    async fn test_fail_next_only_once() {
        let vcd = InMemoryVcd::sysadmin();
        vcd.fail_next("create", endpoints::ORGS, ApiError::new(500, "boom"));
        assert!(vcd.create(endpoints::ORGS, json!({})).await.is_err());
        assert!(vcd.create(endpoints::ORGS, json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_metadata_store() {
        let vcd = InMemoryVcd::sysadmin();
        let object = ObjectRef::new(endpoints::ORG_VDC_NETWORKS, "n1");
        vcd.add_metadata(&object, &MetadataEntry::string("k", "v"))
            .await
            .unwrap();
        assert!(vcd
            .add_metadata(&object, &MetadataEntry::string("k", "v"))
            .await
            .is_err());
        vcd.update_metadata(&object, &MetadataEntry::string("k", "v2"))
            .await
            .unwrap();
        assert_eq!(vcd.metadata_of(endpoints::ORG_VDC_NETWORKS, "n1")[0].value, "v2");
        vcd.delete_metadata(&object, "", "k").await.unwrap();
        assert!(vcd.delete_metadata(&object, "", "k").await.is_err());
        // Rejected calls are still recorded.
        assert_eq!(vcd.metadata_write_count(), 5);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let vcd = InMemoryVcd::sysadmin();
        let err = vcd.get(endpoints::ORGS, "nope").await.unwrap_err();
        assert_eq!(err.status, 404);
    }

    #[test]
    fn test_assert_no_errors() {
        let diagnostics = vec![Diagnostic::warning("Just a warning")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    #[should_panic(expected = "Expected no errors")]
    fn test_assert_no_errors_fails() {
        let diagnostics = vec![Diagnostic::error("An error")];
        assert_no_errors(&diagnostics);
    }

    #[test]
    fn test_assert_has_errors() {
        let diagnostics = vec![Diagnostic::error("An error")];
        assert_has_errors(&diagnostics);
    }

    #[test]
    fn test_assert_error_contains() {
        let diagnostics = vec![Diagnostic::error("Invalid configuration")];
        assert_error_contains(&diagnostics, "Invalid");
        assert_error_contains(&diagnostics, "configuration");
    }

    #[test]
    fn test_assert_has_warning_checks_detail() {
        let diagnostics = vec![Diagnostic::warning("Metadata was not applied")
            .with_detail("owned by a VDC group")];
        assert_has_warning(&diagnostics, "VDC group");
    }

    #[test]
    fn test_error_display() {
        let error = TestError::Diagnostics(vec![
            Diagnostic::error("First error").with_attribute("field1"),
            Diagnostic::error("Second error").with_detail("More info"),
        ]);
        let display = format!("{}", error);
        assert!(display.contains("First error"));
        assert!(display.contains("Second error"));
        assert!(display.contains("field1"));
        assert!(display.contains("More info"));
    }
}
