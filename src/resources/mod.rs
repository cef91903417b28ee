//! Bundled resource and data source handlers.
//!
//! Each handler contributes a schema and the mapping between attributes and
//! VCD payloads. Locking, preflight, metadata and refresh are left to the
//! [`Engine`](crate::engine::Engine).

use std::sync::Arc;

use serde_json::Value;

use crate::engine::Engine;
use crate::error::{ProviderError, Result};
use crate::mapping::{pointer, pointer_str, AttributeMap};

mod alb_controller;
mod alb_service_engine_group;
mod network_dhcp;
mod network_routed;
mod nsxt_manager;
mod rde_behavior_acl;
mod route_advertisement;
mod service_account;
mod solution_add_on;

pub use alb_controller::AlbController;
pub use alb_service_engine_group::AlbServiceEngineGroupAssignment;
pub use network_dhcp::NetworkDhcp;
pub use network_routed::{RoutedNetwork, RoutedNetworkDataSource};
pub use nsxt_manager::NsxtManagerDataSource;
pub use rde_behavior_acl::RdeTypeBehaviorAcl;
pub use route_advertisement::RouteAdvertisement;
pub use service_account::ServiceAccount;
pub use solution_add_on::SolutionAddOnInstance;

/// Register every bundled handler.
pub fn register_all(engine: &mut Engine) {
    engine.register_resource(Arc::new(RoutedNetwork));
    engine.register_resource(Arc::new(NetworkDhcp));
    engine.register_resource(Arc::new(AlbServiceEngineGroupAssignment));
    engine.register_resource(Arc::new(AlbController));
    engine.register_resource(Arc::new(RdeTypeBehaviorAcl));
    engine.register_resource(Arc::new(SolutionAddOnInstance));
    engine.register_resource(Arc::new(ServiceAccount));
    engine.register_resource(Arc::new(RouteAdvertisement));

    engine.register_data_source(Arc::new(RoutedNetworkDataSource));
    engine.register_data_source(Arc::new(NsxtManagerDataSource));
}

/// The `id` VCD assigned to an object.
fn object_id(raw: &Value, what: &str) -> Result<String> {
    pointer_str(raw, "id")
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Validation(format!("{} returned without an id", what)))
}

/// Copy a string field, writing `""` when VCD omits it.
fn copy_str(attrs: &mut AttributeMap, name: &str, raw: &Value, path: &str) {
    attrs.set(name, pointer_str(raw, path).unwrap_or_default());
}

/// Copy a boolean field, writing `default` when VCD omits it.
fn copy_bool(attrs: &mut AttributeMap, name: &str, raw: &Value, path: &str, default: bool) {
    attrs.set(
        name,
        pointer(raw, path).and_then(Value::as_bool).unwrap_or(default),
    );
}

/// Pool blocks as `{start_address, end_address}` objects.
fn pool_blocks(ranges: Option<&Value>) -> Value {
    let pools = ranges
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "start_address": pointer_str(r, "startAddress").unwrap_or_default(),
                        "end_address": pointer_str(r, "endAddress").unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Array(pools)
}

/// Pool blocks as VCD address ranges.
fn pool_ranges(attrs: &AttributeMap, block: &str) -> Result<Vec<Value>> {
    attrs
        .objects(block)
        .iter()
        .map(|pool| {
            Ok(serde_json::json!({
                "startAddress": pool.string("start_address")?,
                "endAddress": pool.string("end_address")?,
            }))
        })
        .collect()
}
