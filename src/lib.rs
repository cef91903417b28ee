//! VCD Provider Engine
//!
//! This crate reconciles declared VMware Cloud Director configuration with
//! the objects that actually exist in VCD. Each resource type plugs into a
//! shared [`Engine`] that drives create, read, update, delete and import
//! with the same guarantees for every type.
//!
//! # Overview
//!
//! The engine provides:
//!
//! - **Schemas**: Typed attribute declarations with force-new, sensitive,
//!   delete-time-only and version-gated fields
//! - **Parent locks**: A process-wide keyed mutex that serializes writers
//!   of the same edge gateway, network, vApp or RDE type
//! - **Not-found handling**: Out-of-band removals become tombstones on read
//! - **Lookups**: Name or filter based data sources with exactly-one semantics
//! - **Metadata**: Diff-and-apply of legacy and namespaced metadata entries
//! - **Import**: Separator-aware import paths with arity errors that list
//!   the expected shape
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use vcd_provider::{Engine, ProviderConfig};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     vcd_provider::init_logging();
//!
//!     let client: Arc<dyn vcd_provider::VcdClient> = connect_to_vcd().await?;
//!     let engine = Engine::with_bundled(client, ProviderConfig::from_env()?);
//!
//!     let desired = vcd_provider::AttributeMap::from_value(json!({
//!         "edge_gateway_id": "urn:vcloud:gateway:...",
//!         "name": "net1",
//!         "gateway": "10.10.0.1",
//!         "prefix_length": 24,
//!     }))?;
//!     let outcome = engine
//!         .create("vcd_network_routed_v2", desired, &CancellationToken::new())
//!         .await;
//!     for diag in outcome.diagnostics.as_slice() {
//!         eprintln!("{:?}: {}", diag.severity, diag.summary);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Bundled Types
//!
//! Resources:
//!
//! - `vcd_network_routed_v2`
//! - `vcd_nsxt_network_dhcp`
//! - `vcd_nsxt_alb_controller`
//! - `vcd_nsxt_alb_edgegateway_service_engine_group`
//! - `vcd_nsxt_route_advertisement`
//! - `vcd_rde_type_behavior_acl`
//! - `vcd_solution_add_on_instance`
//! - `vcd_service_account`
//!
//! Data sources:
//!
//! - `vcd_network_routed_v2`
//! - `vcd_nsxt_manager`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod import;
pub mod logging;
pub mod lookup;
pub mod mapping;
pub mod metadata;
pub mod mutex;
pub mod parent;
pub mod resources;
pub mod schema;
pub mod testing;
pub mod token;
pub mod types;
pub mod urn;
pub mod validation;

// Re-export main types at crate root
pub use client::{ApiVersion, ObjectRef, Session, VcdClient};
pub use config::ProviderConfig;
pub use engine::{
    DataSourceHandler, Engine, NotFoundPolicy, OpContext, Outcome, Phase, ReadResult,
    ResourceHandler,
};
pub use error::{ApiError, ProviderError, Result};
pub use logging::{init_logging, init_logging_with_config, init_logging_with_default};
pub use mapping::AttributeMap;
pub use mutex::{MutexRegistry, ParentLockKey};
pub use schema::{Diagnostic, Diagnostics, ProviderSchema, Schema};
pub use types::{AttributeChange, ImportedResource, ProviderMetadata, ResourceInstance};
pub use urn::{EntityKind, Urn};
pub use validation::{is_valid, validate, validate_result};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tonic;
pub use tracing;
