//! End-to-end lifecycles of the bundled resource types against the
//! in-memory VCD.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use vcd_provider::client::endpoints;
use vcd_provider::testing::{
    assert_error_contains, assert_has_errors, assert_has_warning, assert_no_errors,
    EngineTester, InMemoryVcd,
};
use vcd_provider::metadata::MetadataEntry;
use vcd_provider::urn::Urn;
use vcd_provider::{ApiError, ApiVersion, EntityKind, ObjectRef, ProviderConfig, VcdClient};

const NETWORK: &str = "vcd_network_routed_v2";

struct Site {
    org: String,
    vdc: String,
    edge: String,
}

fn site(vcd: &InMemoryVcd) -> Site {
    let org = vcd.seed_org("org1");
    let vdc = vcd.seed_vdc(&org, "vdc1");
    let edge = vcd.seed_edge_gateway(&vdc, "edge1", true);
    Site { org, vdc, edge }
}

fn network_config(edge: &str, name: &str) -> serde_json::Value {
    json!({
        "edge_gateway_id": edge,
        "name": name,
        "gateway": "10.10.0.1",
        "prefix_length": 24,
        "static_ip_pool": [{ "start_address": "10.10.0.10", "end_address": "10.10.0.20" }],
    })
}

#[tokio::test]
async fn test_bundled_types_registered() {
    let tester = EngineTester::new(Arc::new(InMemoryVcd::sysadmin()));
    let resources = tester.resource_types();
    assert_eq!(resources.len(), 8);
    assert!(resources.contains(&NETWORK.to_string()));
    assert!(resources.contains(&"vcd_service_account".to_string()));
    assert_eq!(
        tester.data_source_types(),
        vec!["vcd_network_routed_v2".to_string(), "vcd_nsxt_manager".to_string()]
    );
    assert!(tester.schema().resources.contains_key("vcd_nsxt_network_dhcp"));
}

#[tokio::test]
async fn test_routed_network_crud() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());

    let mut updated = network_config(&site.edge, "net1");
    updated["description"] = json!("updated");

    let state = tester
        .lifecycle_crud(NETWORK, network_config(&site.edge, "net1"), updated)
        .await
        .unwrap();
    assert_eq!(state.attributes.opt_string("description").as_deref(), Some("updated"));
    assert_eq!(state.attributes.opt_string("owner_id"), Some(site.vdc.clone()));
    assert!(vcd.items(endpoints::ORG_VDC_NETWORKS).is_empty());
}

#[tokio::test]
async fn test_import_arity_error_lists_shape() {
    let tester = EngineTester::new(Arc::new(InMemoryVcd::sysadmin()));
    let outcome = tester.import(NETWORK, "orgA.vdcB").await;
    assert!(outcome.state.is_none());
    assert_error_contains(
        outcome.diagnostics.as_slice(),
        "resource name must be specified as org-name.vdc-name.network-name",
    );
}

#[tokio::test]
async fn test_import_routed_network() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let network = vcd.seed_routed_network(&site.vdc, &site.edge, "net1");
    let tester = EngineTester::new(vcd);

    let outcome = tester.import(NETWORK, "org1.vdc1.net1").await;
    assert_no_errors(outcome.diagnostics.as_slice());
    let state = outcome.into_result().unwrap();
    assert_eq!(state.id(), network);
    assert_eq!(state.attributes.opt_string("org").as_deref(), Some("org1"));
    assert_eq!(state.attributes.opt_string("edge_gateway_id"), Some(site.edge));
}

#[tokio::test]
async fn test_import_with_custom_separator() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    vcd.seed_routed_network(&site.vdc, &site.edge, "net.with.dots");
    let config = ProviderConfig::default().with_import_separator("/");
    let tester = EngineTester::with_config(vcd, config);

    let outcome = tester.import(NETWORK, "org1/vdc1/net.with.dots").await;
    assert_no_errors(outcome.diagnostics.as_slice());
    assert!(outcome.id().is_some());
}

#[tokio::test]
async fn test_nsxt_manager_lookup_by_name() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let manager = vcd.seed_nsxt_manager("nsxt1");
    let tester = EngineTester::new(vcd);

    let outcome = tester
        .read_data_source("vcd_nsxt_manager", json!({ "name": "nsxt1" }))
        .await;
    assert_no_errors(outcome.diagnostics.as_slice());
    let state = outcome.into_result().unwrap();
    assert_eq!(state.id(), manager);
    assert!(Urn::parse(state.id()).unwrap().is_kind(EntityKind::NsxtManager));
    assert_eq!(state.attributes.opt_string("name").as_deref(), Some("nsxt1"));
    assert_eq!(
        state.attributes.opt_string("url").as_deref(),
        Some("https://nsxt1.example.com")
    );
}

#[tokio::test]
async fn test_nsxt_manager_requires_sysadmin() {
    let vcd = Arc::new(InMemoryVcd::tenant("org1"));
    vcd.seed_nsxt_manager("nsxt1");
    let tester = EngineTester::new(vcd.clone());

    let outcome = tester
        .read_data_source("vcd_nsxt_manager", json!({ "name": "nsxt1" }))
        .await;
    assert_error_contains(outcome.diagnostics.as_slice(), "System administrator");
    assert!(vcd.calls().is_empty());
}

#[tokio::test]
async fn test_out_of_band_removal_tombstones() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());

    let state = tester
        .lifecycle_create(NETWORK, network_config(&site.edge, "net1"))
        .await
        .unwrap();
    vcd.remove_item(endpoints::ORG_VDC_NETWORKS, state.id());

    let outcome = tester.read(NETWORK, &state).await;
    assert_no_errors(outcome.diagnostics.as_slice());
    assert!(outcome.is_gone());

    // Deleting the tombstone is a no-op.
    vcd.reset_calls();
    let deleted = tester.delete(NETWORK, outcome.state.as_ref().unwrap()).await;
    assert_no_errors(deleted.diagnostics.as_slice());
    assert_eq!(vcd.write_count(), 0);
}

#[tokio::test]
async fn test_delete_of_vanished_object_succeeds() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());

    let state = tester
        .lifecycle_create(NETWORK, network_config(&site.edge, "net1"))
        .await
        .unwrap();
    vcd.remove_item(endpoints::ORG_VDC_NETWORKS, state.id());

    let outcome = tester.delete(NETWORK, &state).await;
    assert!(outcome.is_gone());
}

#[tokio::test]
async fn test_dhcp_dns_servers_gated_by_api_version() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let network = vcd.seed_routed_network(&site.vdc, &site.edge, "net1");
    vcd.set_api_version(ApiVersion::new(36, 0));
    let tester = EngineTester::new(vcd.clone());

    let outcome = tester
        .create(
            "vcd_nsxt_network_dhcp",
            json!({
                "org_network_id": network,
                "pool": [{ "start_address": "192.168.1.10", "end_address": "192.168.1.20" }],
                "dns_servers": ["1.1.1.1"],
            }),
        )
        .await;
    assert!(outcome.state.is_none());
    assert_error_contains(
        outcome.diagnostics.as_slice(),
        "dns_servers is supported from VCD 10.3.1+",
    );
    assert_eq!(vcd.write_count(), 0);

    vcd.set_api_version(ApiVersion::new(36, 1));
    let outcome = tester
        .create(
            "vcd_nsxt_network_dhcp",
            json!({
                "org_network_id": network,
                "pool": [{ "start_address": "192.168.1.10", "end_address": "192.168.1.20" }],
                "dns_servers": ["1.1.1.1"],
            }),
        )
        .await;
    assert_no_errors(outcome.diagnostics.as_slice());
    let state = outcome.into_result().unwrap();
    assert_eq!(state.id(), network);
    assert_eq!(state.attributes.int("lease_time").unwrap(), 86400);
}

#[tokio::test]
async fn test_network_data_source_name_and_filter_conflict() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    vcd.seed_routed_network(&site.vdc, &site.edge, "net1");
    let tester = EngineTester::new(vcd);

    let both = tester
        .read_data_source(
            NETWORK,
            json!({ "name": "net1", "filter": [{ "name_regex": "^net" }] }),
        )
        .await;
    assert!(both.state.is_none());
    assert_error_contains(both.diagnostics.as_slice(), "conflicts with");

    let neither = tester.read_data_source(NETWORK, json!({})).await;
    assert!(neither.state.is_none());
    assert_error_contains(neither.diagnostics.as_slice(), "no name or filter");
}

#[tokio::test]
async fn test_network_data_source_filter() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let first = vcd.seed_routed_network(&site.vdc, &site.edge, "net1");
    vcd.seed_routed_network(&site.vdc, &site.edge, "other");
    let tester = EngineTester::new(vcd);

    let outcome = tester
        .read_data_source(NETWORK, json!({ "filter": [{ "name_regex": "^net" }] }))
        .await;
    assert_no_errors(outcome.diagnostics.as_slice());
    assert_eq!(outcome.id(), Some(first.as_str()));

    // Both seeded networks share 192.168.1.0/24.
    let ambiguous = tester
        .read_data_source(NETWORK, json!({ "filter": [{ "ip": "192.168.1.50" }] }))
        .await;
    assert_error_contains(ambiguous.diagnostics.as_slice(), "more than one");

    let none = tester
        .read_data_source(NETWORK, json!({ "filter": [{ "name_regex": "^zzz" }] }))
        .await;
    assert_has_errors(none.diagnostics.as_slice());
}

#[tokio::test]
async fn test_network_data_source_name_with_separators() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    vcd.seed_routed_network(&site.vdc, &site.edge, "net");
    let odd = vcd.seed_routed_network(&site.vdc, &site.edge, "net;prod,eu");
    let tester = EngineTester::new(vcd);

    let outcome = tester
        .read_data_source(NETWORK, json!({ "name": "net;prod,eu" }))
        .await;
    assert_no_errors(outcome.diagnostics.as_slice());
    assert_eq!(outcome.id(), Some(odd.as_str()));
}

#[tokio::test]
async fn test_network_data_source_reports_metadata() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let id = vcd.seed_routed_network(&site.vdc, &site.edge, "net1");
    let object = ObjectRef::new(endpoints::ORG_VDC_NETWORKS, &id);
    vcd.add_metadata(&object, &MetadataEntry::string("env", "prod"))
        .await
        .unwrap();
    let owner = MetadataEntry {
        namespace: "ops".to_string(),
        ..MetadataEntry::string("owner", "netops")
    };
    vcd.add_metadata(&object, &owner).await.unwrap();
    let tester = EngineTester::new(vcd);

    let outcome = tester
        .read_data_source(NETWORK, json!({ "name": "net1" }))
        .await;
    assert_no_errors(outcome.diagnostics.as_slice());
    let state = outcome.into_result().unwrap();

    let legacy = state.attributes.string_map("metadata");
    assert_eq!(legacy.len(), 1);
    assert_eq!(legacy["env"], json!("prod"));
    assert_eq!(state.attributes.objects("metadata_entry").len(), 2);
}

#[tokio::test]
async fn test_service_account_token_file_needs_consent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("token.json");
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let tester = EngineTester::new(vcd.clone());
    let config = |allow: bool| {
        json!({
            "name": "sa1",
            "software_id": "12345678-1234-1234-1234-123456789012",
            "role_id": "urn:vcloud:role:11111111-1111-1111-1111-111111111111",
            "active": true,
            "file_name": path.to_string_lossy(),
            "allow_token_file": allow,
        })
    };

    let refused = tester.create("vcd_service_account", config(false)).await;
    assert!(refused.state.is_none());
    assert_error_contains(refused.diagnostics.as_slice(), "allow_token_file");
    assert!(!path.exists());
    assert_eq!(vcd.write_count(), 0);

    let accepted = tester.create("vcd_service_account", config(true)).await;
    assert_no_errors(accepted.diagnostics.as_slice());
    let state = accepted.into_result().unwrap();
    assert_eq!(state.attributes.opt_bool("active"), Some(true));
    assert_eq!(state.attributes.opt_string("status").as_deref(), Some("ACTIVE"));

    let token: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(token["token_type"], "Service Account");
    assert!(!token["refresh_token"].as_str().unwrap().is_empty());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_metadata_on_vdc_group_network_warns() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let org = vcd.seed_org("org1");
    let group = vcd.seed_vdc_group(&org, "group1");
    let edge = vcd.seed_edge_gateway(&group, "edge1", true);
    let tester = EngineTester::new(vcd.clone());

    let mut config = network_config(&edge, "net1");
    config["metadata"] = json!({ "env": "prod" });
    let outcome = tester.create(NETWORK, config).await;

    assert_no_errors(outcome.diagnostics.as_slice());
    assert_has_warning(outcome.diagnostics.as_slice(), "VDC group");
    assert!(outcome.id().is_some());
    assert_eq!(vcd.metadata_write_count(), 0);
}

#[tokio::test]
async fn test_metadata_reconcile_is_idempotent() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());

    let mut config = network_config(&site.edge, "net1");
    config["metadata"] = json!({ "env": "prod", "team": "net" });
    let state = tester
        .lifecycle_create(NETWORK, config.clone())
        .await
        .unwrap();
    assert_eq!(vcd.metadata_write_count(), 2);
    assert_eq!(vcd.metadata_of(endpoints::ORG_VDC_NETWORKS, state.id()).len(), 2);

    let again = tester.update(NETWORK, &state, config.clone()).await;
    assert_no_errors(again.diagnostics.as_slice());
    assert_eq!(vcd.metadata_write_count(), 2);

    config["metadata"] = json!({ "env": "dev" });
    let changed = tester.update(NETWORK, &state, config).await;
    assert_no_errors(changed.diagnostics.as_slice());
    // One update and one delete.
    assert_eq!(vcd.metadata_write_count(), 4);
    let entries = vcd.metadata_of(endpoints::ORG_VDC_NETWORKS, state.id());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, "dev");
}

#[tokio::test]
async fn test_legacy_metadata_keeps_namespaced_entries() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());

    let mut config = network_config(&site.edge, "net1");
    config["metadata"] = json!({ "env": "prod" });
    let state = tester
        .lifecycle_create(NETWORK, config.clone())
        .await
        .unwrap();

    let object = ObjectRef::new(endpoints::ORG_VDC_NETWORKS, state.id());
    let owner = MetadataEntry {
        namespace: "ops".to_string(),
        ..MetadataEntry::string("owner", "netops")
    };
    vcd.add_metadata(&object, &owner).await.unwrap();

    config["metadata"] = json!({ "env": "dev" });
    let outcome = tester.update(NETWORK, &state, config).await;
    assert_no_errors(outcome.diagnostics.as_slice());

    let entries = vcd.metadata_of(endpoints::ORG_VDC_NETWORKS, state.id());
    assert_eq!(entries.len(), 2);
    assert!(entries.contains(&owner));
    assert!(entries.contains(&MetadataEntry::string("env", "dev")));
}

#[tokio::test]
async fn test_ignore_metadata_changes_warns() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let config = ProviderConfig {
        ignore_metadata_changes: true,
        ..ProviderConfig::default()
    };
    let tester = EngineTester::with_config(vcd.clone(), config);

    let state = tester
        .lifecycle_create(NETWORK, network_config(&site.edge, "net1"))
        .await
        .unwrap();
    let mut desired = network_config(&site.edge, "net1");
    desired["metadata"] = json!({ "env": "prod" });
    let outcome = tester.update(NETWORK, &state, desired).await;

    assert_no_errors(outcome.diagnostics.as_slice());
    assert_has_warning(outcome.diagnostics.as_slice(), "Metadata changes ignored");
    assert_eq!(vcd.metadata_write_count(), 0);
}

#[tokio::test]
async fn test_writers_of_one_edge_gateway_are_serialized() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    vcd.set_delay(Duration::from_millis(100));
    let tester = EngineTester::new(vcd.clone());

    let (a, b) = tokio::join!(
        tester.create(NETWORK, network_config(&site.edge, "net1")),
        tester.create(NETWORK, network_config(&site.edge, "net2")),
    );
    assert_no_errors(a.diagnostics.as_slice());
    assert_no_errors(b.diagnostics.as_slice());
    assert_eq!(vcd.max_in_flight(), 1);
}

#[tokio::test]
async fn test_writers_of_different_edge_gateways_overlap() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let other_edge = vcd.seed_edge_gateway(&site.vdc, "edge2", true);
    vcd.set_delay(Duration::from_millis(100));
    let tester = EngineTester::new(vcd.clone());

    let (a, b) = tokio::join!(
        tester.create(NETWORK, network_config(&site.edge, "net1")),
        tester.create(NETWORK, network_config(&other_edge, "net2")),
    );
    assert_no_errors(a.diagnostics.as_slice());
    assert_no_errors(b.diagnostics.as_slice());
    assert_eq!(vcd.max_in_flight(), 2);
}

#[tokio::test]
async fn test_edge_gateways_of_one_vdc_group_share_a_lock() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let org = vcd.seed_org("org1");
    let group = vcd.seed_vdc_group(&org, "group1");
    let edge1 = vcd.seed_edge_gateway(&group, "edge1", true);
    let edge2 = vcd.seed_edge_gateway(&group, "edge2", true);
    vcd.set_delay(Duration::from_millis(100));
    let tester = EngineTester::new(vcd.clone());

    let (a, b) = tokio::join!(
        tester.create(NETWORK, network_config(&edge1, "net1")),
        tester.create(NETWORK, network_config(&edge2, "net2")),
    );
    assert_no_errors(a.diagnostics.as_slice());
    assert_no_errors(b.diagnostics.as_slice());
    assert_eq!(vcd.max_in_flight(), 1);
}

#[tokio::test]
async fn test_moving_network_locks_both_edge_gateways() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let other_edge = vcd.seed_edge_gateway(&site.vdc, "edge2", true);
    let tester = EngineTester::new(vcd.clone());

    let state = tester
        .lifecycle_create(NETWORK, network_config(&site.edge, "net1"))
        .await
        .unwrap();
    vcd.set_delay(Duration::from_millis(100));
    vcd.reset_calls();

    let (moved, created) = tokio::join!(
        tester.update(NETWORK, &state, network_config(&other_edge, "net1")),
        tester.create(NETWORK, network_config(&site.edge, "net2")),
    );
    assert_no_errors(moved.diagnostics.as_slice());
    assert_no_errors(created.diagnostics.as_slice());
    assert_eq!(vcd.max_in_flight(), 1);
    assert_eq!(tester.engine().mutexes().held_count(), 0);

    let raw = vcd.get_item(endpoints::ORG_VDC_NETWORKS, state.id()).unwrap();
    assert_eq!(raw["connection"]["routerRef"]["id"], json!(other_edge));
}

#[tokio::test]
async fn test_metadata_failure_after_create_keeps_id() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());
    vcd.fail_next(
        "add_metadata",
        endpoints::ORG_VDC_NETWORKS,
        ApiError::new(500, "metadata service unavailable"),
    );

    let mut config = network_config(&site.edge, "net1");
    config["metadata"] = json!({ "env": "prod" });
    let outcome = tester.create(NETWORK, config).await;

    assert_error_contains(
        outcome.diagnostics.as_slice(),
        "[vcd_network_routed_v2 create] metadata service unavailable",
    );
    let id = outcome.id().expect("created object must stay in state");
    assert!(vcd.get_item(endpoints::ORG_VDC_NETWORKS, id).is_some());
    assert_eq!(tester.engine().mutexes().held_count(), 0);
}

#[tokio::test]
async fn test_failed_create_releases_parent_lock() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());
    vcd.fail_next(
        "create",
        endpoints::ORG_VDC_NETWORKS,
        ApiError::new(500, "quota exceeded"),
    );

    let failed = tester.create(NETWORK, network_config(&site.edge, "net1")).await;
    assert!(failed.id().is_none());
    assert_error_contains(
        failed.diagnostics.as_slice(),
        "[vcd_network_routed_v2 create] quota exceeded",
    );
    assert_eq!(tester.engine().mutexes().held_count(), 0);
    assert!(vcd.items(endpoints::ORG_VDC_NETWORKS).is_empty());

    let retried = tester.create(NETWORK, network_config(&site.edge, "net1")).await;
    assert_no_errors(retried.diagnostics.as_slice());
    assert!(retried.id().is_some());
}

#[tokio::test]
async fn test_failed_update_keeps_prior_state() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());

    let state = tester
        .lifecycle_create(NETWORK, network_config(&site.edge, "net1"))
        .await
        .unwrap();
    vcd.fail_next(
        "update",
        endpoints::ORG_VDC_NETWORKS,
        ApiError::new(503, "busy"),
    );

    let mut desired = network_config(&site.edge, "net1");
    desired["description"] = json!("changed");
    let outcome = tester.update(NETWORK, &state, desired).await;

    assert_error_contains(outcome.diagnostics.as_slice(), "[vcd_network_routed_v2 update] busy");
    assert_eq!(outcome.id(), Some(state.id()));
    assert_eq!(tester.engine().mutexes().held_count(), 0);
}

#[tokio::test]
async fn test_missing_parent_is_precondition_error() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let tester = EngineTester::new(vcd.clone());
    let missing = Urn::generate(EntityKind::Gateway).to_string();

    let outcome = tester.create(NETWORK, network_config(&missing, "net1")).await;
    assert!(outcome.state.is_none());
    assert_error_contains(outcome.diagnostics.as_slice(), "parent of vcd_network_routed_v2 not found");
    assert_eq!(vcd.write_count(), 0);
}

#[tokio::test]
async fn test_stale_parent_blocks_update() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let tester = EngineTester::new(vcd.clone());

    let state = tester
        .lifecycle_create(NETWORK, network_config(&site.edge, "net1"))
        .await
        .unwrap();
    let other_edge = vcd.seed_edge_gateway(&site.vdc, "edge2", true);

    let mut raw = vcd.get_item(endpoints::ORG_VDC_NETWORKS, state.id()).unwrap();
    raw["connection"]["routerRef"]["id"] = json!(other_edge);
    vcd.insert(endpoints::ORG_VDC_NETWORKS, raw);

    let mut desired = network_config(&site.edge, "net1");
    desired["description"] = json!("changed");
    let outcome = tester.update(NETWORK, &state, desired).await;
    assert_error_contains(outcome.diagnostics.as_slice(), "is stale");
    assert_eq!(outcome.state.as_ref().map(|s| s.id()), Some(state.id()));
}

#[tokio::test]
async fn test_alb_assignment_requires_alb() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let se_group = vcd.seed_service_engine_group("seg1");
    let tester = EngineTester::new(vcd.clone());
    let config = json!({
        "edge_gateway_id": site.edge,
        "service_engine_group_id": se_group,
        "max_virtual_services": "10",
        "reserved_virtual_services": "",
    });

    let refused = tester
        .create("vcd_nsxt_alb_edgegateway_service_engine_group", config.clone())
        .await;
    assert_error_contains(refused.diagnostics.as_slice(), "ALB is not enabled");
    assert_eq!(vcd.write_count(), 0);

    vcd.enable_alb(&site.edge);
    let state = tester
        .lifecycle_create("vcd_nsxt_alb_edgegateway_service_engine_group", config)
        .await
        .unwrap();
    assert_eq!(state.attributes.opt_string("max_virtual_services").as_deref(), Some("10"));
    assert_eq!(state.attributes.opt_string("reserved_virtual_services"), None);
}

#[tokio::test]
async fn test_alb_assignment_import() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let se_group = vcd.seed_service_engine_group("seg1");
    vcd.enable_alb(&site.edge);
    let tester = EngineTester::new(vcd.clone());
    let created = tester
        .lifecycle_create(
            "vcd_nsxt_alb_edgegateway_service_engine_group",
            json!({ "edge_gateway_id": site.edge, "service_engine_group_id": se_group }),
        )
        .await
        .unwrap();

    let imported = tester
        .import(
            "vcd_nsxt_alb_edgegateway_service_engine_group",
            "org1.vdc1.edge1.seg1",
        )
        .await;
    assert_no_errors(imported.diagnostics.as_slice());
    assert_eq!(imported.id(), Some(created.id()));
}

#[tokio::test]
async fn test_route_advertisement_requires_dedicated_gateway() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let site = site(&vcd);
    let shared = vcd.seed_edge_gateway(&site.vdc, "shared", false);
    let tester = EngineTester::new(vcd.clone());

    let refused = tester
        .create(
            "vcd_nsxt_route_advertisement",
            json!({ "edge_gateway_id": shared, "subnets": ["10.0.0.0/24"] }),
        )
        .await;
    assert_error_contains(refused.diagnostics.as_slice(), "dedicated Tier-0");

    let state = tester
        .lifecycle_crud(
            "vcd_nsxt_route_advertisement",
            json!({ "edge_gateway_id": site.edge, "subnets": ["10.0.0.0/24"] }),
            json!({ "edge_gateway_id": site.edge, "subnets": ["10.0.0.0/24", "10.1.0.0/24"] }),
        )
        .await
        .unwrap();
    assert_eq!(state.id(), site.edge);
    assert_eq!(state.attributes.string_set("subnets").len(), 2);
}

#[tokio::test]
async fn test_add_on_delete_input_change_makes_no_calls() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let add_on = vcd.seed_add_on("ds-add-on");
    let tester = EngineTester::new(vcd.clone());
    let config = json!({
        "add_on_id": add_on,
        "accept_eula": true,
        "name": "instance1",
        "input": { "input-delete-previous-versions": "true" },
        "delete_input": { "force-delete": "false" },
    });
    let state = tester
        .lifecycle_create("vcd_solution_add_on_instance", config.clone())
        .await
        .unwrap();

    vcd.reset_calls();
    let mut desired = config;
    desired["delete_input"] = json!({ "force-delete": "true" });
    let outcome = tester
        .update("vcd_solution_add_on_instance", &state, desired)
        .await;
    assert_no_errors(outcome.diagnostics.as_slice());
    assert_eq!(vcd.write_count(), 0);
    let updated = outcome.into_result().unwrap();
    assert_eq!(
        updated.attributes.string_map("delete_input")["force-delete"],
        "true"
    );

    let deleted = tester.delete("vcd_solution_add_on_instance", &updated).await;
    assert!(deleted.is_gone());
    assert!(vcd.get_item(endpoints::ENTITIES, state.id()).is_none());
}

#[tokio::test]
async fn test_add_on_requires_eula() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let add_on = vcd.seed_add_on("ds-add-on");
    let tester = EngineTester::new(vcd.clone());

    let outcome = tester
        .create(
            "vcd_solution_add_on_instance",
            json!({ "add_on_id": add_on, "accept_eula": false, "name": "instance1" }),
        )
        .await;
    assert_error_contains(outcome.diagnostics.as_slice(), "EULA");
    assert_eq!(vcd.write_count(), 0);
}

#[tokio::test]
async fn test_behavior_acl_lifecycle_and_import() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let rde_type = vcd.seed_rde_type("vmware", "k8s", "1.0.0");
    let behavior = vcd.seed_behavior(&rde_type, "activate");
    let other = vcd.seed_behavior(&rde_type, "deactivate");
    let tester = EngineTester::new(vcd.clone());

    let config = |b: &str| {
        json!({
            "rde_type_id": rde_type,
            "behavior_id": b,
            "access_level_ids": ["urn:vcloud:accessLevel:FullControl"],
        })
    };
    let first = tester
        .lifecycle_create("vcd_rde_type_behavior_acl", config(&behavior))
        .await
        .unwrap();
    tester
        .lifecycle_create("vcd_rde_type_behavior_acl", config(&other))
        .await
        .unwrap();

    let path = format!("vmware.k8s.1.0.0.{}", behavior);
    let imported = tester.import("vcd_rde_type_behavior_acl", &path).await;
    assert_no_errors(imported.diagnostics.as_slice());
    assert_eq!(imported.id(), Some(behavior.as_str()));

    // Removing one behavior's levels keeps the other's.
    let deleted = tester.delete("vcd_rde_type_behavior_acl", &first).await;
    assert!(deleted.is_gone());
    let acl = vcd
        .get_item(endpoints::ENTITY_TYPE_BEHAVIOR_ACCESS, &rde_type)
        .unwrap();
    let values = acl["values"].as_array().unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0]["behaviorId"], json!(other));
}

#[tokio::test]
async fn test_alb_controller_needs_sysadmin_and_keeps_password() {
    let vcd = Arc::new(InMemoryVcd::sysadmin());
    let tester = EngineTester::new(vcd.clone());
    let config = json!({
        "name": "ctrl1",
        "url": "https://alb.example.com",
        "username": "admin",
        "password": "secret",
        "license_type": "ENTERPRISE",
    });

    let state = tester
        .lifecycle_create("vcd_nsxt_alb_controller", config.clone())
        .await
        .unwrap();
    assert_eq!(state.attributes.opt_string("password").as_deref(), Some("secret"));

    vcd.set_sysadmin(false);
    let denied = tester.create("vcd_nsxt_alb_controller", config).await;
    assert_error_contains(denied.diagnostics.as_slice(), "System administrator");
}
