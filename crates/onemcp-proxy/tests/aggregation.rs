//! Capability aggregation behaviour across multiple upstreams.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{http_server, MockConnector, MockSpec};
use onemcp_proxy::{EmptyInternalTools, McpProxy, ProxyConfig};

async fn start_proxy(
    servers: Vec<(&str, onemcp_proxy::ServerConfig, MockSpec)>,
) -> (Arc<McpProxy>, Arc<MockConnector>) {
    let mut connector = MockConnector::new();
    let mut config = ProxyConfig::default();
    for (name, server_config, spec) in servers {
        connector = connector.with_server(name, spec);
        config.servers.insert(name.to_string(), server_config);
    }
    let connector = Arc::new(connector);
    let (proxy, errors) = McpProxy::start_with(
        config,
        connector.clone(),
        Arc::new(EmptyInternalTools),
    )
    .await
    .unwrap();
    assert!(errors.is_empty(), "unexpected startup errors: {errors:?}");
    (proxy, connector)
}

#[tokio::test]
async fn duplicate_tool_names_keep_the_sort_earlier_server() {
    let (proxy, _connector) = start_proxy(vec![
        ("serverB", http_server(&[]), MockSpec::with_tools(&["test-tool"])),
        ("serverA", http_server(&[]), MockSpec::with_tools(&["test-tool"])),
    ])
    .await;

    let snapshot = proxy.aggregator().get_current_capabilities();
    let owners: Vec<(&str, &str)> = snapshot
        .tools
        .iter()
        .map(|t| (t.server.as_str(), t.tool.name.as_str()))
        .collect();
    assert_eq!(owners, vec![("serverA", "test-tool")]);

    // The exposed name at the inbound boundary carries the winner's prefix.
    let listed = proxy.handler().list_tools("any-session", None).await.unwrap();
    let names: Vec<&str> = listed.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["serverA_1mcp_test-tool"]);
}

#[tokio::test]
async fn whitelist_takes_precedence_over_blacklist() {
    let mut server = http_server(&[]);
    server.enabled_tools = Some(vec!["tool-a".to_string()]);
    server.disabled_tools = Some(vec!["tool-a".to_string(), "tool-b".to_string()]);

    let (proxy, _connector) = start_proxy(vec![(
        "priority-test",
        server,
        MockSpec::with_tools(&["tool-a", "tool-b"]),
    )])
    .await;

    let snapshot = proxy.aggregator().get_current_capabilities();
    let names: Vec<&str> = snapshot.tools.iter().map(|t| t.tool.name.as_str()).collect();
    assert_eq!(names, vec!["tool-a"]);
}

#[tokio::test]
async fn unchanged_upstreams_produce_no_change_set() {
    let (proxy, _connector) = start_proxy(vec![
        ("fs", http_server(&[]), MockSpec::with_tools(&["read", "write"])),
    ])
    .await;

    let before = proxy.aggregator().get_current_capabilities();
    let change = proxy.aggregator().update_capabilities().await;

    assert!(!change.has_changes);
    assert!(!change.tools_changed);
    assert_eq!(
        change.current.tools.len(),
        before.tools.len()
    );
    assert_eq!(change.current.ready_servers, before.ready_servers);
}

#[tokio::test]
async fn list_failure_is_confined_and_server_stays_ready() {
    let mut spec = MockSpec::with_tools(&["read"]);
    spec.fail_resources = true;

    let (proxy, _connector) = start_proxy(vec![
        ("flaky", http_server(&[]), spec),
        ("stable", http_server(&[]), MockSpec::with_tools(&["query"]).with_resources(&["db://x"])),
    ])
    .await;

    let snapshot = proxy.aggregator().get_current_capabilities();
    // Both servers are ready despite flaky's resources/list failure.
    assert_eq!(
        snapshot.ready_servers,
        vec!["flaky".to_string(), "stable".to_string()]
    );
    // flaky's tools survive; only its resources come back empty.
    assert!(snapshot.tools.iter().any(|t| t.server == "flaky"));
    let resource_servers: Vec<&str> =
        snapshot.resources.iter().map(|r| r.server.as_str()).collect();
    assert_eq!(resource_servers, vec!["stable"]);
}

#[tokio::test]
async fn resources_and_prompts_deduplicate_by_identifier() {
    let (proxy, _connector) = start_proxy(vec![
        (
            "a",
            http_server(&[]),
            MockSpec::with_tools(&["t1"])
                .with_resources(&["shared://doc"])
                .with_prompts(&["greet"]),
        ),
        (
            "b",
            http_server(&[]),
            MockSpec::with_tools(&["t2"])
                .with_resources(&["shared://doc"])
                .with_prompts(&["greet"]),
        ),
    ])
    .await;

    let snapshot = proxy.aggregator().get_current_capabilities();
    assert_eq!(snapshot.resources.len(), 1);
    assert_eq!(snapshot.resources[0].server, "a");
    assert_eq!(snapshot.prompts.len(), 1);
    assert_eq!(snapshot.prompts[0].server, "a");
}

#[tokio::test]
async fn summary_mentions_counts() {
    let (proxy, _connector) = start_proxy(vec![
        ("fs", http_server(&[]), MockSpec::with_tools(&["read"])),
    ])
    .await;
    let summary = proxy.aggregator().get_capabilities_summary();
    assert!(summary.contains("1 tools"));
    assert!(summary.contains("1 ready server"));
}

#[tokio::test]
async fn startup_errors_are_collected_not_fatal() {
    let mut failing = MockSpec::with_tools(&["x"]);
    failing.fail_connect = true;

    let connector = Arc::new(
        MockConnector::new()
            .with_server("bad", failing)
            .with_server("good", MockSpec::with_tools(&["read"])),
    );
    let mut config = ProxyConfig::default();
    config.servers = HashMap::from([
        ("bad".to_string(), http_server(&[])),
        ("good".to_string(), http_server(&[])),
    ]);

    let (proxy, errors) =
        McpProxy::start_with(config, connector, Arc::new(EmptyInternalTools))
            .await
            .unwrap();

    assert!(errors.contains_key("bad"));
    let snapshot = proxy.aggregator().get_current_capabilities();
    assert_eq!(snapshot.ready_servers, vec!["good".to_string()]);
}
