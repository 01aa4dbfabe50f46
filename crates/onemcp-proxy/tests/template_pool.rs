//! Template instance pool behaviour: sharing by rendered hash, per-client
//! scoping, limits, and idle reclamation.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{MockConnector, MockSpec};
use onemcp_proxy::{
    EmptyInternalTools, McpProxy, ProxyConfig, RequiredCapability, ServerConfig, SessionContext,
    TemplateOptions, TransportConfig,
};

fn template_server(options: TemplateOptions) -> ServerConfig {
    let mut config = ServerConfig::new(TransportConfig::Http {
        url: "http://upstream.invalid/{{project.root}}".into(),
        headers: HashMap::new(),
    });
    config.template = Some(options);
    config
}

async fn start_template_proxy(
    options: TemplateOptions,
    pool: Option<onemcp_proxy::PoolConfig>,
) -> (Arc<McpProxy>, Arc<MockConnector>) {
    let connector = Arc::new(
        MockConnector::new().with_server("T", MockSpec::with_tools(&["templated-tool"])),
    );
    let mut config = ProxyConfig::default();
    config.servers.insert("T".to_string(), template_server(options));
    if let Some(pool) = pool {
        config.pool = pool;
    }
    let (proxy, errors) =
        McpProxy::start_with(config, connector.clone(), Arc::new(EmptyInternalTools))
            .await
            .unwrap();
    assert!(errors.is_empty());
    (proxy, connector)
}

fn context(session_id: &str, root: &str) -> SessionContext {
    SessionContext::new(session_id).with_project("root", root)
}

#[tokio::test]
async fn sessions_with_equal_rendered_variables_share_one_instance() {
    let (proxy, connector) = start_template_proxy(TemplateOptions::default(), None).await;

    proxy.create_session(context("S1", "/work/a"), None).await.unwrap();
    proxy.create_session(context("S2", "/work/a"), None).await.unwrap();

    // One rendered hash, one instance, reference count 2.
    let hashes = proxy.pool().session_hashes();
    let hashes = hashes.read().unwrap().clone();
    let h1 = hashes["S1"]["T"].clone();
    let h2 = hashes["S2"]["T"].clone();
    assert_eq!(h1, h2);

    assert_eq!(proxy.pool().instance_count().await, 1);
    let key = format!("T:{h1}");
    let instance = proxy.pool().instance(&key).await.unwrap();
    assert_eq!(instance.reference_count(), 2);

    // Exactly one upstream was spawned, with the rendered URL.
    let spawned = connector.spawned_for("T");
    assert_eq!(spawned.len(), 1);
    match &spawned[0].config.transport {
        TransportConfig::Http { url, .. } => {
            assert_eq!(url, "http://upstream.invalid//work/a");
        }
        other => panic!("unexpected transport {other:?}"),
    }

    // A third session with different variables gets its own instance and
    // cannot see the first one.
    proxy.create_session(context("S3", "/work/b"), None).await.unwrap();
    assert_eq!(proxy.pool().instance_count().await, 2);

    let visible: Vec<String> = proxy
        .handler()
        .effective_connections_for("S3", RequiredCapability::Any)
        .iter()
        .map(|c| c.key().to_string())
        .collect();
    assert!(!visible.contains(&key));
    let hashes = proxy.pool().session_hashes();
    let h3 = hashes.read().unwrap()["S3"]["T"].clone();
    assert!(visible.contains(&format!("T:{h3}")));
}

#[tokio::test]
async fn per_client_templates_are_keyed_by_session() {
    let options = TemplateOptions {
        per_client: true,
        ..Default::default()
    };
    let (proxy, _connector) = start_template_proxy(options, None).await;

    proxy.create_session(context("S1", "/same"), None).await.unwrap();
    proxy.create_session(context("S2", "/same"), None).await.unwrap();

    assert_eq!(proxy.pool().instance_count().await, 2);
    let s1 = proxy.pool().instance("T:S1").await.unwrap();
    let s2 = proxy.pool().instance("T:S2").await.unwrap();
    assert_eq!(s1.reference_count(), 1);
    assert_eq!(s2.reference_count(), 1);
}

#[tokio::test]
async fn instance_limits_are_enforced() {
    let options = TemplateOptions {
        max_instances: Some(1),
        ..Default::default()
    };
    let (proxy, _connector) = start_template_proxy(options.clone(), None).await;

    proxy.create_session(context("S1", "/a"), None).await.unwrap();

    let config = template_server(options);
    let result = proxy
        .pool()
        .get_or_create_client_instance("T", &config, &context("S9", "/different"), "S9")
        .await;
    match result {
        Err(onemcp_proxy::template::PoolError::LimitExceeded { template, limit }) => {
            assert_eq!(template, "T");
            assert_eq!(limit, 1);
        }
        Err(other) => panic!("unexpected pool error: {other}"),
        Ok(_) => panic!("expected LimitExceeded"),
    }
    assert_eq!(proxy.pool().instance_count().await, 1);
}

#[tokio::test]
async fn failed_connect_leaves_no_instance() {
    let mut spec = MockSpec::with_tools(&["x"]);
    spec.fail_connect = true;
    let connector = Arc::new(MockConnector::new().with_server("T", spec));
    let mut config = ProxyConfig::default();
    config
        .servers
        .insert("T".to_string(), template_server(TemplateOptions::default()));
    let (proxy, _errors) =
        McpProxy::start_with(config, connector, Arc::new(EmptyInternalTools))
            .await
            .unwrap();

    let template = template_server(TemplateOptions::default());
    let result = proxy
        .pool()
        .get_or_create_client_instance("T", &template, &context("S1", "/a"), "S1")
        .await;
    assert!(matches!(
        result,
        Err(onemcp_proxy::template::PoolError::Connect(_))
    ));
    assert_eq!(proxy.pool().instance_count().await, 0);
}

#[tokio::test]
async fn idle_instances_are_reclaimed_and_closed_once() {
    let options = TemplateOptions {
        idle_timeout_ms: Some(100),
        ..Default::default()
    };
    let pool_config = onemcp_proxy::PoolConfig {
        idle_timeout_ms: 100,
        cleanup_interval_ms: 50,
        ..Default::default()
    };
    let (proxy, connector) = start_template_proxy(options, Some(pool_config)).await;

    proxy.create_session(context("S1", "/a"), None).await.unwrap();
    let hashes = proxy.pool().session_hashes();
    let hash = hashes.read().unwrap()["S1"]["T"].clone();
    let key = format!("T:{hash}");
    assert!(proxy.pool().instance(&key).await.is_some());
    assert!(proxy.connections().get(&key).is_some());

    // Reference count reaches zero here; the sweep should reclaim it.
    proxy.close_session("S1").await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(proxy.pool().instance(&key).await.is_none());
    assert!(proxy.connections().get(&key).is_none());
    let spawned = connector.spawned_for("T");
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].closed.load(Ordering::SeqCst), 1);
}
