//! End-to-end tests for [`mcp_runtime::PoolManager`] against real child
//! processes (small `bash` scripts standing in for MCP servers, the same
//! technique used in `src/transport.rs`'s and `src/client.rs`'s own tests).
//! These exercise the scenarios spec.md §8 calls out by id (S5, S6, S7) plus
//! the tool-index/conflict bookkeeping spec.md §4.4 requires.

use std::sync::Arc;
use std::time::Duration;

use mcp_runtime::{ManagerConfig, ServerConfig};
use mcp_runtime::protocol::ClientInfo;
use mcp_runtime::pool::PoolManager;
use mcp_runtime::strategy::SelectionStrategy;
use mcp_runtime::state::ConnectionState;

fn client_info() -> ClientInfo {
    ClientInfo { name: "pool-integration-tests".into(), version: "0.1.0".into() }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        connection_timeout: Duration::from_secs(5),
        max_retries: 1,
        retry_delay: Duration::from_millis(20),
        health_check_interval: Duration::from_secs(60),
    }
}

/// A mock MCP server that answers `initialize` with an empty result and
/// `tools/list` with the given tool names, ignoring every other method
/// (including `notifications/initialized`, which expects no reply).
fn mock_server_script(tools: &[&str]) -> String {
    let tool_json: Vec<String> = tools
        .iter()
        .map(|name| format!(r#"{{"name":"{name}","description":"","inputSchema":{{"type":"object","properties":{{}}}}}}"#))
        .collect();
    let tools_array = tool_json.join(",");
    format!(
        r#"
        while IFS= read -r line; do
            id=$(printf '%s' "$line" | sed -n 's/.*"id":"\{{0,1\}}\([0-9]*\)"\{{0,1\}}.*/\1/p')
            case "$line" in
                *'"method":"initialize"'*)
                    printf '{{"jsonrpc":"2.0","id":"%s","result":{{"capabilities":{{}}}}}}\n' "$id" ;;
                *'"method":"tools/list"'*)
                    printf '{{"jsonrpc":"2.0","id":"%s","result":{{"tools":[{tools_array}]}}}}\n' "$id" ;;
                *)
                    ;;
            esac
        done
        "#
    )
}

fn server_cfg(id: &str, tools: &[&str]) -> ServerConfig {
    ServerConfig::new(id, "bash").with_args(["-c".to_string(), mock_server_script(tools)])
}

async fn wait_until<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn two_servers_reach_ready_and_populate_distinct_tools() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::HealthBased,
    ));

    manager.add_server_config(server_cfg("alpha", &["read_file"])).await.unwrap();
    manager.add_server_config(server_cfg("beta", &["write_file"])).await.unwrap();

    wait_until(Duration::from_secs(5), || {
        let m = manager.clone();
        Box::pin(async move { m.is_server_ready("alpha").await && m.is_server_ready("beta").await })
    })
    .await;

    let tools = manager.get_all_tools().await;
    assert_eq!(tools.get("read_file"), Some(&"alpha".to_string()));
    assert_eq!(tools.get("write_file"), Some(&"beta".to_string()));
    assert!(manager.get_conflicts().await.is_empty());

    manager.stop().await;
    assert!(manager.server_ids().await.is_empty());
}

#[tokio::test]
async fn conflicting_tool_name_resolves_to_lexicographically_smallest_id() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::HealthBased,
    ));

    // Added out of lexicographic order on purpose.
    manager.add_server_config(server_cfg("zeta", &["shared"])).await.unwrap();
    manager.add_server_config(server_cfg("alpha", &["shared"])).await.unwrap();

    wait_until(Duration::from_secs(5), || {
        let m = manager.clone();
        Box::pin(async move { m.is_server_ready("zeta").await && m.is_server_ready("alpha").await })
    })
    .await;

    let tools = manager.get_all_tools().await;
    assert_eq!(tools.get("shared"), Some(&"alpha".to_string()));

    let conflicts = manager.get_conflicts().await;
    assert_eq!(conflicts.get("shared"), Some(&vec!["alpha".to_string(), "zeta".to_string()]));

    manager.stop().await;
}

#[tokio::test]
async fn removing_a_server_drops_it_from_the_tool_index() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::HealthBased,
    ));

    manager.add_server_config(server_cfg("alpha", &["shared"])).await.unwrap();
    manager.add_server_config(server_cfg("beta", &["shared"])).await.unwrap();

    wait_until(Duration::from_secs(5), || {
        let m = manager.clone();
        Box::pin(async move { m.is_server_ready("alpha").await && m.is_server_ready("beta").await })
    })
    .await;

    assert_eq!(manager.get_conflicts().await.len(), 1);

    manager.remove_server("beta").await;
    assert!(manager.get_conflicts().await.is_empty());
    assert_eq!(manager.get_all_tools().await.get("shared"), Some(&"alpha".to_string()));

    manager.stop().await;
}

#[tokio::test]
async fn round_robin_over_three_ready_servers_matches_scenario_s5() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::round_robin(),
    ));

    for id in ["s1", "s2", "s3"] {
        manager.add_server_config(server_cfg(id, &["t"])).await.unwrap();
    }

    wait_until(Duration::from_secs(5), || {
        let m = manager.clone();
        Box::pin(async move {
            m.is_server_ready("s1").await && m.is_server_ready("s2").await && m.is_server_ready("s3").await
        })
    })
    .await;

    let mut picks = Vec::new();
    for _ in 0..4 {
        let client = manager.get_client_for_tool("t").await.expect("a ready server advertises t");
        let mut matched = None;
        for id in ["s1", "s2", "s3"] {
            if let Some(candidate) = manager.get_client(id).await {
                if Arc::ptr_eq(&candidate, &client) {
                    matched = Some(id);
                    break;
                }
            }
        }
        picks.push(matched.expect("selected client matches a known server id"));
    }

    assert_eq!(picks, vec!["s1", "s2", "s3", "s1"]);
    manager.stop().await;
}

#[tokio::test]
async fn disabled_server_is_absent_from_status_and_index() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::HealthBased,
    ));

    let cfg = server_cfg("ghost", &["x"]).disabled();
    manager.add_server_config(cfg).await.unwrap();

    assert!(manager.server_ids().await.is_empty());
    assert!(manager.get_status("ghost").await.is_none());
    assert!(manager.get_client_for_tool("x").await.is_none());
}

#[tokio::test]
async fn unreachable_command_lands_in_error_after_retry_budget() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::HealthBased,
    ));

    let cfg = ServerConfig::new("broken", "this-binary-does-not-exist-xyz");
    manager.add_server_config(cfg).await.unwrap();

    wait_until(Duration::from_secs(5), || {
        let m = manager.clone();
        Box::pin(async move {
            matches!(m.get_status("broken").await.map(|s| s.state), Some(ConnectionState::Error))
        })
    })
    .await;

    let status = manager.get_status("broken").await.unwrap();
    assert!(status.last_error.is_some());
    assert!(!status.healthy());
    manager.stop().await;
}

#[tokio::test]
async fn health_check_updates_latency_on_a_ready_server() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::HealthBased,
    ));

    manager.add_server_config(server_cfg("alpha", &["ping"])).await.unwrap();
    wait_until(Duration::from_secs(5), || {
        let m = manager.clone();
        Box::pin(async move { m.is_server_ready("alpha").await })
    })
    .await;

    manager.health_check(Some("alpha")).await.unwrap();
    let status = manager.get_status("alpha").await.unwrap();
    assert!(status.last_latency.is_some());
    assert!(status.last_health_check.is_some());
    assert!(status.healthy());

    manager.stop().await;
}

/// A mock server whose *second* `tools/list` reply (the health probe, since
/// `on_server_ready` already consumed the first) is a JSON-RPC error, so a
/// `health_check` against it fails after the server reached `READY` once.
fn flaky_after_first_probe_script() -> String {
    r#"
        calls=0
        while IFS= read -r line; do
            id=$(printf '%s' "$line" | sed -n 's/.*"id":"\{0,1\}\([0-9]*\)"\{0,1\}.*/\1/p')
            case "$line" in
                *'"method":"initialize"'*)
                    printf '{"jsonrpc":"2.0","id":"%s","result":{"capabilities":{}}}\n' "$id" ;;
                *'"method":"tools/list"'*)
                    calls=$((calls+1))
                    if [ "$calls" -eq 1 ]; then
                        printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[{"name":"ping","description":"","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
                    else
                        printf '{"jsonrpc":"2.0","id":"%s","error":{"code":-32000,"message":"probe failed"}}\n' "$id"
                    fi
                    ;;
            esac
        done
    "#
    .to_string()
}

#[tokio::test]
async fn failed_health_probe_uninitializes_the_client() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::HealthBased,
    ));

    let cfg = ServerConfig::new("alpha", "bash").with_args(["-c".to_string(), flaky_after_first_probe_script()]);
    manager.add_server_config(cfg).await.unwrap();
    wait_until(Duration::from_secs(5), || {
        let m = manager.clone();
        Box::pin(async move { m.is_server_ready("alpha").await })
    })
    .await;

    let client = manager.get_client("alpha").await.unwrap();
    assert!(client.is_connected().await);

    manager.health_check(Some("alpha")).await.unwrap();

    let status = manager.get_status("alpha").await.unwrap();
    assert_eq!(status.state, ConnectionState::Error);
    assert!(!status.healthy());

    // spec §7: a server marked ERROR by a failed probe must also stop
    // serving client operations, even though the transport (a `bash` loop
    // still reading stdin) is technically still alive.
    assert!(!client.is_connected().await);
    let err = client.list_tools().await.unwrap_err();
    assert!(matches!(err, mcp_runtime::ClientError::NotInitialized));

    manager.stop().await;
}

#[tokio::test]
async fn remove_server_surfaces_server_removed_for_an_in_flight_call() {
    init_tracing();
    let manager = Arc::new(PoolManager::new(
        fast_config(),
        client_info(),
        SelectionStrategy::HealthBased,
    ));

    // Answers `initialize`/`tools/list` but never answers `tools/call`, so a
    // call against it blocks until the transport is closed out from under it.
    let script = r#"
        while IFS= read -r line; do
            id=$(printf '%s' "$line" | sed -n 's/.*"id":"\{0,1\}\([0-9]*\)"\{0,1\}.*/\1/p')
            case "$line" in
                *'"method":"initialize"'*)
                    printf '{"jsonrpc":"2.0","id":"%s","result":{"capabilities":{}}}\n' "$id" ;;
                *'"method":"tools/list"'*)
                    printf '{"jsonrpc":"2.0","id":"%s","result":{"tools":[]}}\n' "$id" ;;
                *)
                    ;;
            esac
        done
    "#;
    let cfg = ServerConfig::new("alpha", "bash").with_args(["-c".to_string(), script.to_string()]);
    manager.add_server_config(cfg).await.unwrap();
    wait_until(Duration::from_secs(5), || {
        let m = manager.clone();
        Box::pin(async move { m.is_server_ready("alpha").await })
    })
    .await;

    let client = manager.get_client("alpha").await.unwrap();
    let call = tokio::spawn(async move { client.call_tool("whatever", None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.remove_server("alpha").await;

    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("removal should unblock the in-flight call promptly")
        .unwrap();
    assert!(matches!(result, Err(mcp_runtime::ClientError::ServerRemoved)));
}
