//! Tests for tool registry

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weaver_agent::{handler_fn, AgentError, BoxError, Tool, ToolContext, ToolRegistry};
use weaver_provider::ToolCall;

fn echo_tool(name: &str) -> Tool {
    Tool::new(name, format!("{} tool", name), json!({"type": "object"}))
        .with_handler(handler_fn(|_ctx, input| async move { Ok(input) }))
}

fn failing_tool(name: &str) -> Tool {
    Tool::new(name, "Always fails", json!({"type": "object"})).with_handler(handler_fn(
        |_ctx, _input| async move { Err::<Value, BoxError>("upstream block store offline".into()) },
    ))
}

fn call(id: &str, name: &str, input: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }
}

#[test]
fn test_registry_new() {
    let registry = ToolRegistry::new();
    assert!(registry.is_empty());
    assert!(registry.names().is_empty());
}

#[test]
fn test_registry_register_multiple() {
    let registry = ToolRegistry::new();
    registry.register(echo_tool("list_blocks")).unwrap();
    registry.register(echo_tool("get_block")).unwrap();

    assert_eq!(registry.len(), 2);
    assert!(registry.has("list_blocks"));
    assert!(registry.has("get_block"));
    assert!(!registry.has("nonexistent"));
}

#[test]
fn test_duplicate_registration_keeps_first() {
    let registry = ToolRegistry::new();
    registry
        .register(Tool::new("list_blocks", "first", json!({})).with_handler(handler_fn(
            |_ctx, _input| async move { Ok(json!("first")) },
        )))
        .unwrap();

    let result = registry.register(
        Tool::new("list_blocks", "second", json!({}))
            .with_handler(handler_fn(|_ctx, _input| async move { Ok(json!("second")) })),
    );

    assert!(matches!(result, Err(AgentError::DuplicateTool(ref name)) if name == "list_blocks"));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get("list_blocks").unwrap().description, "first");
}

#[test]
fn test_register_rejects_empty_name_and_missing_handler() {
    let registry = ToolRegistry::new();

    assert!(matches!(
        registry.register(echo_tool("")),
        Err(AgentError::InvalidTool(_))
    ));
    assert!(matches!(
        registry.register(Tool::new("no_handler", "missing", json!({}))),
        Err(AgentError::InvalidTool(_))
    ));
    assert!(registry.is_empty());
}

#[test]
fn test_registry_get_missing() {
    let registry = ToolRegistry::new();
    assert!(registry.get("nonexistent").is_none());
}

#[test]
fn test_list_definitions() {
    let registry = ToolRegistry::new();
    registry.register(echo_tool("list_blocks")).unwrap();
    registry.register(echo_tool("get_block")).unwrap();

    let mut names: Vec<String> = registry
        .list_definitions()
        .into_iter()
        .map(|d| d.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["get_block", "list_blocks"]);

    let value = serde_json::to_value(registry.list_definitions()).unwrap();
    for def in value.as_array().unwrap() {
        assert!(def.get("handler").is_none());
        assert_eq!(def["input_schema"]["type"], "object");
    }
}

#[tokio::test]
async fn test_execute_unknown_invokes_nothing() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();

    let registry = ToolRegistry::new();
    registry
        .register(
            Tool::new("counted", "Counts calls", json!({})).with_handler(handler_fn(
                move |_ctx, _input| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(null))
                    }
                },
            )),
        )
        .unwrap();

    let result = registry
        .execute(&ToolContext::default(), "missing", json!({}))
        .await;

    assert!(matches!(result, Err(AgentError::ToolNotFound(ref name)) if name == "missing"));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_execute_returns_handler_output() {
    let registry = ToolRegistry::new();
    registry.register(echo_tool("echo")).unwrap();

    let output = registry
        .execute(&ToolContext::default(), "echo", json!({"q": "cron"}))
        .await
        .unwrap();
    assert_eq!(output, json!({"q": "cron"}));
}

#[tokio::test]
async fn test_execute_wraps_handler_failure() {
    let registry = ToolRegistry::new();
    registry.register(failing_tool("flaky")).unwrap();

    let err = registry
        .execute(&ToolContext::default(), "flaky", json!({}))
        .await
        .unwrap_err();

    match &err {
        AgentError::ToolExecution { tool, source } => {
            assert_eq!(tool, "flaky");
            assert_eq!(source.to_string(), "upstream block store offline");
        }
        other => panic!("Expected ToolExecution, got {:?}", other),
    }
    assert!(err.to_string().contains("upstream block store offline"));
}

#[tokio::test]
async fn test_execute_aborts_on_cancel() {
    let registry = ToolRegistry::new();
    registry
        .register(
            Tool::new("slow", "Never finishes in time", json!({})).with_handler(handler_fn(
                |_ctx, _input| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!("late"))
                },
            )),
        )
        .unwrap();

    let cancel = CancellationToken::new();
    let ctx = ToolContext::new("t", "u").with_cancel(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        registry.execute(&ctx, "slow", json!({})),
    )
    .await
    .expect("cancellation should abort the handler");

    assert!(matches!(result, Err(AgentError::Cancelled)));
}

#[tokio::test]
async fn test_batch_preserves_order_and_flags_errors() {
    let registry = ToolRegistry::new();
    registry.register(echo_tool("echo")).unwrap();
    registry.register(failing_tool("flaky")).unwrap();

    let calls = vec![
        call("tu_1", "echo", json!({"n": 1})),
        call("tu_2", "flaky", json!({})),
        call("tu_3", "missing", json!({})),
        call("tu_4", "echo", json!({"n": 4})),
    ];

    let results = registry
        .execute_batch(&ToolContext::default(), &calls)
        .await
        .unwrap();

    assert_eq!(results.len(), calls.len());
    let ids: Vec<&str> = results.iter().map(|r| r.tool_use_id.as_str()).collect();
    assert_eq!(ids, vec!["tu_1", "tu_2", "tu_3", "tu_4"]);

    assert!(!results[0].is_error);
    assert_eq!(results[0].content, json!({"n": 1}));
    assert!(results[1].is_error);
    assert!(results[1].content["error"]
        .as_str()
        .unwrap()
        .contains("upstream block store offline"));
    assert!(results[2].is_error);
    assert!(results[2].content["error"]
        .as_str()
        .unwrap()
        .contains("tool not found"));
    assert_eq!(results[3].content, json!({"n": 4}));
}

#[tokio::test]
async fn test_batch_cancelled_before_start() {
    let registry = ToolRegistry::new();
    registry.register(echo_tool("echo")).unwrap();

    let ctx = ToolContext::default();
    ctx.cancel.cancel();

    let result = registry
        .execute_batch(&ctx, &[call("tu_1", "echo", json!({}))])
        .await;
    assert!(matches!(result, Err(AgentError::Cancelled)));
}

#[test]
fn test_concurrent_registration_and_lookup() {
    let registry = Arc::new(ToolRegistry::new());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                registry.register(echo_tool(&format!("tool_{}", i))).unwrap();
                registry.has(&format!("tool_{}", i))
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert_eq!(registry.len(), 8);
}
