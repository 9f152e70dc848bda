use super::common::spawn;

#[tokio::test]
async fn tools_list_returns_the_seeded_tool() {
    let h = spawn().await;
    let res: serde_json::Value = h
        .client
        .post(format!("{}/api/v1/mcp", h.base_url))
        .json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tools = res["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["tool_id"] == "flux-txt2img"));
}

#[tokio::test]
async fn tools_call_without_auth_returns_jsonrpc_error() {
    let h = spawn().await;
    let res: serde_json::Value = h
        .client
        .post(format!("{}/api/v1/mcp", h.base_url))
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "flux-txt2img", "arguments": {}}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(res["error"].is_object());
    assert!(res["result"].is_null());
}

#[tokio::test]
async fn tools_call_with_auth_executes_the_tool() {
    let h = spawn().await;
    let res: serde_json::Value = h
        .client
        .post(format!("{}/api/v1/mcp", h.base_url))
        .header("X-API-Key", &h.api_key)
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "flux-txt2img", "arguments": {"prompt": "a dog"}}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(res["error"].is_null(), "unexpected error: {res:?}");
    assert_eq!(res["result"]["status"], "completed");
}

#[tokio::test]
async fn unknown_method_returns_method_not_found() {
    let h = spawn().await;
    let res: serde_json::Value = h
        .client
        .post(format!("{}/api/v1/mcp", h.base_url))
        .json(&serde_json::json!({"jsonrpc": "2.0", "id": 4, "method": "bogus/method", "params": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(res["error"]["code"], -32601);
}
