use super::common::spawn;

#[tokio::test]
async fn unauthenticated_execute_is_rejected() {
    let h = spawn().await;
    let res = h
        .client
        .post(format!("{}/api/v1/generation/execute", h.base_url))
        .json(&serde_json::json!({"toolId": "flux-txt2img", "inputs": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authenticated_execute_settles_immediately_and_status_reflects_it() {
    let h = spawn().await;
    let res = h
        .client
        .post(format!("{}/api/v1/generation/execute", h.base_url))
        .header("X-API-Key", &h.api_key)
        .json(&serde_json::json!({"toolId": "flux-txt2img", "inputs": {"prompt": "a cat"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    let generation_id = body["generationId"].as_str().unwrap().to_string();

    let status = h
        .client
        .get(format!("{}/api/v1/generation/status/{generation_id}", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(status.status(), reqwest::StatusCode::OK);
    let record: serde_json::Value = status.json().await.unwrap();
    assert_eq!(record["status"], "completed");
}

#[tokio::test]
async fn points_balance_reflects_debit_after_a_generation() {
    let h = spawn().await;
    let before: serde_json::Value = h
        .client
        .get(format!("{}/api/v1/points", h.base_url))
        .header("X-API-Key", &h.api_key)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    h.client
        .post(format!("{}/api/v1/generation/execute", h.base_url))
        .header("X-API-Key", &h.api_key)
        .json(&serde_json::json!({"toolId": "flux-txt2img", "inputs": {}}))
        .send()
        .await
        .unwrap();

    let after: serde_json::Value = h
        .client
        .get(format!("{}/api/v1/points", h.base_url))
        .header("X-API-Key", &h.api_key)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(after["points_remaining"].as_i64().unwrap() < before["points_remaining"].as_i64().unwrap());
}

#[tokio::test]
async fn tool_registry_lists_the_seeded_tool() {
    let h = spawn().await;
    let res: Vec<serde_json::Value> = h.client.get(format!("{}/api/v1/tools/registry", h.base_url)).send().await.unwrap().json().await.unwrap();
    assert!(res.iter().any(|t| t["tool_id"] == "flux-txt2img"));
}

#[tokio::test]
async fn wallet_link_round_trip() {
    let h = spawn().await;
    let initiated: serde_json::Value = h
        .client
        .post(format!("{}/api/v1/wallets/initiate", h.base_url))
        .json(&serde_json::json!({"depositToAddress": "0xabc"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let request_id = initiated["requestId"].as_str().unwrap();

    let pending: serde_json::Value =
        h.client.get(format!("{}/api/v1/wallets/status/{request_id}", h.base_url)).send().await.unwrap().json().await.unwrap();
    assert_eq!(pending["status"], "PENDING");
}
