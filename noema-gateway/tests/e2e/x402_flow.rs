use super::common::spawn;

#[tokio::test]
async fn missing_payment_header_returns_402_with_challenge() {
    let h = spawn().await;
    let res = h
        .client
        .post(format!("{}/api/v1/x402/generate/flux-txt2img", h.base_url))
        .json(&serde_json::json!({"inputs": {}, "payerAddress": "0xpayer"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::PAYMENT_REQUIRED);
    assert!(res.headers().contains_key("x-payment-required"));
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["accepts"][0]["scheme"], "exact");
}

#[tokio::test]
async fn quote_matches_the_static_price_of_the_seeded_tool() {
    let h = spawn().await;
    let res: serde_json::Value =
        h.client.get(format!("{}/api/v1/x402/quote/flux-txt2img", h.base_url)).send().await.unwrap().json().await.unwrap();
    assert_eq!(res["accepts"][0]["network"], "eip155:8453");
}

#[tokio::test]
async fn signed_payment_executes_and_settles() {
    let h = spawn().await;
    let payment = serde_json::json!({"scheme": "exact", "network": "eip155:8453", "payload": {"signature": "0xsig"}}).to_string();

    let res = h
        .client
        .post(format!("{}/api/v1/x402/generate/flux-txt2img", h.base_url))
        .header("X-PAYMENT", payment)
        .json(&serde_json::json!({"inputs": {"prompt": "a cat"}, "payerAddress": "0xpayer"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "completed");

    let generation_id = body["generationId"].as_str().unwrap();
    let status: serde_json::Value =
        h.client.get(format!("{}/api/v1/x402/status/{generation_id}", h.base_url)).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["metadata"]["x402"]["transaction"], "0xsettled");
    assert!(status["metadata"]["x402"]["settled"].as_bool().unwrap());
}
