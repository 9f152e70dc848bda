//! Verifies and settles EIP-3009 payment authorizations against an x402 facilitator
//! (§4.I step 3).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::challenge::PaymentRequirement;
use crate::error::X402Error;

/// The `X-PAYMENT` header, decoded: a signed EIP-3009 `transferWithAuthorization` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub scheme: String,
    pub network: String,
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FacilitatorSettlement {
    pub transaction: String,
    pub payer: String,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    payment_payload: &'a PaymentPayload,
    payment_requirements: &'a PaymentRequirement,
}

#[derive(Deserialize)]
struct VerifyResponse {
    is_valid: bool,
    invalid_reason: Option<String>,
    payer: Option<String>,
}

#[derive(Serialize)]
struct SettleRequest<'a> {
    payment_payload: &'a PaymentPayload,
    payment_requirements: &'a PaymentRequirement,
}

#[derive(Deserialize)]
struct SettleResponse {
    success: bool,
    error_reason: Option<String>,
    transaction: Option<String>,
}

/// The facilitator boundary: verification (signature + balance, no on-chain write) followed
/// by settlement (the actual transfer). Kept as a trait so tests can stub it out.
#[async_trait]
pub trait FacilitatorClient: Send + Sync {
    async fn verify(&self, payload: &PaymentPayload, requirement: &PaymentRequirement) -> Result<String, X402Error>;
    async fn settle(&self, payload: &PaymentPayload, requirement: &PaymentRequirement) -> Result<FacilitatorSettlement, X402Error>;
}

pub struct HttpFacilitatorClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFacilitatorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl FacilitatorClient for HttpFacilitatorClient {
    async fn verify(&self, payload: &PaymentPayload, requirement: &PaymentRequirement) -> Result<String, X402Error> {
        let res: VerifyResponse = self
            .client
            .post(format!("{}/verify", self.base_url))
            .json(&VerifyRequest { payment_payload: payload, payment_requirements: requirement })
            .send()
            .await
            .map_err(|e| X402Error::Facilitator(e.to_string()))?
            .json()
            .await
            .map_err(|e| X402Error::Facilitator(e.to_string()))?;

        if !res.is_valid {
            return Err(X402Error::VerificationFailed(res.invalid_reason.unwrap_or_else(|| "rejected".to_string())));
        }
        res.payer.ok_or_else(|| X402Error::VerificationFailed("facilitator omitted payer".to_string()))
    }

    async fn settle(&self, payload: &PaymentPayload, requirement: &PaymentRequirement) -> Result<FacilitatorSettlement, X402Error> {
        let res: SettleResponse = self
            .client
            .post(format!("{}/settle", self.base_url))
            .json(&SettleRequest { payment_payload: payload, payment_requirements: requirement })
            .send()
            .await
            .map_err(|e| X402Error::Facilitator(e.to_string()))?
            .json()
            .await
            .map_err(|e| X402Error::Facilitator(e.to_string()))?;

        if !res.success {
            return Err(X402Error::VerificationFailed(res.error_reason.unwrap_or_else(|| "settlement rejected".to_string())));
        }
        let transaction = res.transaction.ok_or_else(|| X402Error::Facilitator("settle succeeded without a transaction hash".to_string()))?;
        Ok(FacilitatorSettlement { transaction, payer: String::new() })
    }
}
