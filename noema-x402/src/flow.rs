//! Ties challenge construction and facilitator verification to the lifecycle engine
//! (§4.I: the x402 route never goes through a registered user or the ledger).

use std::sync::Arc;

use noema_lifecycle::{ExecuteHints, ExecuteOutcome, LifecycleEngine};
use noema_model::{MasterAccountId, NotificationPlatform, Platform, PlatformIdentity, User, X402Settlement};
use noema_store::{GenerationPatch, Store};

use crate::challenge::{build_challenge, X402Challenge};
use crate::error::X402Error;
use crate::facilitator::{FacilitatorClient, PaymentPayload};

pub struct X402Handler {
    lifecycle: Arc<LifecycleEngine>,
    store: Arc<dyn Store>,
    facilitator: Arc<dyn FacilitatorClient>,
    pay_to: String,
    usdc_asset: String,
    max_timeout_seconds: u64,
}

impl X402Handler {
    pub fn new(
        lifecycle: Arc<LifecycleEngine>,
        store: Arc<dyn Store>,
        facilitator: Arc<dyn FacilitatorClient>,
        pay_to: impl Into<String>,
        usdc_asset: impl Into<String>,
        max_timeout_seconds: u64,
    ) -> Self {
        Self { lifecycle, store, facilitator, pay_to: pay_to.into(), usdc_asset: usdc_asset.into(), max_timeout_seconds }
    }

    /// Step 1: a bare `GET`/`POST` with no `X-PAYMENT` header gets a 402 challenge priced
    /// off the tool's standard-tier quote.
    pub fn challenge(&self, tool_identifier: &str) -> Result<X402Challenge, X402Error> {
        let (_, quote) = self.lifecycle.quote_for_tool(tool_identifier)?;
        Ok(build_challenge(quote.final_cost_usd, &self.usdc_asset, &self.pay_to, self.max_timeout_seconds))
    }

    /// Steps 2-4: verify the signed authorization, run the tool through the normal
    /// lifecycle under a synthetic x402 identity, then settle on success and stamp the
    /// generation with the facilitator's transaction hash.
    pub async fn pay_and_execute(
        &self,
        tool_identifier: &str,
        inputs: serde_json::Value,
        payer_address: &str,
        payment: PaymentPayload,
    ) -> Result<ExecuteOutcome, X402Error> {
        let (_, quote) = self.lifecycle.quote_for_tool(tool_identifier)?;
        let requirement = build_challenge(quote.final_cost_usd, &self.usdc_asset, &self.pay_to, self.max_timeout_seconds)
            .accepts
            .remove(0);

        let payer = self.facilitator.verify(&payment, &requirement).await?;

        let identity = PlatformIdentity { platform: Platform::Web, platform_id: payer.clone() };
        let user = User::new(MasterAccountId::x402(payer_address), identity);

        let outcome = self
            .lifecycle
            .execute(tool_identifier, inputs, &user, NotificationPlatform::None, ExecuteHints::default())
            .await?;

        let settlement = self.facilitator.settle(&payment, &requirement).await?;

        self.store
            .update_generation(
                &outcome.generation_id,
                GenerationPatch {
                    x402: Some(X402Settlement {
                        transaction: settlement.transaction,
                        settled: true,
                        cost_usd: quote.final_cost_usd,
                        payer,
                    }),
                    ..Default::default()
                },
            )
            .await?;

        Ok(outcome)
    }
}
