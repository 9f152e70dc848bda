//! Fan-out worker: one task per subscriber pool (§5 scheduling model), draining the bus
//! and writing `deliveryStatus` back onto the generation record after each attempt.

use std::sync::Arc;

use noema_events::BusEvent;
use noema_model::{DeliveryStatus, GenerationId};
use noema_store::{GenerationPatch, Store};

use crate::adapter::DeliveryAdapter;
use crate::bus::NotificationBus;

/// Drains `bus` for as long as the channel stays open, delivering each `GenerationUpdated`
/// event through `adapter` and writing the outcome back onto the generation's
/// `deliveryStatus` (§4.H: "the generation record's deliveryStatus field IS the durable
/// delivery log"). Other event kinds are delivered but not logged back to the store; they
/// carry no delivery-tracking field of their own.
pub async fn run_delivery_worker(bus: Arc<NotificationBus>, store: Arc<dyn Store>, adapter: Arc<dyn DeliveryAdapter>) {
    let mut receiver = bus.subscribe();
    loop {
        let event = match receiver.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "delivery worker lagged behind the notification bus");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        let generation_id = match &event {
            BusEvent::GenerationUpdated { generation_id, .. } => Some(generation_id.clone()),
            _ => None,
        };

        let outcome = adapter.deliver(&event).await;

        if let Some(generation_id) = generation_id {
            let status = if outcome.is_ok() {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Failed
            };
            let patch = GenerationPatch {
                delivery_status: Some(status),
                ..Default::default()
            };
            if let Err(e) = store.update_generation(&GenerationId::new(generation_id), patch).await {
                tracing::error!(error = %e, "failed to record delivery status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NullAdapter;
    use noema_model::{GenerationRecord, NotificationPlatform, Platform, ToolId};
    use noema_store::InMemoryStore;

    #[tokio::test]
    async fn worker_marks_generation_delivered_on_success() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let (user, _) = store
            .find_or_create_by_platform(Platform::Telegram, "tg-1", Default::default())
            .await
            .unwrap();
        let generation = GenerationRecord::new(
            noema_model::GenerationId::generate(),
            user.master_account_id.clone(),
            "comfyui",
            ToolId::new("tool-1"),
            "Flux",
            serde_json::json!({}),
            NotificationPlatform::Telegram,
        );
        let gen_id = generation.id.clone();
        store.create_generation(generation).await.unwrap();

        let bus = Arc::new(NotificationBus::new());
        let adapter: Arc<dyn DeliveryAdapter> = Arc::new(NullAdapter);
        let handle = tokio::spawn(run_delivery_worker(bus.clone(), store.clone(), adapter));

        bus.publish(BusEvent::GenerationUpdated {
            generation_id: gen_id.as_str().to_string(),
            status: "completed".into(),
            outputs: None,
            cost_usd: Some("0.05".into()),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        let after = store.find_generation_by_id(&gen_id).await.unwrap();
        assert_eq!(after.delivery_status, DeliveryStatus::Delivered);
    }
}
