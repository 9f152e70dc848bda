//! In-memory tool catalog, loaded from the store at boot (§4.D).
//!
//! Read-mostly with an explicit invalidation hook (§5 "shared-resource policy"): writes go
//! through the store, then the caller must call `reload` so every handler sees the change.

use std::collections::HashMap;
use std::sync::RwLock;

use noema_model::{Tool, ToolId};
use noema_store::Store;

pub struct ToolRegistry {
    tools: RwLock<HashMap<ToolId, Tool>>,
    by_command: RwLock<HashMap<String, ToolId>>,
    by_display: RwLock<HashMap<String, ToolId>>,
}

impl ToolRegistry {
    pub async fn load(store: &dyn Store) -> Result<Self, noema_store::StoreError> {
        let registry = Self {
            tools: RwLock::new(HashMap::new()),
            by_command: RwLock::new(HashMap::new()),
            by_display: RwLock::new(HashMap::new()),
        };
        registry.reload(store).await?;
        Ok(registry)
    }

    /// Re-reads the full tool catalog from the store. Call after any `upsertTool` write so
    /// every process-local registry observes the change (§5 invalidation hook).
    pub async fn reload(&self, store: &dyn Store) -> Result<(), noema_store::StoreError> {
        let fresh = store.list_tools().await?;
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        let mut by_command = self.by_command.write().unwrap_or_else(|e| e.into_inner());
        let mut by_display = self.by_display.write().unwrap_or_else(|e| e.into_inner());
        tools.clear();
        by_command.clear();
        by_display.clear();
        for tool in fresh {
            if let Some(command) = &tool.command_name {
                by_command.insert(command.to_ascii_lowercase(), tool.tool_id.clone());
            }
            by_display.insert(tool.display_name.to_ascii_lowercase(), tool.tool_id.clone());
            tools.insert(tool.tool_id.clone(), tool);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Tool> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    pub fn get(&self, id: &ToolId) -> Option<Tool> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    /// Resolves a free-form identifier to a tool: tries `toolId`, then `commandName`
    /// (case-insensitive, with or without a leading `/`), then `displayName`
    /// case-insensitive (§4.D `resolve`).
    pub fn resolve(&self, identifier: &str) -> Option<Tool> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        if let Some(tool) = tools.get(&ToolId::new(identifier.to_string())) {
            return Some(tool.clone());
        }
        drop(tools);

        let stripped = identifier.strip_prefix('/').unwrap_or(identifier);
        let lower = stripped.to_ascii_lowercase();
        let by_command = self.by_command.read().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = by_command.get(&lower) {
            return self.get(id);
        }
        drop(by_command);

        let by_display = self.by_display.read().unwrap_or_else(|e| e.into_inner());
        by_display.get(&identifier.to_ascii_lowercase()).and_then(|id| self.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noema_model::{CostingModel, CostingUnit, DeliveryMode, InputSchema, Service, ToolMetadata};
    use noema_store::InMemoryStore;

    fn sample_tool() -> Tool {
        Tool {
            tool_id: ToolId::new("flux-txt2img"),
            command_name: Some("/flux".into()),
            display_name: "Flux Text to Image".into(),
            service: Service::ComfyUi,
            delivery_mode: DeliveryMode::Async,
            input_schema: InputSchema::default(),
            costing_model: CostingModel::Dynamic {
                rate: rust_decimal::Decimal::new(2, 2),
                unit: CostingUnit::Second,
            },
            metadata: ToolMetadata::default(),
        }
    }

    #[tokio::test]
    async fn resolves_by_id_command_and_display_name() {
        let store = InMemoryStore::new();
        store.upsert_tool(sample_tool()).await.unwrap();
        let registry = ToolRegistry::load(&store).await.unwrap();

        assert_eq!(registry.resolve("flux-txt2img").unwrap().tool_id.as_str(), "flux-txt2img");
        assert_eq!(registry.resolve("/flux").unwrap().tool_id.as_str(), "flux-txt2img");
        assert_eq!(registry.resolve("flux").unwrap().tool_id.as_str(), "flux-txt2img");
        assert_eq!(registry.resolve("FLUX TEXT TO IMAGE").unwrap().tool_id.as_str(), "flux-txt2img");
        assert!(registry.resolve("nonexistent").is_none());
    }

    #[tokio::test]
    async fn reload_picks_up_newly_registered_tools() {
        let store = InMemoryStore::new();
        let registry = ToolRegistry::load(&store).await.unwrap();
        assert!(registry.resolve("flux-txt2img").is_none());
        store.upsert_tool(sample_tool()).await.unwrap();
        registry.reload(&store).await.unwrap();
        assert!(registry.resolve("flux-txt2img").is_some());
    }
}
