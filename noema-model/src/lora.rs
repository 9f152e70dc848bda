//! LoRA models and private-access permissions (§3 LoRA model & permission).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::MasterAccountId;
use crate::tool::BaseModel;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoraModel {
    pub slug: String,
    pub trigger_words: Vec<String>,
    /// Alias → canonical trigger word, for fuzzy prompt rewriting.
    pub cognates: HashMap<String, String>,
    pub checkpoint: BaseModel,
    pub default_weight: f64,
    /// `None` means public.
    pub owned_by: Option<MasterAccountId>,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl LoraModel {
    pub fn is_public(&self) -> bool {
        self.owned_by.is_none()
    }

    /// Case-insensitive substring match across `{name, slug, triggerWords, description,
    /// tags}` (§6 `/loras/list?q=`).
    pub fn matches_query(&self, query: &str) -> bool {
        let q = query.to_ascii_lowercase();
        self.name.to_ascii_lowercase().contains(&q)
            || self.slug.to_ascii_lowercase().contains(&q)
            || self.description.to_ascii_lowercase().contains(&q)
            || self.trigger_words.iter().any(|w| w.to_ascii_lowercase().contains(&q))
            || self.tags.iter().any(|t| t.to_ascii_lowercase().contains(&q))
    }

    /// Resolves an alias to its canonical trigger word if present.
    pub fn resolve_cognate<'a>(&'a self, word: &'a str) -> &'a str {
        self.cognates.get(word).map(|s| s.as_str()).unwrap_or(word)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoraPermission {
    pub lora_slug: String,
    pub master_account_id: MasterAccountId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LoraModel {
        LoraModel {
            slug: "neon-noir".into(),
            trigger_words: vec!["neonnoir".into()],
            cognates: HashMap::from([("neon noir".to_string(), "neonnoir".to_string())]),
            checkpoint: BaseModel::Flux,
            default_weight: 0.8,
            owned_by: None,
            name: "Neon Noir".into(),
            description: "cyberpunk rain-soaked city".into(),
            tags: vec!["cyberpunk".into()],
        }
    }

    #[test]
    fn public_when_unowned() {
        assert!(sample().is_public());
    }

    #[test]
    fn query_matches_case_insensitively_across_fields() {
        let lora = sample();
        assert!(lora.matches_query("NEON"));
        assert!(lora.matches_query("cyberpunk"));
        assert!(lora.matches_query("rain-soaked"));
        assert!(!lora.matches_query("watercolor"));
    }

    #[test]
    fn cognate_resolves_to_canonical() {
        let lora = sample();
        assert_eq!(lora.resolve_cognate("neon noir"), "neonnoir");
        assert_eq!(lora.resolve_cognate("unrelated"), "unrelated");
    }
}
