//! Stored workflow definitions and running casts (§3 Spell, Spell cast; §4.G cast execution).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::ids::{GenerationId, MasterAccountId, SpellCastId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Listed,
    Public,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpellStep {
    pub step_id: String,
    pub tool_identifier: String,
    pub parameters: serde_json::Value,
}

/// An edge in the step DAG: `from.output` feeds `to.input` (§3 Spell connections).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub step_id: String,
    pub port: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub from: Endpoint,
    pub to: Endpoint,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Spell {
    pub slug: String,
    pub name: String,
    pub visibility: Visibility,
    pub steps: Vec<SpellStep>,
    pub connections: Vec<Connection>,
    pub exposed_inputs: Vec<String>,
    pub owner: MasterAccountId,
}

/// A step graph that failed cycle/edge validation at spell-create time.
#[derive(Debug, thiserror::Error)]
pub enum SpellGraphError {
    #[error("connection references unknown step {0:?}")]
    UnknownStep(String),
    #[error("step graph contains a cycle")]
    Cycle,
}

impl Spell {
    /// Validates the connections graph and returns step ids in execution order
    /// (§Design Notes: "detect cycles at spell-create time"; §4.G: "executes steps in
    /// topological order of the connections graph").
    pub fn topological_order(&self) -> Result<Vec<String>, SpellGraphError> {
        let ids: HashSet<&str> = self.steps.iter().map(|s| s.step_id.as_str()).collect();
        let mut indegree: HashMap<&str, usize> = ids.iter().map(|&id| (id, 0)).collect();
        let mut edges: HashMap<&str, Vec<&str>> = ids.iter().map(|&id| (id, Vec::new())).collect();

        for conn in &self.connections {
            if !ids.contains(conn.from.step_id.as_str()) {
                return Err(SpellGraphError::UnknownStep(conn.from.step_id.clone()));
            }
            if !ids.contains(conn.to.step_id.as_str()) {
                return Err(SpellGraphError::UnknownStep(conn.to.step_id.clone()));
            }
            edges.get_mut(conn.from.step_id.as_str()).unwrap().push(conn.to.step_id.as_str());
            *indegree.get_mut(conn.to.step_id.as_str()).unwrap() += 1;
        }

        let mut queue: Vec<&str> = self
            .steps
            .iter()
            .map(|s| s.step_id.as_str())
            .filter(|id| indegree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        let mut i = 0;
        while i < queue.len() {
            let node = queue[i];
            i += 1;
            order.push(node.to_string());
            for &next in &edges[node] {
                let entry = indegree.get_mut(next).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push(next);
                }
            }
        }

        if order.len() != self.steps.len() {
            return Err(SpellGraphError::Cycle);
        }
        Ok(order)
    }

    /// Final step(s): those with no outgoing connection. Only these emit a
    /// `generationUpdated` notification (§4.G).
    pub fn terminal_steps(&self) -> Vec<&str> {
        let has_outgoing: HashSet<&str> =
            self.connections.iter().map(|c| c.from.step_id.as_str()).collect();
        self.steps
            .iter()
            .map(|s| s.step_id.as_str())
            .filter(|id| !has_outgoing.contains(id))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpellCast {
    pub cast_id: SpellCastId,
    pub slug: String,
    pub context: HashMap<String, serde_json::Value>,
    pub status: CastStatus,
    pub step_status: HashMap<String, StepStatus>,
    pub step_generation_ids: HashMap<String, GenerationId>,
    pub output: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_spell() -> Spell {
        Spell {
            slug: "upscale-then-caption".into(),
            name: "Upscale then caption".into(),
            visibility: Visibility::Private,
            steps: vec![
                SpellStep { step_id: "a".into(), tool_identifier: "upscale".into(), parameters: serde_json::json!({}) },
                SpellStep { step_id: "b".into(), tool_identifier: "caption".into(), parameters: serde_json::json!({}) },
            ],
            connections: vec![Connection {
                from: Endpoint { step_id: "a".into(), port: "image".into() },
                to: Endpoint { step_id: "b".into(), port: "image".into() },
            }],
            exposed_inputs: vec![],
            owner: MasterAccountId::parse("a".repeat(24)).unwrap(),
        }
    }

    #[test]
    fn topological_order_respects_edges() {
        let spell = linear_spell();
        assert_eq!(spell.topological_order().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn terminal_steps_are_those_with_no_outgoing_edge() {
        let spell = linear_spell();
        assert_eq!(spell.terminal_steps(), vec!["b"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut spell = linear_spell();
        spell.connections.push(Connection {
            from: Endpoint { step_id: "b".into(), port: "out".into() },
            to: Endpoint { step_id: "a".into(), port: "in".into() },
        });
        assert!(matches!(spell.topological_order(), Err(SpellGraphError::Cycle)));
    }

    #[test]
    fn unknown_step_in_connection_is_rejected() {
        let mut spell = linear_spell();
        spell.connections.push(Connection {
            from: Endpoint { step_id: "b".into(), port: "out".into() },
            to: Endpoint { step_id: "ghost".into(), port: "in".into() },
        });
        assert!(matches!(spell.topological_order(), Err(SpellGraphError::UnknownStep(_))));
    }
}
