//! Capability Router (C4, `spec.md` §4.4): decides which immediate children
//! of an agent should be engaged for a task, from a capability snapshot.

use crate::model::{tokenize_keywords, AgentId, Capability};

const SELECTION_THRESHOLD: f32 = 0.0;
const DEPTH_PENALTY_FACTOR: f32 = 0.1;

/// Normalized overlap of case-folded token sets: `|task_tokens ∩ keywords| /
/// |keywords|`, so a child whose every keyword appears in the task scores 1.0
/// regardless of how long the task string is.
fn keyword_match(task_tokens: &std::collections::HashSet<String>, keywords: &std::collections::HashSet<String>) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let overlap = task_tokens.intersection(keywords).count();
    overlap as f32 / keywords.len() as f32
}

fn depth_penalty(depth: u32) -> f32 {
    DEPTH_PENALTY_FACTOR * depth as f32
}

/// `select_children(task, agent_capability) -> list<child_id>` (`spec.md`
/// §4.4). Deterministic: ties broken by lexicographic `child_id`.
pub fn select_children(task: &str, agent_capability: &Capability) -> Vec<AgentId> {
    let task_tokens = tokenize_keywords(task);

    let mut scored: Vec<(AgentId, f32)> = agent_capability
        .child_capabilities
        .iter()
        .map(|child| {
            let score = keyword_match(&task_tokens, &child.keywords) - depth_penalty(child.depth);
            (child.agent_id.clone(), score)
        })
        .collect();

    scored.sort_by(|a, b| a.0.cmp(&b.0));

    let qualifying: Vec<AgentId> = scored
        .iter()
        .filter(|(_, score)| *score > SELECTION_THRESHOLD)
        .map(|(id, _)| id.clone())
        .collect();

    if !qualifying.is_empty() {
        return qualifying;
    }

    // Nothing cleared the threshold: fall back to the single highest-scoring
    // child, but only if the task actually mentions one of its keywords.
    let best = scored
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .cloned();

    match best {
        Some((child_id, _)) => {
            let child = agent_capability
                .child_capabilities
                .iter()
                .find(|c| c.agent_id == child_id)
                .expect("best was drawn from child_capabilities");
            if child.keywords.iter().any(|kw| task_tokens.contains(kw)) {
                vec![child_id]
            } else {
                vec![]
            }
        }
        None => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn capability(id: &str, keywords: &[&str], depth: u32) -> Capability {
        Capability {
            agent_id: id.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            child_capabilities: vec![],
            depth,
            confidence: 1.0,
        }
    }

    fn parent_with(children: Vec<Capability>) -> Capability {
        Capability {
            agent_id: "parent".to_string(),
            keywords: HashSet::new(),
            child_capabilities: children,
            depth: 0,
            confidence: 1.0,
        }
    }

    #[test]
    fn selects_children_whose_keywords_overlap_the_task() {
        let parent = parent_with(vec![
            capability("flights", &["flights", "airline"], 1),
            capability("hotels", &["hotels", "lodging"], 1),
        ]);
        let selected = select_children("book a flight to Tokyo", &parent);
        assert_eq!(selected, vec!["flights".to_string()]);
    }

    #[test]
    fn ties_are_broken_lexicographically() {
        let parent = parent_with(vec![
            capability("zeta", &["trip"], 1),
            capability("alpha", &["trip"], 1),
        ]);
        let selected = select_children("plan my trip", &parent);
        assert_eq!(selected, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn no_overlap_returns_empty_not_a_fallback_child() {
        let parent = parent_with(vec![capability("hotels", &["hotels"], 1)]);
        let selected = select_children("translate this document", &parent);
        assert!(selected.is_empty());
    }

    #[test]
    fn depth_penalty_lowers_score_but_both_still_qualify_above_threshold() {
        // shallow: 1.0 - 0.1*1 = 0.9; deep: 1.0 - 0.1*5 = 0.5. Both > 0, so the
        // selection rule ("all children with score > threshold") returns both.
        let parent = parent_with(vec![
            capability("shallow", &["trip"], 1),
            capability("deep", &["trip"], 5),
        ]);
        let selected = select_children("plan my trip", &parent);
        assert_eq!(selected, vec!["deep".to_string(), "shallow".to_string()]);
    }

    #[test]
    fn depth_penalty_can_push_a_child_below_threshold() {
        // deep: 1.0 - 0.1*11 = -0.1, fails the threshold and is excluded even
        // though its keywords fully match the task.
        let parent = parent_with(vec![
            capability("shallow", &["trip"], 1),
            capability("deep", &["trip"], 11),
        ]);
        let selected = select_children("plan my trip", &parent);
        assert_eq!(selected, vec!["shallow".to_string()]);
    }

    #[test]
    fn no_children_at_all_returns_empty() {
        let parent = parent_with(vec![]);
        assert!(select_children("anything", &parent).is_empty());
    }
}
