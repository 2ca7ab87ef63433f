//! Node-selection strategies. Each takes a queued run's snapshot, the set
//! of currently-alive nodes, and the in-memory `running_count` map, and
//! returns a chosen node id or `None` ("no match", try the next strategy).

use std::collections::HashMap;

use fleet_db::models::{Labels, Node};

use crate::config::{LabelMatchConfig, StrategyName};
use crate::heartbeat::HeartbeatRecord;

/// A candidate node, joining its store row with its live heartbeat.
pub struct AliveNode<'a> {
    pub id: &'a str,
    pub labels: &'a Labels,
    pub max_concurrent: i32,
    pub running_count: i32,
}

impl<'a> AliveNode<'a> {
    pub fn has_capacity(&self) -> bool {
        self.running_count < self.max_concurrent
    }

    fn load_ratio(&self) -> f64 {
        if self.max_concurrent <= 0 {
            return f64::INFINITY;
        }
        self.running_count as f64 / self.max_concurrent as f64
    }
}

/// Join node rows with their heartbeat records and the in-memory running
/// count, yielding the alive-and-selectable set in deterministic id order.
pub fn alive_nodes<'a>(
    nodes: &'a [Node],
    heartbeats: &'a [HeartbeatRecord],
    running_counts: &HashMap<String, i32>,
) -> Vec<AliveNode<'a>> {
    let mut result: Vec<AliveNode<'a>> = nodes
        .iter()
        .filter_map(|node| {
            let hb = heartbeats.iter().find(|h| h.node_id == node.id)?;
            Some(AliveNode {
                id: &node.id,
                labels: &node.labels,
                max_concurrent: hb.max_concurrent,
                running_count: *running_counts.get(&node.id).unwrap_or(&hb.running_count),
            })
        })
        .collect();
    result.sort_by(|a, b| a.id.cmp(b.id));
    result
}

fn labels_satisfy(required: &Labels, candidate: &Labels) -> bool {
    required
        .iter()
        .all(|(k, v)| candidate.get(k).is_some_and(|cv| cv == v))
}

/// `direct`: the snapshot names a node id; use it iff alive and under
/// capacity.
pub fn direct<'a>(requested_node: Option<&str>, candidates: &[AliveNode<'a>]) -> Option<String> {
    let requested = requested_node?;
    candidates
        .iter()
        .find(|n| n.id == requested && n.has_capacity())
        .map(|n| n.id.to_string())
}

/// `affinity`: prefer a node already running the task, for cache locality.
pub fn affinity<'a>(nodes_with_task: &[String], candidates: &[AliveNode<'a>]) -> Option<String> {
    candidates
        .iter()
        .find(|n| nodes_with_task.iter().any(|id| id == n.id) && n.has_capacity())
        .map(|n| n.id.to_string())
}

/// `label_match`: among alive, under-capacity nodes whose labels are a
/// superset of the task's required labels, pick by load-balance ratio or
/// deterministic id order.
pub fn label_match<'a>(
    required_labels: &Labels,
    candidates: &[AliveNode<'a>],
    config: &LabelMatchConfig,
) -> Option<String> {
    let mut matching: Vec<&AliveNode<'a>> = candidates
        .iter()
        .filter(|n| n.has_capacity() && labels_satisfy(required_labels, n.labels))
        .collect();

    if matching.is_empty() {
        return None;
    }

    if config.load_balance {
        matching.sort_by(|a, b| {
            a.load_ratio()
                .partial_cmp(&b.load_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(b.id))
        });
    }

    matching.first().map(|n| n.id.to_string())
}

/// Evaluate the configured strategy chain left-to-right, returning the
/// first match.
pub fn select_node<'a>(
    chain: &[StrategyName],
    requested_node: Option<&str>,
    nodes_with_task: &[String],
    required_labels: &Labels,
    label_match_config: &LabelMatchConfig,
    candidates: &[AliveNode<'a>],
) -> Option<String> {
    for strategy in chain {
        let chosen = match strategy {
            StrategyName::Direct => direct(requested_node, candidates),
            StrategyName::Affinity => affinity(nodes_with_task, candidates),
            StrategyName::LabelMatch => {
                label_match(required_labels, candidates, label_match_config)
            }
        };
        if chosen.is_some() {
            return chosen;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn node<'a>(id: &'a str, labels: &'a Labels, running: i32, max: i32) -> AliveNode<'a> {
        AliveNode {
            id,
            labels,
            max_concurrent: max,
            running_count: running,
        }
    }

    #[test]
    fn direct_picks_requested_node_under_capacity() {
        let l = labels(&[]);
        let candidates = vec![node("a", &l, 0, 1), node("b", &l, 0, 1)];
        assert_eq!(direct(Some("b"), &candidates), Some("b".to_string()));
    }

    #[test]
    fn direct_rejects_node_at_capacity() {
        let l = labels(&[]);
        let candidates = vec![node("a", &l, 1, 1)];
        assert_eq!(direct(Some("a"), &candidates), None);
    }

    #[test]
    fn label_match_filters_by_superset() {
        let required = labels(&[("gpu", "true")]);
        let a_labels = labels(&[("gpu", "true")]);
        let b_labels = labels(&[("gpu", "false")]);
        let candidates = vec![node("a", &a_labels, 0, 1), node("b", &b_labels, 0, 1)];
        let cfg = LabelMatchConfig { load_balance: true };
        assert_eq!(
            label_match(&required, &candidates, &cfg),
            Some("a".to_string())
        );
    }

    #[test]
    fn label_match_load_balances_by_ratio() {
        let required = labels(&[]);
        let l = labels(&[]);
        let candidates = vec![node("a", &l, 4, 5), node("b", &l, 1, 5)];
        let cfg = LabelMatchConfig { load_balance: true };
        assert_eq!(
            label_match(&required, &candidates, &cfg),
            Some("b".to_string())
        );
    }

    #[test]
    fn label_match_without_load_balance_picks_first_id() {
        let required = labels(&[]);
        let l = labels(&[]);
        let candidates = vec![node("b", &l, 0, 5), node("a", &l, 0, 5)];
        let cfg = LabelMatchConfig {
            load_balance: false,
        };
        assert_eq!(
            label_match(&required, &candidates, &cfg),
            Some("a".to_string())
        );
    }

    #[test]
    fn chain_falls_through_to_label_match() {
        let required = labels(&[]);
        let l = labels(&[]);
        let candidates = vec![node("a", &l, 0, 1)];
        let chain = vec![
            StrategyName::Direct,
            StrategyName::Affinity,
            StrategyName::LabelMatch,
        ];
        let cfg = LabelMatchConfig { load_balance: true };
        let chosen = select_node(&chain, None, &[], &required, &cfg, &candidates);
        assert_eq!(chosen, Some("a".to_string()));
    }
}
