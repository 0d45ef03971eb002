//! Graph outcome evaluator.
//!
//! Walks a rooted relation graph and computes min/expected/max return over
//! the joint outcome space. Each relation type constrains which child
//! outcomes a parent outcome permits and how the child's probability
//! conditions on the parent; PARTITION_OF children are aggregated as a group
//! where exactly one member resolves yes under a yes parent.

use serde::Serialize;

use crate::models::{Decision, GraphNode, GraphOutcome, RelationType};
use crate::pricing::PROB_EPSILON;

/// Tolerance before a partition sum counts as diverging from the parent.
const PARTITION_SUM_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// Structural validation: unique ids, probability bounds, positive weights,
/// relations on every non-root node.
pub fn validate_graph(root: &GraphNode) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();
    validate_node(root, "root", true, &mut seen_ids, &mut issues);
    issues
}

fn validate_node(
    node: &GraphNode,
    path: &str,
    is_root: bool,
    seen_ids: &mut std::collections::HashSet<String>,
    issues: &mut Vec<ValidationIssue>,
) {
    if node.id.trim().is_empty() {
        issues.push(ValidationIssue {
            path: path.to_string(),
            message: "id must be non-empty".to_string(),
        });
    } else if !seen_ids.insert(node.id.clone()) {
        issues.push(ValidationIssue {
            path: path.to_string(),
            message: format!("duplicate id '{}'", node.id),
        });
    }

    if !node.probability.is_finite() || !(0.0..=1.0).contains(&node.probability) {
        issues.push(ValidationIssue {
            path: path.to_string(),
            message: "probability must lie in [0, 1]".to_string(),
        });
    }

    if !node.weight.is_finite() || node.weight <= 0.0 {
        issues.push(ValidationIssue {
            path: path.to_string(),
            message: "weight must be positive".to_string(),
        });
    }

    if !is_root && node.relation.is_none() {
        issues.push(ValidationIssue {
            path: path.to_string(),
            message: "non-root node must carry a relation".to_string(),
        });
    }

    for (i, child) in node.children.iter().enumerate() {
        let child_path = format!("{}.children[{}]", path, i);
        validate_node(child, &child_path, false, seen_ids, issues);
    }
}

#[derive(Debug, Clone, Copy)]
struct OutcomeMetrics {
    min: f64,
    max: f64,
    expected: f64,
}

impl OutcomeMetrics {
    const ZERO: Self = Self {
        min: 0.0,
        max: 0.0,
        expected: 0.0,
    };

    fn add(self, other: Self) -> Self {
        Self {
            min: self.min + other.min,
            max: self.max + other.max,
            expected: self.expected + other.expected,
        }
    }
}

struct NodeEval {
    /// Metrics of this subtree when the node resolves yes / no.
    yes: OutcomeMetrics,
    no: OutcomeMetrics,
    stake: f64,
    /// Accumulated edge-confidence mass of the subtree.
    confidence: f64,
}

/// Evaluates a validated graph.
pub fn evaluate_graph(root: &GraphNode) -> GraphOutcome {
    let mut warnings = Vec::new();
    let eval = eval_node(root, &mut warnings);

    let p_root = root.probability.clamp(0.0, 1.0);
    let total_stake = eval.stake;
    let worst_case = eval.yes.min.min(eval.no.min);
    let best_case = eval.yes.max.max(eval.no.max);
    let raw_ev = p_root * eval.yes.expected + (1.0 - p_root) * eval.no.expected;

    let confidence = eval.confidence / (eval.confidence + 1.0);
    let risk_factor = if total_stake > 0.0 {
        total_stake / (total_stake + (-worst_case).max(0.0))
    } else {
        0.0
    };

    // Positive expectation is damped by confidence and downside exposure;
    // losses are reported undamped.
    let expected_value = if raw_ev >= 0.0 {
        raw_ev * confidence * risk_factor
    } else {
        raw_ev
    };

    let roi = if total_stake > 0.0 {
        expected_value / total_stake
    } else {
        0.0
    };

    GraphOutcome {
        total_stake,
        worst_case,
        best_case,
        expected_value,
        roi,
        confidence,
        warnings,
    }
}

fn eval_node(node: &GraphNode, warnings: &mut Vec<String>) -> NodeEval {
    let p_parent = node.probability.clamp(0.0, 1.0);

    let mut stake = node.weight;
    let mut confidence = 0.0;

    let mut free_yes = OutcomeMetrics::ZERO;
    let mut free_no = OutcomeMetrics::ZERO;
    let mut partition: Vec<(f64, NodeEval)> = Vec::new();

    for child in &node.children {
        let relation = child.relation.unwrap_or(RelationType::WeakSignal);
        let p_child = child.probability.clamp(0.0, 1.0);
        let eval = eval_node(child, warnings);

        stake += eval.stake;
        confidence += eval.confidence;

        let (q_yes, q_no) = child_conditionals(relation, p_parent, p_child, &child.id, warnings);
        confidence += edge_confidence(p_parent, q_yes, q_no);

        if relation == RelationType::PartitionOf {
            partition.push((p_child, eval));
            continue;
        }

        free_yes = free_yes.add(child_contribution(
            &eval,
            forced_outcome(relation, true),
            q_yes,
        ));
        free_no = free_no.add(child_contribution(
            &eval,
            forced_outcome(relation, false),
            q_no,
        ));
    }

    if !partition.is_empty() {
        let (group_yes, group_no) = partition_group(&partition, p_parent, warnings);
        free_yes = free_yes.add(group_yes);
        free_no = free_no.add(group_no);
    }

    let own_yes = own_return(node, Decision::Yes);
    let own_no = own_return(node, Decision::No);

    NodeEval {
        yes: OutcomeMetrics {
            min: own_yes + free_yes.min,
            max: own_yes + free_yes.max,
            expected: own_yes + free_yes.expected,
        },
        no: OutcomeMetrics {
            min: own_no + free_no.min,
            max: own_no + free_no.max,
            expected: own_no + free_no.expected,
        },
        stake,
        confidence,
    }
}

fn own_return(node: &GraphNode, outcome: Decision) -> f64 {
    let decision = node.decision.unwrap_or(Decision::Yes);
    if decision == outcome {
        node.weight
    } else {
        -node.weight
    }
}

/// `Some(outcome)` when the parent outcome forces the child, `None` when the
/// child may still resolve either way.
fn forced_outcome(relation: RelationType, parent_yes: bool) -> Option<bool> {
    match relation {
        RelationType::Implies | RelationType::PartitionOf => {
            if parent_yes {
                None
            } else {
                Some(false)
            }
        }
        RelationType::Subevent | RelationType::ConditionedOn => {
            if parent_yes {
                Some(true)
            } else {
                None
            }
        }
        RelationType::Contradicts => {
            if parent_yes {
                Some(false)
            } else {
                None
            }
        }
        RelationType::WeakSignal => None,
    }
}

/// Conditional yes-probability of the child under each parent outcome.
fn child_conditionals(
    relation: RelationType,
    p_parent: f64,
    p_child: f64,
    child_id: &str,
    warnings: &mut Vec<String>,
) -> (f64, f64) {
    match relation {
        RelationType::Implies => {
            if p_child > p_parent + PROB_EPSILON {
                warnings.push(format!(
                    "incoherent IMPLIES edge at '{}': child probability exceeds parent",
                    child_id
                ));
            }
            (safe_div(p_child, p_parent, 0.0), 0.0)
        }
        RelationType::Subevent | RelationType::ConditionedOn => {
            if p_child < p_parent - PROB_EPSILON {
                warnings.push(format!(
                    "incoherent {} edge at '{}': child probability below parent",
                    if relation == RelationType::Subevent {
                        "SUBEVENT"
                    } else {
                        "CONDITIONED_ON"
                    },
                    child_id
                ));
            }
            (1.0, safe_div(p_child - p_parent, 1.0 - p_parent, 1.0))
        }
        RelationType::Contradicts => {
            if p_parent + p_child > 1.0 + PROB_EPSILON {
                warnings.push(format!(
                    "incoherent CONTRADICTS edge at '{}': probabilities exceed 1",
                    child_id
                ));
            }
            (0.0, safe_div(p_child, 1.0 - p_parent, p_child.clamp(0.0, 1.0)))
        }
        RelationType::PartitionOf => {
            if p_child > p_parent + PROB_EPSILON {
                warnings.push(format!(
                    "incoherent PARTITION_OF edge at '{}': child probability exceeds parent",
                    child_id
                ));
            }
            (safe_div(p_child, p_parent, 0.0), 0.0)
        }
        RelationType::WeakSignal => {
            let q = p_child.clamp(0.0, 1.0);
            (q, q)
        }
    }
}

fn safe_div(numerator: f64, denominator: f64, fallback: f64) -> f64 {
    if denominator > PROB_EPSILON {
        (numerator / denominator).clamp(0.0, 1.0)
    } else {
        fallback
    }
}

fn child_contribution(
    eval: &NodeEval,
    forced: Option<bool>,
    q_yes: f64,
) -> OutcomeMetrics {
    match forced {
        Some(true) => eval.yes,
        Some(false) => eval.no,
        None => OutcomeMetrics {
            min: eval.yes.min.min(eval.no.min),
            max: eval.yes.max.max(eval.no.max),
            expected: q_yes * eval.yes.expected + (1.0 - q_yes) * eval.no.expected,
        },
    }
}

/// PARTITION_OF children as a group: a no parent forces every member no; a
/// yes parent resolves exactly one member yes at a time.
fn partition_group(
    members: &[(f64, NodeEval)],
    p_parent: f64,
    warnings: &mut Vec<String>,
) -> (OutcomeMetrics, OutcomeMetrics) {
    let base_no = members
        .iter()
        .fold(OutcomeMetrics::ZERO, |acc, (_, e)| acc.add(e.no));

    let prob_sum: f64 = members.iter().map(|(p, _)| *p).sum();
    if prob_sum <= PROB_EPSILON {
        warnings.push(
            "partition children have zero total probability; assuming uniform".to_string(),
        );
    } else if (prob_sum - p_parent).abs() > PARTITION_SUM_TOLERANCE {
        warnings.push(format!(
            "partition probabilities sum to {:.3}, diverging from parent {:.3}",
            prob_sum, p_parent
        ));
    }

    let uniform = 1.0 / members.len() as f64;

    let mut group_min = f64::INFINITY;
    let mut group_max = f64::NEG_INFINITY;
    let mut group_expected = 0.0;

    for (p_child, eval) in members {
        let state_min = base_no.min - eval.no.min + eval.yes.min;
        let state_max = base_no.max - eval.no.max + eval.yes.max;
        let state_expected = base_no.expected - eval.no.expected + eval.yes.expected;

        let share = if prob_sum > PROB_EPSILON {
            p_child / prob_sum
        } else {
            uniform
        };

        group_min = group_min.min(state_min);
        group_max = group_max.max(state_max);
        group_expected += share * state_expected;
    }

    let yes = OutcomeMetrics {
        min: group_min,
        max: group_max,
        expected: group_expected,
    };

    (yes, base_no)
}

fn edge_confidence(p_parent: f64, q_yes: f64, q_no: f64) -> f64 {
    let weighted = p_parent * certainty(q_yes) + (1.0 - p_parent) * certainty(q_no);
    weighted * (q_yes - q_no).abs()
}

/// 1 at the extremes, 0 at a coin flip.
fn certainty(p: f64) -> f64 {
    1.0 - 4.0 * p * (1.0 - p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(
        id: &str,
        probability: f64,
        weight: f64,
        decision: Decision,
        relation: Option<RelationType>,
        children: Vec<GraphNode>,
    ) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            probability,
            weight,
            decision: Some(decision),
            relation,
            children,
        }
    }

    #[test]
    fn single_implies_child() {
        // p(child=yes | root=yes) = 0.6; root=no forces child=no.
        let graph = node(
            "root",
            0.5,
            1.0,
            Decision::Yes,
            None,
            vec![node(
                "a",
                0.3,
                1.0,
                Decision::Yes,
                Some(RelationType::Implies),
                vec![],
            )],
        );

        let out = evaluate_graph(&graph);
        assert_eq!(out.total_stake, 2.0);
        assert_eq!(out.worst_case, -2.0);
        assert_eq!(out.best_case, 2.0);
        assert!((out.expected_value - (-0.4)).abs() < 1e-9);
        assert!((out.roi - (-0.2)).abs() < 1e-9);
    }

    #[test]
    fn weak_signal_only_graph_has_zero_confidence_and_ev() {
        let graph = node(
            "root",
            0.5,
            1.0,
            Decision::Yes,
            None,
            vec![node(
                "a",
                0.5,
                1.0,
                Decision::Yes,
                Some(RelationType::WeakSignal),
                vec![],
            )],
        );

        let out = evaluate_graph(&graph);
        assert_eq!(out.confidence, 0.0);
        assert_eq!(out.expected_value, 0.0);
        assert_eq!(out.roi, 0.0);
        assert_eq!(out.total_stake, 2.0);
        assert_eq!(out.worst_case, -2.0);
        assert_eq!(out.best_case, 2.0);
    }

    #[test]
    fn contradicts_parent_yes_forces_child_no() {
        let graph = node(
            "root",
            0.6,
            1.0,
            Decision::Yes,
            None,
            vec![node(
                "a",
                0.3,
                2.0,
                Decision::Yes,
                Some(RelationType::Contradicts),
                vec![],
            )],
        );

        let out = evaluate_graph(&graph);
        // root=yes: +1 - 2 = -1 deterministically.
        // root=no: -1 + (0.75*2 + 0.25*(-2)) = 0 expected, min -3, max 1.
        assert_eq!(out.worst_case, -3.0);
        assert_eq!(out.best_case, 1.0);
        assert!((out.expected_value - (-0.6)).abs() < 1e-9);
    }

    #[test]
    fn partition_group_aggregates_exactly_one_yes() {
        let graph = node(
            "root",
            0.5,
            1.0,
            Decision::Yes,
            None,
            vec![
                node(
                    "a",
                    0.3,
                    1.0,
                    Decision::Yes,
                    Some(RelationType::PartitionOf),
                    vec![],
                ),
                node(
                    "b",
                    0.2,
                    1.0,
                    Decision::Yes,
                    Some(RelationType::PartitionOf),
                    vec![],
                ),
            ],
        );

        let out = evaluate_graph(&graph);
        // root=yes: one child pays +1, the other -1 => group metrics all 0.
        // root=no: both children forced no => -2; node total -3.
        assert_eq!(out.total_stake, 3.0);
        assert_eq!(out.worst_case, -3.0);
        assert_eq!(out.best_case, 1.0);
        assert!((out.expected_value - (-1.0)).abs() < 1e-9);
        assert!((out.roi - (-1.0 / 3.0)).abs() < 1e-9);
        assert!(out.warnings.is_empty());
        assert!(out.confidence > 0.0 && out.confidence < 1.0);
    }

    #[test]
    fn partition_sum_divergence_warns() {
        let graph = node(
            "root",
            0.9,
            1.0,
            Decision::Yes,
            None,
            vec![node(
                "a",
                0.2,
                1.0,
                Decision::Yes,
                Some(RelationType::PartitionOf),
                vec![],
            )],
        );

        let out = evaluate_graph(&graph);
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("diverging from parent")));
    }

    #[test]
    fn incoherent_implies_edge_warns() {
        let graph = node(
            "root",
            0.5,
            1.0,
            Decision::Yes,
            None,
            vec![node(
                "a",
                0.7,
                1.0,
                Decision::Yes,
                Some(RelationType::Implies),
                vec![],
            )],
        );

        let out = evaluate_graph(&graph);
        assert!(out.warnings.iter().any(|w| w.contains("IMPLIES")));
    }

    #[test]
    fn expected_value_bounded_by_extremes() {
        let graph = node(
            "root",
            0.55,
            2.0,
            Decision::Yes,
            None,
            vec![
                node(
                    "a",
                    0.4,
                    1.0,
                    Decision::No,
                    Some(RelationType::Implies),
                    vec![node(
                        "b",
                        0.2,
                        0.5,
                        Decision::Yes,
                        Some(RelationType::Subevent),
                        vec![],
                    )],
                ),
                node(
                    "c",
                    0.3,
                    1.5,
                    Decision::Yes,
                    Some(RelationType::Contradicts),
                    vec![],
                ),
            ],
        );

        let out = evaluate_graph(&graph);
        assert_eq!(out.total_stake, 5.0);
        assert!(out.expected_value.abs() <= out.worst_case.abs().max(out.best_case.abs()) + 1e-9);
        assert!(out.confidence >= 0.0 && out.confidence < 1.0);
    }

    #[test]
    fn validation_catches_structural_errors() {
        let graph = GraphNode {
            id: "root".to_string(),
            probability: 1.4,
            weight: 0.0,
            decision: None,
            relation: None,
            children: vec![
                GraphNode {
                    id: "root".to_string(),
                    probability: 0.5,
                    weight: 1.0,
                    decision: None,
                    relation: None,
                    children: vec![],
                },
            ],
        };

        let issues = validate_graph(&graph);
        let messages: Vec<&str> = issues.iter().map(|i| i.message.as_str()).collect();

        assert!(messages.iter().any(|m| m.contains("probability")));
        assert!(messages.iter().any(|m| m.contains("weight")));
        assert!(messages.iter().any(|m| m.contains("duplicate id")));
        assert!(messages.iter().any(|m| m.contains("relation")));

        let dup = issues
            .iter()
            .find(|i| i.message.contains("duplicate id"))
            .unwrap();
        assert_eq!(dup.path, "root.children[0]");
    }

    #[test]
    fn valid_graph_passes_validation() {
        let graph = node(
            "root",
            0.5,
            1.0,
            Decision::Yes,
            None,
            vec![node(
                "a",
                0.3,
                1.0,
                Decision::Yes,
                Some(RelationType::Implies),
                vec![],
            )],
        );
        assert!(validate_graph(&graph).is_empty());
    }
}
