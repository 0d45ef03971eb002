//! Compact pricing engine.
//!
//! Turns a root belief plus typed dependants into directional trades. Edges
//! are soft-thresholded (`m²/(m+ε)`) so small mispricings shrink smoothly, and
//! the risk exponent `1/volatility` scales sizes with the chosen posture.
//! Invalid numeric inputs produce warnings and defaults, never errors.

use serde::Deserialize;

use crate::models::{Decision, DependantInput, PricedDependant, RelationType, RootPosition};

/// Equality tolerance for probability comparisons.
pub const PROB_EPSILON: f64 = 1e-6;

fn default_epsilon() -> f64 {
    0.01
}

fn default_volatility() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingOptions {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_volatility")]
    pub volatility: f64,
}

impl Default for PricingOptions {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            volatility: default_volatility(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PricingOutcome {
    pub dependants: Vec<PricedDependant>,
    pub warnings: Vec<String>,
}

/// Sizes every dependant against the root position.
pub fn price_dependants(
    root: &RootPosition,
    dependants: &[DependantInput],
    options: &PricingOptions,
) -> PricingOutcome {
    let mut warnings = Vec::new();

    let root_probability = sanitize_probability(root.probability, "root", &mut warnings);
    let root_weight = if root.weight.is_finite() && root.weight > 0.0 {
        root.weight
    } else {
        warnings.push("root_weight_invalid: defaulting to 1".to_string());
        1.0
    };

    let volatility = if options.volatility.is_finite() {
        options.volatility
    } else {
        warnings.push("volatility_invalid: defaulting to 1".to_string());
        1.0
    };
    let epsilon = if options.epsilon.is_finite() && options.epsilon >= 0.0 {
        options.epsilon
    } else {
        warnings.push("epsilon_invalid: defaulting to 0.01".to_string());
        0.01
    };

    let trades_disabled = volatility <= 0.0;
    if trades_disabled {
        warnings.push(
            "volatility_non_positive: volatility <= 0 disables all trades".to_string(),
        );
    }

    let (effective_epsilon, risk_exponent) = if trades_disabled {
        (1.0, 1.0)
    } else {
        ((epsilon / volatility).clamp(0.0, 0.99), 1.0 / volatility)
    };

    let probabilities: Vec<f64> = dependants
        .iter()
        .map(|d| sanitize_probability(d.probability, &d.id, &mut warnings))
        .collect();

    // PARTITION_OF members rescale jointly: Σ target = root probability.
    let partition_sum: f64 = dependants
        .iter()
        .zip(&probabilities)
        .filter(|(d, _)| d.relation == RelationType::PartitionOf)
        .map(|(_, p)| *p)
        .sum();
    let partition_degenerate = dependants
        .iter()
        .any(|d| d.relation == RelationType::PartitionOf)
        && partition_sum <= PROB_EPSILON;
    if partition_degenerate {
        warnings.push(
            "partition_probability_zero: treating PARTITION_OF members as weak signals"
                .to_string(),
        );
    }

    let priced = dependants
        .iter()
        .zip(&probabilities)
        .map(|(dep, &p)| {
            let target = match dep.relation {
                RelationType::Implies => p.min(root_probability),
                RelationType::Subevent | RelationType::ConditionedOn => p.max(root_probability),
                RelationType::Contradicts => p.min(1.0 - root_probability),
                RelationType::PartitionOf => {
                    if partition_degenerate {
                        p
                    } else {
                        (p * root_probability / partition_sum).clamp(0.0, 1.0)
                    }
                }
                RelationType::WeakSignal => p,
            };

            let edge = target - p;
            let magnitude = edge.abs();

            let (weight, decision) = if magnitude > PROB_EPSILON {
                let adjusted = magnitude * magnitude / (magnitude + effective_epsilon);
                let decision = if edge > 0.0 { Decision::Yes } else { Decision::No };
                (root_weight * adjusted.powf(risk_exponent), decision)
            } else {
                (0.0, root.decision)
            };

            PricedDependant {
                id: dep.id.clone(),
                weight: if trades_disabled { 0.0 } else { weight },
                decision,
                relation: dep.relation,
            }
        })
        .collect();

    PricingOutcome {
        dependants: priced,
        warnings,
    }
}

fn sanitize_probability(p: f64, label: &str, warnings: &mut Vec<String>) -> f64 {
    if !p.is_finite() {
        warnings.push(format!("probability_invalid:{label}: defaulting to 0.5"));
        return 0.5;
    }
    if !(0.0..=1.0).contains(&p) {
        warnings.push(format!("probability_out_of_range:{label}: clamping"));
        return p.clamp(0.0, 1.0);
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(probability: f64, weight: f64, decision: Decision) -> RootPosition {
        RootPosition {
            id: None,
            probability,
            weight,
            decision,
        }
    }

    fn dep(id: &str, probability: f64, relation: RelationType) -> DependantInput {
        DependantInput {
            id: id.to_string(),
            probability,
            relation,
        }
    }

    #[test]
    fn implies_overpriced_dependant_shorts() {
        // target = min(0.8, 0.6) = 0.6, edge = -0.2, adj = 0.04/0.21
        let out = price_dependants(
            &root(0.6, 1.0, Decision::Yes),
            &[dep("a", 0.8, RelationType::Implies)],
            &PricingOptions::default(),
        );

        let d = &out.dependants[0];
        assert_eq!(d.decision, Decision::No);
        assert_eq!(d.relation, RelationType::Implies);
        assert!((d.weight - 0.04 / 0.21).abs() < 1e-9);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn contradicts_with_volatility_scaling() {
        // target = min(0.5, 0.3) = 0.3, eps_eff = 0.005, risk exponent 0.5
        let out = price_dependants(
            &root(0.7, 2.0, Decision::Yes),
            &[dep("x", 0.5, RelationType::Contradicts)],
            &PricingOptions {
                epsilon: 0.01,
                volatility: 2.0,
            },
        );

        let d = &out.dependants[0];
        assert_eq!(d.decision, Decision::No);
        let expected = 2.0 * (0.04f64 / 0.205).sqrt();
        assert!((d.weight - expected).abs() < 1e-9);
        assert!((d.weight - 0.883).abs() < 1e-3);
    }

    #[test]
    fn partition_rescale_with_exact_sum_is_flat() {
        // S = 0.6 = root, scale 1: every edge is zero.
        let out = price_dependants(
            &root(0.6, 1.0, Decision::Yes),
            &[
                dep("a", 0.4, RelationType::PartitionOf),
                dep("b", 0.2, RelationType::PartitionOf),
            ],
            &PricingOptions::default(),
        );

        for d in &out.dependants {
            assert_eq!(d.weight, 0.0);
            assert_eq!(d.decision, Decision::Yes);
        }
    }

    #[test]
    fn partition_targets_sum_to_root_probability() {
        // S = 0.6, root 0.5: targets 1/3 and 1/6, both below market.
        let out = price_dependants(
            &root(0.5, 1.0, Decision::Yes),
            &[
                dep("a", 0.4, RelationType::PartitionOf),
                dep("b", 0.2, RelationType::PartitionOf),
            ],
            &PricingOptions::default(),
        );

        for d in &out.dependants {
            assert_eq!(d.decision, Decision::No);
            assert!(d.weight > 0.0);
        }
    }

    #[test]
    fn partition_sum_zero_degrades_to_weak_signal() {
        let out = price_dependants(
            &root(0.5, 1.0, Decision::Yes),
            &[
                dep("a", 0.0, RelationType::PartitionOf),
                dep("b", 0.0, RelationType::PartitionOf),
            ],
            &PricingOptions::default(),
        );

        for d in &out.dependants {
            assert_eq!(d.weight, 0.0);
        }
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("partition_probability_zero")));
    }

    #[test]
    fn non_positive_volatility_disables_trades() {
        let out = price_dependants(
            &root(0.6, 1.0, Decision::Yes),
            &[
                dep("a", 0.9, RelationType::Implies),
                dep("b", 0.1, RelationType::Subevent),
            ],
            &PricingOptions {
                epsilon: 0.01,
                volatility: 0.0,
            },
        );

        assert!(out.dependants.iter().all(|d| d.weight == 0.0));
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("volatility_non_positive")));
    }

    #[test]
    fn huge_volatility_pushes_weights_toward_root_weight() {
        let out = price_dependants(
            &root(0.6, 1.5, Decision::Yes),
            &[dep("a", 0.9, RelationType::Implies)],
            &PricingOptions {
                epsilon: 0.01,
                volatility: 1e9,
            },
        );

        assert!((out.dependants[0].weight - 1.5).abs() < 1e-3);
    }

    #[test]
    fn monotone_relation_decisions() {
        // IMPLIES with dep above root prices down.
        let out = price_dependants(
            &root(0.4, 1.0, Decision::Yes),
            &[dep("a", 0.7, RelationType::Implies)],
            &PricingOptions::default(),
        );
        assert_eq!(out.dependants[0].decision, Decision::No);

        // SUBEVENT / CONDITIONED_ON with dep below root price up.
        for rel in [RelationType::Subevent, RelationType::ConditionedOn] {
            let out = price_dependants(
                &root(0.7, 1.0, Decision::Yes),
                &[dep("a", 0.3, rel)],
                &PricingOptions::default(),
            );
            assert_eq!(out.dependants[0].decision, Decision::Yes);
        }

        // CONTRADICTS with p_root + p_dep > 1 prices down.
        let out = price_dependants(
            &root(0.7, 1.0, Decision::Yes),
            &[dep("a", 0.6, RelationType::Contradicts)],
            &PricingOptions::default(),
        );
        assert_eq!(out.dependants[0].decision, Decision::No);
    }

    #[test]
    fn weak_signal_never_trades() {
        let out = price_dependants(
            &root(0.2, 1.0, Decision::No),
            &[dep("a", 0.9, RelationType::WeakSignal)],
            &PricingOptions::default(),
        );
        assert_eq!(out.dependants[0].weight, 0.0);
        assert_eq!(out.dependants[0].decision, Decision::No);
    }

    #[test]
    fn output_relation_and_ids_match_input() {
        let inputs = [
            dep("a", 0.8, RelationType::Implies),
            dep("b", 0.2, RelationType::Contradicts),
        ];
        let out = price_dependants(
            &root(0.5, 1.0, Decision::Yes),
            &inputs,
            &PricingOptions::default(),
        );

        assert_eq!(out.dependants.len(), 2);
        for (i, d) in out.dependants.iter().enumerate() {
            assert_eq!(d.id, inputs[i].id);
            assert_eq!(d.relation, inputs[i].relation);
            assert!(d.weight >= 0.0);
        }
    }

    #[test]
    fn out_of_range_probability_is_clamped_with_warning() {
        let out = price_dependants(
            &root(1.4, 1.0, Decision::Yes),
            &[dep("a", -0.2, RelationType::Implies)],
            &PricingOptions::default(),
        );

        assert_eq!(out.dependants.len(), 1);
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("probability_out_of_range:root")));
        assert!(out
            .warnings
            .iter()
            .any(|w| w.contains("probability_out_of_range:a")));
    }
}
