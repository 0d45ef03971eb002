//! Domain records shared across the catalog, finder, pricing, and graph layers.
//!
//! Raw upstream shapes never leave the catalog module; everything here is the
//! normalized form the rest of the service works with.

use serde::{Deserialize, Serialize};

/// Closed set of directional relations between a root market and a dependant.
///
/// Unknown tags coming back from the model degrade to `WeakSignal` instead of
/// failing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", from = "String")]
pub enum RelationType {
    Implies,
    Subevent,
    ConditionedOn,
    Contradicts,
    PartitionOf,
    WeakSignal,
}

impl RelationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IMPLIES" => Some(Self::Implies),
            "SUBEVENT" => Some(Self::Subevent),
            "CONDITIONED_ON" => Some(Self::ConditionedOn),
            "CONTRADICTS" => Some(Self::Contradicts),
            "PARTITION_OF" => Some(Self::PartitionOf),
            "WEAK_SIGNAL" => Some(Self::WeakSignal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implies => "IMPLIES",
            Self::Subevent => "SUBEVENT",
            Self::ConditionedOn => "CONDITIONED_ON",
            Self::Contradicts => "CONTRADICTS",
            Self::PartitionOf => "PARTITION_OF",
            Self::WeakSignal => "WEAK_SIGNAL",
        }
    }
}

impl From<String> for RelationType {
    fn from(s: String) -> Self {
        Self::parse(&s).unwrap_or(Self::WeakSignal)
    }
}

/// Trade direction on a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Yes,
    No,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

/// Outcome token with its current price (0-1 scale).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeToken {
    pub outcome: String,
    pub price: f64,
}

/// Normalized market record.
///
/// Price information may live in any of several fields depending on which
/// upstream endpoint produced the record; `catalog::market_percentages`
/// resolves them in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    #[serde(default)]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub market_slug: Option<String>,
    pub question: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub tokens: Vec<OutcomeToken>,
    /// Raw outcome prices in upstream order (yes first). Scale is detected at
    /// percentage-extraction time: values above 1 are treated as 0-100.
    #[serde(default)]
    pub outcome_prices: Option<Vec<f64>>,
    #[serde(default)]
    pub last_trade_price: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub closed: bool,
}

impl Market {
    /// Canonical identity: the condition id when present, else the plain id.
    pub fn normalized_id(&self) -> &str {
        self.condition_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.id)
    }
}

/// An event groups one or more markets under a stable slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub markets: Vec<Market>,
}

/// A candidate related market produced by the finder.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedBet {
    pub market_id: String,
    pub market: Market,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_slug: Option<String>,
    pub relationship: RelationType,
    pub reasoning: String,
    pub yes_percentage: f64,
    pub no_percentage: f64,
}

/// Root position the pricing engine sizes dependants against.
#[derive(Debug, Clone, Deserialize)]
pub struct RootPosition {
    #[serde(default)]
    pub id: Option<String>,
    pub probability: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_decision")]
    pub decision: Decision,
}

fn default_weight() -> f64 {
    1.0
}

fn default_decision() -> Decision {
    Decision::Yes
}

/// Pricing input: a dependant market with its current probability and the
/// typed relation tying it to the root.
#[derive(Debug, Clone, Deserialize)]
pub struct DependantInput {
    pub id: String,
    pub probability: f64,
    pub relation: RelationType,
}

/// Pricing output for one dependant.
#[derive(Debug, Clone, Serialize)]
pub struct PricedDependant {
    pub id: String,
    pub weight: f64,
    pub decision: Decision,
    pub relation: RelationType,
}

/// Recursive graph node for the outcome evaluator. Non-root nodes carry the
/// relation describing their edge to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub probability: f64,
    pub weight: f64,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub relation: Option<RelationType>,
    #[serde(default)]
    pub children: Vec<GraphNode>,
}

/// Aggregate metrics over the joint outcome space of a relation graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphOutcome {
    pub total_stake: f64,
    pub worst_case: f64,
    pub best_case: f64,
    pub expected_value: f64,
    pub roi: f64,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_round_trip() {
        for (tag, rel) in [
            ("IMPLIES", RelationType::Implies),
            ("SUBEVENT", RelationType::Subevent),
            ("CONDITIONED_ON", RelationType::ConditionedOn),
            ("CONTRADICTS", RelationType::Contradicts),
            ("PARTITION_OF", RelationType::PartitionOf),
            ("WEAK_SIGNAL", RelationType::WeakSignal),
        ] {
            assert_eq!(RelationType::parse(tag), Some(rel));
            assert_eq!(rel.as_str(), tag);
            let json = format!("\"{}\"", tag);
            let parsed: RelationType = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, rel);
        }
    }

    #[test]
    fn unknown_relation_degrades_to_weak_signal() {
        let parsed: RelationType = serde_json::from_str("\"CAUSES\"").unwrap();
        assert_eq!(parsed, RelationType::WeakSignal);
    }

    #[test]
    fn normalized_id_prefers_condition_id() {
        let mut m = Market {
            id: "123".to_string(),
            condition_id: Some("0xabc".to_string()),
            market_slug: None,
            question: "Will it happen?".to_string(),
            description: None,
            outcomes: vec![],
            tokens: vec![],
            outcome_prices: None,
            last_trade_price: None,
            price: None,
            closed: false,
        };
        assert_eq!(m.normalized_id(), "0xabc");

        m.condition_id = None;
        assert_eq!(m.normalized_id(), "123");

        m.condition_id = Some(String::new());
        assert_eq!(m.normalized_id(), "123");
    }
}
