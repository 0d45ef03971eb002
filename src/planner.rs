//! Keyword and event-selection planner.
//!
//! Deterministic heuristics run first; the model is only consulted when the
//! heuristic output is too thin, and every model reply falls back to the
//! heuristic on parse failure.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::{parse_json_reply, ChatClient, ChatRequest};
use crate::models::{Event, Market};

const MAX_KEYWORDS: usize = 4;
const MAX_SELECTED_EVENTS: usize = 8;

/// Question tokens that carry no search signal.
const STOPWORDS: &[&str] = &[
    "will", "the", "and", "or", "a", "an", "of", "in", "on", "at", "to", "for", "by", "with",
    "from", "win", "lose", "yes", "no", "market", "election",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketCategory {
    Politics,
    Crypto,
    Sports,
    Science,
    Entertainment,
    Other,
}

impl MarketCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "politics" => Some(Self::Politics),
            "crypto" => Some(Self::Crypto),
            "sports" => Some(Self::Sports),
            "science" => Some(Self::Science),
            "entertainment" => Some(Self::Entertainment),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Politics => "Politics",
            Self::Crypto => "Crypto",
            Self::Sports => "Sports",
            Self::Science => "Science",
            Self::Entertainment => "Entertainment",
            Self::Other => "Other",
        }
    }
}

pub struct Planner {
    llm: Arc<dyn ChatClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn ChatClient>) -> Self {
        Self { llm }
    }

    /// Up to four short search keywords for a market.
    ///
    /// The heuristic wins when it produces at least two tokens; otherwise the
    /// model is asked, and on any model failure the heuristic output (or
    /// `["market"]`) is used.
    pub async fn generate_search_keywords(&self, market: &Market) -> Vec<String> {
        let heuristic = heuristic_keywords(&market.question);
        if heuristic.len() >= 2 {
            return heuristic;
        }

        let system = "You generate search keywords for a prediction-market catalog. \
                      Reply with JSON: {\"keywords\": [\"...\"]} containing 2-4 short \
                      keywords of 1-2 words each. Prefer proper nouns, tickers, and \
                      identifiers over generic words.";
        let user = format!(
            "Market question: {}\nDescription: {}",
            market.question,
            prefix(market.description.as_deref().unwrap_or(""), 300)
        );

        match self
            .llm
            .chat(ChatRequest {
                system: system.to_string(),
                user,
                temperature: 0.3,
                max_tokens: 200,
            })
            .await
            .and_then(|reply| parse_json_reply(&reply))
        {
            Ok(v) => {
                let keywords: Vec<String> = v["keywords"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|k| k.as_str())
                            .map(|k| k.trim().to_string())
                            .filter(|k| !k.is_empty())
                            .take(MAX_KEYWORDS)
                            .collect()
                    })
                    .unwrap_or_default();
                if keywords.is_empty() {
                    fallback_keywords(heuristic)
                } else {
                    keywords
                }
            }
            Err(e) => {
                warn!(error = %e, "keyword generation failed, using heuristic");
                fallback_keywords(heuristic)
            }
        }
    }

    /// Picks at most eight event slugs relevant to the source market,
    /// skipping anything already visited.
    pub async fn select_relevant_events(
        &self,
        market: &Market,
        events: &[Event],
        visited_slugs: &HashSet<String>,
    ) -> Vec<String> {
        let unvisited: Vec<&Event> = events
            .iter()
            .filter(|e| !visited_slugs.contains(&e.slug))
            .collect();
        if unvisited.is_empty() {
            return Vec::new();
        }

        let listing: String = unvisited
            .iter()
            .map(|e| {
                format!(
                    "- {} | {} | {}",
                    e.slug,
                    e.title,
                    prefix(e.description.as_deref().unwrap_or(""), 150)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let system = "You pick prediction-market events related to a source market. \
                      Relevant means same topic, causally linked, or covering the \
                      same time window. Reply with JSON: {\"slugs\": [\"...\"]} \
                      listing at most 8 slugs from the provided list, most relevant \
                      first.";
        let user = format!(
            "Source market: {}\n\nCandidate events:\n{}",
            market.question, listing
        );

        let known: HashSet<&str> = unvisited.iter().map(|e| e.slug.as_str()).collect();

        match self
            .llm
            .chat(ChatRequest {
                system: system.to_string(),
                user,
                temperature: 0.2,
                max_tokens: 400,
            })
            .await
            .and_then(|reply| parse_json_reply(&reply))
        {
            Ok(v) => {
                let mut seen = HashSet::new();
                let slugs: Vec<String> = v["slugs"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|s| s.as_str())
                            .map(|s| s.trim().to_string())
                            .filter(|s| known.contains(s.as_str()) && seen.insert(s.clone()))
                            .take(MAX_SELECTED_EVENTS)
                            .collect()
                    })
                    .unwrap_or_default();
                if slugs.is_empty() {
                    first_unvisited(&unvisited)
                } else {
                    slugs
                }
            }
            Err(e) => {
                warn!(error = %e, "event selection failed, taking first unvisited");
                first_unvisited(&unvisited)
            }
        }
    }

    /// Single-label category for fallback search. `Other` on any failure.
    pub async fn market_category(&self, market: &Market) -> MarketCategory {
        let system = "Classify a prediction market into exactly one category: \
                      Politics, Crypto, Sports, Science, Entertainment, or Other. \
                      Reply with JSON: {\"category\": \"...\"}.";
        let user = format!("Market question: {}", market.question);

        match self
            .llm
            .chat(ChatRequest {
                system: system.to_string(),
                user,
                temperature: 0.2,
                max_tokens: 50,
            })
            .await
            .and_then(|reply| parse_json_reply(&reply))
        {
            Ok(v) => {
                let label = v["category"].as_str().unwrap_or_default();
                let category = MarketCategory::parse(label).unwrap_or(MarketCategory::Other);
                debug!(category = category.as_str(), "classified market");
                category
            }
            Err(e) => {
                warn!(error = %e, "category classification failed");
                MarketCategory::Other
            }
        }
    }
}

/// Stopword-filtered question tokens, deduped case-insensitively, first four.
/// Tokens shorter than three characters are dropped unless they contain a
/// digit (keeps years and tickers).
pub fn heuristic_keywords(question: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for token in question.split(|c: char| !c.is_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        let lower = token.to_ascii_lowercase();
        if STOPWORDS.contains(&lower.as_str()) {
            continue;
        }
        if token.len() < 3 && !token.chars().any(|c| c.is_ascii_digit()) {
            continue;
        }
        if !seen.insert(lower) {
            continue;
        }

        keywords.push(token.to_string());
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }

    keywords
}

fn fallback_keywords(heuristic: Vec<String>) -> Vec<String> {
    if heuristic.is_empty() {
        vec!["market".to_string()]
    } else {
        heuristic
    }
}

fn first_unvisited(unvisited: &[&Event]) -> Vec<String> {
    unvisited
        .iter()
        .take(MAX_SELECTED_EVENTS)
        .map(|e| e.slug.clone())
        .collect()
}

fn prefix(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}
