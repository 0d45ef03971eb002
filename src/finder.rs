//! Related-bet finder.
//!
//! Streams typed related-market candidates for a source market within a hard
//! wall-clock deadline. Stages: event harvesting (keyword search, category
//! supplement, active-events fallback), event selection, bounded-fan-out
//! market harvesting, candidate assembly, and batched model classification.
//! Progress and warnings flow through the same channel as the bets so the
//! HTTP handler can interleave them on the SSE stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::catalog::{market_percentages, CatalogClient};
use crate::llm::{parse_json_reply, ChatClient, ChatRequest};
use crate::models::{Event, Market, RelatedBet, RelationType};
use crate::planner::Planner;

/// Fan-out cap for per-event market fetches.
const EVENT_FETCH_CONCURRENCY: usize = 4;
/// Fan-out cap for classification batches.
const CLASSIFY_CONCURRENCY: usize = 2;
/// Candidates per classification batch.
const CLASSIFY_BATCH_SIZE: usize = 10;
/// Hard cap on assembled candidates.
const CANDIDATE_LIMIT: usize = 50;
/// Below this many event-derived markets the general catalog supplements.
const EVENT_MARKET_FLOOR: usize = 50;
const GENERAL_MARKET_FETCH: usize = 200;
const ACTIVE_EVENT_FALLBACK: usize = 30;

#[derive(Debug, Clone)]
pub struct FinderOptions {
    pub max_results: usize,
    pub min_results: usize,
    pub timeout_ms: u64,
}

impl Default for FinderOptions {
    fn default() -> Self {
        Self {
            max_results: 4,
            min_results: 3,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Warn,
    Error,
}

/// A progress line destined for the SSE stream.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl LogLine {
    pub fn log(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Log,
            message: message.into(),
            meta: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Warn,
            message: message.into(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[derive(Debug)]
pub enum FinderEvent {
    Log(LogLine),
    Bet(Box<RelatedBet>),
}

/// A market candidate tagged with the event slug it came from.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub market: Market,
    pub event_slug: Option<String>,
}

pub struct Finder {
    catalog: Arc<CatalogClient>,
    planner: Arc<Planner>,
    llm: Arc<dyn ChatClient>,
}

impl Finder {
    pub fn new(catalog: Arc<CatalogClient>, planner: Arc<Planner>, llm: Arc<dyn ChatClient>) -> Self {
        Self {
            catalog,
            planner,
            llm,
        }
    }

    /// Spawns the discovery pipeline; the returned receiver yields progress
    /// logs and at most `max_results` deduplicated bets. Dropping the
    /// receiver cancels the pipeline at its next send.
    pub fn stream(
        self: Arc<Self>,
        source: Market,
        visited_slugs: HashSet<String>,
        options: FinderOptions,
    ) -> mpsc::Receiver<FinderEvent> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            self.run(source, visited_slugs, options, tx).await;
        });
        rx
    }

    async fn run(
        &self,
        source: Market,
        visited_slugs: HashSet<String>,
        options: FinderOptions,
        tx: mpsc::Sender<FinderEvent>,
    ) {
        let deadline = Instant::now() + Duration::from_millis(options.timeout_ms.max(1));
        let max_results = options.max_results.max(1);
        let min_results = options.min_results.min(max_results);

        macro_rules! emit {
            ($ev:expr) => {
                if tx.send($ev).await.is_err() {
                    debug!("finder receiver dropped, stopping");
                    return;
                }
            };
        }

        // Stage 1: event harvesting.
        let keywords = self.planner.generate_search_keywords(&source).await;
        emit!(FinderEvent::Log(
            LogLine::log(format!("Searching events for keywords: {}", keywords.join(", ")))
        ));

        let mut events = self.catalog.search_events_by_keywords(&keywords).await;
        if events.len() < 5 {
            let category = self.planner.market_category(&source).await;
            emit!(FinderEvent::Log(LogLine::log(format!(
                "Few keyword hits, supplementing with {} events",
                category.as_str()
            ))));
            events.extend(self.catalog.search_events_by_category(category.as_str()).await);
        }
        if events.is_empty() {
            emit!(FinderEvent::Log(LogLine::log(
                "No search results, falling back to most active events",
            )));
            events = self.catalog.fetch_active_events(ACTIVE_EVENT_FALLBACK).await;
        }
        let events = dedupe_events(events);
        emit!(FinderEvent::Log(
            LogLine::log(format!("Harvested {} candidate events", events.len()))
        ));

        // Stage 2: event selection.
        let selected = self
            .planner
            .select_relevant_events(&source, &events, &visited_slugs)
            .await;
        emit!(FinderEvent::Log(
            LogLine::log(format!("Selected {} relevant events", selected.len()))
        ));

        // Stage 3: market harvesting, bounded fan-out.
        let catalog = self.catalog.clone();
        let event_markets: Vec<Candidate> = stream::iter(selected)
            .map(|slug| {
                let catalog = catalog.clone();
                async move {
                    let events = catalog.fetch_events_by_slug(&slug).await;
                    events
                        .into_iter()
                        .flat_map(|e| e.markets)
                        .map(|market| Candidate {
                            market,
                            event_slug: Some(slug.clone()),
                        })
                        .collect::<Vec<_>>()
                }
            })
            .buffer_unordered(EVENT_FETCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        // Stage 4: supplement from the general catalog when events are thin.
        let general: Vec<Candidate> = if event_markets.len() < EVENT_MARKET_FLOOR {
            match self.catalog.fetch_markets(GENERAL_MARKET_FETCH).await {
                Ok(markets) => markets
                    .into_iter()
                    .map(|market| Candidate {
                        market,
                        event_slug: None,
                    })
                    .collect(),
                Err(e) => {
                    emit!(FinderEvent::Log(
                        LogLine::warn(format!("General market fetch failed: {e}"))
                    ));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        // Stage 5: candidate assembly.
        let candidates = assemble_candidates(source.normalized_id(), event_markets, general);
        emit!(FinderEvent::Log(
            LogLine::log(format!("Assembled {} candidates for classification", candidates.len()))
        ));

        // Stage 6/7: batched classification with dedup-first-wins yielding.
        let source_pct = market_percentages(&source);
        let batches: Vec<&[Candidate]> = candidates.chunks(CLASSIFY_BATCH_SIZE).collect();

        let mut yielded: HashSet<String> = HashSet::new();
        let mut found = 0usize;
        let mut timed_out = false;

        'groups: for group in batches.chunks(CLASSIFY_CONCURRENCY) {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }

            let results = join_all(group.iter().map(|batch| {
                classify_batch(self.llm.as_ref(), &source, source_pct.yes, source_pct.no, batch)
            }))
            .await;

            for result in results {
                match result {
                    Ok(bets) => {
                        for bet in bets {
                            if !yielded.insert(bet.market_id.clone()) {
                                continue;
                            }
                            emit!(FinderEvent::Log(
                                LogLine::log(format!(
                                    "Found related bet: {} ({})",
                                    bet.market.question,
                                    bet.relationship.as_str()
                                ))
                            ));
                            emit!(FinderEvent::Bet(Box::new(bet)));
                            found += 1;
                            if found >= max_results {
                                break 'groups;
                            }
                        }
                    }
                    Err(e) => {
                        emit!(FinderEvent::Log(
                            LogLine::warn(format!("Classification batch failed: {e}"))
                        ));
                    }
                }
            }
        }

        if timed_out {
            emit!(FinderEvent::Log(LogLine::warn(
                "No related markets within the time limit",
            )));
        } else if found < min_results {
            emit!(FinderEvent::Log(LogLine::log(format!(
                "Exhausted candidates with {found} related bets (target {min_results})"
            ))));
        }
    }
}

/// Event markets first, then general markets; the source market and
/// duplicate ids are dropped, and the list is capped.
pub fn assemble_candidates(
    source_id: &str,
    event_markets: Vec<Candidate>,
    general_markets: Vec<Candidate>,
) -> Vec<Candidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for candidate in event_markets.into_iter().chain(general_markets) {
        let id = candidate.market.normalized_id().to_string();
        if id.is_empty() || id == source_id {
            continue;
        }
        if !seen.insert(id) {
            continue;
        }
        out.push(candidate);
        if out.len() == CANDIDATE_LIMIT {
            break;
        }
    }

    out
}

fn dedupe_events(events: Vec<Event>) -> Vec<Event> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|e| seen.insert(e.slug.clone()))
        .collect()
}

async fn classify_batch(
    llm: &dyn ChatClient,
    source: &Market,
    source_yes: f64,
    source_no: f64,
    batch: &[Candidate],
) -> anyhow::Result<Vec<RelatedBet>> {
    let system = "You classify prediction markets by their logical relation to a \
                  source market. Relations: IMPLIES (candidate implies the source), \
                  SUBEVENT (source is contained in the candidate), CONDITIONED_ON \
                  (source is only meaningful if the candidate resolves yes), \
                  CONTRADICTS (mutually exclusive), PARTITION_OF (candidate is one \
                  slice of a partition of the source), WEAK_SIGNAL (correlated \
                  only). Reply with JSON: {\"related\": [{\"marketId\": \"...\", \
                  \"relationship\": \"...\", \"reasoning\": \"...\"}]} listing only \
                  candidates with a genuine relation.";

    let listing: String = batch
        .iter()
        .map(|c| {
            let pct = market_percentages(&c.market);
            format!(
                "- id={} | {} | yes {:.0}% / no {:.0}% | {}",
                c.market.normalized_id(),
                c.market.question,
                pct.yes,
                pct.no,
                prefix(c.market.description.as_deref().unwrap_or(""), 200)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!(
        "Source market: {}\nSource prices: yes {:.0}% / no {:.0}%\nDescription: {}\n\nCandidates:\n{}",
        source.question,
        source_yes,
        source_no,
        prefix(source.description.as_deref().unwrap_or(""), 300),
        listing
    );

    let reply = llm
        .chat(ChatRequest {
            system: system.to_string(),
            user,
            temperature: 0.2,
            max_tokens: 800,
        })
        .await?;

    Ok(parse_classification_reply(&reply, batch))
}

/// Maps a model classification reply onto the batch. Unknown relation tags
/// degrade to WEAK_SIGNAL; ids not present in the batch are dropped.
pub fn parse_classification_reply(reply: &str, batch: &[Candidate]) -> Vec<RelatedBet> {
    let Ok(v) = parse_json_reply(reply) else {
        warn!("classification reply was not JSON, dropping batch");
        return Vec::new();
    };

    let Some(entries) = v["related"].as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let market_id = entry["marketId"].as_str()?;
            let candidate = batch
                .iter()
                .find(|c| c.market.normalized_id() == market_id)?;

            let relationship = entry["relationship"]
                .as_str()
                .and_then(RelationType::parse)
                .unwrap_or(RelationType::WeakSignal);
            let reasoning = entry["reasoning"].as_str().unwrap_or_default().to_string();

            let pct = market_percentages(&candidate.market);
            Some(RelatedBet {
                market_id: market_id.to_string(),
                market: candidate.market.clone(),
                event_slug: candidate.event_slug.clone(),
                relationship,
                reasoning,
                yes_percentage: pct.yes,
                no_percentage: pct.no,
            })
        })
        .collect()
}

fn prefix(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(id: &str, question: &str) -> Market {
        Market {
            id: id.to_string(),
            condition_id: None,
            market_slug: None,
            question: question.to_string(),
            description: None,
            outcomes: vec![],
            tokens: vec![],
            outcome_prices: Some(vec![0.5, 0.5]),
            last_trade_price: None,
            price: None,
            closed: false,
        }
    }

    fn candidate(id: &str, slug: Option<&str>) -> Candidate {
        Candidate {
            market: market(id, &format!("Question {id}")),
            event_slug: slug.map(|s| s.to_string()),
        }
    }

    #[test]
    fn assembly_drops_source_and_duplicates() {
        let event_markets = vec![
            candidate("src", Some("e1")),
            candidate("a", Some("e1")),
            candidate("b", Some("e2")),
            candidate("a", Some("e2")),
        ];
        let general = vec![candidate("b", None), candidate("c", None)];

        let out = assemble_candidates("src", event_markets, general);
        let ids: Vec<&str> = out.iter().map(|c| c.market.normalized_id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        // Event-derived instance of "b" wins over the general one.
        assert_eq!(out[1].event_slug.as_deref(), Some("e2"));
    }

    #[test]
    fn assembly_caps_candidates() {
        let many: Vec<Candidate> = (0..80).map(|i| candidate(&format!("m{i}"), None)).collect();
        let out = assemble_candidates("src", many, vec![]);
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn events_dedupe_by_slug_preserving_order() {
        let events = vec![
            Event {
                slug: "a".to_string(),
                title: "first".to_string(),
                description: None,
                markets: vec![],
            },
            Event {
                slug: "b".to_string(),
                title: "second".to_string(),
                description: None,
                markets: vec![],
            },
            Event {
                slug: "a".to_string(),
                title: "shadowed".to_string(),
                description: None,
                markets: vec![],
            },
        ];

        let out = dedupe_events(events);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].title, "first");
    }

    #[test]
    fn classification_reply_maps_onto_batch() {
        let batch = vec![candidate("a", Some("e1")), candidate("b", None)];
        let reply = r#"{"related": [
            {"marketId": "a", "relationship": "IMPLIES", "reasoning": "direct implication"},
            {"marketId": "b", "relationship": "SOMETHING_NEW", "reasoning": ""},
            {"marketId": "ghost", "relationship": "CONTRADICTS", "reasoning": "n/a"}
        ]}"#;

        let bets = parse_classification_reply(reply, &batch);
        assert_eq!(bets.len(), 2);

        assert_eq!(bets[0].market_id, "a");
        assert_eq!(bets[0].relationship, RelationType::Implies);
        assert_eq!(bets[0].reasoning, "direct implication");
        assert_eq!(bets[0].event_slug.as_deref(), Some("e1"));
        assert_eq!(bets[0].yes_percentage, 50.0);

        // Unknown relation tag degrades instead of failing.
        assert_eq!(bets[1].relationship, RelationType::WeakSignal);
    }

    #[test]
    fn malformed_classification_reply_yields_nothing() {
        let batch = vec![candidate("a", None)];
        assert!(parse_classification_reply("total nonsense", &batch).is_empty());
        assert!(parse_classification_reply("{\"unrelated\": []}", &batch).is_empty());
    }
}
