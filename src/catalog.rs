//! Polymarket catalog client.
//!
//! Resolves user-supplied URLs or raw ids into normalized markets, retrieves
//! events, and extracts yes/no percentages across the several upstream price
//! shapes. Raw provider DTOs stay inside this module.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::models::{Event, Market, OutcomeToken};

const CLOB_API_BASE: &str = "https://clob.polymarket.com";
const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Share of significant slug tokens that must appear in a candidate question
/// for a fuzzy URL match.
const FUZZY_MATCH_THRESHOLD: f64 = 0.6;

pub struct CatalogClient {
    http: Client,
    clob_base: String,
    gamma_base: String,
}

impl CatalogClient {
    pub fn new(http: Client) -> Self {
        Self::with_bases(http, CLOB_API_BASE, GAMMA_API_BASE)
    }

    pub fn with_bases(
        http: Client,
        clob_base: impl Into<String>,
        gamma_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            clob_base: clob_base.into(),
            gamma_base: gamma_base.into(),
        }
    }

    /// Reads `POLYMARKET_CLOB_BASE` / `POLYMARKET_GAMMA_BASE` overrides.
    pub fn from_env(http: Client) -> Self {
        let clob_base = std::env::var("POLYMARKET_CLOB_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| CLOB_API_BASE.to_string());
        let gamma_base = std::env::var("POLYMARKET_GAMMA_BASE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| GAMMA_API_BASE.to_string());

        Self {
            http,
            clob_base,
            gamma_base,
        }
    }

    /// Resolves a market URL to a canonical market id.
    ///
    /// Tries events-by-slug first (the first market's condition id), then
    /// falls back to scanning the markets catalog for an exact slug match or
    /// a fuzzy question match.
    pub async fn find_market_id_from_url(&self, url: &str) -> Result<Option<String>> {
        let Some(slug) = extract_slug(url) else {
            return Ok(None);
        };

        let events = self.fetch_events_by_slug(&slug).await;
        if let Some(market) = events.first().and_then(|e| e.markets.first()) {
            return Ok(Some(market.normalized_id().to_string()));
        }

        debug!(slug = %slug, "no event for slug, scanning markets catalog");
        let markets = self.fetch_markets(1000).await?;

        if let Some(m) = markets
            .iter()
            .find(|m| m.market_slug.as_deref() == Some(slug.as_str()))
        {
            return Ok(Some(m.normalized_id().to_string()));
        }

        Ok(markets
            .iter()
            .find(|m| slug_matches_question(&slug, &m.question))
            .map(|m| m.normalized_id().to_string()))
    }

    /// Fetches a single market by id, trying the modern endpoint first and
    /// the legacy one on a non-OK response.
    pub async fn fetch_market(&self, id: &str) -> Result<Market> {
        let modern = format!("{}/markets/{}", self.clob_base, id);
        match self.get_json::<ClobMarketDto>(&modern, &[]).await {
            Ok(dto) => return Ok(dto.into_market()),
            Err(e) => debug!(id = %id, error = %e, "modern market fetch failed, trying legacy"),
        }

        let legacy = format!("{}/markets/{}", self.gamma_base, id);
        match self.get_json::<GammaMarketDto>(&legacy, &[]).await {
            Ok(dto) => Ok(dto.into_market()),
            Err(e) => {
                warn!(id = %id, error = %e, "legacy market fetch failed");
                Err(anyhow!("upstream_market_fetch"))
            }
        }
    }

    /// Fetches up to `limit` non-closed markets from the catalog. `limit` is
    /// clamped to 1..=1000.
    pub async fn fetch_markets(&self, limit: usize) -> Result<Vec<Market>> {
        let limit = limit.clamp(1, 1000);
        let url = format!("{}/markets", self.gamma_base);
        let dtos: Vec<GammaMarketDto> = self
            .get_json(
                &url,
                &[("closed", "false".to_string()), ("limit", limit.to_string())],
            )
            .await
            .context("markets catalog fetch")?;

        Ok(dtos
            .into_iter()
            .filter(|m| !m.closed)
            .map(GammaMarketDto::into_market)
            .collect())
    }

    /// Events matching the given slug. Empty on error.
    pub async fn fetch_events_by_slug(&self, slug: &str) -> Vec<Event> {
        let url = format!("{}/events", self.gamma_base);
        match self
            .get_json::<Vec<GammaEventDto>>(&url, &[("slug", slug.to_string())])
            .await
        {
            Ok(dtos) => dtos.into_iter().map(GammaEventDto::into_event).collect(),
            Err(e) => {
                warn!(slug = %slug, error = %e, "events-by-slug fetch failed");
                Vec::new()
            }
        }
    }

    /// Full-text event search over the provider. Empty on error.
    pub async fn search_events_by_keywords(&self, keywords: &[String]) -> Vec<Event> {
        let q = keywords.join(" ");
        if q.trim().is_empty() {
            return Vec::new();
        }

        let url = format!("{}/public-search", self.gamma_base);
        match self
            .get_json::<SearchResponseDto>(&url, &[("q", q.clone()), ("limit_per_type", "20".to_string())])
            .await
        {
            Ok(resp) => resp
                .events
                .into_iter()
                .map(GammaEventDto::into_event)
                .collect(),
            Err(e) => {
                warn!(query = %q, error = %e, "keyword event search failed");
                Vec::new()
            }
        }
    }

    /// Category (tag) based event search. Empty on error.
    pub async fn search_events_by_category(&self, category: &str) -> Vec<Event> {
        let tag = category.trim().to_ascii_lowercase();
        if tag.is_empty() {
            return Vec::new();
        }

        let url = format!("{}/events", self.gamma_base);
        match self
            .get_json::<Vec<GammaEventDto>>(
                &url,
                &[
                    ("tag_slug", tag.clone()),
                    ("closed", "false".to_string()),
                    ("limit", "20".to_string()),
                ],
            )
            .await
        {
            Ok(dtos) => dtos.into_iter().map(GammaEventDto::into_event).collect(),
            Err(e) => {
                warn!(category = %tag, error = %e, "category event search failed");
                Vec::new()
            }
        }
    }

    /// Most active open events, used as a last-resort candidate source.
    pub async fn fetch_active_events(&self, limit: usize) -> Vec<Event> {
        let url = format!("{}/events", self.gamma_base);
        match self
            .get_json::<Vec<GammaEventDto>>(
                &url,
                &[
                    ("active", "true".to_string()),
                    ("closed", "false".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await
        {
            Ok(dtos) => dtos.into_iter().map(GammaEventDto::into_event).collect(),
            Err(e) => {
                warn!(error = %e, "active events fetch failed");
                Vec::new()
            }
        }
    }

    /// GET with exponential backoff retry; 429 backs off harder.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let request = self
                .http
                .get(url)
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .header(reqwest::header::USER_AGENT, "Polygraph/0.1")
                .query(params);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.text().await.context("response body read")?;
                        return serde_json::from_str(&body).map_err(|e| {
                            warn!(
                                url = %url,
                                error = %e,
                                body_preview = %body.chars().take(300).collect::<String>(),
                                "upstream JSON parse failed"
                            );
                            anyhow!("upstream json parse: {e}")
                        });
                    } else if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(url = %url, attempt = attempt + 1, "upstream rate limited, backing off");
                        sleep(Duration::from_millis(backoff * 10)).await;
                    } else {
                        bail!("upstream status {} for {}", status.as_u16(), url);
                    }
                }
                Err(e) => {
                    warn!(url = %url, attempt = attempt + 1, error = %e, "request failed");
                }
            }

            if attempt < MAX_RETRIES - 1 {
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(30_000);
            }
        }

        bail!("max retries exceeded for {}", url)
    }
}

/// Extracts the event slug from a Polymarket URL. Never errors.
pub fn extract_slug(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?;
    if !host.contains("polymarket.com") {
        return None;
    }

    let mut segments = parsed.path_segments()?;
    while let Some(seg) = segments.next() {
        if seg == "event" {
            let slug = segments.next()?.trim();
            if slug.is_empty() {
                return None;
            }
            return Some(slug.to_string());
        }
    }

    None
}

fn slug_matches_question(slug: &str, question: &str) -> bool {
    let question_lower = question.to_ascii_lowercase();
    let tokens: Vec<&str> = slug.split('-').filter(|t| t.len() > 2).collect();
    if tokens.is_empty() {
        return false;
    }

    let matched = tokens
        .iter()
        .filter(|t| question_lower.contains(&t.to_ascii_lowercase()))
        .count();

    matched as f64 / tokens.len() as f64 >= FUZZY_MATCH_THRESHOLD
}

/// Yes/no percentages in [0, 100] for a market.
#[derive(Debug, Clone, Copy)]
pub struct MarketPercentages {
    pub yes: f64,
    pub no: f64,
    /// True when no price source was found and 50/50 was assumed.
    pub defaulted: bool,
}

/// Resolves percentages across the upstream price shapes in priority order:
/// explicit yes/no tokens, outcome prices, last trade price, scalar price.
pub fn market_percentages(market: &Market) -> MarketPercentages {
    if let Some(p) = percentages_from_tokens(&market.tokens) {
        return p;
    }

    if let Some(prices) = market.outcome_prices.as_ref().filter(|p| !p.is_empty()) {
        let scaled = scale_prices(prices);
        let yes = round2(scaled[0]);
        let no = scaled
            .get(1)
            .map(|v| round2(*v))
            .unwrap_or_else(|| round2(100.0 - yes));
        return MarketPercentages {
            yes,
            no,
            defaulted: false,
        };
    }

    if let Some(p) = market.last_trade_price.or(market.price) {
        let yes = round2(scale_price(p));
        return MarketPercentages {
            yes,
            no: round2(100.0 - yes),
            defaulted: false,
        };
    }

    warn!(id = %market.normalized_id(), "no price source on market, assuming 50/50");
    MarketPercentages {
        yes: 50.0,
        no: 50.0,
        defaulted: true,
    }
}

fn percentages_from_tokens(tokens: &[OutcomeToken]) -> Option<MarketPercentages> {
    let yes_token = tokens.iter().find(|t| t.outcome.eq_ignore_ascii_case("yes"));
    let no_token = tokens.iter().find(|t| t.outcome.eq_ignore_ascii_case("no"));

    let yes = match (yes_token, no_token) {
        (Some(y), _) => scale_price(y.price),
        (None, Some(n)) => 100.0 - scale_price(n.price),
        (None, None) => return None,
    };

    let yes = round2(yes);
    Some(MarketPercentages {
        yes,
        no: round2(100.0 - yes),
        defaulted: false,
    })
}

// Upstream sometimes reports 0-1 probabilities and sometimes 0-100
// percentages; any value above 1 marks the whole array as percentages.
fn scale_prices(prices: &[f64]) -> Vec<f64> {
    let already_percent = prices.iter().any(|p| *p > 1.0);
    prices
        .iter()
        .map(|p| if already_percent { *p } else { *p * 100.0 })
        .map(|p| p.clamp(0.0, 100.0))
        .collect()
}

fn scale_price(p: f64) -> f64 {
    let v = if p > 1.0 { p } else { p * 100.0 };
    v.clamp(0.0, 100.0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Upstream DTOs

fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => {
            // Some responses return JSON arrays as a string (e.g. "[\"Yes\",\"No\"]").
            serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom)
        }
        Value::Null => Ok(Vec::new()),
        _ => Ok(Vec::new()),
    }
}

fn de_string_f64_vec_opt<'de, D>(deserializer: D) -> Result<Option<Vec<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    let parse_array = |arr: Vec<Value>| -> Vec<f64> {
        arr.into_iter()
            .filter_map(|x| match x {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            })
            .collect()
    };

    match v {
        Value::Null => Ok(None),
        Value::Array(arr) => Ok(Some(parse_array(arr))),
        Value::String(s) => {
            if s.trim().is_empty() {
                return Ok(None);
            }
            let inner: Vec<Value> =
                serde_json::from_str(&s).map_err(serde::de::Error::custom)?;
            Ok(Some(parse_array(inner)))
        }
        _ => Ok(None),
    }
}

fn de_string_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GammaMarketDto {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "conditionId", default)]
    condition_id: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, deserialize_with = "de_string_vec")]
    outcomes: Vec<String>,
    #[serde(rename = "outcomePrices", default, deserialize_with = "de_string_f64_vec_opt")]
    outcome_prices: Option<Vec<f64>>,
    #[serde(rename = "lastTradePrice", default, deserialize_with = "de_string_f64_opt")]
    last_trade_price: Option<f64>,
    #[serde(default, deserialize_with = "de_string_f64_opt")]
    price: Option<f64>,
    #[serde(default)]
    closed: bool,
}

impl GammaMarketDto {
    fn into_market(self) -> Market {
        let id = self
            .id
            .or_else(|| self.condition_id.clone())
            .unwrap_or_default();
        Market {
            id,
            condition_id: self.condition_id,
            market_slug: self.slug,
            question: self.question.unwrap_or_default(),
            description: self.description,
            outcomes: self.outcomes,
            tokens: Vec::new(),
            outcome_prices: self.outcome_prices,
            last_trade_price: self.last_trade_price,
            price: self.price,
            closed: self.closed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ClobTokenDto {
    #[serde(default)]
    outcome: String,
    #[serde(default, deserialize_with = "de_string_f64_opt")]
    price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClobMarketDto {
    #[serde(rename = "conditionId", alias = "condition_id")]
    condition_id: String,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "marketSlug", alias = "market_slug", default)]
    market_slug: Option<String>,
    #[serde(default)]
    tokens: Vec<ClobTokenDto>,
    #[serde(default)]
    closed: bool,
}

impl ClobMarketDto {
    fn into_market(self) -> Market {
        let tokens: Vec<OutcomeToken> = self
            .tokens
            .into_iter()
            .filter_map(|t| {
                t.price.map(|price| OutcomeToken {
                    outcome: t.outcome,
                    price,
                })
            })
            .collect();

        Market {
            id: self.condition_id.clone(),
            condition_id: Some(self.condition_id),
            market_slug: self.market_slug,
            question: self.question.unwrap_or_default(),
            description: self.description,
            outcomes: tokens.iter().map(|t| t.outcome.clone()).collect(),
            tokens,
            outcome_prices: None,
            last_trade_price: None,
            price: None,
            closed: self.closed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GammaEventDto {
    slug: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    markets: Vec<GammaMarketDto>,
}

impl GammaEventDto {
    fn into_event(self) -> Event {
        Event {
            title: self.title.unwrap_or_else(|| self.slug.clone()),
            slug: self.slug,
            description: self.description,
            markets: self
                .markets
                .into_iter()
                .filter(|m| !m.closed)
                .map(GammaMarketDto::into_market)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResponseDto {
    #[serde(default)]
    events: Vec<GammaEventDto>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_market() -> Market {
        Market {
            id: "m1".to_string(),
            condition_id: None,
            market_slug: None,
            question: "Will the Fed cut rates in September?".to_string(),
            description: None,
            outcomes: vec![],
            tokens: vec![],
            outcome_prices: None,
            last_trade_price: None,
            price: None,
            closed: false,
        }
    }

    #[test]
    fn extract_slug_happy_path() {
        assert_eq!(
            extract_slug("https://polymarket.com/event/fed-rate-cut-september"),
            Some("fed-rate-cut-september".to_string())
        );
        assert_eq!(
            extract_slug("https://www.polymarket.com/event/foo?tid=123"),
            Some("foo".to_string())
        );
    }

    #[test]
    fn extract_slug_rejects_other_hosts_and_paths() {
        assert_eq!(extract_slug("https://example.com/event/foo"), None);
        assert_eq!(extract_slug("https://polymarket.com/markets/foo"), None);
        assert_eq!(extract_slug("not a url"), None);
        assert_eq!(extract_slug("https://polymarket.com/event/"), None);
    }

    #[test]
    fn percentages_prefer_tokens() {
        let mut m = bare_market();
        m.tokens = vec![
            OutcomeToken {
                outcome: "Yes".to_string(),
                price: 0.62,
            },
            OutcomeToken {
                outcome: "No".to_string(),
                price: 0.38,
            },
        ];
        m.outcome_prices = Some(vec![0.99, 0.01]);

        let p = market_percentages(&m);
        assert_eq!(p.yes, 62.0);
        assert_eq!(p.no, 38.0);
        assert!(!p.defaulted);
    }

    #[test]
    fn percentages_from_no_token_only() {
        let mut m = bare_market();
        m.tokens = vec![OutcomeToken {
            outcome: "No".to_string(),
            price: 0.25,
        }];

        let p = market_percentages(&m);
        assert_eq!(p.yes, 75.0);
        assert_eq!(p.no, 25.0);
    }

    #[test]
    fn percentages_from_outcome_prices_auto_scale() {
        let mut m = bare_market();
        m.outcome_prices = Some(vec![0.4, 0.6]);
        let p = market_percentages(&m);
        assert_eq!(p.yes, 40.0);
        assert_eq!(p.no, 60.0);

        m.outcome_prices = Some(vec![40.0, 60.0]);
        let p = market_percentages(&m);
        assert_eq!(p.yes, 40.0);
        assert_eq!(p.no, 60.0);
    }

    #[test]
    fn percentages_fall_back_to_last_trade_then_price() {
        let mut m = bare_market();
        m.last_trade_price = Some(0.735);
        let p = market_percentages(&m);
        assert_eq!(p.yes, 73.5);
        assert_eq!(p.no, 26.5);

        m.last_trade_price = None;
        m.price = Some(0.1);
        let p = market_percentages(&m);
        assert_eq!(p.yes, 10.0);
        assert_eq!(p.no, 90.0);
    }

    #[test]
    fn percentages_default_when_no_source() {
        let p = market_percentages(&bare_market());
        assert_eq!(p.yes, 50.0);
        assert_eq!(p.no, 50.0);
        assert!(p.defaulted);
    }

    #[test]
    fn percentage_bijection_holds() {
        let mut m = bare_market();
        m.last_trade_price = Some(0.333);
        let p = market_percentages(&m);
        assert!((p.yes + p.no - 100.0).abs() < 0.01);
    }

    #[test]
    fn fuzzy_slug_match() {
        assert!(slug_matches_question(
            "fed-rate-cut-september",
            "Will the Fed announce a rate cut in September?"
        ));
        assert!(!slug_matches_question(
            "bitcoin-100k-by-march",
            "Will the Fed announce a rate cut in September?"
        ));
    }

    #[test]
    fn gamma_dto_tolerates_string_encoded_arrays() {
        let raw = r#"{
            "id": "518123",
            "conditionId": "0xdeadbeef",
            "slug": "fed-rate-cut",
            "question": "Fed cut?",
            "outcomes": "[\"Yes\", \"No\"]",
            "outcomePrices": "[\"0.62\", \"0.38\"]",
            "lastTradePrice": "0.61",
            "closed": false
        }"#;
        let dto: GammaMarketDto = serde_json::from_str(raw).unwrap();
        let m = dto.into_market();
        assert_eq!(m.normalized_id(), "0xdeadbeef");
        assert_eq!(m.outcomes, vec!["Yes", "No"]);
        assert_eq!(m.outcome_prices, Some(vec![0.62, 0.38]));
        assert_eq!(m.last_trade_price, Some(0.61));
    }

    #[test]
    fn clob_dto_maps_tokens() {
        let raw = r#"{
            "conditionId": "0xfeed",
            "question": "Will it rain?",
            "marketSlug": "will-it-rain",
            "tokens": [
                {"outcome": "Yes", "price": 0.3},
                {"outcome": "No", "price": 0.7}
            ]
        }"#;
        let dto: ClobMarketDto = serde_json::from_str(raw).unwrap();
        let m = dto.into_market();
        assert_eq!(m.tokens.len(), 2);
        let p = market_percentages(&m);
        assert_eq!(p.yes, 30.0);
    }
}
