//! Request handlers.
//!
//! HTTP status codes are assigned here and nowhere else: validation failures
//! map to 400, upstream resolution failures to 500, and everything inside a
//! running discovery stream degrades to warnings in the final payload.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Json as AxumJson, State as AxumState},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::Utc;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::catalog::{extract_slug, market_percentages};
use crate::finder::{Finder, FinderEvent, FinderOptions, LogLevel, LogLine};
use crate::graph::{evaluate_graph, validate_graph, ValidationIssue};
use crate::llm::ChatClient;
use crate::models::{
    Decision, DependantInput, GraphNode, Market, PricedDependant, RelationType, RootPosition,
};
use crate::planner::Planner;
use crate::pricing::{price_dependants, PricingOptions};

/// Cap on dependants in the final discovery payload.
const MAX_DEPENDANTS: usize = 4;

// ---------------------------------------------------------------------------
// Manifest and health

#[derive(Debug, Serialize)]
struct EndpointInfo {
    method: &'static str,
    path: &'static str,
    description: &'static str,
}

pub async fn get_manifest() -> Json<Value> {
    let endpoints = [
        EndpointInfo {
            method: "POST",
            path: "/api/dependencies",
            description: "Discover and price related markets for a market URL (SSE)",
        },
        EndpointInfo {
            method: "POST",
            path: "/api/relations/price",
            description: "Price typed dependants against a root position",
        },
        EndpointInfo {
            method: "POST",
            path: "/api/relations/graph",
            description: "Evaluate outcome metrics over a relation graph",
        },
        EndpointInfo {
            method: "GET",
            path: "/health",
            description: "Liveness probe",
        },
    ];

    Json(json!({
        "name": "polygraph-backend",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": endpoints,
    }))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Synchronous pricing

#[derive(Debug, Deserialize)]
pub struct PriceRequest {
    pub root: RootPosition,
    #[serde(alias = "relations", default)]
    pub dependants: Vec<DependantInput>,
    #[serde(default)]
    pub options: PricingOptions,
}

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub dependants: Vec<PricedDependant>,
    pub warnings: Vec<String>,
}

pub async fn post_relations_price(AxumJson(req): AxumJson<PriceRequest>) -> Json<PriceResponse> {
    let outcome = price_dependants(&req.root, &req.dependants, &req.options);
    Json(PriceResponse {
        dependants: outcome.dependants,
        warnings: outcome.warnings,
    })
}

// ---------------------------------------------------------------------------
// Graph evaluation

#[derive(Debug, Serialize)]
struct ValidationErrorBody {
    error: &'static str,
    details: Vec<ValidationIssue>,
}

pub async fn post_relations_graph(AxumJson(body): AxumJson<Value>) -> Response {
    let node: GraphNode = match serde_json::from_value(body) {
        Ok(node) => node,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ValidationErrorBody {
                    error: "invalid_body",
                    details: vec![ValidationIssue {
                        path: "root".to_string(),
                        message: e.to_string(),
                    }],
                }),
            )
                .into_response();
        }
    };

    let issues = validate_graph(&node);
    if !issues.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ValidationErrorBody {
                error: "validation_failed",
                details: issues,
            }),
        )
            .into_response();
    }

    Json(evaluate_graph(&node)).into_response()
}

// ---------------------------------------------------------------------------
// Discovery (SSE)

#[derive(Debug, Deserialize)]
pub struct DependenciesRequest {
    pub url: String,
    #[serde(default)]
    pub visited: Vec<String>,
    pub weight: f64,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub volatility: Option<f64>,
    #[serde(default)]
    pub options: DependenciesOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct DependenciesOptions {
    #[serde(default)]
    pub epsilon: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceMarketPayload {
    id: String,
    slug: String,
    question: String,
    yes_percentage: f64,
    no_percentage: f64,
    probability: f64,
    weight: f64,
    decision: Decision,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DependantPayload {
    id: String,
    weight: f64,
    decision: Decision,
    relation: RelationType,
    explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    yes_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_percentage: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalPayload {
    source_market: SourceMarketPayload,
    dependants: Vec<DependantPayload>,
    warnings: Vec<String>,
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn post_dependencies(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<DependenciesRequest>,
) -> Response {
    // Misconfiguration is rejected at request entry, before any work.
    let Some(llm) = state.llm.clone() else {
        warn!("dependencies request rejected: model key not configured");
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, "Server misconfiguration");
    };

    let Some(slug) = extract_slug(&req.url) else {
        return error_json(StatusCode::BAD_REQUEST, "Invalid Polymarket URL");
    };
    if !req.weight.is_finite() || req.weight <= 0.0 {
        return error_json(StatusCode::BAD_REQUEST, "weight must be a positive number");
    }
    let volatility = req.volatility.unwrap_or(1.0);
    if !volatility.is_finite() || volatility < 0.0 {
        return error_json(StatusCode::BAD_REQUEST, "volatility must be >= 0");
    }
    let epsilon = req.options.epsilon.unwrap_or(0.01);
    if !epsilon.is_finite() || epsilon < 0.0 {
        return error_json(StatusCode::BAD_REQUEST, "epsilon must be >= 0");
    }
    let decision = req.decision.unwrap_or(Decision::Yes);

    let visited: HashSet<String> = req
        .visited
        .iter()
        .map(|v| extract_slug(v).unwrap_or_else(|| v.trim().to_string()))
        .filter(|v| !v.is_empty())
        .collect();

    let request_id = Uuid::new_v4().to_string();
    let mut pre_logs = vec![LogLine::log("Resolving market from URL")
        .with_meta(json!({ "requestId": request_id }))];

    // Resolution happens before the stream opens so upstream failures still
    // map to an HTTP status.
    let market_id = match state.catalog.find_market_id_from_url(&req.url).await {
        Ok(Some(id)) => id,
        Ok(None) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, "Market not found"),
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "market resolution failed");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "upstream_market_fetch");
        }
    };
    let market = match state.catalog.fetch_market(&market_id).await {
        Ok(m) => m,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "market fetch failed");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "upstream_market_fetch");
        }
    };

    info!(request_id = %request_id, market = %market.question, "discovery started");
    pre_logs.push(LogLine::log(format!("Resolved market: {}", market.question)));

    let (tx, rx) = mpsc::channel::<String>(64);
    let params = PipelineParams {
        slug,
        visited,
        weight: req.weight,
        decision,
        volatility,
        epsilon,
    };
    tokio::spawn(run_discovery_pipeline(state, llm, market, params, pre_logs, tx));

    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(SseEvent::default().data(line)), rx))
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

struct PipelineParams {
    slug: String,
    visited: HashSet<String>,
    weight: f64,
    decision: Decision,
    volatility: f64,
    epsilon: f64,
}

async fn run_discovery_pipeline(
    state: AppState,
    llm: Arc<dyn ChatClient>,
    market: Market,
    params: PipelineParams,
    pre_logs: Vec<LogLine>,
    tx: mpsc::Sender<String>,
) {
    let send_log = |tx: &mpsc::Sender<String>, line: &LogLine| {
        let payload = serde_json::to_string(line).unwrap_or_default();
        let tx = tx.clone();
        let line = format!("log - {payload}");
        async move { tx.send(line).await.is_ok() }
    };

    for line in &pre_logs {
        if !send_log(&tx, line).await {
            return;
        }
    }

    let planner = Arc::new(Planner::new(llm.clone()));
    let finder = Arc::new(Finder::new(state.catalog.clone(), planner, llm));

    let mut warnings: Vec<String> = Vec::new();
    let mut bets = Vec::new();

    let mut finder_rx = finder.stream(market.clone(), params.visited, FinderOptions::default());
    while let Some(event) = finder_rx.recv().await {
        match event {
            FinderEvent::Log(line) => {
                if line.level == LogLevel::Warn {
                    warnings.push(line.message.clone());
                }
                if !send_log(&tx, &line).await {
                    return;
                }
            }
            FinderEvent::Bet(bet) => bets.push(*bet),
        }
    }

    let pct = market_percentages(&market);
    if pct.defaulted {
        let line = LogLine::warn("Source market had no usable price, assuming 50/50");
        warnings.push(line.message.clone());
        if !send_log(&tx, &line).await {
            return;
        }
    }

    let root = RootPosition {
        id: Some(market.normalized_id().to_string()),
        probability: pct.yes / 100.0,
        weight: params.weight,
        decision: params.decision,
    };
    let dependant_inputs: Vec<DependantInput> = bets
        .iter()
        .map(|b| DependantInput {
            id: b.market_id.clone(),
            probability: b.yes_percentage / 100.0,
            relation: b.relationship,
        })
        .collect();

    let outcome = price_dependants(
        &root,
        &dependant_inputs,
        &PricingOptions {
            epsilon: params.epsilon,
            volatility: params.volatility,
        },
    );
    for message in &outcome.warnings {
        if !send_log(&tx, &LogLine::warn(message.clone())).await {
            return;
        }
    }
    warnings.extend(outcome.warnings);

    let dependants: Vec<DependantPayload> = outcome
        .dependants
        .into_iter()
        .zip(&bets)
        .filter(|(priced, _)| priced.weight > 0.0)
        .take(MAX_DEPENDANTS)
        .map(|(priced, bet)| DependantPayload {
            id: priced.id,
            weight: priced.weight,
            decision: priced.decision,
            relation: priced.relation,
            explanation: bet.reasoning.clone(),
            question: Some(bet.market.question.clone()),
            url: bet
                .event_slug
                .as_ref()
                .map(|s| format!("https://polymarket.com/event/{s}")),
            probability: Some(bet.yes_percentage / 100.0),
            yes_percentage: Some(bet.yes_percentage),
            no_percentage: Some(bet.no_percentage),
        })
        .collect();

    let payload = FinalPayload {
        source_market: SourceMarketPayload {
            id: market.normalized_id().to_string(),
            slug: market.market_slug.clone().unwrap_or(params.slug),
            question: market.question.clone(),
            yes_percentage: pct.yes,
            no_percentage: pct.no,
            probability: pct.yes / 100.0,
            weight: params.weight,
            decision: params.decision,
        },
        dependants,
        warnings,
    };

    let line = format!(
        "final - {}",
        serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string())
    );
    let _ = tx.send(line).await;
}
