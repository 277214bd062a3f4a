//! HTTP API for gateway callbacks and operator calls
//!
//! ## Gateway
//! - `POST /webhooks/gateway` - Record a payment-gateway callback (safe to redeliver)
//!
//! ## Ledger
//! - `GET /ledger/pending?limit=` - Pending ledger lines
//! - `GET /ledger/events/{event_id}` - Lines written for one event
//! - `POST /ledger/entries/{id}/complete` - `{externalTransferId}`
//! - `POST /ledger/entries/{id}/fail` - `{reason}`
//!
//! ## Categories
//! - `GET /categories` / `POST /categories`
//! - `GET /categories/{id}` / `PATCH /categories/{id}`
//! - `POST /categories/{id}/items` - `{delta}`
//! - `POST /categories/{id}/start-cycle` - `{force?}`
//! - `POST /categories/{id}/close` - `{reason, triggerPayout?}`
//! - `POST /categories/{id}/payout` - closure split hand-off
//! - `GET /categories/{id}/stats`, `GET /categories/{id}/audit?limit=`
//! - `POST /categories/sweep` - `{dryRun?, categoryIds?}`
//!
//! ## Rankings and wagers
//! - `POST /rankings/{date}/settle`, `GET /rankings/latest`, `GET /rankings/{date}`
//! - `GET /rankings/{date}/pot`, `GET /rankings/participants/{id}?limit=`
//! - `POST /wagers` / `GET /wagers?month=YYYY-MM`, `POST /wagers/settle/{date}`
//!
//! ## Points
//! - `GET /points/{account}`, `GET /points/{account}/history?limit=`
//! - `POST /points/{account}/streaks/{daily|weekly}`, `POST /points/{account}/cashout`
//!
//! Privileged calls carry the operator id in the `X-Operator-Id` header.
//!
//! ```bash
//! curl -X POST -H "X-Operator-Id: op-1" \
//!      -d '{"name":"comedy","activationThreshold":30,"maxItemCount":100}' \
//!      http://localhost:8095/categories
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::db::{self, CreateCategoryInput, SettlementDb, UpdateCategoryInput};
use crate::error::SettlementError;
use crate::lifecycle::Actor;
use crate::services::category_service::{
    CloseCategoryInput, ClosurePayoutInput, StartCycleInput, SweepRequest,
};
use crate::services::operators::require_operator;
use crate::services::ranking_service::PurchaseWagerInput;
use crate::services::{
    bad_request, error_response, from_create_result, from_option, from_result,
    method_not_allowed, not_found, GatewayEvent, Services,
};

/// Header carrying the calling operator's id
pub const OPERATOR_HEADER: &str = "x-operator-id";

const DEFAULT_LIMIT: i64 = 50;

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct MonthQuery {
    month: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemsBody {
    delta: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteBody {
    external_transfer_id: String,
}

#[derive(Debug, Deserialize)]
struct FailBody {
    reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct StreakBody {
    #[serde(default)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse<'a> {
    account_id: &'a str,
    balance: i64,
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    db: Arc<SettlementDb>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, db: Arc<SettlementDb>, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            db,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), SettlementError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return Ok(bad_request(&format!("Failed to read body: {}", e))),
        };

        debug!(method = %parts.method, path = %parts.uri.path(), "Incoming request");

        let response = self.route(&parts, &body);
        if response.status().is_server_error() {
            warn!(method = %parts.method, path = %parts.uri.path(), status = %response.status(), "Request failed");
        }
        Ok(response)
    }

    /// Route requests to handlers
    fn route(&self, parts: &Parts, body: &Bytes) -> Response<Full<Bytes>> {
        let path = parts.uri.path().trim_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').collect();
        let s = &self.services;
        let now = Utc::now();

        match (&parts.method, segments.as_slice()) {
            (&Method::GET, ["health"]) => from_result(self.db.stats().map(|stats| {
                serde_json::json!({ "status": "ok", "stats": stats })
            })),

            // Gateway
            (&Method::POST, ["webhooks", "gateway"]) => from_result(
                parse_body::<GatewayEvent>(body)
                    .and_then(|event| s.ledger.handle_gateway_event(&event, now)),
            ),

            // Ledger
            (&Method::GET, ["ledger", "pending"]) => from_result(
                limit(parts).and_then(|limit| s.ledger.get_pending_entries(limit)),
            ),
            (&Method::GET, ["ledger", "events", event_id]) => {
                from_result(s.ledger.entries_for_event(event_id))
            }
            (&Method::POST, ["ledger", "entries", id, "complete"]) => from_result(
                self.operator(parts)
                    .and_then(|actor| require_operator(s.operators.as_ref(), &actor))
                    .and_then(|_| parse_body::<CompleteBody>(body))
                    .and_then(|b| s.ledger.mark_completed(id, &b.external_transfer_id, now))
                    .map(|_| serde_json::json!({ "entryId": id, "status": "completed" })),
            ),
            (&Method::POST, ["ledger", "entries", id, "fail"]) => from_result(
                self.operator(parts)
                    .and_then(|actor| require_operator(s.operators.as_ref(), &actor))
                    .and_then(|_| parse_body::<FailBody>(body))
                    .and_then(|b| s.ledger.mark_failed(id, &b.reason, now))
                    .map(|_| serde_json::json!({ "entryId": id, "status": "failed" })),
            ),

            // Categories
            (&Method::GET, ["categories"]) => from_result(s.categories.list()),
            (&Method::POST, ["categories"]) => from_create_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, parse_body::<CreateCategoryInput>(body)?)))
                    .and_then(|(actor, input)| s.categories.create(&actor, &input, now)),
            ),
            (&Method::POST, ["categories", "sweep"]) => from_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, parse_body::<SweepRequest>(body)?)))
                    .and_then(|(actor, request)| s.categories.sweep(&actor, &request, now)),
            ),
            (&Method::GET, ["categories", id]) => from_result(s.categories.get(id)),
            (&Method::PATCH, ["categories", id]) => from_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, parse_body::<UpdateCategoryInput>(body)?)))
                    .and_then(|(actor, input)| s.categories.update(&actor, id, &input, now)),
            ),
            (&Method::POST, ["categories", id, "items"]) => from_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, parse_body::<ItemsBody>(body)?)))
                    .and_then(|(actor, b)| s.categories.add_items(&actor, id, b.delta, now)),
            ),
            (&Method::POST, ["categories", id, "start-cycle"]) => from_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, parse_body::<StartCycleInput>(body)?)))
                    .and_then(|(actor, input)| {
                        s.categories.force_start_cycle(&actor, id, input.force, now)
                    }),
            ),
            (&Method::POST, ["categories", id, "close"]) => from_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, parse_body::<CloseCategoryInput>(body)?)))
                    .and_then(|(actor, input)| s.categories.manual_close(&actor, id, &input, now)),
            ),
            (&Method::POST, ["categories", id, "payout"]) => from_create_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, parse_body::<ClosurePayoutInput>(body)?)))
                    .and_then(|(actor, input)| {
                        s.categories.compute_closure_payout(&actor, id, &input, now)
                    }),
            ),
            (&Method::GET, ["categories", id, "stats"]) => from_result(s.categories.stats(id, now)),
            (&Method::GET, ["categories", id, "audit"]) => from_result(
                limit(parts).and_then(|limit| s.categories.audit_trail(id, limit)),
            ),

            // Rankings
            (&Method::GET, ["rankings", "latest"]) => {
                from_option(s.rankings.latest(), "No ranking has been settled yet")
            }
            (&Method::GET, ["rankings", "participants", id]) => from_result(
                limit(parts).and_then(|limit| s.rankings.participant_history(id, limit)),
            ),
            (&Method::POST, ["rankings", date, "settle"]) => from_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, db::parse_date(date)?)))
                    .and_then(|(actor, date)| s.rankings.settle_day(&actor, date, now)),
            ),
            (&Method::GET, ["rankings", date, "pot"]) => match db::parse_date(date) {
                Ok(date) => from_option(s.rankings.pot_for_date(date), "Day has not been settled"),
                Err(e) => error_response(e),
            },
            (&Method::GET, ["rankings", date]) => from_result(
                db::parse_date(date).and_then(|date| s.rankings.rankings_for_date(date)),
            ),

            // Wagers
            (&Method::POST, ["wagers"]) => from_create_result(
                parse_body::<PurchaseWagerInput>(body)
                    .and_then(|input| s.rankings.purchase_wager(&input, now.date_naive(), now)),
            ),
            (&Method::GET, ["wagers"]) => from_result(
                month(parts).and_then(|month| s.rankings.list_wagers(month.unwrap_or(now.date_naive()))),
            ),
            (&Method::POST, ["wagers", "settle", date]) => from_result(
                self.operator(parts)
                    .and_then(|actor| Ok((actor, db::parse_date(date)?)))
                    .and_then(|(actor, date)| s.rankings.settle_wagers(&actor, date, now)),
            ),

            // Points
            (&Method::GET, ["points", account]) => from_result(
                s.points
                    .balance(account)
                    .map(|balance| BalanceResponse { account_id: account, balance }),
            ),
            (&Method::GET, ["points", account, "history"]) => from_result(
                limit(parts).and_then(|limit| s.points.history(account, limit)),
            ),
            (&Method::POST, ["points", account, "streaks", kind]) => {
                let date = match parse_body::<StreakBody>(body) {
                    Ok(b) => b.date.unwrap_or(now.date_naive()),
                    Err(e) => return error_response(e),
                };
                match *kind {
                    "daily" => from_result(s.points.award_daily_streak(account, date, now)),
                    "weekly" => from_result(s.points.award_weekly_streak(account, date, now)),
                    other => not_found(&format!("Unknown streak kind: {}", other)),
                }
            }
            (&Method::POST, ["points", account, "cashout"]) => {
                from_create_result(s.points.cashout(account, now))
            }

            (_, ["health" | "webhooks" | "ledger" | "categories" | "rankings" | "wagers" | "points", ..]) => {
                if is_known_path(&segments) {
                    method_not_allowed()
                } else {
                    not_found(&format!("No route for /{}", path))
                }
            }
            _ => not_found(&format!("No route for /{}", path)),
        }
    }

    /// Operator identity from the request header. Missing means not authorized.
    fn operator(&self, parts: &Parts) -> Result<Actor, SettlementError> {
        parts
            .headers
            .get(OPERATOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(Actor::operator)
            .ok_or_else(|| {
                SettlementError::PermissionDenied(format!("{} header is required", OPERATOR_HEADER))
            })
    }
}

/// Paths that exist under some other method
fn is_known_path(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["health"]
            | ["webhooks", "gateway"]
            | ["categories"]
            | ["categories", _]
            | ["categories", _, _]
            | ["rankings", _]
            | ["rankings", _, _]
            | ["wagers"]
            | ["points", _]
            | ["points", _, _]
    )
}

/// Parse a JSON body; an empty body reads as `{}`
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, SettlementError> {
    let raw: &[u8] = if body.is_empty() { b"{}" } else { body };
    serde_json::from_slice(raw)
        .map_err(|e| SettlementError::InvalidInput(format!("Invalid JSON body: {}", e)))
}

fn query<T: DeserializeOwned>(parts: &Parts) -> Result<T, SettlementError> {
    serde_urlencoded::from_str(parts.uri.query().unwrap_or(""))
        .map_err(|e| SettlementError::InvalidInput(format!("Invalid query string: {}", e)))
}

fn limit(parts: &Parts) -> Result<i64, SettlementError> {
    let q: ListQuery = query(parts)?;
    Ok(q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 1_000))
}

/// `?month=YYYY-MM` as the first day of that month
fn month(parts: &Parts) -> Result<Option<NaiveDate>, SettlementError> {
    let q: MonthQuery = query(parts)?;
    q.month
        .map(|m| db::parse_date(&format!("{}-01", m)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use hyper::StatusCode;

    fn server() -> HttpServer {
        let db = Arc::new(SettlementDb::open_in_memory().unwrap());
        let config = Config {
            authorized_operators: vec!["op-1".into()],
            ..Config::default()
        };
        let services = Arc::new(Services::new(db.clone(), &config));
        HttpServer::new(services, db, "127.0.0.1:0".parse().unwrap())
    }

    fn request(method: Method, uri: &str, operator: Option<&str>) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(op) = operator {
            builder = builder.header(OPERATOR_HEADER, op);
        }
        builder.body(()).unwrap().into_parts().0
    }

    async fn json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let server = server();
        let response = server.route(&request(Method::GET, "/health", None), &Bytes::new());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_gateway_redelivery_is_acknowledged() {
        let server = server();
        let body = Bytes::from_static(
            br#"{"id":"evt-1","type":"sale.completed","payload":{"creatorId":"c1","buyerId":"b1","amount":1000}}"#,
        );
        let parts = request(Method::POST, "/webhooks/gateway", None);

        let first = server.route(&parts, &body);
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(json(first).await["status"], "applied");

        let second = server.route(&parts, &body);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(json(second).await["status"], "duplicate");
    }

    #[tokio::test]
    async fn test_category_admin_needs_operator_header() {
        let server = server();
        let body = Bytes::from_static(br#"{"name":"comedy","activationThreshold":2,"maxItemCount":5}"#);

        let response = server.route(&request(Method::POST, "/categories", None), &body);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = server.route(&request(Method::POST, "/categories", Some("intruder")), &body);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = server.route(&request(Method::POST, "/categories", Some("op-1")), &body);
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = json(response).await["id"].as_str().unwrap().to_string();

        let items = format!("/categories/{}/items", id);
        let delta = Bytes::from_static(br#"{"delta":1}"#);
        let response = server.route(&request(Method::POST, &items, None), &delta);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = server.route(&request(Method::POST, &items, Some("op-1")), &delta);
        assert_eq!(response.status(), StatusCode::OK);

        let response = server.route(
            &request(Method::GET, &format!("/categories/{}/stats", id), None),
            &Bytes::new(),
        );
        assert_eq!(json(response).await["remainingUntilActivation"], 1);
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let server = server();
        let response = server.route(&request(Method::GET, "/categories/missing", None), &Bytes::new());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server.route(
            &request(Method::POST, "/rankings/not-a-date/settle", Some("op-1")),
            &Bytes::new(),
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = server.route(&request(Method::DELETE, "/categories", None), &Bytes::new());
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = server.route(&request(Method::GET, "/nowhere", None), &Bytes::new());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_latest_ranking_before_any_settlement() {
        let server = server();
        let response = server.route(&request(Method::GET, "/rankings/latest", None), &Bytes::new());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server.route(
            &request(Method::POST, "/rankings/2025-03-01/settle", Some("op-1")),
            &Bytes::new(),
        );
        assert_eq!(response.status(), StatusCode::OK);
        let response = server.route(&request(Method::GET, "/rankings/2025-03-01/pot", None), &Bytes::new());
        assert_eq!(json(response).await["totalPot"], 0);
    }
}
