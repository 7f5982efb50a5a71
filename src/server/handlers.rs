//! Request handlers

use super::AppState;
use crate::encoding::id::parse_hex_id;
use crate::ingester::IngestError;
use crate::metrics;
use crate::querier::{FEDERATED_HEADER, ORG_ID_HEADER};
use crate::router::{ApiRoute, ApiRouter, RouterError};
use crate::search::{SearchError, SearchRequest};
use crate::util::unix_now;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

/// Tenant used when a request carries no `X-Scope-OrgID`
pub const DEFAULT_TENANT: &str = "single-tenant";

type HttpResponse = Response<Full<Bytes>>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Route and answer one request.
pub async fn handle_request<B>(
    state: Arc<AppState>,
    req: Request<B>,
) -> Result<HttpResponse, Infallible>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let route = match ApiRouter::parse(req.method().as_str(), req.uri().path()) {
        Ok(route) => route,
        Err(e) => {
            let status = match e {
                RouterError::NotFound(_) => StatusCode::NOT_FOUND,
                RouterError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
                RouterError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            };
            metrics::record_http_request("other", status.as_u16());
            return Ok(text(status, e.to_string()));
        }
    };

    let name = route.name();
    let response = match route {
        ApiRoute::Health => json(StatusCode::OK, Bytes::from_static(br#"{"status":"ok"}"#)),
        ApiRoute::Ready => text(StatusCode::OK, "ready"),
        ApiRoute::Metrics => metrics_handler(&state),
        route => match tenant(&req) {
            Ok(tenant) => match route {
                ApiRoute::FindTrace { id } => {
                    let federate = !req.headers().contains_key(FEDERATED_HEADER);
                    find_trace(&state, &tenant, &id, federate).await
                }
                ApiRoute::Push { id } => push(&state, &tenant, &id, req).await,
                ApiRoute::Search => search(&state, &tenant, req.uri().query()),
                ApiRoute::Blocks => blocks(&state, &tenant),
                _ => text(StatusCode::NOT_FOUND, "Not Found"),
            },
            Err(response) => response,
        },
    };

    metrics::record_http_request(name, response.status().as_u16());
    Ok(response)
}

fn tenant<B>(req: &Request<B>) -> Result<String, HttpResponse> {
    let Some(value) = req.headers().get(ORG_ID_HEADER) else {
        return Ok(DEFAULT_TENANT.to_string());
    };
    let tenant = value.to_str().unwrap_or_default().trim();

    if tenant.is_empty()
        || tenant == "."
        || tenant == ".."
        || tenant.contains(['/', '\\', '+'])
    {
        return Err(text(
            StatusCode::BAD_REQUEST,
            format!("invalid tenant '{}'", tenant),
        ));
    }
    Ok(tenant.to_string())
}

async fn find_trace(state: &AppState, tenant: &str, hex_id: &str, federate: bool) -> HttpResponse {
    let id = match parse_hex_id(hex_id) {
        Ok(id) => id,
        Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.querier.find_trace_by_id(tenant, &id, federate).await {
        Ok(Some(trace)) => {
            let mut response = Response::new(Full::new(trace));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Ok(None) => text(StatusCode::NOT_FOUND, "trace not found"),
        Err(e) => {
            tracing::error!(tenant = %tenant, trace_id = %hex_id, error = %e, "Trace lookup failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn push<B>(state: &AppState, tenant: &str, hex_id: &str, req: Request<B>) -> HttpResponse
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let id = match parse_hex_id(hex_id) {
        Ok(id) => id,
        Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let now = unix_now();
    let (mut start, mut end) = (now, now);
    let mut tags = BTreeMap::new();
    for (key, value) in ApiRouter::parse_query(req.uri().query()) {
        match key.as_str() {
            "start" | "end" => {
                let Ok(secs) = value.parse::<u32>() else {
                    return text(
                        StatusCode::BAD_REQUEST,
                        format!("invalid {} '{}'", key, value),
                    );
                };
                if key == "start" {
                    start = secs;
                } else {
                    end = secs;
                }
            }
            _ => {
                tags.insert(key, value);
            }
        }
    }

    // one byte past the limit is enough to reject the trace
    let max = state.ingester.max_bytes_per_trace();
    let body = match Limited::new(req.into_body(), max.saturating_add(1)).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return text(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("trace body exceeds max {} bytes", max),
            )
        }
        Err(e) => return text(StatusCode::BAD_REQUEST, format!("failed to read body: {}", e)),
    };
    if body.is_empty() {
        return text(StatusCode::BAD_REQUEST, "empty trace body");
    }

    match state.ingester.push(tenant, &id, &body, start, end, &tags) {
        Ok(()) => {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::NO_CONTENT;
            response
        }
        Err(e @ IngestError::TraceTooLarge { .. }) => text(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
        Err(e @ IngestError::Search(SearchError::InvalidEntry(_))) => {
            text(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            tracing::error!(tenant = %tenant, trace_id = %hex_id, error = %e, "Push failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn search(state: &AppState, tenant: &str, query: Option<&str>) -> HttpResponse {
    let mut request = SearchRequest::new();
    for (key, value) in ApiRouter::parse_query(query) {
        let parsed = match key.as_str() {
            "limit" => value.parse().map(|v| request.limit = v).is_ok(),
            "start" => value.parse().map(|v| request.start = Some(v)).is_ok(),
            "end" => value.parse().map(|v| request.end = Some(v)).is_ok(),
            _ => {
                request.tags.insert(key.clone(), value.clone());
                true
            }
        };
        if !parsed {
            return text(
                StatusCode::BAD_REQUEST,
                format!("invalid {} '{}'", key, value),
            );
        }
    }

    match state.ingester.search(tenant, &request) {
        Ok(response) => match serde_json::to_vec(&response) {
            Ok(body) => json(StatusCode::OK, Bytes::from(body)),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(e) => {
            tracing::error!(tenant = %tenant, error = %e, "Search failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn blocks(state: &AppState, tenant: &str) -> HttpResponse {
    match serde_json::to_vec(&state.store.blocklist(tenant)) {
        Ok(body) => json(StatusCode::OK, Bytes::from(body)),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn metrics_handler(state: &AppState) -> HttpResponse {
    if !state.metrics_enabled {
        return text(StatusCode::NOT_FOUND, "metrics disabled");
    }

    match metrics::gather_text() {
        Ok((content_type, buffer)) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

fn text(status: StatusCode, body: impl Into<String>) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn json(status: StatusCode, body: Bytes) -> HttpResponse {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
