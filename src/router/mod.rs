//! API Router
//!
//! Maps HTTP method and path to an API route and decodes query strings.

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Router errors
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// API routes
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRoute {
    /// GET /api/traces/{id}
    FindTrace { id: String },
    /// POST /api/push/{id}?start=&end=&tag=value
    Push { id: String },
    /// GET /api/search?tag=value&limit=
    Search,
    /// GET /api/blocks
    Blocks,
    /// GET /metrics
    Metrics,
    /// GET /health
    Health,
    /// GET /ready
    Ready,
}

impl ApiRoute {
    /// Label used for request metrics
    pub fn name(&self) -> &'static str {
        match self {
            ApiRoute::FindTrace { .. } => "traces",
            ApiRoute::Push { .. } => "push",
            ApiRoute::Search => "search",
            ApiRoute::Blocks => "blocks",
            ApiRoute::Metrics => "metrics",
            ApiRoute::Health => "health",
            ApiRoute::Ready => "ready",
        }
    }
}

pub struct ApiRouter;

impl ApiRouter {
    /// Resolve a request to a route
    pub fn parse(method: &str, path: &str) -> Result<ApiRoute, RouterError> {
        let (route, allowed) = if let Some(id) = path.strip_prefix("/api/traces/") {
            (ApiRoute::FindTrace { id: path_id(id)? }, "GET")
        } else if let Some(id) = path.strip_prefix("/api/push/") {
            (ApiRoute::Push { id: path_id(id)? }, "POST")
        } else {
            let route = match path {
                "/api/search" => ApiRoute::Search,
                "/api/blocks" => ApiRoute::Blocks,
                "/metrics" => ApiRoute::Metrics,
                "/health" => ApiRoute::Health,
                "/ready" => ApiRoute::Ready,
                _ => return Err(RouterError::NotFound(path.to_string())),
            };
            (route, "GET")
        };

        if method != allowed {
            return Err(RouterError::MethodNotAllowed(format!(
                "{} {} (expected {})",
                method, path, allowed
            )));
        }
        Ok(route)
    }

    /// Decode `a=1&b=x%20y` into pairs, in order. `+` decodes to a space.
    pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
        let Some(query) = query else {
            return Vec::new();
        };

        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode(key), decode(value))
            })
            .collect()
    }
}

fn path_id(raw: &str) -> Result<String, RouterError> {
    let id = raw.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return Err(RouterError::InvalidPath(format!("invalid trace id '{}'", raw)));
    }
    Ok(id.to_string())
}

fn decode(s: &str) -> String {
    percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}
