use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use ipnetwork::IpNetwork;

use crate::api::views::MessageResponse;
use crate::api::AppState;
use crate::config::{ApiKey, AuthConfig};
use crate::error::{PrecheckError, Result};

/// Request admission rules built from [`AuthConfig`].
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    required: bool,
    networks: Vec<IpNetwork>,
    api_keys: Vec<ApiKey>,
}

impl AuthPolicy {
    /// Fails on an `allowed_ips` entry that is neither an address nor a CIDR block.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let networks = config
            .allowed_ips
            .iter()
            .map(|entry| {
                entry.trim().parse::<IpNetwork>().map_err(|e| {
                    PrecheckError::Config(format!("invalid allowed_ips entry {entry:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            required: config.required,
            networks,
            api_keys: config.api_keys.clone(),
        })
    }

    /// Admits everyone.
    pub fn open() -> Self {
        Self {
            required: false,
            networks: Vec::new(),
            api_keys: Vec::new(),
        }
    }

    /// An empty allowlist admits every address; an unknown address is only
    /// admitted by an empty allowlist.
    pub fn ip_allowed(&self, ip: Option<IpAddr>) -> bool {
        if self.networks.is_empty() {
            return true;
        }
        let Some(ip) = ip else {
            return false;
        };
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.networks.iter().any(|net| net.contains(ip))
    }

    /// Name of the configured key matching `presented`.
    pub fn key_name(&self, presented: &str) -> Option<&str> {
        self.api_keys
            .iter()
            .find(|k| k.key == presented)
            .map(|k| k.name.as_str())
    }
}

/// `Authorization: Bearer <key>` first, then `X-API-Key`.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

fn reject(status: StatusCode, message: String) -> Response {
    (status, Json(MessageResponse::new(message))).into_response()
}

/// Middleware applied to every `/api` route.
pub async fn authorize(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if !state.auth.ip_allowed(client) {
        let shown = client.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        tracing::warn!(client = %shown, path = %request.uri().path(), "Request from disallowed address");
        return reject(
            StatusCode::FORBIDDEN,
            format!("Forbidden: IP {shown} not allowed"),
        );
    }

    if state.auth.required {
        let Some(key) = presented_key(request.headers()) else {
            return reject(
                StatusCode::UNAUTHORIZED,
                "Unauthorized: API key required".to_string(),
            );
        };
        match state.auth.key_name(key) {
            Some(name) => tracing::debug!(key = %name, path = %request.uri().path(), "Request authorized"),
            None => {
                tracing::warn!(client = ?client, "Invalid API key presented");
                return reject(
                    StatusCode::UNAUTHORIZED,
                    "Unauthorized: Invalid API key".to_string(),
                );
            }
        }
    }

    next.run(request).await
}
