use crate::{
    admission::{Admission, AdmissionController, CallerClass},
    models::ApiError,
    tenants::TenantRegistry,
};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Method, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AuthState {
    tenants: TenantRegistry,
    admission: Arc<AdmissionController>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub tenant: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn new(tenants: TenantRegistry, admission: Arc<AdmissionController>) -> Self {
        Self { tenants, admission }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.tenants.authenticate(presented).map(|record| AuthContext {
            tenant: record.tenant,
            api_key_id: record.api_key_id,
        })
    }
}

/// Which admission budget a protected request draws from.
pub fn classify(method: &Method, path: &str) -> CallerClass {
    let path = path.trim_end_matches('/');
    if method == Method::GET {
        return CallerClass::Read;
    }
    if method == Method::POST
        && (path == "/jobs" || path.ends_with("/retry") || path.ends_with("/confirm"))
    {
        return CallerClass::Expensive;
    }
    CallerClass::Standard
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        let response =
            unauthorized_response("missing_api_key", "Provide X-Api-Key or Bearer token");
        return Ok(response);
    };

    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "catalog.api", "rejected unknown api key");
        let response = unauthorized_response("invalid_api_key", "Key not recognized");
        return Ok(response);
    };

    let class = classify(request.method(), request.uri().path());
    match state.admission.allow(class, &context.api_key_id).await {
        Admission::Admitted {
            limit,
            remaining,
            reset_after,
        } => {
            debug!(
                target = "catalog.admission",
                tenant = %context.tenant,
                class = %class,
                remaining,
                "request_admitted"
            );
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            apply_rate_headers(response.headers_mut(), limit, remaining, reset_after);
            Ok(response)
        }
        Admission::Throttled { limit, retry_after } => {
            warn!(
                target = "catalog.admission",
                tenant = %context.tenant,
                api_key = %context.api_key_id,
                class = %class,
                retry_after_ms = retry_after.as_millis() as u64,
                "request_throttled"
            );
            let mut response = too_many_requests("rate_limited", "Too many requests");
            let headers = response.headers_mut();
            headers.insert(
                http::header::RETRY_AFTER,
                header_number(ceil_secs(retry_after).max(1)),
            );
            apply_rate_headers(headers, limit, 0, retry_after);
            Ok(response)
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn header_number(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn apply_rate_headers(headers: &mut http::HeaderMap, limit: u32, remaining: u32, reset: Duration) {
    headers.insert("X-RateLimit-Limit", header_number(u64::from(limit)));
    headers.insert("X-RateLimit-Remaining", header_number(u64::from(remaining)));
    headers.insert("X-RateLimit-Reset", header_number(ceil_secs(reset)));
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Api-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn too_many_requests(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_routes_by_cost() {
        assert_eq!(classify(&Method::POST, "/jobs"), CallerClass::Expensive);
        assert_eq!(classify(&Method::POST, "/jobs/abc/retry"), CallerClass::Expensive);
        assert_eq!(classify(&Method::POST, "/jobs/abc/confirm"), CallerClass::Expensive);
        assert_eq!(classify(&Method::POST, "/jobs/abc/cancel"), CallerClass::Standard);
        assert_eq!(classify(&Method::GET, "/jobs/abc"), CallerClass::Read);
        assert_eq!(classify(&Method::GET, "/jobs"), CallerClass::Read);
    }

    #[test]
    fn reads_bearer_or_header_keys() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer  k1 "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("k1"));

        let mut headers = http::HeaderMap::new();
        headers.insert("X-Api-Key", HeaderValue::from_static("k2"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("k2"));

        assert_eq!(extract_api_key(&http::HeaderMap::new()), None);
    }

    #[test]
    fn partial_seconds_round_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(6)), 6);
    }
}
