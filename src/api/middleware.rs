use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

use crate::api::state::AppState;
use crate::error::AppError;

/// Picks the identifier a request is rate limited by: first hop of
/// X-Forwarded-For, then X-Real-IP, then the socket address. Headers are
/// client-controlled, which is an accepted limitation of IP keying.
pub fn client_identifier(request: &Request) -> String {
    let headers = request.headers();

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first) = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return first.to_string();
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admission gate in front of the widget-facing routes.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let identifier = client_identifier(&request);

    if !state.limiter.check(&identifier).await {
        // Expected under load; informational, not an error.
        tracing::debug!(client = %identifier, "rate limit exceeded");
        return Err(AppError::RateLimited);
    }

    Ok(next.run(request).await)
}

/// Pulls the bearer token out of an Authorization header, if any. A header
/// with a different scheme counts as an invalid credential, not as absent.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AppError> {
    let Some(header) = headers.get("Authorization") else {
        return Ok(None);
    };

    header
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| Some(token.trim()))
        .ok_or(AppError::InvalidToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_headers(pairs: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/api/chat");
        for (name, value) in pairs {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn forwarded_for_takes_first_entry() {
        let request = request_with_headers(&[
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1, 10.0.0.2"),
            ("x-real-ip", "198.51.100.4"),
        ]);
        assert_eq!(client_identifier(&request), "203.0.113.9");
    }

    #[test]
    fn real_ip_is_the_fallback() {
        let request = request_with_headers(&[("x-real-ip", " 198.51.100.4 ")]);
        assert_eq!(client_identifier(&request), "198.51.100.4");
    }

    #[test]
    fn empty_forwarded_header_is_skipped() {
        let request = request_with_headers(&[
            ("x-forwarded-for", "  "),
            ("x-real-ip", "198.51.100.4"),
        ]);
        assert_eq!(client_identifier(&request), "198.51.100.4");
    }

    #[test]
    fn no_headers_and_no_socket_reads_unknown() {
        let request = request_with_headers(&[]);
        assert_eq!(client_identifier(&request), "unknown");
    }

    #[test]
    fn socket_address_is_used_when_present() {
        let mut request = request_with_headers(&[]);
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("192.0.2.7:4242".parse().unwrap()));
        assert_eq!(client_identifier(&request), "192.0.2.7");
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers).unwrap(), None);

        headers.insert("Authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), Some("abc123"));

        headers.insert("Authorization", "Basic dXNlcjpwdw==".parse().unwrap());
        assert!(bearer_token(&headers).is_err());
    }
}
