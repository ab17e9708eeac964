use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Initialize the tracing subscriber with JSON formatter for production.
pub fn init(rust_log: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(rust_log));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Extract the correlation id from an inbound HTTP request's headers, for
/// use in a `warp::Filter` chain or directly against `warp::http::HeaderMap`.
pub fn correlation_id_from_headers(headers: &warp::http::HeaderMap) -> Option<String> {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|val| val.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_returns_none() {
        let headers = warp::http::HeaderMap::new();
        assert_eq!(correlation_id_from_headers(&headers), None);
    }

    #[test]
    fn present_header_is_returned() {
        let mut headers = warp::http::HeaderMap::new();
        headers.insert(CORRELATION_ID_HEADER, "abc-123".parse().unwrap());
        assert_eq!(
            correlation_id_from_headers(&headers),
            Some("abc-123".to_string())
        );
    }
}
