//! CORS layer, config-driven.
//!
//! With no configured origins everything is allowed, which suits local
//! development; production deployments set `WEFT_CORS_ORIGINS` to a
//! comma-separated allow-list.

use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

pub fn layer(allowed_origins: Option<&str>) -> CorsLayer {
    match allowed_origins {
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        Some(list) => {
            let origins: Vec<HeaderValue> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|origin| match origin.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(origin, error = %e, "ignoring unparsable CORS origin");
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}
