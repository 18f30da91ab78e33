use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use dlcache_service::metric;
use dlcache_service::service::ProxyService;
use sentry::integrations::tower::NewSentryLayer;
use tower::ServiceBuilder;

mod admission;
mod error;
mod metrics;
mod proxy;

pub use admission::RateLimiter;
pub use error::ResponseError;
use metrics::MetricsLayer;

use admission::admit;
use proxy::proxy_request as proxy;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

/// Creates the proxy application.
///
/// Every path except for the healthcheck is a proxied URL, regardless of the method.
pub fn create_app(service: ProxyService, limiter: Arc<RateLimiter>) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(MetricsLayer);

    Router::new()
        .fallback(proxy)
        // Caller and rate checks run before the proxy, but inside of metrics and sentry.
        .layer(middleware::from_fn_with_state(limiter, admit))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
