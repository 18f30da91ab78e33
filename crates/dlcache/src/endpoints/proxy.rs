use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, Response, Uri, header};
use dlcache_service::error::ProxyError;
use dlcache_service::service::ProxyService;
use percent_encoding::percent_decode_str;

use super::ResponseError;

/// Tells clients whether the body came from the cache.
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Turns the request URI into the proxied target.
///
/// The path is percent-decoded and loses its leading slash. The query string is kept as sent.
///
/// Escapes that do not decode to UTF-8 are rejected. Replacing them would make distinct paths
/// share a single cache key.
fn request_target(uri: &Uri) -> Result<String, ProxyError> {
    let path = percent_decode_str(uri.path()).decode_utf8().map_err(|_| {
        tracing::info!("Forbidden, invalid path encoding: {}", uri.path());
        ProxyError::Forbidden
    })?;
    let mut target = path.strip_prefix('/').unwrap_or(&path).to_owned();
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    Ok(target)
}

pub async fn proxy_request(
    State(service): State<ProxyService>,
    uri: Uri,
) -> Result<Response<Body>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("proxy"));
    });

    let target = request_target(&uri)?;
    let response = service.fetch(&target).await?;

    let content_length = response.body.len();
    Ok(Response::builder()
        .header(header::CONTENT_LENGTH, content_length)
        .header(X_CACHE, response.cache_status.as_str())
        .body(Body::from(response.body))?)
}
