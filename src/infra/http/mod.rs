mod data;
mod health;
mod middleware;

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware, routing::get};

use crate::{
    application::{data::DataService, repos::SeriesSource},
    cache::BlobStore,
};

pub use middleware::{REQUEST_ID_HEADER, RequestContext};

const CACHE_CONTROL_VALUE: &str = "public, max-age=90, must-revalidate";
const CONTENT_LANGUAGE_VALUE: &str = "en-GB";

#[derive(Clone)]
pub struct HttpState {
    pub data: Arc<DataService>,
    pub store: Arc<dyn BlobStore>,
    pub source: Arc<dyn SeriesSource>,
    /// Public origin used for `Content-Location` permalinks.
    pub public_url: String,
    /// Container served under `/downloads`.
    pub container: String,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route(
            "/api/v2/data",
            get(data::data).fallback(data::unsupported_method),
        )
        .route("/api/v2/healthcheck", get(health::healthcheck))
        .route("/downloads/{container}/{*path}", get(data::download))
        .fallback(data::not_found)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
