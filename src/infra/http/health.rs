use axum::{
    Json,
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::application::error::{ErrorReport, error_body};

use super::HttpState;

const SOURCE: &str = "infra::http::health";

#[derive(Debug, Serialize)]
struct HealthBody {
    db: String,
    storage: String,
}

/// Checks the database and the blob store concurrently.
pub(super) async fn healthcheck(State(state): State<HttpState>, method: Method) -> Response {
    let (db, storage) = tokio::join!(state.source.health_check(), state.store.health_check());

    let failure = match (&db, &storage) {
        (Err(err), _) => Some(ErrorReport::from_error(
            SOURCE,
            StatusCode::SERVICE_UNAVAILABLE,
            err,
        )),
        (_, Err(err)) => Some(ErrorReport::from_error(
            SOURCE,
            StatusCode::SERVICE_UNAVAILABLE,
            err,
        )),
        _ => None,
    };
    if let Some(report) = failure {
        let mut response = error_body(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
        report.attach(&mut response);
        return response;
    }

    if method == Method::HEAD {
        return StatusCode::NO_CONTENT.into_response();
    }

    let now = db.unwrap_or_default();
    Json(HealthBody {
        db: format!("healthy - {now}"),
        storage: format!("healthy - {}", state.container),
    })
    .into_response()
}
