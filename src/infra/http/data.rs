use std::str::FromStr;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        HeaderValue, Method, StatusCode, Uri,
        header::{
            CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LANGUAGE, CONTENT_LOCATION, CONTENT_TYPE,
            LOCATION,
        },
        response::Builder,
    },
    response::{IntoResponse, Response},
};
use axum_extra::extract::{Query, QueryRejection};
use tracing::error;

use crate::{
    application::{
        data::{DataBody, DataResponse},
        error::{AppError, HttpError},
    },
    cache::blob::is_done,
    domain::{
        error::DomainError,
        request::{RequestMethod, RequestParams, ResponseFormat},
    },
};

use super::{CACHE_CONTROL_VALUE, CONTENT_LANGUAGE_VALUE, HttpState};

pub(super) async fn data(
    State(state): State<HttpState>,
    method: Method,
    uri: Uri,
    params: Result<Query<RequestParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => {
            return AppError::from(DomainError::validation(rejection.to_string())).into_response();
        }
    };
    let method = if method == Method::HEAD {
        RequestMethod::Head
    } else {
        RequestMethod::Get
    };

    match state.data.handle(&params, method).await {
        Ok(response) => render(response, &uri, &state.public_url),
        Err(err) => err.into_response(),
    }
}

pub(super) async fn unsupported_method(method: Method) -> Response {
    AppError::from(DomainError::validation(format!(
        "Invalid method `{method}`; only GET and HEAD are supported."
    )))
    .into_response()
}

pub(super) async fn not_found(uri: Uri) -> Response {
    HttpError::new(
        "infra::http::data::not_found",
        StatusCode::NOT_FOUND,
        "Not found",
        format!("no route for `{}`", uri.path()),
    )
    .into_response()
}

fn with_cache_headers(builder: Builder, response: &DataResponse, permalink: &str) -> Builder {
    let disposition = format!(
        "attachment; filename=\"{}\"",
        response.descriptor.download_filename()
    );
    let builder = builder
        .header(CACHE_CONTROL, CACHE_CONTROL_VALUE)
        .header(CONTENT_LANGUAGE, CONTENT_LANGUAGE_VALUE)
        .header(CONTENT_DISPOSITION, disposition);
    match HeaderValue::from_str(permalink) {
        Ok(value) => builder.header(CONTENT_LOCATION, value),
        Err(_) => builder,
    }
}

fn permalink(uri: &Uri, public_url: &str) -> String {
    match uri.query() {
        Some(query) => format!("{public_url}{}?{query}", uri.path()),
        None => format!("{public_url}{}", uri.path()),
    }
}

fn render(response: DataResponse, uri: &Uri, public_url: &str) -> Response {
    let permalink = permalink(uri, public_url);
    let content_type = response.descriptor.format.content_type();

    let result = match response.body {
        DataBody::Redirect(ref location) => {
            with_cache_headers(Response::builder(), &response, &permalink)
                .status(StatusCode::TEMPORARY_REDIRECT)
                .header(LOCATION, location.as_str())
                .body(Body::empty())
        }
        _ => {
            let builder = with_cache_headers(Response::builder(), &response, &permalink)
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type);
            match response.body {
                DataBody::Inline(bytes) => builder.body(Body::from(bytes)),
                DataBody::Stream(chunks) => builder.body(Body::from_stream(chunks)),
                DataBody::Empty | DataBody::Redirect(_) => builder.body(Body::empty()),
            }
        }
    };

    result.unwrap_or_else(|err| {
        error!(
            target = "ondata::http::data",
            error = %err,
            "failed to assemble data response"
        );
        AppError::unexpected(err.to_string()).into_response()
    })
}

/// Serves finished cache entries; the redirect target of cached responses.
pub(super) async fn download(
    State(state): State<HttpState>,
    Path((container, path)): Path<(String, String)>,
) -> Response {
    const SOURCE: &str = "infra::http::data::download";
    let missing = || {
        HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Not found",
            "The requested file is not available",
        )
        .into_response()
    };

    if container != state.container {
        return missing();
    }

    match state.store.get_tags(&path).await {
        Ok(tags) if is_done(&tags) => {}
        Ok(_) => return missing(),
        Err(err) if err.is_not_found() => return missing(),
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read cached file",
                &err,
            )
            .into_response();
        }
    }

    let bytes = match state.store.download(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.is_not_found() => return missing(),
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read cached file",
                &err,
            )
            .into_response();
        }
    };

    let content_type = path
        .rsplit_once('.')
        .and_then(|(_, extension)| ResponseFormat::from_str(extension).ok())
        .map_or("application/octet-stream", ResponseFormat::content_type);

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CACHE_CONTROL, CACHE_CONTROL_VALUE)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permalink_keeps_the_query() {
        let uri: Uri = "/api/v2/data?areaType=nation&metric=newCasesByPublishDate"
            .parse()
            .expect("uri");
        assert_eq!(
            permalink(&uri, "https://api.example.org"),
            "https://api.example.org/api/v2/data?areaType=nation&metric=newCasesByPublishDate"
        );
    }
}
