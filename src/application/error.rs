use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    application::producer::ProduceError,
    cache::{CoordinatorError, WriterError},
    domain::error::DomainError,
    infra::error::InfraError,
};

pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred whilst processing your request, please \
     try again. If the problem persists, please report as an issue and include your request.";

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Body shape shared by every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub response: &'a str,
    pub status_code: u16,
}

pub fn error_body(status: StatusCode, message: &str) -> Response {
    if status == StatusCode::NO_CONTENT {
        return status.into_response();
    }
    (
        status,
        Json(ErrorBody {
            response: message,
            status_code: status.as_u16(),
        }),
    )
        .into_response()
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = error_body(self.status, self.public_message);
        self.report.attach(&mut response);
        response
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Produce(ProduceError),
    #[error(transparent)]
    Cache(#[from] CoordinatorError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("no data is available for the request")]
    NotAvailable,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<ProduceError> for AppError {
    fn from(error: ProduceError) -> Self {
        match error {
            ProduceError::NotAvailable => AppError::NotAvailable,
            ProduceError::Domain(err) => AppError::Domain(err),
            other => AppError::Produce(other),
        }
    }
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotAvailable => StatusCode::NO_CONTENT,
            AppError::Domain(DomainError::Validation { .. }) => StatusCode::BAD_REQUEST,
            AppError::Domain(DomainError::InvalidQuery { .. }) => StatusCode::PRECONDITION_FAILED,
            AppError::Domain(DomainError::Invariant { .. })
            | AppError::Infra(_)
            | AppError::Produce(_)
            | AppError::Cache(_)
            | AppError::Writer(_)
            | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to clients; internal detail stays in the logs.
    pub fn presentation_message(&self) -> String {
        match self {
            AppError::NotAvailable => String::new(),
            AppError::Domain(DomainError::Validation { message })
            | AppError::Domain(DomainError::InvalidQuery { message }) => message.clone(),
            _ => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = error_body(status, &message);
        report.attach(&mut response);
        response
    }
}
