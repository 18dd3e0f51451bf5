// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of faultline.
//
// faultline is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// faultline is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with faultline.  If not,
// see <http://www.gnu.org/licenses/>.

//! # HTTP plumbing shared by the RPC services
//!
//! faultline speaks a simple JSON-over-HTTP RPC dialect. Every failed call returns an
//! [ErrorResponseBody] naming one of a small set of canonical [Code]s along with a message meant
//! for the caller.

use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};

/// Canonical RPC error codes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Code {
    /// The request was malformed; the caller should fix it & not retry as-is
    InvalidArgument,
    /// The system isn't in a state to serve the request (e.g. the project isn't configured)
    FailedPrecondition,
    NotFound,
    /// A concurrency conflict; re-read & retry
    Aborted,
    PermissionDenied,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::NotFound => "NOT_FOUND",
            Code::Aborted => "ABORTED",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::Internal => "INTERNAL",
        }
    }
    pub fn status(&self) -> StatusCode {
        match self {
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::Aborted => StatusCode::CONFLICT,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A serializable struct for use in HTTP error responses
///
/// This is intended to be used in the [IntoResponse] implementations for whatever error type
/// an axum handler is using.
///
/// [IntoResponse]: https://docs.rs/axum/latest/axum/response/trait.IntoResponse.html
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub code: String,
    pub error: String,
}

/// Build the response for a failed RPC
///
/// Internal errors are reported opaquely; the details belong in the server log, not on the wire.
pub fn error_response(code: Code, msg: String) -> axum::response::Response {
    use axum::response::IntoResponse;
    let error = match code {
        Code::Internal => "internal server error".to_owned(),
        _ => msg,
    };
    (
        code.status(),
        Json(ErrorResponseBody {
            code: code.as_str().to_owned(),
            error,
        }),
    )
        .into_response()
}
