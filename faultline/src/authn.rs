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

//! # Authentication & access control
//!
//! Every faultline RPC is restricted to members of a single access group. Callers authenticate
//! with an API key (`Authorization: Bearer <key>`); the configured identities map keys to an
//! e-mail address & a set of groups. The [authenticate] middleware resolves the caller's
//! [Identity], rejects non-members, & attaches the [Identity] to the request for the handlers
//! (which record the e-mail on the rules they write).

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::IntoResponse,
};
use itertools::Itertools;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use snafu::{Backtrace, prelude::*};
use tracing::{debug, info};

use crate::{
    counter_add,
    faultline::Faultline,
    http::{Code, error_response},
    metrics::{self, Sort},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Authorization header {value:?} couldn't be parsed"))]
    BadAuthHeaderParse {
        value: HeaderValue,
        backtrace: Backtrace,
    },
    #[snafu(display("An Authorization header had a non-textual value: {source}"))]
    InvalidAuthHeaderValue {
        source: axum::http::header::ToStrError,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple Authorization headers"))]
    MultipleAuthnHeaders { backtrace: Backtrace },
    #[snafu(display("{caller} is not a member of {group}"))]
    NotAMember {
        caller: String,
        group: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown API key"))]
    UnknownKey { backtrace: Backtrace },
    #[snafu(display("Authorization scheme {scheme} not supported"))]
    UnsupportedAuthScheme {
        scheme: String,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn as_code_and_msg(&self, group: &str) -> (Code, String) {
        match self {
            Error::MultipleAuthnHeaders { .. } => (
                Code::InvalidArgument,
                "multiple Authorization headers".to_owned(),
            ),
            // Don't tell the caller any more than they need to know
            _ => (Code::PermissionDenied, format!("not a member of {}", group)),
        }
    }
}

inventory::submit! { metrics::Registration::new("auth.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("auth.failures", Sort::IntegralCounter) }

/// The group to which callers must belong absent other configuration
pub const DEFAULT_ACCESS_GROUP: &str = "faultline-access";

/// An authenticated caller
#[derive(Clone, Debug, Deserialize)]
pub struct Identity {
    pub email: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn is_member(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// A configured API key & the identity it authenticates
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeyedIdentity {
    pub api_key: SecretString,
    #[serde(flatten)]
    pub identity: Identity,
}

/// Access control configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AccessControl {
    /// Callers must be members of this group
    pub group: String,
    pub identities: Vec<KeyedIdentity>,
}

impl Default for AccessControl {
    fn default() -> Self {
        AccessControl {
            group: DEFAULT_ACCESS_GROUP.to_owned(),
            identities: Vec::new(),
        }
    }
}

impl AccessControl {
    fn identify(&self, key: &str) -> Option<&Identity> {
        self.identities
            .iter()
            .find(|keyed| keyed.api_key.expose_secret() == key)
            .map(|keyed| &keyed.identity)
    }
    /// Resolve the caller presenting `headers` & check they may use faultline
    fn authorize(&self, headers: &HeaderMap) -> Result<Identity> {
        // Reject requests with more than one Authorization header outright; it's too ambiguous
        let identity = match headers
            .get_all(header::AUTHORIZATION)
            .into_iter()
            .at_most_one()
            .map_err(|_| MultipleAuthnHeadersSnafu.build())?
        {
            Some(value) => {
                let (scheme, key) = value
                    .to_str()
                    .context(InvalidAuthHeaderValueSnafu)?
                    .split_ascii_whitespace()
                    .collect_tuple()
                    .context(BadAuthHeaderParseSnafu {
                        value: value.clone(),
                    })?;
                ensure!(
                    scheme.eq_ignore_ascii_case("bearer"),
                    UnsupportedAuthSchemeSnafu { scheme }
                );
                Some(self.identify(key).context(UnknownKeySnafu)?)
            }
            None => None,
        };
        match identity {
            Some(identity) if identity.is_member(&self.group) => Ok(identity.clone()),
            _ => NotAMemberSnafu {
                caller: identity
                    .map(|i| i.email.clone())
                    .unwrap_or_else(|| "anonymous".to_owned()),
                group: &self.group,
            }
            .fail(),
        }
    }
}

/// Authentication & authorization middleware for every RPC
pub async fn authenticate(
    State(state): State<Arc<Faultline>>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    match state.access.authorize(&headers) {
        Ok(identity) => {
            debug!("faultline authorized {}", identity.email);
            request.extensions_mut().insert(identity);
            counter_add!(state.instruments, "auth.successes", 1, &[]);
            next.run(request).await
        }
        Err(err) => {
            info!("faultline refused this request: {}", err);
            counter_add!(state.instruments, "auth.failures", 1, &[]);
            let (code, msg) = err.as_code_and_msg(&state.access.group);
            error_response(code, msg).into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn access() -> AccessControl {
        toml::from_str(
            r#"
group = "faultline-access"
[[identities]]
api-key = "sekrit"
email = "someone@example.com"
groups = ["faultline-access", "others"]
[[identities]]
api-key = "outsider"
email = "outsider@example.com"
"#,
        )
        .unwrap()
    }

    fn headers(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(
                header::AUTHORIZATION,
                HeaderValue::from_static(value),
            );
        }
        headers
    }

    #[test]
    fn authorization() {
        let access = access();
        let identity = access.authorize(&headers(&["Bearer sekrit"])).unwrap();
        assert_eq!("someone@example.com", identity.email);
        assert!(access.authorize(&headers(&["bearer sekrit"])).is_ok());

        for bad in [
            headers(&[]),
            headers(&["Bearer outsider"]),
            headers(&["Bearer nope"]),
            headers(&["Basic sekrit"]),
            headers(&["Bearer"]),
        ] {
            let err = access.authorize(&bad).unwrap_err();
            assert_eq!(
                (
                    Code::PermissionDenied,
                    "not a member of faultline-access".to_owned()
                ),
                err.as_code_and_msg(&access.group)
            );
        }

        let err = access
            .authorize(&headers(&["Bearer sekrit", "Bearer sekrit"]))
            .unwrap_err();
        assert_eq!(Code::InvalidArgument, err.as_code_and_msg(&access.group).0);
    }

    #[test]
    fn defaults() {
        let access: AccessControl = toml::from_str("").unwrap();
        assert_eq!(DEFAULT_ACCESS_GROUP, access.group);
        assert!(access.identities.is_empty());
    }
}
