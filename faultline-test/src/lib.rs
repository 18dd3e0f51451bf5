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

//! # The faultline Integration Tests
//!
//! Rust's built-in test harness is oriented toward testing *libraries*; there's no notion of a
//! fixture shared by several tests. So the integration tests in this crate opt out of it
//! (`harness = false` in Cargo.toml) & use [libtest-mimic] instead, with each integration test
//! program acting as a fixture unto itself.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! # Project Structure
//!
//! Test bodies applicable to any fixture live here, in the library, as async functions returning
//! `Result<(), Failed>` so that they can use `?` on fallible code whose failure isn't the point of
//! the test. Code relating to the test framework itself (e.g. the `Test` struct) belongs in
//! `tests/common`; the integration test programs themselves go in `tests`.
//!
//! Tests may run concurrently against one server, so each works with bugs & rules of its own.

use libtest_mimic::Failed;
use reqwest::{
    StatusCode, Url,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use serde::{Serialize, de::DeserializeOwned};

use faultline::http::ErrorResponseBody;

pub mod clusters;
pub mod rules;

/// Hit the faultline healthcheck endpoint
pub async fn test_healthcheck(url: Url) -> Result<(), Failed> {
    assert_eq!(
        "GOOD",
        reqwest::get(url.join("/healthcheck")?).await?.text().await?
    );
    Ok(())
}

/// A faultline RPC client
pub struct Client {
    client: reqwest::Client,
    url: Url,
}

impl Client {
    /// A client presenting `api_key`, or no credentials at all
    pub fn new(url: &Url, api_key: Option<&str>) -> Result<Client, Failed> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", api_key))?,
            );
        }
        Ok(Client {
            client: reqwest::Client::builder()
                .default_headers(headers)
                .build()?,
            url: url.clone(),
        })
    }
    async fn post<Req: Serialize>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
    ) -> Result<reqwest::Response, Failed> {
        Ok(self
            .client
            .post(
                self.url
                    .join(&format!("/prpc/faultline.v1.{}/{}", service, method))?,
            )
            .json(req)
            .send()
            .await?)
    }
    /// Make an RPC that is expected to succeed
    pub async fn call<Req: Serialize, Rsp: DeserializeOwned>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
    ) -> Result<Rsp, Failed> {
        let rsp = self.post(service, method, req).await?;
        if StatusCode::OK != rsp.status() {
            return Err(format!(
                "{}/{} failed with {}: {}",
                service,
                method,
                rsp.status(),
                rsp.text().await?
            )
            .into());
        }
        Ok(rsp.json::<Rsp>().await?)
    }
    /// Make an RPC that is expected to fail; return the HTTP status & error body
    pub async fn call_err<Req: Serialize>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
    ) -> Result<(StatusCode, ErrorResponseBody), Failed> {
        let rsp = self.post(service, method, req).await?;
        let status = rsp.status();
        if status.is_success() {
            return Err(format!("{}/{} unexpectedly succeeded", service, method).into());
        }
        Ok((status, rsp.json::<ErrorResponseBody>().await?))
    }
}
