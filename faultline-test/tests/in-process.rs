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

//! # In-process Integration Tests
//!
//! The fixture: a faultline server running inside this very process, on an ephemeral port, backed
//! by the in-memory rule store. Two projects are configured ("chromium" & "testproject"), and
//! presubmit impact is seeded for "chromium" only.
//!
//! libtest-mimic runs each trial on a thread of its own; the server runs on a separate
//! (multi-threaded) Tokio runtime that outlives them all.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc, time::Duration};

use libtest_mimic::{Arguments, Trial};
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use reqwest::Url;
use snafu::{prelude::*, Backtrace};
use tokio::net::TcpListener;

use faultline::{
    analysis::{ClusterPresubmitImpact, Dataset},
    authn::AccessControl,
    clustering::ClusterId,
    config::{MonorailConfig, ProjectConfig, StaticConfig},
    entities::STARTING_EPOCH,
    faultline::{Collaborators, Faultline},
    memory::InMemory,
    server::make_router,
};
use faultline_shared::ProjectId;
use faultline_test::{
    clusters::{self, SEEDED_CLUSTER_ID, SEEDED_IMPACT_12H, SEEDED_IMPACT_1D},
    rules, test_healthcheck,
};

use common::{Configuration, Test, block_on};

mod common;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Failed to parse the access control fixture: {source}"))]
    Access {
        source: toml::de::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to bind a listening socket: {source}"))]
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid project configuration: {source}"))]
    Projects { source: faultline::config::Error },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
    #[snafu(display("Failed to form the server URL: {source}"))]
    Url { source: url::ParseError },
}

type Result<T> = std::result::Result<T, Error>;

const API_KEY: &str = "b3c2a8e4f0d94f3fa9e1d1c2b7a6e5f4";

fn projects() -> HashMap<ProjectId, ProjectConfig> {
    [
        ("chromium", "chromium", "crbug.com"),
        ("testproject", "monorailproject", "mybug.com"),
    ]
    .into_iter()
    .map(|(project, monorail, prefix)| {
        (
            ProjectId::new(project).unwrap(/* known good */),
            ProjectConfig {
                monorail: MonorailConfig {
                    project: monorail.to_owned(),
                    display_prefix: prefix.to_owned(),
                    monorail_hostname: "monorailhost.com".to_owned(),
                },
                ..Default::default()
            },
        )
    })
    .collect()
}

fn state() -> Result<Arc<Faultline>> {
    let access: AccessControl = toml::from_str(&format!(
        r#"
group = "faultline-access"
[[identities]]
api-key = "{API_KEY}"
email = "tester@example.com"
groups = ["faultline-access"]
"#
    ))
    .context(AccessSnafu)?;

    let mut dataset = Dataset::empty();
    dataset.insert(
        ProjectId::new("chromium").unwrap(/* known good */),
        *STARTING_EPOCH,
        vec![ClusterPresubmitImpact {
            cluster_id: ClusterId::new("reason-v1", SEEDED_CLUSTER_ID),
            distinct_cl_test_runs_failed_12h: SEEDED_IMPACT_12H,
            distinct_cl_test_runs_failed_1d: SEEDED_IMPACT_1D,
        }],
    );
    let dataset = Arc::new(dataset);

    Ok(Arc::new(Faultline::new(
        Collaborators {
            storage: Arc::new(InMemory::new()),
            configs: Arc::new(StaticConfig::new(&projects()).context(ProjectsSnafu)?),
            analysis: dataset.clone(),
            progress: dataset,
        },
        access,
        Duration::from_secs(60),
        NonZeroUsize::new(8).unwrap(/* known good */),
        PrometheusExporter::new(),
    )))
}

inventory::submit!(Test {
    name: "test_healthcheck",
    test_fn: |cfg| block_on(test_healthcheck(cfg.url)),
});

inventory::submit!(Test {
    name: "test_cluster",
    test_fn: |cfg| block_on(clusters::test_cluster(&cfg.url, &cfg.api_key)),
});

inventory::submit!(Test {
    name: "test_cluster_validation",
    test_fn: |cfg| block_on(clusters::test_cluster_validation(&cfg.url, &cfg.api_key)),
});

inventory::submit!(Test {
    name: "test_presubmit_impact",
    test_fn: |cfg| block_on(clusters::test_presubmit_impact(&cfg.url, &cfg.api_key)),
});

inventory::submit!(Test {
    name: "test_rule_lifecycle",
    test_fn: |cfg| block_on(rules::test_rule_lifecycle(&cfg.url, &cfg.api_key)),
});

inventory::submit!(Test {
    name: "test_rule_validation",
    test_fn: |cfg| block_on(rules::test_rule_validation(&cfg.url, &cfg.api_key)),
});

inventory::submit!(Test {
    name: "test_bug_management",
    test_fn: |cfg| block_on(rules::test_bug_management(&cfg.url, &cfg.api_key)),
});

fn main() -> Result<()> {
    let args = Arguments::from_args();

    let runtime = tokio::runtime::Runtime::new().context(TokioRuntimeSnafu)?;
    let state = state()?;
    let listener = runtime
        .block_on(TcpListener::bind("127.0.0.1:0"))
        .context(BindSnafu)?;
    let addr = listener.local_addr().context(BindSnafu)?;
    runtime.spawn(async move { axum::serve(listener, make_router(state)).await });

    let cfg = Configuration {
        url: Url::parse(&format!("http://{}", addr)).context(UrlSnafu)?,
        api_key: API_KEY.to_owned(),
    };

    let conclusion = libtest_mimic::run(
        &args,
        inventory::iter::<Test>
            .into_iter()
            .map(|test| {
                let cfg = cfg.clone();
                let test_fn = test.test_fn;
                Trial::test(test.name, move || test_fn(cfg))
            })
            .collect(),
    );

    drop(runtime);
    conclusion.exit();
}
