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

//! # The Clusters service
//!
//! Two RPCs:
//!
//! - `Cluster`: cluster a batch of test failures on demand, against the project's current
//!   configuration & rules
//! - `BatchGetPresubmitImpact`: read the presubmit impact of a batch of clusters
//!
//! Both are served as `POST /prpc/faultline.v1.Clusters/{method}` with JSON bodies.

use std::{collections::HashMap, sync::Arc};

use axum::{
    Extension, Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::post,
};
use lazy_static::lazy_static;
use regex::Regex;
use snafu::{Backtrace, prelude::*};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, info};

use faultline_shared::{PROJECT_ID_PATTERN, ProjectId, RuleId, api};

use crate::{
    algorithms::{self, ALGORITHMS_VERSION},
    analysis::{self, ClusterPresubmitImpact},
    authn::{Identity, authenticate},
    clustering::{self, ClusterId, Failure},
    counter_add,
    entities::parse_project_name,
    faultline::Faultline,
    http::{Code, error_response},
    metrics::{self, Sort},
    ruleset::{self, Consistency},
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read cluster analysis: {source}"))]
    Analysis { source: analysis::Error },
    #[snafu(display("name {index}: invalid cluster presubmit impact name: {source}"))]
    BadClusterId {
        index: usize,
        source: clustering::Error,
    },
    #[snafu(display(
        "name {index}: invalid cluster presubmit impact name, expected format: \
         projects/{{project}}/clusters/{{cluster_alg}}/{{cluster_id}}/presubmitImpact"
    ))]
    BadImpactName { index: usize, backtrace: Backtrace },
    #[snafu(display("parent: invalid project name, expected format: projects/{{project}}"))]
    BadParent { parent: String, backtrace: Backtrace },
    #[snafu(display("project is not valid: {source}"))]
    BadProject { source: faultline_shared::Error },
    #[snafu(display("Failed to cluster test results: {source}"))]
    ClusteringTask {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("test result {index}: test ID must not be empty"))]
    EmptyTestId { index: usize, backtrace: Backtrace },
    #[snafu(display(
        "project does not exist in faultline or cluster analysis is not yet available"
    ))]
    NoAnalysis { project: ProjectId },
    #[snafu(display("names must be specified"))]
    NoNames { backtrace: Backtrace },
    #[snafu(display("project must be specified"))]
    NoProject { backtrace: Backtrace },
    #[snafu(display("project does not exist in faultline"))]
    NoSuchProject {
        project: ProjectId,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read reclustering progress: {source}"))]
    Progress { source: analysis::Error },
    #[snafu(display("name {index}: project must match parent project ({project:?})"))]
    ProjectMismatch {
        index: usize,
        project: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read rules: {source}"))]
    ReadRules { source: storage::Error },
    #[snafu(display("Failed to read the ruleset: {source}"))]
    Ruleset { source: ruleset::Error },
    #[snafu(display(
        "too many names: presubmit impact for at most {MAX_BATCH_GET_PRESUBMIT_IMPACT_SIZE} \
         clusters can be retrieved in one request"
    ))]
    TooManyNames { count: usize, backtrace: Backtrace },
    #[snafu(display(
        "too many test results: at most {MAX_CLUSTER_REQUEST_SIZE} test results can be clustered \
         in one request"
    ))]
    TooManyTestResults { count: usize, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn as_code_and_msg(&self) -> (Code, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::BadClusterId { .. }
            | Error::BadImpactName { .. }
            | Error::BadParent { .. }
            | Error::BadProject { .. }
            | Error::EmptyTestId { .. }
            | Error::NoNames { .. }
            | Error::NoProject { .. }
            | Error::ProjectMismatch { .. }
            | Error::TooManyNames { .. }
            | Error::TooManyTestResults { .. } => (Code::InvalidArgument, format!("{}", self)),
            Error::NoSuchProject { .. } => (Code::FailedPrecondition, format!("{}", self)),
            Error::NoAnalysis { .. } => (Code::NotFound, format!("{}", self)),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Analysis { .. }
            | Error::ClusteringTask { .. }
            | Error::Progress { .. }
            | Error::ReadRules { .. }
            | Error::Ruleset { .. } => (Code::Internal, format!("{}", self)),
        }
    }
    fn is_internal(&self) -> bool {
        self.as_code_and_msg().0 == Code::Internal
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_code_and_msg();
        error_response(code, msg)
    }
}

/// Log a failed RPC at a level befitting whose fault it was
fn log_failure(method: &str, err: &Error) {
    if err.is_internal() {
        error!("{} failed: {:#?}", method, err);
    } else {
        info!("{} refused: {}", method, err);
    }
}

/// The maximum number of test results that may be clustered in one request
pub const MAX_CLUSTER_REQUEST_SIZE: usize = 1000;

/// The maximum number of clusters whose impact may be read in one request
pub const MAX_BATCH_GET_PRESUBMIT_IMPACT_SIZE: usize = 1000;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            `Cluster`                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("clusters.cluster.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("clusters.cluster.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("clusters.test.results", Sort::IntegralCounter) }

pub(crate) async fn cluster1(state: &Faultline, req: api::ClusterReq) -> Result<api::ClusterRsp> {
    ensure!(
        req.test_results.len() <= MAX_CLUSTER_REQUEST_SIZE,
        TooManyTestResultsSnafu {
            count: req.test_results.len()
        }
    );
    if let Some(index) = req.test_results.iter().position(|tr| tr.test_id.is_empty()) {
        return EmptyTestIdSnafu { index }.fail();
    }
    ensure!(!req.project.is_empty(), NoProjectSnafu);
    let project = ProjectId::new(&req.project).context(BadProjectSnafu)?;

    let config = state
        .configs
        .project_config(&project)
        .await
        .context(NoSuchProjectSnafu {
            project: project.clone(),
        })?;
    // Clustering on demand must reflect every rule committed before the request
    let ruleset = state
        .rulesets
        .ruleset(&project, Consistency::Strong)
        .await
        .context(RulesetSnafu)?;

    let failures = req.test_results.iter().map(Failure::from).collect::<Vec<_>>();
    let clusters = {
        let config = config.clone();
        let ruleset = ruleset.clone();
        tokio::task::spawn_blocking(move || {
            failures
                .iter()
                .map(|failure| algorithms::cluster(&config, &ruleset, failure))
                .collect::<Vec<_>>()
        })
        .await
        .context(ClusteringTaskSnafu)?
    };

    let clustered_test_results = req
        .test_results
        .into_iter()
        .zip(clusters)
        .map(|(test_result, ids)| api::ClusteredTestResult {
            request_tag: test_result.request_tag,
            clusters: ids
                .into_iter()
                .map(|id| {
                    let bug = id
                        .is_bug_cluster()
                        .then(|| RuleId::new(&id.id).ok())
                        .flatten()
                        .and_then(|rule_id| ruleset.active_rule(&rule_id))
                        .map(|cached| config.associated_bug(&cached.rule.bug));
                    api::ClusterEntry {
                        cluster_id: id.to_wire(),
                        bug,
                    }
                })
                .collect(),
        })
        .collect::<Vec<_>>();

    Ok(api::ClusterRsp {
        clustered_test_results,
        clustering_version: api::ClusteringVersion {
            algorithms_version: ALGORITHMS_VERSION,
            rules_version: ruleset.version().predicates,
            config_version: config.version(),
        },
    })
}

async fn cluster(
    State(state): State<Arc<Faultline>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<api::ClusterReq>,
) -> axum::response::Response {
    let count = req.test_results.len();
    match cluster1(&state, req).await {
        Ok(rsp) => {
            debug!("{} clustered {} test results", identity.email, count);
            counter_add!(state.instruments, "clusters.cluster.successes", 1, &[]);
            counter_add!(state.instruments, "clusters.test.results", count as u64, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            log_failure("Cluster", &err);
            counter_add!(state.instruments, "clusters.cluster.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   `BatchGetPresubmitImpact`                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("clusters.impact.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("clusters.impact.failures", Sort::IntegralCounter) }

lazy_static! {
    static ref IMPACT_NAME: Regex = Regex::new(&format!(
        "^projects/({})/clusters/([^/]+)/([^/]+)/presubmitImpact$",
        PROJECT_ID_PATTERN
    ))
    .unwrap(/* known good */);
}

/// Parse & validate the `index`-th name in a request for impact in `project`
fn parse_impact_name(index: usize, name: &str, project: &ProjectId) -> Result<ClusterId> {
    let captures = IMPACT_NAME
        .captures(name)
        .context(BadImpactNameSnafu { index })?;
    let cluster_id = ClusterId::from_wire(&captures[2], &captures[3]);
    cluster_id.validate().context(BadClusterIdSnafu { index })?;
    ensure!(
        &captures[1] == &**project,
        ProjectMismatchSnafu {
            index,
            project: project.to_string()
        }
    );
    Ok(cluster_id)
}

pub(crate) async fn batch_get_presubmit_impact1(
    state: &Faultline,
    req: api::BatchGetPresubmitImpactReq,
) -> Result<api::BatchGetPresubmitImpactRsp> {
    let project = parse_project_name(&req.parent).context(BadParentSnafu {
        parent: req.parent.clone(),
    })?;
    ensure!(!req.names.is_empty(), NoNamesSnafu);
    ensure!(
        req.names.len() <= MAX_BATCH_GET_PRESUBMIT_IMPACT_SIZE,
        TooManyNamesSnafu {
            count: req.names.len()
        }
    );
    let cluster_ids = req
        .names
        .iter()
        .enumerate()
        .map(|(index, name)| parse_impact_name(index, name, &project))
        .collect::<Result<Vec<_>>>()?;

    // Bug clusters need their rules to decide whose impact to report
    let mut rule_ids = cluster_ids
        .iter()
        .filter(|id| id.is_bug_cluster())
        .filter_map(|id| RuleId::new(&id.id).ok())
        .collect::<Vec<_>>();
    rule_ids.sort();
    rule_ids.dedup();
    let rules: HashMap<RuleId, _> = state
        .storage
        .read_many_rules(&project, &rule_ids)
        .await
        .context(ReadRulesSnafu)?
        .into_iter()
        .flatten()
        .map(|rule| (rule.rule_id.clone(), rule))
        .collect();
    let completed = state
        .progress
        .rules_version_completed(&project)
        .await
        .context(ProgressSnafu)?;

    // The cluster whose impact each request should report, if any
    let sources = cluster_ids
        .iter()
        .map(|id| {
            if !id.is_bug_cluster() {
                return Some(id.clone());
            }
            let rule = RuleId::new(&id.id)
                .ok()
                .and_then(|rule_id| rules.get(&rule_id))
                .filter(|rule| rule.is_active)?;
            // Until reclustering catches up with a new rule, its cluster has no failures of its
            // own; report those of the cluster it was created from instead
            if rule.creation_time > completed && !rule.source_cluster.is_empty() {
                Some(rule.source_cluster.clone())
            } else {
                Some(id.clone())
            }
        })
        .collect::<Vec<_>>();

    let mut to_read = sources.iter().flatten().cloned().collect::<Vec<_>>();
    to_read.sort();
    to_read.dedup();
    let impacts: HashMap<ClusterId, ClusterPresubmitImpact> = state
        .analysis
        .read_cluster_presubmit_impact(&project, &to_read)
        .await
        .map_err(|err| match err {
            analysis::Error::ProjectNotExists { project, .. } => Error::NoAnalysis { project },
            err => Error::Analysis { source: err },
        })?
        .into_iter()
        .map(|impact| (impact.cluster_id.clone(), impact))
        .collect();

    Ok(api::BatchGetPresubmitImpactRsp {
        presubmit_impact: req
            .names
            .into_iter()
            .zip(sources)
            .map(|(name, source)| {
                let impact = source.as_ref().and_then(|id| impacts.get(id));
                api::ClusterPresubmitImpact {
                    name,
                    distinct_cl_test_runs_failed_12h: impact
                        .map(|i| i.distinct_cl_test_runs_failed_12h)
                        .unwrap_or(0),
                    distinct_cl_test_runs_failed_24h: impact
                        .map(|i| i.distinct_cl_test_runs_failed_1d)
                        .unwrap_or(0),
                }
            })
            .collect(),
    })
}

async fn batch_get_presubmit_impact(
    State(state): State<Arc<Faultline>>,
    Json(req): Json<api::BatchGetPresubmitImpactReq>,
) -> axum::response::Response {
    match batch_get_presubmit_impact1(&state, req).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "clusters.impact.successes", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            log_failure("BatchGetPresubmitImpact", &err);
            counter_add!(state.instruments, "clusters.impact.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         public API                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Faultline>) -> Router<Arc<Faultline>> {
    Router::new()
        .route("/Cluster", post(cluster))
        .route("/BatchGetPresubmitImpact", post(batch_get_presubmit_impact))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            authenticate,
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
