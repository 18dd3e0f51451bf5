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

//! # The Rules service
//!
//! Failure association rule lifecycle: `Get`, `List`, `Create`, `Update` & `LookupBug`, served as
//! `POST /prpc/faultline.v1.Rules/{method}` with JSON bodies.
//!
//! Two invariants over bugs are maintained at write time, inside the writing transaction:
//!
//! 1. within a project, at most one rule may cite a given bug
//! 2. across all projects, at most one rule may manage a given bug
//!
//! When creating a rule for a bug already managed elsewhere, the new rule quietly gives up
//! managing it. An update which explicitly asks to manage such a bug is refused instead.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::post,
};
use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use snafu::{Backtrace, prelude::*};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, info};

use faultline_shared::{BugId, ProjectId, RuleId, api};

use crate::{
    authn::{Identity, authenticate},
    clustering::ClusterId,
    config::{self, CompiledConfig},
    counter_add,
    entities::{
        self, FailureAssociationRule, STARTING_EPOCH, parse_project_name, parse_rule_name,
        validate_user,
    },
    faultline::Faultline,
    http::{Code, error_response},
    metrics::{self, Sort},
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("bug ID is not valid: {source}"))]
    BadBug { source: faultline_shared::Error },
    #[snafu(display("page token is not valid"))]
    BadPageToken { token: String, backtrace: Backtrace },
    #[snafu(display("invalid project name, expected format: projects/{{project}}"))]
    BadProjectName { name: String, backtrace: Backtrace },
    #[snafu(display("invalid rule name, expected format: projects/{{project}}/rules/{{rule_id}}"))]
    BadRuleName { name: String, backtrace: Backtrace },
    #[snafu(display("bug already used by a rule in the same project ({project}/{rule_id})"))]
    BugInUse {
        project: ProjectId,
        rule_id: RuleId,
        backtrace: Backtrace,
    },
    #[snafu(display("bug already managed by a rule in another project ({project}/{rule_id})"))]
    BugManagedElsewhere {
        project: ProjectId,
        rule_id: RuleId,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    BugNotInProject { source: config::Error },
    #[snafu(display("the rule was modified since it was last read; the update was not applied."))]
    EtagMismatch {
        expected: String,
        actual: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    InvalidRule { source: entities::Error },
    #[snafu(display("project does not exist in faultline"))]
    NoSuchProject {
        project: ProjectId,
        backtrace: Backtrace,
    },
    #[snafu(display("rule does not exist"))]
    NoSuchRule { name: String, backtrace: Backtrace },
    #[snafu(display("Rule store failure: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("unsupported field mask: {path}"))]
    UnsupportedMask { path: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn as_code_and_msg(&self) -> (Code, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::BadBug { .. }
            | Error::BadPageToken { .. }
            | Error::BadProjectName { .. }
            | Error::BadRuleName { .. }
            | Error::BugInUse { .. }
            | Error::BugManagedElsewhere { .. }
            | Error::BugNotInProject { .. }
            | Error::InvalidRule { .. }
            | Error::UnsupportedMask { .. } => (Code::InvalidArgument, format!("{}", self)),
            Error::NoSuchProject { .. } => (Code::FailedPrecondition, format!("{}", self)),
            Error::NoSuchRule { .. } => (Code::NotFound, format!("{}", self)),
            // The caller should re-read the rule & retry with the fresh ETag
            Error::EtagMismatch { .. } => (Code::Aborted, format!("{}", self)),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Storage { .. } => (Code::Internal, format!("{}", self)),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_code_and_msg();
        error_response(code, msg)
    }
}

fn log_failure(method: &str, err: &Error) {
    match err {
        Error::Storage { .. } => error!("{} failed: {:#?}", method, err),
        _ => info!("{} refused: {}", method, err),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           utilities                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn project_config(state: &Faultline, project: &ProjectId) -> Result<Arc<CompiledConfig>> {
    state
        .configs
        .project_config(project)
        .await
        .context(NoSuchProjectSnafu {
            project: project.clone(),
        })
}

/// Present `rule` to a caller
fn to_wire(rule: &FailureAssociationRule, config: &CompiledConfig) -> api::Rule {
    api::Rule {
        name: rule.name(),
        project: rule.project.to_string(),
        rule_id: rule.rule_id.to_string(),
        rule_definition: rule.rule_definition.clone(),
        bug: config.associated_bug(&rule.bug),
        is_active: rule.is_active,
        is_managing_bug: rule.is_managing_bug,
        source_cluster: rule.source_cluster.to_wire(),
        create_time: rule.creation_time,
        create_user: rule.creation_user.clone(),
        last_update_time: rule.last_updated,
        last_update_user: rule.last_updated_user.clone(),
        predicate_last_update_time: rule.predicate_last_updated,
        etag: rule.etag(),
    }
}

fn parse_bug(bug: &api::BugRef) -> Result<BugId> {
    BugId::parse(&bug.system, &bug.id).context(BadBugSnafu)
}

/// Validate `rule`, about to be written by `user` into a project configured per `config`
fn validate(rule: &FailureAssociationRule, user: &str, config: &CompiledConfig) -> Result<()> {
    rule.validate().context(InvalidRuleSnafu)?;
    validate_user(user).context(InvalidRuleSnafu)?;
    config.validate_bug(&rule.bug).context(BugNotInProjectSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             `Get`                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("rules.get.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("rules.get.failures", Sort::IntegralCounter) }

pub(crate) async fn get1(state: &Faultline, req: api::GetRuleReq) -> Result<api::Rule> {
    let (project, rule_id) = parse_rule_name(&req.name).context(BadRuleNameSnafu {
        name: req.name.clone(),
    })?;
    let config = project_config(state, &project).await?;
    let rule = state
        .storage
        .read_rule(&project, &rule_id)
        .await
        .context(StorageSnafu)?
        .context(NoSuchRuleSnafu { name: req.name })?;
    Ok(to_wire(&rule, &config))
}

async fn get(
    State(state): State<Arc<Faultline>>,
    Json(req): Json<api::GetRuleReq>,
) -> axum::response::Response {
    match get1(&state, req).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "rules.get.successes", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            log_failure("Get", &err);
            counter_add!(state.instruments, "rules.get.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             `List`                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("rules.list.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("rules.list.failures", Sort::IntegralCounter) }

/// Page tokens are the (encoded) ID of the last rule on the previous page
fn decode_page_token(token: &str) -> Result<Option<RuleId>> {
    if token.is_empty() {
        return Ok(None);
    }
    BASE64_URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|text| RuleId::new(&text).ok())
        .context(BadPageTokenSnafu { token })
        .map(Some)
}

pub(crate) async fn list1(state: &Faultline, req: api::ListRulesReq) -> Result<api::ListRulesRsp> {
    let project = parse_project_name(&req.parent).context(BadProjectNameSnafu {
        name: req.parent.clone(),
    })?;
    let after = decode_page_token(&req.page_token)?;
    let config = project_config(state, &project).await?;
    let mut rules = state
        .storage
        .read_active_rules(&project)
        .await
        .context(StorageSnafu)?;
    rules.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));

    let remaining = rules
        .iter()
        .filter(|rule| after.as_ref().is_none_or(|after| &rule.rule_id > after))
        .collect::<Vec<_>>();
    let (page, next_page_token) = match req.page_size as usize {
        0 => (remaining.as_slice(), String::new()),
        n if n >= remaining.len() => (remaining.as_slice(), String::new()),
        n => (
            &remaining[..n],
            BASE64_URL_SAFE_NO_PAD.encode(remaining[n - 1].rule_id.as_bytes()),
        ),
    };
    Ok(api::ListRulesRsp {
        rules: page.iter().map(|rule| to_wire(rule, &config)).collect(),
        next_page_token,
    })
}

async fn list(
    State(state): State<Arc<Faultline>>,
    Json(req): Json<api::ListRulesReq>,
) -> axum::response::Response {
    match list1(&state, req).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "rules.list.successes", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            log_failure("List", &err);
            counter_add!(state.instruments, "rules.list.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            `Create`                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("rules.create.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("rules.create.failures", Sort::IntegralCounter) }

pub(crate) async fn create1(
    state: &Faultline,
    user: &str,
    req: api::CreateRuleReq,
) -> Result<api::Rule> {
    let project = parse_project_name(&req.parent).context(BadProjectNameSnafu {
        name: req.parent.clone(),
    })?;
    let config = project_config(state, &project).await?;

    let mut rule = FailureAssociationRule {
        project,
        rule_id: RuleId::generate(),
        rule_definition: req.rule.rule_definition,
        bug: parse_bug(&req.rule.bug)?,
        is_active: req.rule.is_active,
        is_managing_bug: req.rule.is_managing_bug,
        source_cluster: ClusterId::from_wire(
            &req.rule.source_cluster.algorithm,
            &req.rule.source_cluster.id,
        ),
        // Assigned at commit
        creation_time: *STARTING_EPOCH,
        creation_user: user.to_owned(),
        last_updated: *STARTING_EPOCH,
        last_updated_user: user.to_owned(),
        predicate_last_updated: *STARTING_EPOCH,
    };
    validate(&rule, user, &config)?;

    let mut txn = state.storage.begin().await.context(StorageSnafu)?;
    let existing = txn
        .read_rules_by_bug(&rule.bug)
        .await
        .context(StorageSnafu)?;
    if existing.iter().any(|other| other.is_managing_bug) {
        rule.is_managing_bug = false;
    }
    if let Some(other) = existing.iter().find(|other| other.project == rule.project) {
        return BugInUseSnafu {
            project: other.project.clone(),
            rule_id: other.rule_id.clone(),
        }
        .fail();
    }
    txn.create_rule(&rule, user).context(StorageSnafu)?;
    let committed = txn.commit().await.context(StorageSnafu)?;

    rule.creation_time = committed;
    rule.last_updated = committed;
    rule.predicate_last_updated = committed;
    Ok(to_wire(&rule, &config))
}

async fn create(
    State(state): State<Arc<Faultline>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<api::CreateRuleReq>,
) -> axum::response::Response {
    match create1(&state, &identity.email, req).await {
        Ok(rsp) => {
            debug!("{} created {}", identity.email, rsp.name);
            counter_add!(state.instruments, "rules.create.successes", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            log_failure("Create", &err);
            counter_add!(state.instruments, "rules.create.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            `Update`                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("rules.update.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("rules.update.failures", Sort::IntegralCounter) }

pub(crate) async fn update1(
    state: &Faultline,
    user: &str,
    req: api::UpdateRuleReq,
) -> Result<api::Rule> {
    let (project, rule_id) = parse_rule_name(&req.rule.name).context(BadRuleNameSnafu {
        name: req.rule.name.clone(),
    })?;
    let config = project_config(state, &project).await?;

    let mut txn = state.storage.begin().await.context(StorageSnafu)?;
    let mut rule = txn
        .read_rule(&project, &rule_id)
        .await
        .context(StorageSnafu)?
        .context(NoSuchRuleSnafu {
            name: req.rule.name.clone(),
        })?;
    ensure!(
        req.etag.is_empty() || req.etag == rule.etag(),
        EtagMismatchSnafu {
            expected: req.etag.clone(),
            actual: rule.etag()
        }
    );

    let mut update_predicate = false;
    let mut update_bug = false;
    let mut update_bug_ownership = false;
    let mut managing_requested = false;
    for path in &req.update_mask.paths {
        match path.as_str() {
            "rule_definition" | "ruleDefinition" => {
                rule.rule_definition = req.rule.rule_definition.clone();
                update_predicate = true;
            }
            "bug" => {
                rule.bug = parse_bug(&req.rule.bug)?;
                update_bug = true;
                update_bug_ownership = true;
            }
            "is_active" | "isActive" => {
                rule.is_active = req.rule.is_active;
                update_predicate = true;
            }
            "is_managing_bug" | "isManagingBug" => {
                rule.is_managing_bug = req.rule.is_managing_bug;
                managing_requested = true;
                update_bug_ownership = true;
            }
            _ => return UnsupportedMaskSnafu { path }.fail(),
        }
    }
    // The bug is checked against the project's configuration only when it changes
    rule.validate().context(InvalidRuleSnafu)?;
    validate_user(user).context(InvalidRuleSnafu)?;
    if update_bug {
        config.validate_bug(&rule.bug).context(BugNotInProjectSnafu)?;
    }

    if update_bug_ownership {
        let others = txn
            .read_rules_by_bug(&rule.bug)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter(|other| !(other.project == rule.project && other.rule_id == rule.rule_id))
            .collect::<Vec<_>>();
        if let Some(other) = others.iter().find(|other| other.project == rule.project) {
            return BugInUseSnafu {
                project: other.project.clone(),
                rule_id: other.rule_id.clone(),
            }
            .fail();
        }
        for other in &others {
            if other.is_managing_bug {
                // An explicit request to manage the bug can't be honoured quietly
                ensure!(
                    !(managing_requested && req.rule.is_managing_bug),
                    BugManagedElsewhereSnafu {
                        project: other.project.clone(),
                        rule_id: other.rule_id.clone(),
                    }
                );
                rule.is_managing_bug = false;
            }
        }
    }

    txn.update_rule(&rule, update_predicate, user)
        .context(StorageSnafu)?;
    let committed = txn.commit().await.context(StorageSnafu)?;

    rule.last_updated = committed;
    rule.last_updated_user = user.to_owned();
    if update_predicate {
        rule.predicate_last_updated = committed;
    }
    Ok(to_wire(&rule, &config))
}

async fn update(
    State(state): State<Arc<Faultline>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<api::UpdateRuleReq>,
) -> axum::response::Response {
    match update1(&state, &identity.email, req).await {
        Ok(rsp) => {
            debug!("{} updated {}", identity.email, rsp.name);
            counter_add!(state.instruments, "rules.update.successes", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            log_failure("Update", &err);
            counter_add!(state.instruments, "rules.update.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          `LookupBug`                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("rules.lookup.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("rules.lookup.failures", Sort::IntegralCounter) }

pub(crate) async fn lookup_bug1(
    state: &Faultline,
    req: api::LookupBugReq,
) -> Result<api::LookupBugRsp> {
    let bug = BugId::parse(&req.system, &req.id).context(BadBugSnafu)?;
    Ok(api::LookupBugRsp {
        rules: state
            .storage
            .read_rules_by_bug(&bug)
            .await
            .context(StorageSnafu)?
            .iter()
            .map(|rule| rule.name())
            .collect(),
    })
}

async fn lookup_bug(
    State(state): State<Arc<Faultline>>,
    Json(req): Json<api::LookupBugReq>,
) -> axum::response::Response {
    match lookup_bug1(&state, req).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "rules.lookup.successes", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            log_failure("LookupBug", &err);
            counter_add!(state.instruments, "rules.lookup.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         public API                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Faultline>) -> Router<Arc<Faultline>> {
    Router::new()
        .route("/Get", post(get))
        .route("/List", post(list))
        .route("/Create", post(create))
        .route("/Update", post(update))
        .route("/LookupBug", post(lookup_bug))
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

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        analysis::Dataset,
        entities::RuleBuilder,
        faultline::test_support::{self, USER},
        memory::InMemory,
        storage::Backend,
    };

    fn testproject() -> ProjectId {
        ProjectId::new("testproject").unwrap()
    }

    fn chromium() -> ProjectId {
        ProjectId::new("chromium").unwrap()
    }

    fn code(err: &Error) -> Code {
        err.as_code_and_msg().0
    }

    async fn fixture(rules: Vec<FailureAssociationRule>) -> (Arc<InMemory>, Arc<Faultline>) {
        let storage = Arc::new(InMemory::new());
        storage.load(rules).await;
        let state = test_support::state(storage.clone(), Dataset::empty());
        (storage, state)
    }

    fn spec(bug: (&str, &str)) -> api::RuleSpec {
        api::RuleSpec {
            rule_definition: r#"test = "ninja://chrome/test:browser_tests/SomeTest""#.to_owned(),
            bug: api::BugRef {
                system: bug.0.to_owned(),
                id: bug.1.to_owned(),
            },
            is_active: true,
            is_managing_bug: true,
            source_cluster: api::ClusterId {
                algorithm: "reason-v1".to_owned(),
                id: "00112233445566778899aabbccddeeff".to_owned(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_rules() {
        let rule = RuleBuilder::new(1).build();
        let (_, state) = fixture(vec![rule.clone()]).await;
        let config = state.configs.project_config(&testproject()).await.unwrap();

        let rsp = get1(&state, api::GetRuleReq { name: rule.name() }).await.unwrap();
        assert_eq!(to_wire(&rule, &config), rsp);
        assert_eq!("mybug.com/101", rsp.bug.link_text);
        assert_eq!(
            "https://monorailhost.com/p/monorailproject/issues/detail?id=101",
            rsp.bug.url
        );
        assert_eq!(rule.etag(), rsp.etag);

        let err = get1(&state, api::GetRuleReq { name: "rules/abc".to_owned() })
            .await
            .unwrap_err();
        assert_eq!(Code::InvalidArgument, code(&err));
        assert_eq!(
            "invalid rule name, expected format: projects/{project}/rules/{rule_id}",
            err.as_code_and_msg().1
        );

        let err = get1(
            &state,
            api::GetRuleReq {
                name: format!("projects/nonexistent/rules/{}", rule.rule_id),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(Code::FailedPrecondition, code(&err));

        let err = get1(
            &state,
            api::GetRuleReq {
                name: RuleBuilder::new(2).build().name(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(Code::NotFound, code(&err));
        assert_eq!("rule does not exist", err.as_code_and_msg().1);
    }

    #[tokio::test]
    async fn list_rules() {
        let rules = vec![
            RuleBuilder::new(3).build(),
            RuleBuilder::new(1).build(),
            RuleBuilder::new(2).build(),
            RuleBuilder::new(4).with_active(false).build(),
            RuleBuilder::new(5).with_project(&chromium()).build(),
        ];
        let (_, state) = fixture(rules).await;

        let ids = |rsp: &api::ListRulesRsp| {
            rsp.rules
                .iter()
                .map(|rule| rule.rule_id.clone())
                .collect::<Vec<_>>()
        };

        let rsp = list1(
            &state,
            api::ListRulesReq {
                parent: "projects/testproject".to_owned(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            vec![format!("{:032x}", 1), format!("{:032x}", 2), format!("{:032x}", 3)],
            ids(&rsp)
        );
        assert!(rsp.next_page_token.is_empty());

        let first = list1(
            &state,
            api::ListRulesReq {
                parent: "projects/testproject".to_owned(),
                page_size: 2,
                page_token: String::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(vec![format!("{:032x}", 1), format!("{:032x}", 2)], ids(&first));
        assert!(!first.next_page_token.is_empty());
        let second = list1(
            &state,
            api::ListRulesReq {
                parent: "projects/testproject".to_owned(),
                page_size: 2,
                page_token: first.next_page_token,
            },
        )
        .await
        .unwrap();
        assert_eq!(vec![format!("{:032x}", 3)], ids(&second));
        assert!(second.next_page_token.is_empty());

        let err = list1(
            &state,
            api::ListRulesReq {
                parent: "projects/testproject".to_owned(),
                page_size: 2,
                page_token: "not a token".to_owned(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BadPageToken { .. }));

        let err = list1(
            &state,
            api::ListRulesReq {
                parent: "testproject".to_owned(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(
            "invalid project name, expected format: projects/{project}",
            err.as_code_and_msg().1
        );
    }

    #[tokio::test]
    async fn create_rules() {
        let (storage, state) = fixture(vec![]).await;

        let rsp = create1(
            &state,
            USER,
            api::CreateRuleReq {
                parent: "projects/testproject".to_owned(),
                rule: spec(("monorail", "monorailproject/2")),
            },
        )
        .await
        .unwrap();
        assert!(rsp.name.starts_with("projects/testproject/rules/"));
        assert!(rsp.is_managing_bug);
        assert_eq!(USER, rsp.create_user);
        assert_eq!(USER, rsp.last_update_user);
        assert_eq!(rsp.create_time, rsp.last_update_time);
        assert_eq!(rsp.create_time, rsp.predicate_last_update_time);
        assert_eq!("mybug.com/2", rsp.bug.link_text);

        let stored = storage
            .read_rule(&testproject(), &RuleId::new(&rsp.rule_id).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.etag(), rsp.etag);
        assert_eq!(rsp.rule_definition, stored.rule_definition);

        // Same bug, same project
        let err = create1(
            &state,
            USER,
            api::CreateRuleReq {
                parent: "projects/testproject".to_owned(),
                rule: spec(("monorail", "monorailproject/2")),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(
            format!(
                "bug already used by a rule in the same project (testproject/{})",
                rsp.rule_id
            ),
            err.as_code_and_msg().1
        );

        // Same bug, another project: allowed, but the new rule doesn't manage it
        let first = create1(
            &state,
            USER,
            api::CreateRuleReq {
                parent: "projects/testproject".to_owned(),
                rule: spec(("buganizer", "1234")),
            },
        )
        .await
        .unwrap();
        assert!(first.is_managing_bug);
        let second = create1(
            &state,
            USER,
            api::CreateRuleReq {
                parent: "projects/chromium".to_owned(),
                rule: spec(("buganizer", "1234")),
            },
        )
        .await
        .unwrap();
        assert!(!second.is_managing_bug);
        assert_eq!("b/1234", second.bug.link_text);
    }

    #[tokio::test]
    async fn create_validation() {
        let (_, state) = fixture(vec![]).await;
        let create = |parent: &str, rule: api::RuleSpec, user: &'static str| {
            let state = state.clone();
            let parent = parent.to_owned();
            async move { create1(&state, user, api::CreateRuleReq { parent, rule }).await }
        };

        let err = create("projects/testproject", spec(("monorail", "chromium/2")), USER)
            .await
            .unwrap_err();
        assert_eq!(
            "bug not in expected monorail project (monorailproject)",
            err.as_code_and_msg().1
        );

        let err = create("projects/testproject", spec(("jira", "2")), USER)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadBug { .. }));

        let mut bad = spec(("buganizer", "1"));
        bad.rule_definition = "test LIKE".to_owned();
        let err = create("projects/testproject", bad, USER).await.unwrap_err();
        assert!(
            err.as_code_and_msg()
                .1
                .starts_with("rule definition is not valid: ")
        );

        let mut bad = spec(("buganizer", "1"));
        bad.source_cluster.id = "not hex".to_owned();
        let err = create("projects/testproject", bad, USER).await.unwrap_err();
        assert!(
            err.as_code_and_msg()
                .1
                .starts_with("source cluster ID is not valid: ")
        );

        let err = create("projects/testproject", spec(("buganizer", "1")), "nobody")
            .await
            .unwrap_err();
        assert_eq!("user must be valid", err.as_code_and_msg().1);

        let err = create("projects/elsewhere", spec(("buganizer", "1")), USER)
            .await
            .unwrap_err();
        assert_eq!(Code::FailedPrecondition, code(&err));
        assert_eq!("project does not exist in faultline", err.as_code_and_msg().1);
    }

    fn update_req(rule: &FailureAssociationRule, paths: &[&str], etag: &str) -> api::UpdateRuleReq {
        api::UpdateRuleReq {
            rule: api::RuleSpec {
                name: rule.name(),
                rule_definition: rule.rule_definition.clone(),
                bug: api::BugRef {
                    system: rule.bug.system().to_string(),
                    id: rule.bug.id().to_owned(),
                },
                is_active: rule.is_active,
                is_managing_bug: rule.is_managing_bug,
                source_cluster: rule.source_cluster.to_wire(),
            },
            update_mask: api::FieldMask {
                paths: paths.iter().map(|p| p.to_string()).collect(),
            },
            etag: etag.to_owned(),
        }
    }

    #[tokio::test]
    async fn update_rules() {
        let rule = RuleBuilder::new(1).build();
        let (storage, state) = fixture(vec![rule.clone()]).await;

        let mut changed = rule.clone();
        changed.rule_definition = r#"test LIKE "%Other%""#.to_owned();
        let rsp = update1(&state, USER, update_req(&changed, &["rule_definition"], &rule.etag()))
            .await
            .unwrap();
        assert_eq!(r#"test LIKE "%Other%""#, rsp.rule_definition);
        assert_eq!(USER, rsp.last_update_user);
        assert_eq!(rule.creation_time, rsp.create_time);
        assert_eq!(rsp.last_update_time, rsp.predicate_last_update_time);
        assert!(rsp.last_update_time > rule.last_updated);
        assert_ne!(rule.etag(), rsp.etag);

        // The old ETag is now stale
        let err = update1(&state, USER, update_req(&changed, &["is_active"], &rule.etag()))
            .await
            .unwrap_err();
        assert_eq!(Code::Aborted, code(&err));
        assert_eq!(
            "the rule was modified since it was last read; the update was not applied.",
            err.as_code_and_msg().1
        );

        // Non-predicate fields leave the predicate timestamp alone
        let mut changed = storage
            .read_rule(&rule.project, &rule.rule_id)
            .await
            .unwrap()
            .unwrap();
        changed.bug = BugId::parse("monorail", "monorailproject/555").unwrap();
        let rsp = update1(&state, USER, update_req(&changed, &["bug"], "")).await.unwrap();
        assert_eq!("monorailproject/555", rsp.bug.id);
        assert!(rsp.last_update_time > rsp.predicate_last_update_time);
        assert_eq!(changed.predicate_last_updated, rsp.predicate_last_update_time);

        let err = update1(&state, USER, update_req(&changed, &["rule_id"], ""))
            .await
            .unwrap_err();
        assert_eq!("unsupported field mask: rule_id", err.as_code_and_msg().1);

        let missing = RuleBuilder::new(9).build();
        let err = update1(&state, USER, update_req(&missing, &["is_active"], ""))
            .await
            .unwrap_err();
        assert_eq!(Code::NotFound, code(&err));
    }

    #[tokio::test]
    async fn update_bug_ownership() {
        let shared = BugId::parse("buganizer", "1234").unwrap();
        let managing = RuleBuilder::new(1)
            .with_project(&chromium())
            .with_bug(&shared)
            .build();
        let sibling = RuleBuilder::new(2).build();
        let rule = RuleBuilder::new(3)
            .with_bug(&BugId::parse("buganizer", "5555").unwrap())
            .build();
        let (storage, state) = fixture(vec![managing, sibling.clone(), rule.clone()]).await;

        // Another rule in this project already cites the bug
        let mut changed = rule.clone();
        changed.bug = sibling.bug.clone();
        let err = update1(&state, USER, update_req(&changed, &["bug"], ""))
            .await
            .unwrap_err();
        assert_eq!(
            format!(
                "bug already used by a rule in the same project (testproject/{})",
                sibling.rule_id
            ),
            err.as_code_and_msg().1
        );

        // Explicitly asking to manage a bug managed elsewhere is refused...
        let mut changed = rule.clone();
        changed.bug = shared.clone();
        let err = update1(
            &state,
            USER,
            update_req(&changed, &["bug", "is_managing_bug"], ""),
        )
        .await
        .unwrap_err();
        assert_eq!(
            format!(
                "bug already managed by a rule in another project (chromium/{:032x})",
                1
            ),
            err.as_code_and_msg().1
        );

        // ...whereas just moving to it quietly gives up management
        let rsp = update1(&state, USER, update_req(&changed, &["bug"], ""))
            .await
            .unwrap();
        assert!(!rsp.is_managing_bug);
        let stored = storage
            .read_rule(&rule.project, &rule.rule_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shared, stored.bug);
        assert!(!stored.is_managing_bug);
    }

    #[tokio::test]
    async fn update_same_project_conflicts_first() {
        let shared = BugId::parse("buganizer", "1234").unwrap();
        // "chromium" sorts before "testproject"
        let managing = RuleBuilder::new(1)
            .with_project(&chromium())
            .with_bug(&shared)
            .build();
        let sibling = RuleBuilder::new(2)
            .with_bug(&shared)
            .with_managing_bug(false)
            .build();
        let rule = RuleBuilder::new(3)
            .with_bug(&BugId::parse("buganizer", "5555").unwrap())
            .build();
        let (_, state) = fixture(vec![managing, sibling.clone(), rule.clone()]).await;

        let mut changed = rule.clone();
        changed.bug = shared;
        changed.is_managing_bug = true;
        let err = update1(
            &state,
            USER,
            update_req(&changed, &["bug", "is_managing_bug"], ""),
        )
        .await
        .unwrap_err();
        assert_eq!(
            format!(
                "bug already used by a rule in the same project (testproject/{})",
                sibling.rule_id
            ),
            err.as_code_and_msg().1
        );
    }

    #[tokio::test]
    async fn update_rules_citing_unconfigured_bugs() {
        // The project's monorail project has changed since this rule was written
        let rule = RuleBuilder::new(1)
            .with_bug(&BugId::parse("monorail", "oldproject/5").unwrap())
            .build();
        let (storage, state) = fixture(vec![rule.clone()]).await;

        let mut changed = rule.clone();
        changed.is_active = false;
        let rsp = update1(&state, USER, update_req(&changed, &["is_active"], ""))
            .await
            .unwrap();
        assert!(!rsp.is_active);
        assert_eq!("oldproject/5", rsp.bug.id);

        // Naming the bug in the mask re-checks it against the configuration
        let changed = storage
            .read_rule(&rule.project, &rule.rule_id)
            .await
            .unwrap()
            .unwrap();
        let err = update1(&state, USER, update_req(&changed, &["bug"], ""))
            .await
            .unwrap_err();
        assert_eq!(Code::InvalidArgument, code(&err));
        assert_eq!(
            "bug not in expected monorail project (monorailproject)",
            err.as_code_and_msg().1
        );
    }

    #[tokio::test]
    async fn lookup_bugs() {
        let shared = BugId::parse("buganizer", "1234").unwrap();
        let first = RuleBuilder::new(1).with_bug(&shared).build();
        let second = RuleBuilder::new(2)
            .with_project(&chromium())
            .with_bug(&shared)
            .with_managing_bug(false)
            .build();
        let (_, state) = fixture(vec![first.clone(), second.clone(), RuleBuilder::new(3).build()]).await;

        let rsp = lookup_bug1(
            &state,
            api::LookupBugReq {
                system: "buganizer".to_owned(),
                id: "1234".to_owned(),
            },
        )
        .await
        .unwrap();
        assert_eq!(vec![second.name(), first.name()], rsp.rules);

        let rsp = lookup_bug1(
            &state,
            api::LookupBugReq {
                system: "buganizer".to_owned(),
                id: "999".to_owned(),
            },
        )
        .await
        .unwrap();
        assert!(rsp.rules.is_empty());

        let err = lookup_bug1(
            &state,
            api::LookupBugReq {
                system: "jira".to_owned(),
                id: "1".to_owned(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(Code::InvalidArgument, code(&err));
    }
}
