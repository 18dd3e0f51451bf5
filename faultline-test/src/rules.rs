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

//! Rules service integration tests

use libtest_mimic::Failed;
use reqwest::{StatusCode, Url};

use faultline_shared::api;

use crate::Client;

/// A rule citing `bug` (a (system, ID) pair) with no source cluster
pub fn spec(definition: &str, bug: (&str, &str)) -> api::RuleSpec {
    api::RuleSpec {
        rule_definition: definition.to_owned(),
        bug: api::BugRef {
            system: bug.0.to_owned(),
            id: bug.1.to_owned(),
        },
        is_active: true,
        is_managing_bug: true,
        ..Default::default()
    }
}

pub async fn create_rule(
    client: &Client,
    project: &str,
    rule: api::RuleSpec,
) -> Result<api::Rule, Failed> {
    client
        .call(
            "Rules",
            "Create",
            &api::CreateRuleReq {
                parent: format!("projects/{}", project),
                rule,
            },
        )
        .await
}

fn update(rule: &api::Rule, paths: &[&str], etag: &str) -> api::UpdateRuleReq {
    api::UpdateRuleReq {
        rule: api::RuleSpec {
            name: rule.name.clone(),
            rule_definition: rule.rule_definition.clone(),
            bug: api::BugRef {
                system: rule.bug.system.clone(),
                id: rule.bug.id.clone(),
            },
            is_active: rule.is_active,
            is_managing_bug: rule.is_managing_bug,
            source_cluster: rule.source_cluster.clone(),
        },
        update_mask: api::FieldMask {
            paths: paths.iter().map(|p| p.to_string()).collect(),
        },
        etag: etag.to_owned(),
    }
}

/// Create, read, list, update & look up a rule
pub async fn test_rule_lifecycle(url: &Url, api_key: &str) -> Result<(), Failed> {
    let client = Client::new(url, Some(api_key))?;

    let created = create_rule(
        &client,
        "testproject",
        spec(
            r#"test LIKE "%Lifecycle%" AND reason LIKE "%timed out%""#,
            ("monorail", "monorailproject/70001"),
        ),
    )
    .await?;
    assert_eq!("testproject", created.project);
    assert_eq!(
        format!("projects/testproject/rules/{}", created.rule_id),
        created.name
    );
    assert_eq!("mybug.com/70001", created.bug.link_text);
    assert!(created.is_managing_bug);
    assert_eq!(created.create_time, created.predicate_last_update_time);

    let fetched: api::Rule = client
        .call(
            "Rules",
            "Get",
            &api::GetRuleReq {
                name: created.name.clone(),
            },
        )
        .await?;
    assert_eq!(created, fetched);

    let listed: api::ListRulesRsp = client
        .call(
            "Rules",
            "List",
            &api::ListRulesReq {
                parent: "projects/testproject".to_owned(),
                ..Default::default()
            },
        )
        .await?;
    assert!(listed.rules.iter().any(|rule| rule.name == created.name));

    let mut changed = fetched.clone();
    changed.rule_definition = r#"test LIKE "%Lifecycle%""#.to_owned();
    let updated: api::Rule = client
        .call(
            "Rules",
            "Update",
            &update(&changed, &["rule_definition"], &fetched.etag),
        )
        .await?;
    assert_eq!(r#"test LIKE "%Lifecycle%""#, updated.rule_definition);
    assert!(updated.predicate_last_update_time > created.predicate_last_update_time);
    assert_ne!(fetched.etag, updated.etag);

    // Updating with the ETag we read before is refused
    let (status, body) = client
        .call_err(
            "Rules",
            "Update",
            &update(&changed, &["is_active"], &fetched.etag),
        )
        .await?;
    assert_eq!(StatusCode::CONFLICT, status);
    assert_eq!("ABORTED", body.code);

    let found: api::LookupBugRsp = client
        .call(
            "Rules",
            "LookupBug",
            &api::LookupBugReq {
                system: "monorail".to_owned(),
                id: "monorailproject/70001".to_owned(),
            },
        )
        .await?;
    assert_eq!(vec![created.name.clone()], found.rules);

    // Deactivated rules drop out of listings
    let deactivated: api::Rule = client
        .call(
            "Rules",
            "Update",
            &update(
                &api::Rule {
                    is_active: false,
                    ..updated.clone()
                },
                &["is_active"],
                &updated.etag,
            ),
        )
        .await?;
    assert!(!deactivated.is_active);
    let listed: api::ListRulesRsp = client
        .call(
            "Rules",
            "List",
            &api::ListRulesReq {
                parent: "projects/testproject".to_owned(),
                ..Default::default()
            },
        )
        .await?;
    assert!(listed.rules.iter().all(|rule| rule.name != created.name));

    Ok(())
}

/// Malformed & unauthorized requests are refused with the right codes
pub async fn test_rule_validation(url: &Url, api_key: &str) -> Result<(), Failed> {
    let client = Client::new(url, Some(api_key))?;

    let (status, body) = client
        .call_err(
            "Rules",
            "Create",
            &api::CreateRuleReq {
                parent: "projects/testproject".to_owned(),
                rule: spec("test LIKE", ("monorail", "monorailproject/70002")),
            },
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);
    assert_eq!("INVALID_ARGUMENT", body.code);
    assert!(body.error.starts_with("rule definition is not valid: "));

    let (status, body) = client
        .call_err(
            "Rules",
            "Create",
            &api::CreateRuleReq {
                parent: "projects/testproject".to_owned(),
                rule: spec(r#"test = "a""#, ("monorail", "chromium/70002")),
            },
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);
    assert_eq!(
        "bug not in expected monorail project (monorailproject)",
        body.error
    );

    let (status, body) = client
        .call_err(
            "Rules",
            "Create",
            &api::CreateRuleReq {
                parent: "projects/no-such-project".to_owned(),
                rule: spec(r#"test = "a""#, ("buganizer", "70002")),
            },
        )
        .await?;
    assert_eq!(StatusCode::PRECONDITION_FAILED, status);
    assert_eq!("project does not exist in faultline", body.error);

    let (status, body) = client
        .call_err(
            "Rules",
            "Get",
            &api::GetRuleReq {
                name: "projects/testproject/rules/ffffffffffffffffffffffffffffffff".to_owned(),
            },
        )
        .await?;
    assert_eq!(StatusCode::NOT_FOUND, status);
    assert_eq!("rule does not exist", body.error);

    let (status, _) = client
        .call_err(
            "Rules",
            "Get",
            &api::GetRuleReq {
                name: "rules/testproject".to_owned(),
            },
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);

    let anonymous = Client::new(url, None)?;
    let (status, body) = anonymous
        .call_err(
            "Rules",
            "List",
            &api::ListRulesReq {
                parent: "projects/testproject".to_owned(),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(StatusCode::FORBIDDEN, status);
    assert_eq!("PERMISSION_DENIED", body.code);
    assert_eq!("not a member of faultline-access", body.error);

    Ok(())
}

/// At most one rule manages any bug, across projects
pub async fn test_bug_management(url: &Url, api_key: &str) -> Result<(), Failed> {
    let client = Client::new(url, Some(api_key))?;

    let first = create_rule(
        &client,
        "chromium",
        spec(r#"test = "ManagedTest""#, ("buganizer", "80001")),
    )
    .await?;
    assert!(first.is_managing_bug);

    let second = create_rule(
        &client,
        "testproject",
        spec(r#"test = "ManagedTest""#, ("buganizer", "80001")),
    )
    .await?;
    assert!(!second.is_managing_bug);

    let (status, body) = client
        .call_err(
            "Rules",
            "Update",
            &update(
                &api::Rule {
                    is_managing_bug: true,
                    ..second.clone()
                },
                &["is_managing_bug"],
                &second.etag,
            ),
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);
    assert_eq!(
        format!(
            "bug already managed by a rule in another project (chromium/{})",
            first.rule_id
        ),
        body.error
    );

    let (status, body) = client
        .call_err(
            "Rules",
            "Create",
            &api::CreateRuleReq {
                parent: "projects/chromium".to_owned(),
                rule: spec(r#"test = "Other""#, ("buganizer", "80001")),
            },
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);
    assert_eq!(
        format!(
            "bug already used by a rule in the same project (chromium/{})",
            first.rule_id
        ),
        body.error
    );

    let found: api::LookupBugRsp = client
        .call(
            "Rules",
            "LookupBug",
            &api::LookupBugReq {
                system: "buganizer".to_owned(),
                id: "80001".to_owned(),
            },
        )
        .await?;
    assert_eq!(vec![first.name, second.name], found.rules);

    Ok(())
}
