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

//! # faultline entities
//!
//! The persistent types at the heart of faultline: [FailureAssociationRule] & friends.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use faultline_shared::{BugId, BugSystem, PROJECT_ID_PATTERN, ProjectId, RULE_ID_PATTERN, RuleId};

use crate::{clustering, clustering::ClusterId, lang};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("rule definition is not valid: {source}"))]
    BadDefinition { source: lang::Error },
    #[snafu(display("source cluster ID is not valid: {source}"))]
    BadSourceCluster { source: clustering::Error },
    #[snafu(display("user must be valid"))]
    BadUser { user: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

/// The user faultline records when it modifies rules on its own behalf
pub const SYSTEM_USER: &str = "faultline";

lazy_static! {
    /// The rules version of a project with no rules
    pub static ref STARTING_EPOCH: DateTime<Utc> =
        Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap(/* known good */);
    static ref PROJECT_NAME: Regex =
        Regex::new(&format!("^projects/({})$", PROJECT_ID_PATTERN)).unwrap(/* known good */);
    static ref RULE_NAME: Regex = Regex::new(&format!(
        "^projects/({})/rules/({})$",
        PROJECT_ID_PATTERN, RULE_ID_PATTERN
    ))
    .unwrap(/* known good */);
    static ref USER: Regex =
        Regex::new(r"^faultline$|^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+$").unwrap(/* known good */);
}

/// Check that `user` may be recorded as the author of a change to a rule
pub fn validate_user(user: &str) -> Result<()> {
    ensure!(USER.is_match(user), BadUserSnafu { user });
    Ok(())
}

/// "projects/{project}/rules/{rule_id}"
pub fn rule_name(project: &ProjectId, rule_id: &RuleId) -> String {
    format!("projects/{}/rules/{}", project, rule_id)
}

/// Parse a project resource name, "projects/{project}"
pub fn parse_project_name(name: &str) -> Option<ProjectId> {
    PROJECT_NAME
        .captures(name)
        .and_then(|c| ProjectId::new(&c[1]).ok())
}

/// Parse a rule resource name, "projects/{project}/rules/{rule_id}"
pub fn parse_rule_name(name: &str) -> Option<(ProjectId, RuleId)> {
    let captures = RULE_NAME.captures(name)?;
    Some((
        ProjectId::new(&captures[1]).ok()?,
        RuleId::new(&captures[2]).ok()?,
    ))
}

/// A failure association rule
///
/// A rule associates the failures matching its definition (a predicate in the [lang] language)
/// with a bug. Rules are never deleted, only deactivated.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FailureAssociationRule {
    pub project: ProjectId,
    pub rule_id: RuleId,
    pub rule_definition: String,
    pub bug: BugId,
    pub is_active: bool,
    /// Whether this rule "owns" its bug (i.e. faultline may update the bug); at most one rule
    /// across all projects may own a given bug
    pub is_managing_bug: bool,
    /// The suggested cluster this rule was created from, if any (else empty)
    #[serde(default)]
    pub source_cluster: ClusterId,
    pub creation_time: DateTime<Utc>,
    pub creation_user: String,
    pub last_updated: DateTime<Utc>,
    pub last_updated_user: String,
    /// Bumped only on changes to the rule's definition or active flag
    pub predicate_last_updated: DateTime<Utc>,
}

impl FailureAssociationRule {
    /// This rule's resource name
    pub fn name(&self) -> String {
        rule_name(&self.project, &self.rule_id)
    }
    /// A weak ETag derived from the last-updated time
    ///
    /// Commit timestamps strictly increase, so every write to a rule changes its ETag.
    pub fn etag(&self) -> String {
        format!(
            "W/\"{}\"",
            self.last_updated
                .to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )
    }
    /// The bug cluster this rule defines
    pub fn cluster_id(&self) -> ClusterId {
        ClusterId::for_rule(&self.rule_id)
    }
    /// Validate the parts of a rule not already guaranteed by its types
    pub fn validate(&self) -> Result<()> {
        if !self.source_cluster.is_empty() {
            self.source_cluster
                .validate()
                .context(BadSourceClusterSnafu)?;
        }
        lang::parse(&self.rule_definition).context(BadDefinitionSnafu)?;
        Ok(())
    }
}

/// Build [FailureAssociationRule]s for tests
///
/// Each `uniquifier` yields a distinct, valid rule; the `with_*` methods override its parts.
#[cfg(test)]
pub struct RuleBuilder {
    rule: FailureAssociationRule,
}

#[cfg(test)]
impl RuleBuilder {
    pub fn new(uniquifier: u32) -> RuleBuilder {
        let when = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(/* known good */)
            + chrono::Duration::hours(uniquifier as i64);
        RuleBuilder {
            rule: FailureAssociationRule {
                project: ProjectId::new("testproject").unwrap(/* known good */),
                rule_id: RuleId::new(&format!("{:032x}", uniquifier)).unwrap(/* known good */),
                rule_definition: format!("reason LIKE \"%exit code {}%\"", uniquifier),
                bug: BugId::new(BugSystem::Monorail, &format!("monorailproject/{}", 100 + uniquifier))
                    .unwrap(/* known good */),
                is_active: true,
                is_managing_bug: true,
                source_cluster: ClusterId::new("reason-v1", &format!("{:032x}", uniquifier)),
                creation_time: when,
                creation_user: SYSTEM_USER.to_owned(),
                last_updated: when,
                last_updated_user: SYSTEM_USER.to_owned(),
                predicate_last_updated: when,
            },
        }
    }
    pub fn with_project(mut self, project: &ProjectId) -> RuleBuilder {
        self.rule.project = project.clone();
        self
    }
    pub fn with_rule_definition(mut self, definition: &str) -> RuleBuilder {
        self.rule.rule_definition = definition.to_owned();
        self
    }
    pub fn with_bug(mut self, bug: &BugId) -> RuleBuilder {
        self.rule.bug = bug.clone();
        self
    }
    pub fn with_active(mut self, active: bool) -> RuleBuilder {
        self.rule.is_active = active;
        self
    }
    pub fn with_managing_bug(mut self, managing: bool) -> RuleBuilder {
        self.rule.is_managing_bug = managing;
        self
    }
    pub fn with_source_cluster(mut self, cluster: ClusterId) -> RuleBuilder {
        self.rule.source_cluster = cluster;
        self
    }
    pub fn with_creation_time(mut self, when: DateTime<Utc>) -> RuleBuilder {
        self.rule.creation_time = when;
        self
    }
    /// Sets both the predicate & overall last-updated times
    pub fn with_predicate_last_updated(mut self, when: DateTime<Utc>) -> RuleBuilder {
        self.rule.predicate_last_updated = when;
        self.rule.last_updated = when;
        self
    }
    pub fn with_last_updated(mut self, when: DateTime<Utc>) -> RuleBuilder {
        self.rule.last_updated = when;
        self
    }
    pub fn build(self) -> FailureAssociationRule {
        self.rule
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;

    #[test]
    fn users() {
        assert!(validate_user("faultline").is_ok());
        assert!(validate_user("someone@example.com").is_ok());
        assert!(validate_user("first.last+tag@sub.example.org").is_ok());
        assert!(validate_user("").is_err());
        assert!(validate_user("someone").is_err());
        assert!(validate_user("faultline-bot").is_err());
    }

    #[test]
    fn resource_names() {
        assert_eq!(
            Some(ProjectId::new("chromium").unwrap()),
            parse_project_name("projects/chromium")
        );
        assert_eq!(None, parse_project_name("projects/Chromium"));
        assert_eq!(None, parse_project_name("projects/chromium/rules"));
        assert_eq!(None, parse_project_name("chromium"));

        let rule = RuleBuilder::new(3).build();
        assert_eq!(
            Some((rule.project.clone(), rule.rule_id.clone())),
            parse_rule_name(&rule.name())
        );
        assert_eq!(None, parse_rule_name("projects/testproject/rules/abc"));
        assert_eq!(None, parse_rule_name("projects/testproject/rules/"));
    }

    #[test]
    fn etags() {
        let when = Utc.with_ymd_and_hms(2021, 2, 12, 1, 2, 4).unwrap()
            + Duration::microseconds(5);
        let rule = RuleBuilder::new(0).with_last_updated(when).build();
        assert_eq!(r#"W/"2021-02-12T01:02:04.000005Z""#, rule.etag());
        let later = RuleBuilder::new(0)
            .with_last_updated(when + Duration::microseconds(1))
            .build();
        assert_ne!(rule.etag(), later.etag());
    }

    #[test]
    fn validation() {
        let rule = RuleBuilder::new(7).build();
        assert!(rule.validate().is_ok());
        assert_eq!("projects/testproject/rules/00000000000000000000000000000007", rule.name());
        assert!(RuleBuilder::new(1)
            .with_source_cluster(ClusterId::default())
            .build()
            .validate()
            .is_ok());

        let err = RuleBuilder::new(1)
            .with_rule_definition("")
            .build()
            .validate()
            .unwrap_err();
        assert!(format!("{err}").starts_with("rule definition is not valid: "));

        let err = RuleBuilder::new(1)
            .with_source_cluster(ClusterId::new("reason-v1", "xyz"))
            .build()
            .validate()
            .unwrap_err();
        assert_eq!(
            "source cluster ID is not valid: ID is not valid lowercase hexadecimal bytes",
            format!("{err}")
        );
    }
}
