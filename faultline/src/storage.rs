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

//! # faultline storage
//!
//! The [Backend] trait abstracts over the rule store. Reads may be issued directly against the
//! backend; writes are always made through a [Transaction], which lets callers compose the
//! read-check-write sequences enforcing bug-ownership invariants into a single atomic unit.

use crate::entities::FailureAssociationRule;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use faultline_shared::{BugId, ProjectId, RuleId};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

type Rule = FailureAssociationRule;

#[async_trait]
pub trait Backend {
    /// Retrieve a single rule; None means there is no such rule
    async fn read_rule(&self, project: &ProjectId, rule_id: &RuleId)
    -> Result<Option<Rule>, Error>;
    /// Retrieve all active rules for `project`, in no particular order
    async fn read_active_rules(&self, project: &ProjectId) -> Result<Vec<Rule>, Error>;
    /// Retrieve every rule, in any project, citing `bug`, ordered by project then rule ID
    async fn read_rules_by_bug(&self, bug: &BugId) -> Result<Vec<Rule>, Error>;
    /// Retrieve every rule (active or not) in `project` last updated strictly after `since`
    async fn read_rules_delta(
        &self,
        project: &ProjectId,
        since: &DateTime<Utc>,
    ) -> Result<Vec<Rule>, Error>;
    /// Retrieve several rules by ID; the result has one entry per requested ID, in order
    async fn read_many_rules(
        &self,
        project: &ProjectId,
        rule_ids: &[RuleId],
    ) -> Result<Vec<Option<Rule>>, Error>;
    /// The latest last-updated time over all rules in `project`, active or not;
    /// [STARTING_EPOCH](crate::entities::STARTING_EPOCH) if there are none
    async fn read_last_updated(&self, project: &ProjectId) -> Result<DateTime<Utc>, Error>;
    /// Begin a read-write transaction
    async fn begin(&self) -> Result<Box<dyn Transaction + Send + Sync>, Error>;
}

/// A read-write transaction against the rule store
///
/// Writes are buffered until [commit](Transaction::commit); dropping a transaction discards them.
/// Timestamps on written rules are taken from the commit time. No other transaction commits
/// between a transaction's reads & its commit.
#[async_trait]
pub trait Transaction {
    async fn read_rule(&self, project: &ProjectId, rule_id: &RuleId)
    -> Result<Option<Rule>, Error>;
    async fn read_rules_by_bug(&self, bug: &BugId) -> Result<Vec<Rule>, Error>;
    /// Create `rule` on behalf of `user`; the rule must be valid & its ID unused
    fn create_rule(&mut self, rule: &Rule, user: &str) -> Result<(), Error>;
    /// Overwrite the existing rule with `rule`'s ID; bump its predicate last-updated time iff
    /// `update_predicate` is set
    fn update_rule(&mut self, rule: &Rule, update_predicate: bool, user: &str)
    -> Result<(), Error>;
    /// Atomically apply this transaction's writes, returning the commit time
    async fn commit(self: Box<Self>) -> Result<DateTime<Utc>, Error>;
}
