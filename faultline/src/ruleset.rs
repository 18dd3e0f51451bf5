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

//! # Rulesets
//!
//! A [Ruleset] is an immutable snapshot of a project's active rules, each with its definition
//! compiled, stamped with the [RulesVersion] it reflects. The [RulesetCache] keeps the most
//! recent snapshot for each of a bounded number of projects & refreshes them incrementally: a
//! refresh reads only the rules updated since the snapshot's version & recompiles just those. If
//! the project's last-updated time hasn't moved past the snapshot's version, the rules aren't
//! read at all.
//!
//! Callers choose their [Consistency]. A strong read never returns a snapshot fetched before the
//! read began; a cached read may return any snapshot no older than the cache's maximum
//! staleness.
//!
//! Each project's slot has its own lock, so a refresh for one project never blocks readers of
//! another, & concurrent strong readers of one project share a single refresh.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use lru::LruCache;
use opentelemetry::KeyValue;
use snafu::prelude::*;
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use faultline_shared::{ProjectId, RuleId};

use crate::{
    counter_add,
    entities::{FailureAssociationRule, STARTING_EPOCH},
    gauge_set,
    lang::{self, Expr},
    metrics::{self, Instruments, Sort},
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("rule {name} has an invalid definition: {source}"))]
    BadRule { name: String, source: lang::Error },
    #[snafu(display("Failed to read the rules for project {project}: {source}"))]
    ReadRules {
        project: ProjectId,
        source: storage::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

inventory::submit! { metrics::Registration::new("ruleset.refreshes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("ruleset.active.rules", Sort::IntegralGauge) }

/// An active rule with its definition compiled
#[derive(Debug)]
pub struct CachedRule {
    pub rule: FailureAssociationRule,
    pub expr: Expr,
}

/// The version of a set of rules
///
/// `total` advances on any change to any rule; `predicates` only on changes to a rule's
/// definition or active flag, which are the only changes that affect clustering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RulesVersion {
    pub total: DateTime<Utc>,
    pub predicates: DateTime<Utc>,
}

impl Default for RulesVersion {
    fn default() -> Self {
        RulesVersion {
            total: *STARTING_EPOCH,
            predicates: *STARTING_EPOCH,
        }
    }
}

#[derive(Debug)]
pub struct Ruleset {
    active: HashMap<RuleId, Arc<CachedRule>>,
    version: RulesVersion,
    fetched: Instant,
}

impl Ruleset {
    /// The ruleset of a project with no rules
    pub fn empty() -> Ruleset {
        Ruleset {
            active: HashMap::new(),
            version: RulesVersion::default(),
            fetched: Instant::now(),
        }
    }
    /// Build a ruleset from the complete set of a project's rules (active or not)
    pub fn from_rules(rules: Vec<FailureAssociationRule>) -> Result<Ruleset> {
        Ruleset::empty().apply_delta(rules, Instant::now())
    }
    /// Produce the ruleset resulting from applying `delta`, the rules changed since this
    /// ruleset's version, as read at time `fetched`
    fn apply_delta(&self, delta: Vec<FailureAssociationRule>, fetched: Instant) -> Result<Ruleset> {
        let mut active = self.active.clone();
        let mut version = self.version;
        for rule in delta {
            version.total = version.total.max(rule.last_updated);
            version.predicates = version.predicates.max(rule.predicate_last_updated);
            if rule.is_active {
                let expr = lang::parse(&rule.rule_definition).context(BadRuleSnafu {
                    name: rule.name(),
                })?;
                active.insert(rule.rule_id.clone(), Arc::new(CachedRule { rule, expr }));
            } else {
                active.remove(&rule.rule_id);
            }
        }
        Ok(Ruleset {
            active,
            version,
            fetched,
        })
    }
    pub fn active_rules(&self) -> impl Iterator<Item = &CachedRule> {
        self.active.values().map(|rule| rule.as_ref())
    }
    pub fn active_rule(&self, rule_id: &RuleId) -> Option<&CachedRule> {
        self.active.get(rule_id).map(|rule| rule.as_ref())
    }
    pub fn version(&self) -> RulesVersion {
        self.version
    }
}

/// How fresh a ruleset the caller requires
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Consistency {
    /// Reflect every commit made before the read began
    Strong,
    /// Accept a snapshot up to the cache's maximum staleness old
    Cached,
}

type Slot = Arc<Mutex<Option<Arc<Ruleset>>>>;

pub struct RulesetCache {
    storage: Arc<dyn storage::Backend + Send + Sync>,
    instruments: Arc<Instruments>,
    max_staleness: Duration,
    slots: Mutex<LruCache<ProjectId, Slot>>,
}

impl RulesetCache {
    pub fn new(
        storage: Arc<dyn storage::Backend + Send + Sync>,
        instruments: Arc<Instruments>,
        max_staleness: Duration,
        capacity: NonZeroUsize,
    ) -> RulesetCache {
        RulesetCache {
            storage,
            instruments,
            max_staleness,
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }
    /// Retrieve the ruleset for `project` at the given consistency
    pub async fn ruleset(
        &self,
        project: &ProjectId,
        consistency: Consistency,
    ) -> Result<Arc<Ruleset>> {
        let requested = Instant::now();
        let slot = self
            .slots
            .lock()
            .await
            .get_or_insert(project.clone(), || Arc::new(Mutex::new(None)))
            .clone();

        let mut slot = slot.lock().await;
        if let Some(ruleset) = slot.as_ref() {
            let fresh = match consistency {
                Consistency::Strong => ruleset.fetched > requested,
                Consistency::Cached => ruleset.fetched.elapsed() <= self.max_staleness,
            };
            if fresh {
                return Ok(ruleset.clone());
            }
        }

        let base = slot.clone().unwrap_or_else(|| Arc::new(Ruleset::empty()));
        // Stamp the snapshot before reading; it reflects at least every commit made before now
        let fetched = Instant::now();
        let last_updated = self
            .storage
            .read_last_updated(project)
            .await
            .context(ReadRulesSnafu {
                project: project.clone(),
            })?;
        let delta = if last_updated > base.version.total {
            self.storage
                .read_rules_delta(project, &base.version.total)
                .await
                .context(ReadRulesSnafu {
                    project: project.clone(),
                })?
        } else {
            Vec::new()
        };
        debug!(
            "Refreshing the ruleset for {} with {} changed rules",
            project,
            delta.len()
        );
        let next = Arc::new(base.apply_delta(delta, fetched)?);
        counter_add!(self.instruments, "ruleset.refreshes", 1, &[]);
        gauge_set!(
            self.instruments,
            "ruleset.active.rules",
            next.active.len() as u64,
            &[KeyValue::new("project", project.to_string())]
        );
        *slot = Some(next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use crate::{
        entities::{RuleBuilder, SYSTEM_USER},
        memory::InMemory,
        storage::{Backend, Transaction},
    };

    /// Counts the delta reads made against an in-memory store
    struct CountingDeltas {
        inner: InMemory,
        deltas: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingDeltas {
        async fn read_rule(
            &self,
            project: &ProjectId,
            rule_id: &RuleId,
        ) -> std::result::Result<Option<FailureAssociationRule>, storage::Error> {
            self.inner.read_rule(project, rule_id).await
        }
        async fn read_active_rules(
            &self,
            project: &ProjectId,
        ) -> std::result::Result<Vec<FailureAssociationRule>, storage::Error> {
            self.inner.read_active_rules(project).await
        }
        async fn read_rules_by_bug(
            &self,
            bug: &faultline_shared::BugId,
        ) -> std::result::Result<Vec<FailureAssociationRule>, storage::Error> {
            self.inner.read_rules_by_bug(bug).await
        }
        async fn read_rules_delta(
            &self,
            project: &ProjectId,
            since: &DateTime<Utc>,
        ) -> std::result::Result<Vec<FailureAssociationRule>, storage::Error> {
            self.deltas.fetch_add(1, Ordering::SeqCst);
            self.inner.read_rules_delta(project, since).await
        }
        async fn read_many_rules(
            &self,
            project: &ProjectId,
            rule_ids: &[RuleId],
        ) -> std::result::Result<Vec<Option<FailureAssociationRule>>, storage::Error> {
            self.inner.read_many_rules(project, rule_ids).await
        }
        async fn read_last_updated(
            &self,
            project: &ProjectId,
        ) -> std::result::Result<DateTime<Utc>, storage::Error> {
            self.inner.read_last_updated(project).await
        }
        async fn begin(
            &self,
        ) -> std::result::Result<Box<dyn Transaction + Send + Sync>, storage::Error> {
            self.inner.begin().await
        }
    }

    fn project() -> ProjectId {
        ProjectId::new("testproject").unwrap()
    }

    fn cache(storage: Arc<InMemory>, max_staleness: Duration) -> RulesetCache {
        RulesetCache::new(
            storage,
            Arc::new(Instruments::new("faultline-test")),
            max_staleness,
            NonZeroUsize::new(8).unwrap(),
        )
    }

    #[test]
    fn versions() {
        let base = RuleBuilder::new(0).build().last_updated;
        let ruleset = Ruleset::from_rules(vec![
            RuleBuilder::new(1)
                .with_predicate_last_updated(base + ChronoDuration::hours(1))
                .build(),
            RuleBuilder::new(2)
                .with_predicate_last_updated(base + ChronoDuration::hours(2))
                .with_last_updated(base + ChronoDuration::hours(5))
                .build(),
            RuleBuilder::new(3)
                .with_predicate_last_updated(base + ChronoDuration::hours(3))
                .with_active(false)
                .build(),
        ])
        .unwrap();
        assert_eq!(
            RulesVersion {
                total: base + ChronoDuration::hours(5),
                predicates: base + ChronoDuration::hours(3),
            },
            ruleset.version()
        );
        assert_eq!(2, ruleset.active_rules().count());
        assert!(ruleset.active_rule(&RuleBuilder::new(3).build().rule_id).is_none());
        assert_eq!(RulesVersion::default(), Ruleset::empty().version());
    }

    #[tokio::test]
    async fn strong_reads_see_prior_commits() {
        let storage = Arc::new(InMemory::new());
        let cache = cache(storage.clone(), Duration::from_secs(3600));

        let ruleset = cache.ruleset(&project(), Consistency::Strong).await.unwrap();
        assert_eq!(0, ruleset.active_rules().count());
        assert_eq!(*STARTING_EPOCH, ruleset.version().predicates);

        let rule = RuleBuilder::new(1).build();
        let mut txn = storage.begin().await.unwrap();
        txn.create_rule(&rule, SYSTEM_USER).unwrap();
        let committed = txn.commit().await.unwrap();

        // A cached read may return the stale snapshot...
        let stale = cache.ruleset(&project(), Consistency::Cached).await.unwrap();
        assert_eq!(0, stale.active_rules().count());
        // but a strong read may not
        let ruleset = cache.ruleset(&project(), Consistency::Strong).await.unwrap();
        assert!(ruleset.active_rule(&rule.rule_id).is_some());
        assert_eq!(committed, ruleset.version().predicates);
        assert_eq!(committed, ruleset.version().total);

        // Deactivation is picked up incrementally
        let mut deactivated = ruleset.active_rule(&rule.rule_id).unwrap().rule.clone();
        deactivated.is_active = false;
        let mut txn = storage.begin().await.unwrap();
        txn.update_rule(&deactivated, true, SYSTEM_USER).unwrap();
        let committed = txn.commit().await.unwrap();
        let ruleset = cache.ruleset(&project(), Consistency::Strong).await.unwrap();
        assert_eq!(0, ruleset.active_rules().count());
        assert_eq!(committed, ruleset.version().predicates);

        // Non-predicate updates move only the total version
        let mut txn = storage.begin().await.unwrap();
        txn.update_rule(&deactivated, false, SYSTEM_USER).unwrap();
        let later = txn.commit().await.unwrap();
        let ruleset = cache.ruleset(&project(), Consistency::Strong).await.unwrap();
        assert_eq!(committed, ruleset.version().predicates);
        assert_eq!(later, ruleset.version().total);
    }

    #[tokio::test]
    async fn unchanged_projects_skip_the_delta() {
        let storage = Arc::new(CountingDeltas {
            inner: InMemory::new(),
            deltas: AtomicUsize::new(0),
        });
        storage.inner.load(vec![RuleBuilder::new(1).build()]).await;
        let cache = RulesetCache::new(
            storage.clone(),
            Arc::new(Instruments::new("faultline-test")),
            Duration::from_secs(3600),
            NonZeroUsize::new(8).unwrap(),
        );

        let first = cache.ruleset(&project(), Consistency::Strong).await.unwrap();
        assert_eq!(1, first.active_rules().count());
        assert_eq!(1, storage.deltas.load(Ordering::SeqCst));

        // Nothing has changed, so the rules aren't re-read
        let second = cache.ruleset(&project(), Consistency::Strong).await.unwrap();
        assert_eq!(first.version(), second.version());
        assert_eq!(1, second.active_rules().count());
        assert_eq!(1, storage.deltas.load(Ordering::SeqCst));

        let mut txn = storage.begin().await.unwrap();
        txn.create_rule(&RuleBuilder::new(2).build(), SYSTEM_USER).unwrap();
        let committed = txn.commit().await.unwrap();
        let third = cache.ruleset(&project(), Consistency::Strong).await.unwrap();
        assert_eq!(2, third.active_rules().count());
        assert_eq!(committed, third.version().total);
        assert_eq!(2, storage.deltas.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cached_reads_expire() {
        let storage = Arc::new(InMemory::new());
        let cache = cache(storage.clone(), Duration::ZERO);
        cache.ruleset(&project(), Consistency::Cached).await.unwrap();
        storage.load(vec![RuleBuilder::new(1).build()]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let ruleset = cache.ruleset(&project(), Consistency::Cached).await.unwrap();
        assert_eq!(1, ruleset.active_rules().count());
    }
}
