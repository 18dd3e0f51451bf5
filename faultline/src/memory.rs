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

//! # In-memory rule store
//!
//! [InMemory] keeps committed rules in a [BTreeMap] keyed by (project, rule ID) behind a tokio
//! [RwLock]. A transaction holds the store's writer [Mutex] from [begin] until it's committed or
//! dropped, so its reads & the writes it commits are serialised with respect to every other
//! transaction; plain reads never wait on a transaction, only (briefly) on a commit.
//!
//! If configured with a snapshot path, the store loads its rules from that file at startup &
//! rewrites it (atomically, via rename) on every commit.
//!
//! [begin]: storage::Backend::begin

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use snafu::{Backtrace, prelude::*};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use faultline_shared::{BugId, ProjectId, RuleId};

use crate::{
    entities::{self, FailureAssociationRule, STARTING_EPOCH, validate_user},
    storage::{self, Error as StorError, Transaction},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid rule: {source}"))]
    InvalidRule { source: entities::Error },
    #[snafu(display("rule {name} does not exist"))]
    NoSuchRule { name: String, backtrace: Backtrace },
    #[snafu(display("Failed to parse the rule snapshot at {path:?}: {source}"))]
    ParseSnapshot {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read the rule snapshot at {path:?}: {source}"))]
    ReadSnapshot {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("rule {name} already exists"))]
    RuleExists { name: String, backtrace: Backtrace },
    #[snafu(display("Failed to serialize the rule snapshot: {source}"))]
    SerializeSnapshot {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to write the rule snapshot to {path:?}: {source}"))]
    WriteSnapshot {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

type Rule = FailureAssociationRule;

type Key = (ProjectId, RuleId);

fn key(rule: &Rule) -> Key {
    (rule.project.clone(), rule.rule_id.clone())
}

#[derive(Debug, Default)]
struct Store {
    rules: BTreeMap<Key, Rule>,
    last_commit: Option<DateTime<Utc>>,
}

impl Store {
    fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Store {
        let mut store = Store::default();
        store.insert(rules);
        store
    }
    fn insert(&mut self, rules: impl IntoIterator<Item = Rule>) {
        for rule in rules {
            self.last_commit = self.last_commit.max(Some(rule.last_updated));
            self.rules.insert(key(&rule), rule);
        }
    }
    fn project_rules<'a>(&'a self, project: &'a ProjectId) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules
            .iter()
            .filter(move |((p, _), _)| p == project)
            .map(|(_, rule)| rule)
    }
    fn by_bug(&self, bug: &BugId) -> Vec<Rule> {
        // Keys are ordered by (project, rule ID) already
        self.rules
            .values()
            .filter(|rule| &rule.bug == bug)
            .cloned()
            .collect()
    }
    /// The next commit timestamp: now, at microsecond precision, but strictly after the last
    fn next_commit(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        match self.last_commit {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }
}

/// An in-memory, optionally persistent, rule store
pub struct InMemory {
    store: Arc<RwLock<Store>>,
    writer: Arc<Mutex<()>>,
    snapshot: Option<PathBuf>,
}

impl Default for InMemory {
    fn default() -> Self {
        InMemory::new()
    }
}

impl InMemory {
    /// An empty store, persisted nowhere
    pub fn new() -> InMemory {
        InMemory {
            store: Arc::new(RwLock::new(Store::default())),
            writer: Arc::new(Mutex::new(())),
            snapshot: None,
        }
    }
    /// A store persisted at `path`, initialized from it if it exists
    pub fn open(path: &Path) -> Result<InMemory> {
        let rules: Vec<Rule> = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context(ParseSnapshotSnafu { path })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).context(ReadSnapshotSnafu { path }),
        };
        debug!("Loaded {} rules from {}", rules.len(), path.display());
        Ok(InMemory {
            store: Arc::new(RwLock::new(Store::from_rules(rules))),
            writer: Arc::new(Mutex::new(())),
            snapshot: Some(path.to_owned()),
        })
    }
    /// Insert `rules` verbatim (timestamps & all), bypassing transactions
    #[cfg(test)]
    pub async fn load(&self, rules: impl IntoIterator<Item = Rule>) {
        self.store.write().await.insert(rules)
    }
}

#[async_trait]
impl storage::Backend for InMemory {
    async fn read_rule(
        &self,
        project: &ProjectId,
        rule_id: &RuleId,
    ) -> StdResult<Option<Rule>, StorError> {
        Ok(self
            .store
            .read()
            .await
            .rules
            .get(&(project.clone(), rule_id.clone()))
            .cloned())
    }
    async fn read_active_rules(&self, project: &ProjectId) -> StdResult<Vec<Rule>, StorError> {
        Ok(self
            .store
            .read()
            .await
            .project_rules(project)
            .filter(|rule| rule.is_active)
            .cloned()
            .collect())
    }
    async fn read_rules_by_bug(&self, bug: &BugId) -> StdResult<Vec<Rule>, StorError> {
        Ok(self.store.read().await.by_bug(bug))
    }
    async fn read_rules_delta(
        &self,
        project: &ProjectId,
        since: &DateTime<Utc>,
    ) -> StdResult<Vec<Rule>, StorError> {
        Ok(self
            .store
            .read()
            .await
            .project_rules(project)
            .filter(|rule| &rule.last_updated > since)
            .cloned()
            .collect())
    }
    async fn read_many_rules(
        &self,
        project: &ProjectId,
        rule_ids: &[RuleId],
    ) -> StdResult<Vec<Option<Rule>>, StorError> {
        let store = self.store.read().await;
        Ok(rule_ids
            .iter()
            .map(|id| store.rules.get(&(project.clone(), id.clone())).cloned())
            .collect())
    }
    async fn read_last_updated(&self, project: &ProjectId) -> StdResult<DateTime<Utc>, StorError> {
        Ok(self
            .store
            .read()
            .await
            .project_rules(project)
            .map(|rule| rule.last_updated)
            .max()
            .unwrap_or(*STARTING_EPOCH))
    }
    async fn begin(&self) -> StdResult<Box<dyn Transaction + Send + Sync>, StorError> {
        let guard = self.writer.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            store: self.store.clone(),
            snapshot: self.snapshot.clone(),
            _guard: guard,
            mutations: Vec::new(),
        }))
    }
}

enum Mutation {
    Create {
        rule: Rule,
        user: String,
    },
    Update {
        rule: Rule,
        update_predicate: bool,
        user: String,
    },
}

struct MemoryTransaction {
    store: Arc<RwLock<Store>>,
    snapshot: Option<PathBuf>,
    _guard: OwnedMutexGuard<()>,
    mutations: Vec<Mutation>,
}

fn check(rule: &Rule, user: &str) -> Result<()> {
    rule.validate().context(InvalidRuleSnafu)?;
    validate_user(user).context(InvalidRuleSnafu)
}

/// Compute the rows `mutations` would write at time `ts` atop `rules`
fn stage(
    rules: &BTreeMap<Key, Rule>,
    mutations: Vec<Mutation>,
    ts: DateTime<Utc>,
) -> Result<BTreeMap<Key, Rule>> {
    let mut staged: BTreeMap<Key, Rule> = BTreeMap::new();
    for mutation in mutations {
        match mutation {
            Mutation::Create { mut rule, user } => {
                let key = key(&rule);
                ensure!(
                    !staged.contains_key(&key) && !rules.contains_key(&key),
                    RuleExistsSnafu { name: rule.name() }
                );
                rule.creation_time = ts;
                rule.creation_user = user.clone();
                rule.last_updated = ts;
                rule.last_updated_user = user;
                rule.predicate_last_updated = ts;
                staged.insert(key, rule);
            }
            Mutation::Update {
                mut rule,
                update_predicate,
                user,
            } => {
                let key = key(&rule);
                let prior = staged
                    .get(&key)
                    .or_else(|| rules.get(&key))
                    .context(NoSuchRuleSnafu { name: rule.name() })?;
                rule.creation_time = prior.creation_time;
                rule.creation_user = prior.creation_user.clone();
                rule.last_updated = ts;
                rule.last_updated_user = user;
                rule.predicate_last_updated = if update_predicate {
                    ts
                } else {
                    prior.predicate_last_updated
                };
                staged.insert(key, rule);
            }
        }
    }
    Ok(staged)
}

async fn write_snapshot(path: &Path, rules: &BTreeMap<Key, Rule>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&rules.values().collect::<Vec<_>>())
        .context(SerializeSnapshotSnafu)?;
    let tmp = path.with_extension("tmp");
    let result = match tokio::fs::write(&tmp, bytes).await {
        Ok(()) => tokio::fs::rename(&tmp, path)
            .await
            .context(WriteSnapshotSnafu { path }),
        Err(err) => Err(err).context(WriteSnapshotSnafu { path: &tmp }),
    };
    if result.is_err() {
        // Best effort; the write may have failed before creating the file
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn read_rule(
        &self,
        project: &ProjectId,
        rule_id: &RuleId,
    ) -> StdResult<Option<Rule>, StorError> {
        Ok(self
            .store
            .read()
            .await
            .rules
            .get(&(project.clone(), rule_id.clone()))
            .cloned())
    }
    async fn read_rules_by_bug(&self, bug: &BugId) -> StdResult<Vec<Rule>, StorError> {
        Ok(self.store.read().await.by_bug(bug))
    }
    fn create_rule(&mut self, rule: &Rule, user: &str) -> StdResult<(), StorError> {
        check(rule, user).map_err(StorError::new)?;
        self.mutations.push(Mutation::Create {
            rule: rule.clone(),
            user: user.to_owned(),
        });
        Ok(())
    }
    fn update_rule(
        &mut self,
        rule: &Rule,
        update_predicate: bool,
        user: &str,
    ) -> StdResult<(), StorError> {
        check(rule, user).map_err(StorError::new)?;
        self.mutations.push(Mutation::Update {
            rule: rule.clone(),
            update_predicate,
            user: user.to_owned(),
        });
        Ok(())
    }
    async fn commit(self: Box<Self>) -> StdResult<DateTime<Utc>, StorError> {
        let this = *self;
        let mut store = this.store.write().await;
        let ts = store.next_commit();
        let staged = stage(&store.rules, this.mutations, ts).map_err(StorError::new)?;
        let mut next = store.rules.clone();
        next.extend(staged);
        if let Some(path) = &this.snapshot {
            write_snapshot(path, &next).await.map_err(StorError::new)?;
        }
        store.rules = next;
        store.last_commit = Some(ts);
        Ok(ts)
    }
}
