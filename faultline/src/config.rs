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

//! # Project configuration
//!
//! Each project onboarded to faultline carries a small amount of configuration: where its bugs
//! live (for presenting bug links & validating the bugs rules cite) and how to cluster its test
//! names. This module defines that configuration, its compiled form, and the [Backend] trait
//! through which the rest of faultline looks it up.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use faultline_shared::{BugId, BugSystem, ProjectId, api};

use crate::{
    algorithms::test_name::{self, CompiledTestNameRule},
    entities::STARTING_EPOCH,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("test name rule {name:?} is invalid: {source}"))]
    BadTestNameRule {
        name: String,
        source: test_name::Error,
    },
    #[snafu(display("bug not in expected monorail project ({expected})"))]
    WrongMonorailProject {
        expected: String,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      Project configuration                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Where a project files its monorail bugs
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonorailConfig {
    /// The monorail project in which bugs are filed
    pub project: String,
    /// Prefix for user-facing bug links, e.g. "crbug.com"
    pub display_prefix: String,
    /// The monorail host, e.g. "bugs.chromium.org"
    pub monorail_hostname: String,
}

/// A rule for clustering test failures by test name; see [test_name](crate::algorithms::test_name)
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestNameRule {
    pub name: String,
    pub pattern: String,
    pub like_template: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProjectConfig {
    pub monorail: MonorailConfig,
    pub test_name_rules: Vec<TestNameRule>,
    /// When this configuration last changed; reported to callers as the config version
    pub last_updated: DateTime<Utc>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        ProjectConfig {
            monorail: MonorailConfig::default(),
            test_name_rules: Vec::new(),
            last_updated: *STARTING_EPOCH,
        }
    }
}

/// A [ProjectConfig] with its test name rules compiled
#[derive(Clone, Debug, Default)]
pub struct CompiledConfig {
    config: ProjectConfig,
    test_name_rules: Vec<CompiledTestNameRule>,
}

impl CompiledConfig {
    pub fn new(config: ProjectConfig) -> Result<CompiledConfig> {
        let test_name_rules = config
            .test_name_rules
            .iter()
            .map(|rule| {
                CompiledTestNameRule::compile(rule).context(BadTestNameRuleSnafu {
                    name: rule.name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledConfig {
            config,
            test_name_rules,
        })
    }
    /// The configuration version
    pub fn version(&self) -> DateTime<Utc> {
        self.config.last_updated
    }
    pub fn test_name_rules(&self) -> &[CompiledTestNameRule] {
        &self.test_name_rules
    }
    /// Present `bug` to a caller
    pub fn associated_bug(&self, bug: &BugId) -> api::AssociatedBug {
        let (link_text, url) = match (bug.system(), bug.monorail_project_and_id()) {
            (BugSystem::Monorail, Some((project, id))) => (
                format!("{}/{}", self.config.monorail.display_prefix, id),
                format!(
                    "https://{}/p/{}/issues/detail?id={}",
                    self.config.monorail.monorail_hostname, project, id
                ),
            ),
            _ => (
                format!("b/{}", bug.id()),
                format!("https://issuetracker.google.com/issues/{}", bug.id()),
            ),
        };
        api::AssociatedBug {
            system: bug.system().to_string(),
            id: bug.id().to_owned(),
            link_text,
            url,
        }
    }
    /// Check that rules in this project may cite `bug`
    pub fn validate_bug(&self, bug: &BugId) -> Result<()> {
        if let Some((project, _)) = bug.monorail_project_and_id() {
            ensure!(
                project == self.config.monorail.project,
                WrongMonorailProjectSnafu {
                    expected: self.config.monorail.project.clone()
                }
            );
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        Configuration lookup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Look up project configuration
#[async_trait]
pub trait Backend {
    /// Retrieve the configuration for `project`; None means the project isn't onboarded
    async fn project_config(&self, project: &ProjectId) -> Option<Arc<CompiledConfig>>;
}

/// Serve project configuration from a fixed table, compiled once at construction
#[derive(Debug, Default)]
pub struct StaticConfig {
    projects: HashMap<ProjectId, Arc<CompiledConfig>>,
}

impl StaticConfig {
    pub fn new<'a>(
        projects: impl IntoIterator<Item = (&'a ProjectId, &'a ProjectConfig)>,
    ) -> Result<StaticConfig> {
        Ok(StaticConfig {
            projects: projects
                .into_iter()
                .map(|(project, config)| -> Result<_> {
                    Ok((project.clone(), Arc::new(CompiledConfig::new(config.clone())?)))
                })
                .collect::<Result<HashMap<_, _>>>()?,
        })
    }
}

#[async_trait]
impl Backend for StaticConfig {
    async fn project_config(&self, project: &ProjectId) -> Option<Arc<CompiledConfig>> {
        self.projects.get(project).cloned()
    }
}
