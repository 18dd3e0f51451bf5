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

//! # Cluster analysis
//!
//! faultline doesn't compute cluster impact itself; it reads it from an analysis pipeline that
//! periodically re-clusters every failure against the latest rules. This module defines the two
//! things faultline needs from that pipeline: the presubmit impact of clusters ([Backend]) and
//! how far re-clustering has progressed ([ReclusteringProgress]).
//!
//! [Dataset] implements both over a JSON file.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::{Backtrace, prelude::*};

use faultline_shared::ProjectId;

use crate::{clustering::ClusterId, entities::STARTING_EPOCH};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse the analysis dataset at {path:?}: {source}"))]
    ParseDataset {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("project {project} has no cluster analysis"))]
    ProjectNotExists {
        project: ProjectId,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read the analysis dataset at {path:?}: {source}"))]
    ReadDataset {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The presubmit impact of a single cluster
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterPresubmitImpact {
    #[serde(flatten)]
    pub cluster_id: ClusterId,
    /// Distinct user CLs with test runs failed in this cluster over the last 12 hours
    pub distinct_cl_test_runs_failed_12h: i64,
    /// ...& over the last day
    pub distinct_cl_test_runs_failed_1d: i64,
}

#[async_trait]
pub trait Backend {
    /// Read the impact of `clusters` in `project`
    ///
    /// Clusters with no failures have no row, & are simply absent from the result. Fails with
    /// [Error::ProjectNotExists] if analysis is not (yet) available for `project`.
    async fn read_cluster_presubmit_impact(
        &self,
        project: &ProjectId,
        clusters: &[ClusterId],
    ) -> Result<Vec<ClusterPresubmitImpact>>;
}

#[async_trait]
pub trait ReclusteringProgress {
    /// The rules version which re-clustering of all of `project`'s failures has caught up
    /// with; [STARTING_EPOCH] if it hasn't caught up with any
    async fn rules_version_completed(&self, project: &ProjectId) -> Result<DateTime<Utc>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ProjectAnalysis {
    #[serde(default = "starting_epoch")]
    rules_version_completed: DateTime<Utc>,
    #[serde(default)]
    impacts: Vec<ClusterPresubmitImpact>,
}

fn starting_epoch() -> DateTime<Utc> {
    *STARTING_EPOCH
}

#[derive(Debug, Default)]
struct ProjectImpacts {
    rules_version_completed: DateTime<Utc>,
    impacts: HashMap<ClusterId, ClusterPresubmitImpact>,
}

/// Cluster analysis results, read from a JSON document of the form:
///
/// ```json
/// {
///   "chromium": {
///     "rules-version-completed": "2021-01-01T00:00:00Z",
///     "impacts": [
///       {"algorithm": "reason-v1", "id": "...",
///        "distinct-cl-test-runs-failed-12h": 1, "distinct-cl-test-runs-failed-1d": 2}
///     ]
///   }
/// }
/// ```
///
/// Projects absent from the document have no analysis.
#[derive(Debug, Default)]
pub struct Dataset {
    projects: HashMap<ProjectId, ProjectImpacts>,
}

impl Dataset {
    /// A dataset with no projects
    pub fn empty() -> Dataset {
        Dataset::default()
    }
    pub fn open(path: &Path) -> Result<Dataset> {
        let text = std::fs::read_to_string(path).context(ReadDatasetSnafu { path })?;
        let projects: HashMap<ProjectId, ProjectAnalysis> =
            serde_json::from_str(&text).context(ParseDatasetSnafu { path })?;
        let mut dataset = Dataset::empty();
        for (project, analysis) in projects {
            dataset.insert(
                project,
                analysis.rules_version_completed,
                analysis.impacts,
            );
        }
        Ok(dataset)
    }
    /// Add (or replace) the analysis for `project`
    pub fn insert(
        &mut self,
        project: ProjectId,
        rules_version_completed: DateTime<Utc>,
        impacts: impl IntoIterator<Item = ClusterPresubmitImpact>,
    ) {
        self.projects.insert(
            project,
            ProjectImpacts {
                rules_version_completed,
                impacts: impacts
                    .into_iter()
                    .map(|impact| (impact.cluster_id.clone(), impact))
                    .collect(),
            },
        );
    }
    fn project(&self, project: &ProjectId) -> Result<&ProjectImpacts> {
        self.projects.get(project).context(ProjectNotExistsSnafu {
            project: project.clone(),
        })
    }
}

#[async_trait]
impl Backend for Dataset {
    async fn read_cluster_presubmit_impact(
        &self,
        project: &ProjectId,
        clusters: &[ClusterId],
    ) -> Result<Vec<ClusterPresubmitImpact>> {
        let analysis = self.project(project)?;
        Ok(clusters
            .iter()
            .filter_map(|id| analysis.impacts.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl ReclusteringProgress for Dataset {
    async fn rules_version_completed(&self, project: &ProjectId) -> Result<DateTime<Utc>> {
        Ok(self
            .projects
            .get(project)
            .map(|analysis| analysis.rules_version_completed)
            .unwrap_or(*STARTING_EPOCH))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    #[tokio::test]
    async fn datasets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
  "chromium": {{
    "rules-version-completed": "2020-04-01T02:03:04.000000005Z",
    "impacts": [
      {{"algorithm": "reason-v1", "id": "cccccccccccccccccccccccccccccc00",
       "distinct-cl-test-runs-failed-12h": 1, "distinct-cl-test-runs-failed-1d": 2}}
    ]
  }},
  "newproject": {{}}
}}"#
        )
        .unwrap();
        let dataset = Dataset::open(file.path()).unwrap();

        let chromium = ProjectId::new("chromium").unwrap();
        let known = ClusterId::new("reason-v1", "cccccccccccccccccccccccccccccc00");
        let unknown = ClusterId::new("reason-v1", "cccccccccccccccccccccccccccccc01");
        let rows = dataset
            .read_cluster_presubmit_impact(&chromium, &[unknown.clone(), known.clone()])
            .await
            .unwrap();
        assert_eq!(1, rows.len());
        assert_eq!(known, rows[0].cluster_id);
        assert_eq!(1, rows[0].distinct_cl_test_runs_failed_12h);
        assert_eq!(2, rows[0].distinct_cl_test_runs_failed_1d);
        assert_eq!(
            "2020-04-01T02:03:04.000000005+00:00",
            dataset
                .rules_version_completed(&chromium)
                .await
                .unwrap()
                .to_rfc3339()
        );

        let newproject = ProjectId::new("newproject").unwrap();
        assert!(dataset
            .read_cluster_presubmit_impact(&newproject, &[known])
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            *STARTING_EPOCH,
            dataset.rules_version_completed(&newproject).await.unwrap()
        );

        let missing = ProjectId::new("missing").unwrap();
        assert!(matches!(
            dataset.read_cluster_presubmit_impact(&missing, &[]).await,
            Err(Error::ProjectNotExists { .. })
        ));
    }
}
