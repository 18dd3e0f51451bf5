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

//! # faultline service state
//!
//! [Faultline] is the state shared by every request handler: the rule store, project
//! configuration, ruleset cache, cluster analysis & access control.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use opentelemetry_prometheus_text_exporter::PrometheusExporter;

use crate::{
    analysis::{Backend as AnalysisBackend, ReclusteringProgress},
    authn::AccessControl,
    config::Backend as ConfigBackend,
    metrics::Instruments,
    ruleset::RulesetCache,
    storage::Backend as StorageBackend,
};

pub struct Faultline {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub configs: Arc<dyn ConfigBackend + Send + Sync>,
    pub rulesets: RulesetCache,
    pub analysis: Arc<dyn AnalysisBackend + Send + Sync>,
    pub progress: Arc<dyn ReclusteringProgress + Send + Sync>,
    pub access: AccessControl,
    pub instruments: Arc<Instruments>,
    pub exporter: PrometheusExporter,
}

/// The collaborators from which a [Faultline] is assembled
pub struct Collaborators {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub configs: Arc<dyn ConfigBackend + Send + Sync>,
    pub analysis: Arc<dyn AnalysisBackend + Send + Sync>,
    pub progress: Arc<dyn ReclusteringProgress + Send + Sync>,
}

impl Faultline {
    pub fn new(
        collaborators: Collaborators,
        access: AccessControl,
        ruleset_max_staleness: Duration,
        ruleset_cache_size: NonZeroUsize,
        exporter: PrometheusExporter,
    ) -> Faultline {
        let instruments = Arc::new(Instruments::new("faultline"));
        Faultline {
            rulesets: RulesetCache::new(
                collaborators.storage.clone(),
                instruments.clone(),
                ruleset_max_staleness,
                ruleset_cache_size,
            ),
            storage: collaborators.storage,
            configs: collaborators.configs,
            analysis: collaborators.analysis,
            progress: collaborators.progress,
            access,
            instruments,
            exporter,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    use std::collections::HashMap;

    use faultline_shared::ProjectId;

    use crate::{
        analysis::Dataset,
        config::{MonorailConfig, ProjectConfig, StaticConfig},
        memory::InMemory,
    };

    /// The identity unit tests act as
    pub const USER: &str = "someone@example.com";

    /// "chromium" & "testproject", both filing bugs in monorail
    pub fn projects() -> HashMap<ProjectId, ProjectConfig> {
        [("chromium", "chromium", "crbug.com"), ("testproject", "monorailproject", "mybug.com")]
            .into_iter()
            .map(|(project, monorail, prefix)| {
                (
                    ProjectId::new(project).unwrap(),
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

    pub fn state(storage: Arc<InMemory>, dataset: Dataset) -> Arc<Faultline> {
        let dataset = Arc::new(dataset);
        Arc::new(Faultline::new(
            Collaborators {
                storage,
                configs: Arc::new(StaticConfig::new(&projects()).unwrap()),
                analysis: dataset.clone(),
                progress: dataset,
            },
            AccessControl::default(),
            Duration::from_secs(60),
            NonZeroUsize::new(16).unwrap(),
            PrometheusExporter::new(),
        ))
    }
}
