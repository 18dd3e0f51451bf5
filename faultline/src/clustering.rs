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

//! # Cluster identity
//!
//! A cluster is named by the algorithm that produced it & an algorithm-specific ID. Clusters
//! produced by the rules algorithm are "bug clusters" (their ID is the ID of the rule that defines
//! them); everything else is a "suggested" cluster.
//!
//! The version of the rules algorithm is an internal detail: on the wire bug clusters are always
//! reported under the alias "rules", and the alias is resolved back to the current version when
//! reading a cluster ID from a caller.

use std::fmt::Display;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use faultline_shared::api;

use crate::algorithms;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("algorithm not valid"))]
    BadAlgorithm { algorithm: String, backtrace: Backtrace },
    #[snafu(display("ID is not valid lowercase hexadecimal bytes"))]
    BadId { id: String, backtrace: Backtrace },
    #[snafu(display("ID is empty"))]
    EmptyId { backtrace: Backtrace },
    #[snafu(display("ID is too long (got {got} bytes, want at most {MAX_CLUSTER_ID_BYTES} bytes)"))]
    IdTooLong { got: usize, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

/// The largest cluster ID any algorithm may produce, in bytes
pub const MAX_CLUSTER_ID_BYTES: usize = 16;

/// The name under which bug clusters are reported to callers
pub const RULES_ALIAS: &str = "rules";

lazy_static! {
    // Every algorithm name carries a version suffix; only the three algorithm families faultline
    // knows about are accepted, but any version of them is (rules may cite clusters produced by
    // earlier versions of an algorithm).
    static ref ALGORITHM: Regex =
        Regex::new(r"^(reason|testname|rules)-v[1-9][0-9]*$").unwrap(/* known good */);
    static ref RULES_FAMILY: Regex = Regex::new(r"^rules-v[1-9][0-9]*$").unwrap(/* known good */);
}

/// Identifies a cluster
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ClusterId {
    pub algorithm: String,
    pub id: String,
}

impl ClusterId {
    pub fn new(algorithm: &str, id: &str) -> ClusterId {
        ClusterId {
            algorithm: algorithm.to_owned(),
            id: id.to_owned(),
        }
    }
    /// The bug cluster defined by the rule with ID `rule_id`
    pub fn for_rule(rule_id: &str) -> ClusterId {
        ClusterId::new(algorithms::rules::ALGORITHM_NAME, rule_id)
    }
    /// Read a cluster ID supplied by a caller, resolving the "rules" alias
    pub fn from_wire(algorithm: &str, id: &str) -> ClusterId {
        if algorithm == RULES_ALIAS {
            ClusterId::for_rule(id)
        } else {
            ClusterId::new(algorithm, id)
        }
    }
    /// Produce the representation of this cluster ID we show callers
    pub fn to_wire(&self) -> api::ClusterId {
        api::ClusterId {
            algorithm: if self.is_bug_cluster() {
                RULES_ALIAS.to_owned()
            } else {
                self.algorithm.clone()
            },
            id: self.id.clone(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.algorithm.is_empty() && self.id.is_empty()
    }
    /// True iff this cluster was produced by (any version of) the rules algorithm
    pub fn is_bug_cluster(&self) -> bool {
        RULES_FAMILY.is_match(&self.algorithm)
    }
    pub fn validate(&self) -> Result<()> {
        ensure!(
            ALGORITHM.is_match(&self.algorithm),
            BadAlgorithmSnafu {
                algorithm: &self.algorithm
            }
        );
        ensure!(
            self.id.len() % 2 == 0
                && self
                    .id
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)),
            BadIdSnafu { id: &self.id }
        );
        ensure!(!self.id.is_empty(), EmptyIdSnafu);
        ensure!(
            self.id.len() / 2 <= MAX_CLUSTER_ID_BYTES,
            IdTooLongSnafu {
                got: self.id.len() / 2
            }
        );
        Ok(())
    }
    /// A string uniquely identifying this cluster, suitable for use as a map key
    ///
    /// Two cluster IDs produce the same key if & only if they're equal. The algorithm is
    /// length-prefixed, so no choice of algorithm & ID can masquerade as another.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.algorithm.len(), self.algorithm, self.id)
    }
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.algorithm, self.id)
    }
}

/// A single test failure to be clustered
///
/// Constructed per-request from the wire; never persisted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Failure {
    pub test_id: String,
    /// The primary error message, if the failure has one
    pub reason: Option<String>,
}

impl Failure {
    pub fn new(test_id: &str, reason: Option<&str>) -> Failure {
        Failure {
            test_id: test_id.to_owned(),
            reason: reason.map(|s| s.to_owned()),
        }
    }
    /// The primary error message, or the empty string
    pub fn reason_text(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

impl From<&api::ClusterTestResult> for Failure {
    fn from(value: &api::ClusterTestResult) -> Self {
        Failure {
            test_id: value.test_id.clone(),
            reason: value
                .failure_reason
                .as_ref()
                .map(|r| r.primary_error_message.clone()),
        }
    }
}
