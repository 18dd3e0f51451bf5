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

//! # faultline API types
//!
//! JSON representations of the faultline RPC requests & responses. Field names are camelCase on
//! the wire. These are deliberately "loose" (plain strings rather than the refined types in this
//! crate): the service validates them itself so that it can tell the caller precisely what was
//! wrong, rather than failing deserialization wholesale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Common types                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A cluster, as identified on the wire
///
/// Bug clusters are always reported with the algorithm "rules", whatever version of the rules
/// algorithm produced them.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterId {
    pub algorithm: String,
    pub id: String,
}

/// A bug associated with a rule, along with what's needed to display it
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedBug {
    pub system: String,
    pub id: String,
    pub link_text: String,
    pub url: String,
}

/// A bug reference supplied by a caller
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BugRef {
    pub system: String,
    pub id: String,
}

/// The versions of the inputs that produced a set of clustering results
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringVersion {
    pub algorithms_version: i64,
    pub rules_version: DateTime<Utc>,
    pub config_version: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       Clusters service                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    pub primary_error_message: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTestResult {
    /// Opaque to the service; echoed back so callers can correlate results
    #[serde(default)]
    pub request_tag: String,
    #[serde(default)]
    pub test_id: String,
    pub failure_reason: Option<FailureReason>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReq {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub test_results: Vec<ClusterTestResult>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEntry {
    pub cluster_id: ClusterId,
    /// Set for bug clusters only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bug: Option<AssociatedBug>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteredTestResult {
    pub request_tag: String,
    /// In no particular order
    pub clusters: Vec<ClusterEntry>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRsp {
    /// One per requested test result, in request order
    pub clustered_test_results: Vec<ClusteredTestResult>,
    pub clustering_version: ClusteringVersion,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGetPresubmitImpactReq {
    /// "projects/{project}"
    #[serde(default)]
    pub parent: String,
    /// "projects/{project}/clusters/{algorithm}/{id}/presubmitImpact"
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPresubmitImpact {
    pub name: String,
    pub distinct_cl_test_runs_failed_12h: i64,
    pub distinct_cl_test_runs_failed_24h: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGetPresubmitImpactRsp {
    /// One per requested name, in request order
    pub presubmit_impact: Vec<ClusterPresubmitImpact>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Rules service                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A failure association rule, as returned by the Rules service
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// "projects/{project}/rules/{rule_id}"
    pub name: String,
    pub project: String,
    pub rule_id: String,
    pub rule_definition: String,
    pub bug: AssociatedBug,
    pub is_active: bool,
    pub is_managing_bug: bool,
    pub source_cluster: ClusterId,
    pub create_time: DateTime<Utc>,
    pub create_user: String,
    pub last_update_time: DateTime<Utc>,
    pub last_update_user: String,
    pub predicate_last_update_time: DateTime<Utc>,
    /// Weak ETag; supply it to Update to guard against lost updates
    pub etag: String,
}

/// The caller-supplied fields of a rule, for Create & Update
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleSpec {
    /// Required on Update ("projects/{project}/rules/{rule_id}"); ignored on Create
    pub name: String,
    pub rule_definition: String,
    pub bug: BugRef,
    pub is_active: bool,
    pub is_managing_bug: bool,
    pub source_cluster: ClusterId,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GetRuleReq {
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRulesReq {
    #[serde(default)]
    pub parent: String,
    /// Zero or absent means "everything"
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub page_token: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRulesRsp {
    pub rules: Vec<Rule>,
    /// Empty when there are no further pages
    #[serde(default)]
    pub next_page_token: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreateRuleReq {
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub rule: RuleSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FieldMask {
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleReq {
    #[serde(default)]
    pub rule: RuleSpec,
    #[serde(default)]
    pub update_mask: FieldMask,
    /// If non-empty, the update is only applied if the rule's current ETag matches
    #[serde(default)]
    pub etag: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LookupBugReq {
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LookupBugRsp {
    /// Rule names, ordered by project & then rule ID
    pub rules: Vec<String>,
}
