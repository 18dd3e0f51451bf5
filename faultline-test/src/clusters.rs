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

//! Clusters service integration tests

use libtest_mimic::Failed;
use reqwest::{StatusCode, Url};

use faultline_shared::api;

use crate::{
    Client,
    rules::{create_rule, spec},
};

/// A `reason-v1` cluster for which fixtures seed presubmit impact in "chromium"...
pub const SEEDED_CLUSTER_ID: &str = "00112233445566778899aabbccddeeff";
/// ...namely this many distinct CL test runs failed over the last 12 hours...
pub const SEEDED_IMPACT_12H: i64 = 3;
/// ...& this many over the last day
pub const SEEDED_IMPACT_1D: i64 = 4;

fn test_result(tag: &str, test_id: &str, reason: Option<&str>) -> api::ClusterTestResult {
    api::ClusterTestResult {
        request_tag: tag.to_owned(),
        test_id: test_id.to_owned(),
        failure_reason: reason.map(|reason| api::FailureReason {
            primary_error_message: reason.to_owned(),
        }),
    }
}

/// Cluster failures against a freshly-created rule
pub async fn test_cluster(url: &Url, api_key: &str) -> Result<(), Failed> {
    let client = Client::new(url, Some(api_key))?;

    let rule = create_rule(
        &client,
        "chromium",
        spec(
            r#"test LIKE "%IntegrationSuite.Flaky%""#,
            ("monorail", "chromium/90001"),
        ),
    )
    .await?;

    let rsp: api::ClusterRsp = client
        .call(
            "Clusters",
            "Cluster",
            &api::ClusterReq {
                project: "chromium".to_owned(),
                test_results: vec![
                    test_result(
                        "first",
                        "ninja://chrome/test:browser_tests/IntegrationSuite.FlakyTest",
                        Some("Check failed: x == 42."),
                    ),
                    test_result("second", "ninja://other/Test", None),
                ],
            },
        )
        .await?;

    assert_eq!(1, rsp.clustering_version.algorithms_version);
    // The rule was committed before the request, so it must have been seen
    assert!(rsp.clustering_version.rules_version >= rule.predicate_last_update_time);
    assert_eq!(2, rsp.clustered_test_results.len());

    let first = &rsp.clustered_test_results[0];
    assert_eq!("first", first.request_tag);
    let mut algorithms = first
        .clusters
        .iter()
        .map(|entry| entry.cluster_id.algorithm.as_str())
        .collect::<Vec<_>>();
    algorithms.sort();
    assert_eq!(vec!["reason-v1", "rules", "testname-v1"], algorithms);
    let bug_cluster = first
        .clusters
        .iter()
        .find(|entry| entry.cluster_id.algorithm == "rules")
        .ok_or("no bug cluster")?;
    assert_eq!(rule.rule_id, bug_cluster.cluster_id.id);
    assert_eq!(Some(rule.bug.clone()), bug_cluster.bug);
    assert!(
        first
            .clusters
            .iter()
            .filter(|entry| entry.cluster_id.algorithm != "rules")
            .all(|entry| entry.bug.is_none() && entry.cluster_id.id.len() == 32)
    );

    let second = &rsp.clustered_test_results[1];
    assert_eq!("second", second.request_tag);
    assert_eq!(1, second.clusters.len());
    assert_eq!("testname-v1", second.clusters[0].cluster_id.algorithm);

    Ok(())
}

pub async fn test_cluster_validation(url: &Url, api_key: &str) -> Result<(), Failed> {
    let client = Client::new(url, Some(api_key))?;

    let (status, body) = client
        .call_err(
            "Clusters",
            "Cluster",
            &api::ClusterReq {
                project: String::new(),
                test_results: vec![test_result("t", "some/test", None)],
            },
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);
    assert_eq!("INVALID_ARGUMENT", body.code);

    let (status, body) = client
        .call_err(
            "Clusters",
            "Cluster",
            &api::ClusterReq {
                project: "no-such-project".to_owned(),
                test_results: vec![test_result("t", "some/test", None)],
            },
        )
        .await?;
    assert_eq!(StatusCode::PRECONDITION_FAILED, status);
    assert_eq!("FAILED_PRECONDITION", body.code);

    let (status, _) = client
        .call_err(
            "Clusters",
            "Cluster",
            &api::ClusterReq {
                project: "chromium".to_owned(),
                test_results: (0..1001)
                    .map(|i| test_result(&i.to_string(), "some/test", None))
                    .collect(),
            },
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);

    let (status, _) = client
        .call_err(
            "Clusters",
            "Cluster",
            &api::ClusterReq {
                project: "chromium".to_owned(),
                test_results: vec![test_result("t", "", None)],
            },
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);

    Ok(())
}

/// Read presubmit impact, both of suggested clusters & of a bug cluster whose rule is newer than
/// reclustering (& so reports its source cluster's impact)
pub async fn test_presubmit_impact(url: &Url, api_key: &str) -> Result<(), Failed> {
    let client = Client::new(url, Some(api_key))?;

    let mut sourced = spec(r#"reason LIKE "%presubmit impact%""#, ("buganizer", "90002"));
    sourced.source_cluster = api::ClusterId {
        algorithm: "reason-v1".to_owned(),
        id: SEEDED_CLUSTER_ID.to_owned(),
    };
    let rule = create_rule(&client, "chromium", sourced).await?;

    let names = vec![
        format!(
            "projects/chromium/clusters/reason-v1/{}/presubmitImpact",
            SEEDED_CLUSTER_ID
        ),
        "projects/chromium/clusters/reason-v1/ffffffffffffffffffffffffffffffff/presubmitImpact"
            .to_owned(),
        format!("projects/chromium/clusters/rules/{}/presubmitImpact", rule.rule_id),
        "projects/chromium/clusters/rules/eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee/presubmitImpact"
            .to_owned(),
    ];
    let rsp: api::BatchGetPresubmitImpactRsp = client
        .call(
            "Clusters",
            "BatchGetPresubmitImpact",
            &api::BatchGetPresubmitImpactReq {
                parent: "projects/chromium".to_owned(),
                names: names.clone(),
            },
        )
        .await?;
    assert_eq!(
        names,
        rsp.presubmit_impact
            .iter()
            .map(|impact| impact.name.clone())
            .collect::<Vec<_>>()
    );
    assert_eq!(
        vec![
            (SEEDED_IMPACT_12H, SEEDED_IMPACT_1D),
            (0, 0),
            (SEEDED_IMPACT_12H, SEEDED_IMPACT_1D),
            (0, 0)
        ],
        rsp.presubmit_impact
            .iter()
            .map(|impact| (
                impact.distinct_cl_test_runs_failed_12h,
                impact.distinct_cl_test_runs_failed_24h
            ))
            .collect::<Vec<_>>()
    );

    // No analysis has been seeded for "testproject"
    let (status, body) = client
        .call_err(
            "Clusters",
            "BatchGetPresubmitImpact",
            &api::BatchGetPresubmitImpactReq {
                parent: "projects/testproject".to_owned(),
                names: vec![format!(
                    "projects/testproject/clusters/reason-v1/{}/presubmitImpact",
                    SEEDED_CLUSTER_ID
                )],
            },
        )
        .await?;
    assert_eq!(StatusCode::NOT_FOUND, status);
    assert_eq!(
        "project does not exist in faultline or cluster analysis is not yet available",
        body.error
    );

    // Names must lie within the parent
    let (status, _) = client
        .call_err(
            "Clusters",
            "BatchGetPresubmitImpact",
            &api::BatchGetPresubmitImpactReq {
                parent: "projects/chromium".to_owned(),
                names: vec![format!(
                    "projects/testproject/clusters/reason-v1/{}/presubmitImpact",
                    SEEDED_CLUSTER_ID
                )],
            },
        )
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, status);

    Ok(())
}
