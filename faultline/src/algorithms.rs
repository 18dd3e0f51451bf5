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

//! # Clustering algorithms
//!
//! faultline clusters each failure several ways at once. The "suggesting" algorithms
//! ([failure_reason], [test_name]) propose clusters from the failure alone (given project
//! configuration); the [rules] algorithm places the failure in the bug cluster of every active
//! rule whose predicate it satisfies.
//!
//! The set of algorithms is closed & versioned: changing any algorithm's output means bumping
//! both its name & [ALGORITHMS_VERSION].

pub mod failure_reason;
pub mod rules;
pub mod test_name;

use sha2::{Digest, Sha256};

use crate::{
    clustering::{ClusterId, Failure, MAX_CLUSTER_ID_BYTES},
    config::CompiledConfig,
    ruleset::Ruleset,
};

/// The version of the set of algorithms this build of faultline implements
pub const ALGORITHMS_VERSION: i64 = 1;

/// A suggesting clustering algorithm
///
/// Implementations must be pure functions of their inputs; they're invoked concurrently for
/// different failures in the same batch.
pub trait Algorithm: Send + Sync {
    /// This algorithm's name, including its version suffix
    fn name(&self) -> &'static str;
    /// Cluster `failure`, if this algorithm has an opinion about it
    fn cluster(&self, config: &CompiledConfig, failure: &Failure) -> Option<ClusterId>;
}

static SUGGESTING: &[&dyn Algorithm] = &[&failure_reason::FailureReason, &test_name::TestName];

/// The names of every algorithm, suggesting or otherwise
#[cfg(test)]
fn names() -> impl Iterator<Item = &'static str> {
    SUGGESTING
        .iter()
        .map(|a| a.name())
        .chain(std::iter::once(rules::ALGORITHM_NAME))
}

/// Run every algorithm over `failure`, returning the union of the clusters they produce
///
/// The result is sorted & free of duplicates.
pub fn cluster(config: &CompiledConfig, ruleset: &Ruleset, failure: &Failure) -> Vec<ClusterId> {
    let mut ids: Vec<ClusterId> = SUGGESTING
        .iter()
        .filter_map(|algorithm| algorithm.cluster(config, failure))
        .chain(rules::cluster(ruleset, failure))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Derive a cluster ID from `text`: the leading bytes of its SHA-256 digest, hex-encoded
pub(crate) fn hash_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..MAX_CLUSTER_ID_BYTES])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_name_is_valid() {
        let names = names().collect::<Vec<_>>();
        assert_eq!(vec!["reason-v1", "testname-v1", "rules-v2"], names);
        for name in names {
            assert!(ClusterId::new(name, "00").validate().is_ok());
        }
    }

    #[test]
    fn hashes() {
        let id = hash_id("abc");
        // SHA-256("abc") = ba7816bf 8f01cfea 414140de 5dae2223 ...
        assert_eq!("ba7816bf8f01cfea414140de5dae2223", id);
        assert!(ClusterId::new("reason-v1", &id).validate().is_ok());
    }
}
