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

//! Cluster failures by their (normalised) primary error message.

use lazy_static::lazy_static;
use regex::Regex;

use crate::{
    algorithms::{Algorithm, hash_id},
    clustering::{ClusterId, Failure},
    config::CompiledConfig,
    lang::escape_like,
};

pub const ALGORITHM_NAME: &str = "reason-v1";

lazy_static! {
    // Hex literals, long runs of hex digits (addresses, hashes) & decimal numbers
    static ref VARIABLE: Regex =
        Regex::new(r"0[xX][0-9a-fA-F]+|[0-9a-fA-F]{8,}|[0-9]+").unwrap(/* known good */);
}

/// Produce a LIKE pattern matching `reason` and every message differing from it only in the
/// numbers it mentions
pub fn like_expression(reason: &str) -> String {
    VARIABLE.replace_all(&escape_like(reason), "%").into_owned()
}

pub struct FailureReason;

impl Algorithm for FailureReason {
    fn name(&self) -> &'static str {
        ALGORITHM_NAME
    }
    fn cluster(&self, _config: &CompiledConfig, failure: &Failure) -> Option<ClusterId> {
        match failure.reason.as_deref() {
            Some(reason) if !reason.is_empty() => Some(ClusterId::new(
                ALGORITHM_NAME,
                &hash_id(&like_expression(reason)),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalisation() {
        assert_eq!(
            r"my\_file.cc(%): Check failed: false.",
            like_expression("my_file.cc(123): Check failed: false.")
        );
        assert_eq!(
            "segfault at % in %",
            like_expression("segfault at 0x7ffd1234 in 5")
        );
        assert_eq!(
            "object % went away",
            like_expression("object deadbeefcafe0123 went away")
        );
        assert_eq!(r"%\% done", like_expression("100% done"));
    }

    #[test]
    fn clustering() {
        let config = CompiledConfig::default();
        let a = FailureReason.cluster(&config, &Failure::new("t1", Some("Timed out after 30s")));
        let b = FailureReason.cluster(&config, &Failure::new("t2", Some("Timed out after 45s")));
        let c = FailureReason.cluster(&config, &Failure::new("t2", Some("Out of memory")));
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_ne!(a, c);
        let a = a.unwrap();
        assert_eq!(ALGORITHM_NAME, a.algorithm);
        assert!(a.validate().is_ok());

        assert_eq!(None, FailureReason.cluster(&config, &Failure::new("t", None)));
        assert_eq!(None, FailureReason.cluster(&config, &Failure::new("t", Some(""))));
    }
}
