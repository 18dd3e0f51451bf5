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

//! Cluster failures by the failure association rules they satisfy.

use crate::{
    clustering::{ClusterId, Failure},
    ruleset::Ruleset,
};

pub const ALGORITHM_NAME: &str = "rules-v2";

/// The bug clusters of every active rule in `ruleset` whose predicate `failure` satisfies
pub fn cluster<'a>(ruleset: &'a Ruleset, failure: &'a Failure) -> impl Iterator<Item = ClusterId> + 'a {
    ruleset
        .active_rules()
        .filter(|rule| rule.expr.evaluate(failure))
        .map(|rule| rule.rule.cluster_id())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{entities::RuleBuilder, ruleset::Ruleset};

    #[test]
    fn matching() {
        let ruleset = Ruleset::from_rules(vec![
            RuleBuilder::new(1)
                .with_rule_definition(r#"test LIKE "%TestSuite.TestName%""#)
                .build(),
            RuleBuilder::new(2)
                .with_rule_definition(r#"reason LIKE "my_file.cc(%): Check failed: false.""#)
                .build(),
            RuleBuilder::new(3)
                .with_rule_definition(r#"test LIKE "%TestSuite%""#)
                .with_active(false)
                .build(),
        ])
        .unwrap();

        let mut ids = cluster(
            &ruleset,
            &Failure::new(
                "ninja://TestSuite.TestName",
                Some("my_file.cc(123): Check failed: false."),
            ),
        )
        .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(
            vec![
                ClusterId::new(ALGORITHM_NAME, "00000000000000000000000000000001"),
                ClusterId::new(ALGORITHM_NAME, "00000000000000000000000000000002"),
            ],
            ids
        );
        assert_eq!(
            0,
            cluster(&ruleset, &Failure::new("ninja://Other", None)).count()
        );
    }
}
