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

//! Cluster failures by test name.
//!
//! Projects may configure an ordered list of [TestNameRule]s, each pairing a regular expression
//! over test IDs with a template for a LIKE expression. The first rule matching a test ID
//! instantiates its template with the pattern's named captures; the hash of the resulting LIKE
//! expression identifies the cluster. Test IDs matching no rule are clustered by their own
//! (escaped) text.
//!
//! Templates refer to captures as `${name}`; `$$` inserts a literal `$`. Captured text is
//! LIKE-escaped before substitution, so it always matches literally.

use lazy_static::lazy_static;
use regex::Regex;
use snafu::{Backtrace, prelude::*};

use crate::{
    algorithms::{Algorithm, hash_id},
    clustering::{ClusterId, Failure},
    config::{CompiledConfig, TestNameRule},
    lang::{self, escape_like, validate_like_pattern},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "invalid use of the $ operator at position {position} in {template:?} ('$' not followed \
         by '{{name}}' or '$'), if you meant to include a literal $ character, please use $$"
    ))]
    BareDollar {
        position: usize,
        template: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{text:?} is not a valid standalone LIKE expression: {source}"))]
    BadLiteral { text: String, source: lang::Error },
    #[snafu(display("parsing pattern: {source}"))]
    BadPattern {
        source: regex::Error,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "like template contains reference to non-existant capturing group with name {name:?}"
    ))]
    NoSuchGroup { name: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

pub const ALGORITHM_NAME: &str = "testname-v1";

lazy_static! {
    static ref SUBSTITUTION: Regex = Regex::new(r"\$\{(\w+?)\}|\$\$?").unwrap(/* known good */);
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Capture(usize),
}

/// A [TestNameRule], ready for evaluation
#[derive(Clone, Debug)]
pub struct CompiledTestNameRule {
    pattern: Regex,
    segments: Vec<Segment>,
}

fn literal(text: &str) -> Result<Segment> {
    validate_like_pattern(text).context(BadLiteralSnafu { text })?;
    Ok(Segment::Literal(text.to_owned()))
}

impl CompiledTestNameRule {
    pub fn compile(rule: &TestNameRule) -> Result<CompiledTestNameRule> {
        let pattern = Regex::new(&rule.pattern).context(BadPatternSnafu)?;
        let template = &rule.like_template;

        let mut segments = Vec::new();
        let mut last = 0;
        for captures in SUBSTITUTION.captures_iter(template) {
            let whole = captures.get(0).unwrap(/* group zero always participates */);
            if whole.start() > last {
                segments.push(literal(&template[last..whole.start()])?);
            }
            match (whole.as_str(), captures.get(1)) {
                ("$", _) => {
                    return BareDollarSnafu {
                        position: whole.start(),
                        template,
                    }
                    .fail();
                }
                ("$$", _) => segments.push(Segment::Literal("$".to_owned())),
                (_, Some(name)) => {
                    let index = pattern
                        .capture_names()
                        .position(|n| n == Some(name.as_str()))
                        .context(NoSuchGroupSnafu {
                            name: name.as_str(),
                        })?;
                    segments.push(Segment::Capture(index));
                }
                (_, None) => unreachable!("the substitution regex has no other alternatives"),
            }
            last = whole.end();
        }
        if last < template.len() {
            segments.push(literal(&template[last..])?);
        }

        Ok(CompiledTestNameRule {
            pattern,
            segments,
        })
    }
    /// If this rule matches `test_id`, produce the LIKE expression defining its cluster
    pub fn evaluate(&self, test_id: &str) -> Option<String> {
        let captures = self.pattern.captures(test_id)?;
        Some(
            self.segments
                .iter()
                .map(|segment| match segment {
                    Segment::Literal(text) => text.clone(),
                    Segment::Capture(index) => captures
                        .get(*index)
                        .map(|m| escape_like(m.as_str()))
                        .unwrap_or_default(),
                })
                .collect::<String>(),
        )
    }
}

/// The LIKE expression defining the test-name cluster of `test_id` under `config`
pub fn like_expression(config: &CompiledConfig, test_id: &str) -> String {
    config
        .test_name_rules()
        .iter()
        .find_map(|rule| rule.evaluate(test_id))
        .unwrap_or_else(|| escape_like(test_id))
}

pub struct TestName;

impl Algorithm for TestName {
    fn name(&self) -> &'static str {
        ALGORITHM_NAME
    }
    fn cluster(&self, config: &CompiledConfig, failure: &Failure) -> Option<ClusterId> {
        Some(ClusterId::new(
            ALGORITHM_NAME,
            &hash_id(&like_expression(config, &failure.test_id)),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rule(pattern: &str, like_template: &str) -> TestNameRule {
        TestNameRule {
            name: "rule".to_owned(),
            pattern: pattern.to_owned(),
            like_template: like_template.to_owned(),
        }
    }

    #[test]
    fn templates() {
        let gtest = CompiledTestNameRule::compile(&rule(
            r"^gtest://(\w+/)?(?P<testcase>\w+\.\w+)/\w+$",
            "gtest://%${testcase}%",
        ))
        .unwrap();
        assert_eq!(
            Some("gtest://%ColorSpaceTest.testNullTransform%".to_owned()),
            gtest.evaluate("gtest://InstantiationOne/ColorSpaceTest.testNullTransform/0")
        );
        assert_eq!(
            gtest.evaluate("gtest://InstantiationOne/ColorSpaceTest.testNullTransform/0"),
            gtest.evaluate("gtest://InstantiationTwo/ColorSpaceTest.testNullTransform/1")
        );
        assert_eq!(None, gtest.evaluate("ninja://chrome/test:browser_tests"));

        // Captures are escaped; "$$" is a literal dollar sign
        let escaping = CompiledTestNameRule::compile(&rule(
            r"^(?P<prefix>[^/]+)/(?P<suffix>.*)$",
            "$$${prefix}:${suffix}",
        ))
        .unwrap();
        assert_eq!(
            Some(r"$a\_b:100\%".to_owned()),
            escaping.evaluate("a_b/100%")
        );
    }

    #[test]
    fn bad_templates() {
        let err = CompiledTestNameRule::compile(&rule("(?P<a>.*)", "${a}$b")).unwrap_err();
        assert_eq!(
            "invalid use of the $ operator at position 4 in \"${a}$b\" ('$' not followed by \
             '{name}' or '$'), if you meant to include a literal $ character, please use $$",
            format!("{err}")
        );
        let err = CompiledTestNameRule::compile(&rule("(?P<a>.*)", "${b}")).unwrap_err();
        assert_eq!(
            "like template contains reference to non-existant capturing group with name \"b\"",
            format!("{err}")
        );
        let err = CompiledTestNameRule::compile(&rule("(?P<a>.*)", r"${a}\")).unwrap_err();
        assert!(format!("{err}").starts_with(r#""\\" is not a valid standalone LIKE expression"#));
        let err = CompiledTestNameRule::compile(&rule("(", "x")).unwrap_err();
        assert!(format!("{err}").starts_with("parsing pattern"));
    }

    #[test]
    fn default_cluster() {
        let config = CompiledConfig::default();
        assert_eq!(r"a\_b", like_expression(&config, "a_b"));
        let a = TestName.cluster(&config, &Failure::new("a_b", None)).unwrap();
        let b = TestName.cluster(&config, &Failure::new("a_b", Some("boom"))).unwrap();
        assert_eq!(a, b);
        assert_eq!(ALGORITHM_NAME, a.algorithm);
        assert_eq!(hash_id(r"a\_b"), a.id);
    }
}
