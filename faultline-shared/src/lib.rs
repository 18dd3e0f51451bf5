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

//! # faultline-shared
//!
//! Types shared between the faultline service & its clients: the refined identifier types that
//! show up in resource names & on the wire, plus the JSON representations of the RPC requests and
//! responses (in [api]).

use std::{fmt::Display, ops::Deref, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{Backtrace, prelude::*};
use uuid::Uuid;

pub mod api;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid buganizer bug ID {id:?}"))]
    BadBuganizerId { id: String, backtrace: Backtrace },
    #[snafu(display("invalid monorail bug ID {id:?}"))]
    BadMonorailId { id: String, backtrace: Backtrace },
    #[snafu(display("{text:?} is not a valid project ID"))]
    BadProjectId { text: String, backtrace: Backtrace },
    #[snafu(display("{text:?} is not a valid rule ID"))]
    BadRuleId { text: String, backtrace: Backtrace },
    #[snafu(display("unsupported bug system: {system}"))]
    UnsupportedBugSystem { system: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

fn mk_serde_de_err<'de, D: Deserializer<'de>>(err: Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           ProjectId                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Regex fragment matching a project ID; exported so resource-name patterns can embed it
pub const PROJECT_ID_PATTERN: &str = r"[a-z0-9\-]{1,40}";

lazy_static! {
    static ref PROJECT_ID: Regex = Regex::new(&format!("^{}$", PROJECT_ID_PATTERN)).unwrap(/* known good */);
}

/// A refined type representing a faultline project
///
/// Project IDs are one to forty characters drawn from lower-case ASCII letters, digits and '-'.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(text: &str) -> Result<ProjectId> {
        PROJECT_ID
            .is_match(text)
            .then_some(ProjectId(text.to_owned()))
            .context(BadProjectIdSnafu { text })
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for ProjectId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ProjectId {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        ProjectId::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        ProjectId::new(s)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if PROJECT_ID.is_match(&text) {
            Ok(ProjectId(text))
        } else {
            BadProjectIdSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             RuleId                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Regex fragment matching a rule ID
pub const RULE_ID_PATTERN: &str = r"[0-9a-f]{32}";

lazy_static! {
    static ref RULE_ID: Regex = Regex::new(&format!("^{}$", RULE_ID_PATTERN)).unwrap(/* known good */);
}

/// A refined type identifying a failure association rule within its project
///
/// Rule IDs are 128 bits, written as 32 lower-case hex digits. They're assigned at creation & never
/// change.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(text: &str) -> Result<RuleId> {
        RULE_ID
            .is_match(text)
            .then_some(RuleId(text.to_owned()))
            .context(BadRuleIdSnafu { text })
    }
    /// Mint a fresh, random [RuleId]
    pub fn generate() -> RuleId {
        // `simple()` renders the UUID as exactly 32 lower-case hex digits
        RuleId(Uuid::new_v4().simple().to_string())
    }
}

impl AsRef<str> for RuleId {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for RuleId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for RuleId {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        RuleId::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RuleId {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        RuleId::new(s)
    }
}

impl TryFrom<String> for RuleId {
    type Error = Error;

    fn try_from(text: String) -> StdResult<Self, Self::Error> {
        if RULE_ID.is_match(&text) {
            Ok(RuleId(text))
        } else {
            BadRuleIdSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             BugId                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The bug-tracking systems to which a rule may be linked
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum BugSystem {
    #[serde(rename = "buganizer")]
    Buganizer,
    #[serde(rename = "monorail")]
    Monorail,
}

impl BugSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            BugSystem::Buganizer => "buganizer",
            BugSystem::Monorail => "monorail",
        }
    }
}

impl Display for BugSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BugSystem {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "buganizer" => Ok(BugSystem::Buganizer),
            "monorail" => Ok(BugSystem::Monorail),
            _ => UnsupportedBugSystemSnafu { system: s }.fail(),
        }
    }
}

lazy_static! {
    static ref MONORAIL_ID: Regex =
        Regex::new(r"^([a-z0-9\-_]+)/([1-9][0-9]*)$").unwrap(/* known good */);
    static ref BUGANIZER_ID: Regex = Regex::new(r"^[1-9][0-9]*$").unwrap(/* known good */);
}

/// A refined type naming a bug in one of the supported trackers
///
/// Monorail bugs are written "project/number", buganizer bugs are just a number.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct BugId {
    system: BugSystem,
    id: String,
}

#[derive(Deserialize)]
struct BugIdRepr {
    system: BugSystem,
    id: String,
}

impl BugId {
    pub fn new(system: BugSystem, id: &str) -> Result<BugId> {
        match system {
            BugSystem::Buganizer => ensure!(BUGANIZER_ID.is_match(id), BadBuganizerIdSnafu { id }),
            BugSystem::Monorail => ensure!(MONORAIL_ID.is_match(id), BadMonorailIdSnafu { id }),
        }
        Ok(BugId {
            system,
            id: id.to_owned(),
        })
    }
    /// Construct a [BugId] from its textual system & ID, as they appear on the wire
    pub fn parse(system: &str, id: &str) -> Result<BugId> {
        BugId::new(system.parse::<BugSystem>()?, id)
    }
    pub fn system(&self) -> BugSystem {
        self.system
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    /// For monorail bugs, split the ID into its project & issue number
    pub fn monorail_project_and_id(&self) -> Option<(&str, &str)> {
        match self.system {
            BugSystem::Monorail => self.id.split_once('/'),
            BugSystem::Buganizer => None,
        }
    }
}

impl<'de> Deserialize<'de> for BugId {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = BugIdRepr::deserialize(deserializer)?;
        BugId::new(repr.system, &repr.id).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for BugId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.system, self.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn project_ids() {
        assert!(ProjectId::new("chromium").is_ok());
        assert!(ProjectId::new("my-project-2").is_ok());
        assert!(ProjectId::new("").is_err());
        assert!(ProjectId::new("Chromium").is_err());
        assert!(ProjectId::new("a/b").is_err());
        assert!(ProjectId::new(&"a".repeat(41)).is_err());
        assert!(serde_json::from_str::<ProjectId>("\"UPPER\"").is_err());
    }

    #[test]
    fn rule_ids() {
        let id = RuleId::generate();
        assert_eq!(32, id.len());
        assert!(RuleId::new(&id).is_ok());
        assert_ne!(id, RuleId::generate());
        assert!(RuleId::new("0123456789abcdef0123456789ABCDEF").is_err());
        assert!(RuleId::new("0123").is_err());
    }

    #[test]
    fn bug_ids() {
        let bug = BugId::parse("monorail", "chromium/7654321").unwrap();
        assert_eq!(Some(("chromium", "7654321")), bug.monorail_project_and_id());
        assert!(BugId::parse("monorail", "chromium/0123").is_err());
        assert!(BugId::parse("monorail", "7654321").is_err());
        let bug = BugId::parse("buganizer", "82828282").unwrap();
        assert_eq!(None, bug.monorail_project_and_id());
        assert!(BugId::parse("buganizer", "chromium/1").is_err());
        assert_eq!(
            "unsupported bug system: jira",
            format!("{}", BugId::parse("jira", "1").unwrap_err())
        );
        let bug: BugId =
            serde_json::from_str(r#"{"system": "monorail", "id": "chromium/1"}"#).unwrap();
        assert_eq!("monorail:chromium/1", format!("{}", bug));
    }
}
