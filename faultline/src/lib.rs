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

//! # faultline
//!
//! faultline groups failing test results into clusters, both "suggested" clusters computed by
//! algorithms over the failure itself & "bug" clusters defined by user-authored failure
//! association rules, and manages the lifecycle of those rules.
//!
//! The library crate has the same name as the package, so `rustdoc` documents this rather than the
//! `faultlined` binary.
pub mod algorithms;
pub mod analysis;
pub mod authn;
pub mod clustering;
pub mod clusters;
pub mod config;
pub mod entities;
pub mod faultline;
pub mod http;
pub mod lang;
pub mod memory;
pub mod metrics;
pub mod rules;
pub mod ruleset;
pub mod server;
pub mod storage;
