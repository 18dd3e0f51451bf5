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


use std::future::Future;

use libtest_mimic::Failed;
use reqwest::Url;

/// Common test configuration: where the server under test lives & how to authenticate to it
#[derive(Clone, Debug)]
pub struct Configuration {
    pub url: Url,
    pub api_key: String,
}

#[derive(Debug)]
pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(cfg: Configuration) -> std::result::Result<(), Failed>,
}

inventory::collect!(Test);

/// Run an async test body to completion on a runtime of its own
pub fn block_on<F: Future<Output = std::result::Result<(), Failed>>>(
    f: F,
) -> std::result::Result<(), Failed> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(f)
}
