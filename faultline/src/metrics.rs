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

//! # faultline metrics
//!
//! faultline exports metrics through [OpenTelemetry]. OTel would have us build each "instrument"
//! (counter, gauge, ...) once & re-use it, which raises the question of where to keep them. Rather
//! than a state struct with a field per metric, or a central list of names that every module has
//! to edit, each module declares the metrics it uses next to the code that uses them:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("rules.create.successes", Sort::IntegralCounter) }
//! // ...
//! counter_add!(state.instruments, "rules.create.successes", 1, &[]);
//! ```
//!
//! [inventory] gathers the registrations at link time; [Instruments::new] builds every
//! registered instrument up-front (so recording needs only `&self`) and refuses duplicate names.
//! Recording against a name that was never registered, or that names an instrument of a different
//! sort, is a logic error & panics.

use std::collections::{HashMap, hash_map::Entry};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge},
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// A metric registration; submit one per metric with [inventory::submit!]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic if two registrations share a name; call this early in process startup
pub fn check_metric_names() {
    let mut seen: HashMap<&'static str, Sort> = HashMap::new();
    for reg in inventory::iter::<Registration> {
        if seen.insert(reg.name(), reg.sort()).is_some() {
            panic!("The metric name {} was registered twice", reg.name());
        }
    }
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map = HashMap::new();
        for reg in inventory::iter::<Registration> {
            match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", reg.name()),
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                    });
                }
            }
        }
        Instruments { map }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::CounterU64(c)) => c.add(count, attributes),
            _ => panic!("{} does not name a counter", name),
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn record(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::GaugeU64(g)) => g.record(value, attributes),
            _ => panic!("{} does not name a gauge", name),
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_set {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.record($name, $value, $attrs);
    };
}

#[cfg(test)]
mod test {
    use super::*;

    inventory::submit! { Registration::new("metrics.test.counter", Sort::IntegralCounter) }

    #[test]
    fn registrations() {
        check_metric_names();
        let instruments = Instruments::new("faultline-test");
        counter_add!(instruments, "metrics.test.counter", 1, &[]);
    }

    #[test]
    #[should_panic]
    fn wrong_sort() {
        let instruments = Instruments::new("faultline-test");
        gauge_set!(instruments, "metrics.test.counter", 1, &[]);
    }
}
