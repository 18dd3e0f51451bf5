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

//! # faultlined
//!
//! The faultline daemon: serve the Clusters & Rules RPC services over HTTP.
//!
//! Nearly all configuration is read from a TOML file (`/etc/faultline.toml` by default); the
//! command line governs only where to find that file & how to log. `SIGHUP` re-reads the file &
//! rebuilds the service state (keeping the last good configuration should the new one fail to
//! parse); `SIGTERM` shuts the server down gracefully.

use std::{
    collections::HashMap,
    env,
    future::IntoFuture,
    io,
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use serde::Deserialize;
use snafu::{IntoError, prelude::*};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::Notify,
};
use tracing::{Level, debug, error, info};
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, fmt, layer::SubscriberExt};
use url::Url;

use faultline_shared::ProjectId;

use faultline::{
    analysis::{self, Dataset},
    authn::AccessControl,
    config::{self, ProjectConfig, StaticConfig},
    faultline::{Collaborators, Faultline},
    memory::{self, InMemory},
    metrics::check_metric_names,
    server::make_router,
};

/// The faultlined application error type
///
/// `main()` returns `Result<(), Error>`, so the runtime reports failures through [Debug]; that's
/// implemented by hand, below, to print the (far more readable) [Display] form.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to load the cluster analysis dataset: {source}"))]
    Analysis { source: analysis::Error },
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While building the OTLP exporter, {source}"))]
    OtlpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("Invalid project configuration: {source}"))]
    Projects { source: config::Error },
    #[snafu(display("ruleset-cache-size must be greater than zero"))]
    RulesetCacheSize,
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to open the rule store: {source}"))]
    Storage { source: memory::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

static DEFAULT_CONFIG: &str = "/etc/faultline.toml";

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Rule store configuration
#[derive(Clone, Debug, Deserialize)]
pub enum StorageConfig {
    /// Hold rules in memory, optionally persisting them to a JSON snapshot on every commit
    Memory { snapshot: Option<PathBuf> },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory { snapshot: None }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<Duration>,
}

/// faultline configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ConfigV1 {
    /// OTLP export target; None means don't export
    otlp_export: Option<OtelExportConfig>,
    /// Local address at which to listen for requests; specify as "address:port"
    public_address: SocketAddr,
    storage: StorageConfig,
    /// Longest a cached ruleset may be used by reads that don't demand strong consistency
    ruleset_max_staleness_secs: u64,
    /// Number of projects whose rulesets are kept in memory
    ruleset_cache_size: usize,
    /// Presubmit impact & reclustering progress; without one, no project has analysis available
    analysis_dataset: Option<PathBuf>,
    access: AccessControl,
    projects: HashMap<ProjectId, ProjectConfig>,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            otlp_export: None,
            public_address: "0.0.0.0:20720".parse::<SocketAddr>().unwrap(/* known good */),
            storage: StorageConfig::default(),
            ruleset_max_staleness_secs: 120,
            ruleset_cache_size: 256,
            analysis_dataset: None,
            access: AccessControl::default(),
            projects: HashMap::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the faultline configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from(DEFAULT_CONFIG), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(_) if defaulted => Ok(ConfigV1::default()),
        Err(err) => Err(ConfigNotFoundSnafu { pth }.into_error(err)),
    }
}

/// Build the logging layer & filter dictated by `logopts`
#[allow(clippy::type_complexity)]
fn configure_logging(logopts: &LogOpts) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, EnvFilter)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers of different types; box them
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    Ok((formatter, filter))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Assemble the service state called-for by `cfg`
fn make_state(cfg: &ConfigV1, exporter: &PrometheusExporter) -> Result<Arc<Faultline>> {
    let storage = match &cfg.storage {
        StorageConfig::Memory { snapshot: None } => InMemory::new(),
        StorageConfig::Memory {
            snapshot: Some(path),
        } => InMemory::open(path).context(StorageSnafu)?,
    };
    let dataset = Arc::new(match &cfg.analysis_dataset {
        Some(path) => Dataset::open(path).context(AnalysisSnafu)?,
        None => Dataset::empty(),
    });
    Ok(Arc::new(Faultline::new(
        Collaborators {
            storage: Arc::new(storage),
            configs: Arc::new(StaticConfig::new(&cfg.projects).context(ProjectsSnafu)?),
            analysis: dataset.clone(),
            progress: dataset,
        },
        cfg.access.clone(),
        Duration::from_secs(cfg.ruleset_max_staleness_secs),
        NonZeroUsize::new(cfg.ruleset_cache_size).context(RulesetCacheSizeSnafu)?,
        exporter.clone(),
    )))
}

/// Serve faultline API requests
#[tracing::instrument(skip(opts, cfg))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E>(x: StdResult<T, E>)
    where
        E: std::error::Error + std::fmt::Debug,
    {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;

    let exporter = init_telemetry(cfg.otlp_export.as_ref())?;

    // Loop until asked to terminate, re-building the service state on each SIGHUP
    loop {
        let state = make_state(&cfg, &exporter)?;
        info!(
            "Serving {} project(s) on {}.",
            cfg.projects.len(),
            cfg.public_address
        );

        let nfy = Arc::new(Notify::new());
        let mut server = std::pin::pin!(
            axum::serve(
                TcpListener::bind(cfg.public_address)
                    .await
                    .context(BindSnafu {
                        addr: cfg.public_address
                    })?,
                make_router(state),
            )
            .with_graceful_shutdown(shutdown_signal(nfy.clone()))
            .into_future()
        );

        tokio::select! {
            res = &mut server => {
                // Not expected; the server only exits when signalled
                error!("The server exited unexpectedly with {:?}; shutting-down.", res);
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                nfy.notify_one();
                log_on_err(server.await);
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        error!("{err}; keeping the prior configuration.");
                        cfg
                    }
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                nfy.notify_one();
                log_on_err(server.await);
                break;
            }
        }
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// <div class="warning">
///
/// This method must be invoked from inside the Tokio runtime, but before any instruments are
/// accessed.
///
/// </div>
///
/// Returns an exporter backing the `/metrics` endpoint. If `collector_config` is given, metrics are
/// additionally pushed over OTLP/HTTP.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<PrometheusExporter> {
    check_metric_names();
    let prometheus_exporter = PrometheusExporter::new();

    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "faultline"))
                .build(),
        )
        .with_reader(prometheus_exporter.clone());

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OtlpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    global::set_meter_provider(provider.build());

    Ok(prometheus_exporter)
}

/// Read our configuration, set up logging for good, then `serve()`
async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    // Logging must be configured *before* `serve()` is entered, since it's instrumented. Failure to
    // parse here is fatal; on SIGHUP, we fall back to the last known-good configuration instead.
    let (cfg, formatter, filter) = match parse_config(&opts.cfg)
        .and_then(|cfg| configure_logging(&opts.log_opts).map(|(layer, filter)| (cfg, layer, filter)))
    {
        Ok(x) => x,
        Err(err) => {
            error!("While configuring logging: {err:?}");
            return Err(err);
        }
    };

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)?;
    drop(bootstrap_logging_guard);

    info!("faultline version {} starting.", crate_version!());

    serve(opts, cfg).await
}

fn main() -> Result<()> {
    let opts = CliOpts::new(
        Command::new("faultlined")
            .version(crate_version!())
            .author(crate_authors!())
            .about("Test-failure clustering & failure association rules")
            .long_about(
                "`faultlined` clusters failing test results & manages the rules associating \
                 failures with bugs.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("FAULTLINE_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FAULTLINE_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FAULTLINE_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FAULTLINE_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FAULTLINE_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Until the configuration's been read, log to stderr through a temporary subscriber
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::path::Path;

    #[test]
    fn configuration() {
        let Configuration::V1(cfg) = toml::from_str::<Configuration>(
            r#"
version = "1"
public-address = "127.0.0.1:8080"
ruleset-max-staleness-secs = 30
analysis-dataset = "/var/lib/faultline/impact.json"

[storage.Memory]
snapshot = "/var/lib/faultline/rules.json"

[access]
group = "testers"
[[access.identities]]
api-key = "sekrit"
email = "someone@example.com"
groups = ["testers"]

[projects.chromium.monorail]
project = "chromium"
display-prefix = "crbug.com"
monorail-hostname = "bugs.chromium.org"
"#,
        )
        .unwrap();
        assert_eq!("127.0.0.1:8080".parse::<SocketAddr>().unwrap(), cfg.public_address);
        assert_eq!(30, cfg.ruleset_max_staleness_secs);
        assert_eq!(256, cfg.ruleset_cache_size);
        assert!(matches!(
            cfg.storage,
            StorageConfig::Memory { snapshot: Some(ref p) } if p == Path::new("/var/lib/faultline/rules.json")
        ));
        assert_eq!("testers", cfg.access.group);
        assert_eq!(1, cfg.projects.len());
        assert!(make_state(&cfg, &PrometheusExporter::new()).is_err()); // no such dataset

        let Configuration::V1(cfg) = toml::from_str::<Configuration>(r#"version = "1""#).unwrap();
        assert!(cfg.projects.is_empty());
        assert!(make_state(&cfg, &PrometheusExporter::new()).is_ok());

        assert!(toml::from_str::<Configuration>(r#"version = "2""#).is_err());
    }
}
