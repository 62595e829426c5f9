use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use mediarepo_service::config::{Config, LogFormat};
use mediarepo_service::logging::init_json_logging;
use mediarepo_service::metrics;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

#[derive(Debug, Default)]
pub struct Options {
    /// Runs the production logging setup, discarding its output.
    pub tracing: bool,
    /// Reports metrics to a local sink unless statsd is configured.
    pub metrics: bool,
}

type UdpSink = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<UdpSink>,
}

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             mediarepo_service=DEBUG,\
             mediarepo_stress=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             mediarepo_service=TRACE,\
             mediarepo_stress=TRACE"
        }
    }
}

/// Initializes logging, error reporting and metrics for the stresstest.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init(config: &Config, options: Options) -> Result<Guard> {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let sentry = config.sentry_dsn.clone().map(|dsn| {
        sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        })
    });

    init_logging(config, options.tracing);
    let udp_sink = init_metrics(config, options.metrics)?;

    Ok(Guard { sentry, udp_sink })
}

fn init_logging(config: &Config, discard: bool) {
    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.logging.level).to_string());

    if discard {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        init_json_logging(&rust_log, || NoopWriter);
        return;
    }

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(std::io::stderr);
    let layer = match (config.logging.format, console::user_attended_stderr()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => {
            init_json_logging(&rust_log, std::io::stderr);
            return;
        }
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(EnvFilter::new(&rust_log)))
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Configures metrics, returning the local sink that needs to be driven if one is used.
fn init_metrics(config: &Config, local_sink: bool) -> Result<Option<UdpSink>> {
    if let Some(statsd) = &config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
        return Ok(None);
    }
    if !local_sink {
        return Ok(None);
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
    listener.set_nonblocking(true)?;
    let socket = listener.local_addr()?;

    let udp_sink: UdpSink = Box::pin(async move {
        let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
            return;
        };
        let mut buf = Vec::with_capacity(1024);
        while listener.recv_buf(&mut buf).await.is_ok() {
            buf.clear();
        }
    });

    // have some default tags, just to be closer to the real world config
    let mut tags = BTreeMap::new();
    tags.insert("host".into(), "stresstest".into());
    tags.insert("env".into(), "stresstest".into());

    metrics::configure_statsd("mediarepo", socket, tags)?;
    Ok(Some(udp_sink))
}

impl Guard {
    pub fn sentry_enabled(&self) -> bool {
        self.sentry.is_some()
    }
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
