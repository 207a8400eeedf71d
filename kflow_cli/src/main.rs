use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, warn};
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode, WriteLogger};

use kflow_lib::decoder::*;
use kflow_lib::metrics::*;
use kflow_lib::server::*;
use kflow_lib::settings::*;
use kflow_lib::sinks::*;
use kflow_lib::templates::*;

/// IPFIX collector that publishes every flow record as JSON.
#[derive(Debug, Parser)]
#[command(name = "kflow", version)]
struct Args {
    /// Settings file, written with defaults when missing
    #[arg(short, long, default_value = "config.ini")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match Settings::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("kflow: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = init_logging(&settings.log) {
        eprintln!("kflow: {e:#}");
        return ExitCode::from(1);
    }

    info!("Starting kflow {}", env!("CARGO_PKG_VERSION"));
    info!("Settings from {}:\n{}", args.config.display(), settings.dump_masked());

    let mut hooks = ShutdownHooks::default();
    let result = run(&settings, &mut hooks);
    hooks.run();

    match result {
        Ok(()) => {
            info!("kflow stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(settings: &Settings, hooks: &mut ShutdownHooks) -> anyhow::Result<()> {
    let templates = Arc::new(TemplateStore::new());
    let decoder = Arc::new(IpfixDecoder::new(Arc::clone(&templates)));

    let sink = Arc::new(PooledFlowSink::from_settings(&settings.sink).context("unable to open the flow sink")?);
    let sink_hook = Arc::clone(&sink);
    hooks.register("sink", move || sink_hook.close().map_err(anyhow::Error::from));

    let server = Arc::new(Mutex::new(IpfixServer::new(
        settings.server.clone(),
        decoder.clone(),
        sink.clone(),
    )));
    let server_hook = Arc::clone(&server);
    hooks.register("server", move || {
        lock(&server_hook).stop();
        Ok(())
    });

    let socket_stats = {
        let mut server = lock(&server);
        server.start().context("unable to start the IPFIX server")?;
        server.socket_stats()
    };

    if !settings.metrics_interval.is_zero() {
        let telemetry = Telemetry::new(Arc::clone(decoder.metrics()), templates)
            .with_socket_stats(socket_stats)
            .with_sink(Arc::clone(sink.metrics()));
        let reporter = MetricsReporter::spawn(telemetry, settings.metrics_interval)
            .context("unable to start the metrics reporter")?;
        hooks.register("metrics reporter", move || {
            reporter.stop();
            Ok(())
        });
    }

    wait_for_shutdown_signal()?;
    info!("Shutdown signal received");
    Ok(())
}

fn init_logging(log_settings: &LogSettings) -> anyhow::Result<()> {
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        log_settings.level,
        config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];
    if let Some(path) = &log_settings.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open log file {}", path.display()))?;
        loggers.push(WriteLogger::new(log_settings.level, config, file));
    }
    CombinedLogger::init(loggers).context("unable to install the logger")?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type ShutdownHook = Box<dyn FnOnce() -> anyhow::Result<()>>;

/// Cleanup actions, run last-registered first.
#[derive(Default)]
struct ShutdownHooks {
    hooks: Vec<(&'static str, ShutdownHook)>,
}

impl ShutdownHooks {
    fn register(&mut self, name: &'static str, hook: impl FnOnce() -> anyhow::Result<()> + 'static) {
        self.hooks.push((name, Box::new(hook)));
    }

    fn run(&mut self) {
        while let Some((name, hook)) = self.hooks.pop() {
            debug!("Running shutdown hook: {name}");
            if let Err(e) = hook() {
                warn!("Shutdown hook {name} failed: {e:#}");
            }
        }
    }
}

/// Logs a metrics snapshot as JSON every `interval`.
struct MetricsReporter {
    stop_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl MetricsReporter {
    fn spawn(telemetry: Telemetry, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join_handle = thread::Builder::new()
            .name("kflow-metrics".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match serde_json::to_string(&telemetry.snapshot()) {
                        Ok(json) => info!("Metrics {json}"),
                        Err(e) => warn!("Unable to serialize metrics: {e}"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(MetricsReporter { stop_tx, join_handle })
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.join_handle.join().is_err() {
            error!("Metrics reporter panicked");
        }
    }
}

/// Blocks until SIGINT, or SIGTERM on unix.
fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("unable to start the signal runtime")?;
    runtime
        .block_on(shutdown_signal())
        .context("unable to listen for shutdown signals")
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}


#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_hooks_run_in_reverse_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = ShutdownHooks::default();
        for name in ["sink", "server", "metrics reporter"] {
            let order = Rc::clone(&order);
            hooks.register(name, move || {
                order.borrow_mut().push(name);
                Ok(())
            });
        }
        hooks.register("failing", || Err(anyhow::anyhow!("boom")));

        hooks.run();
        hooks.run();
        assert_eq!(*order.borrow(), vec!["metrics reporter", "server", "sink"]);
    }

    #[test]
    fn test_config_flag() {
        let args = Args::parse_from(["kflow"]);
        assert_eq!(args.config, PathBuf::from("config.ini"));
        let args = Args::parse_from(["kflow", "-c", "/etc/kflow.ini"]);
        assert_eq!(args.config, PathBuf::from("/etc/kflow.ini"));
        let args = Args::parse_from(["kflow", "--config", "other.ini"]);
        assert_eq!(args.config, PathBuf::from("other.ini"));
    }

    #[test]
    fn test_metrics_reporter_stops_promptly() {
        let telemetry = Telemetry::new(Arc::new(DecoderMetrics::new()), Arc::new(TemplateStore::new()));
        let reporter = MetricsReporter::spawn(telemetry, Duration::from_secs(3600)).unwrap();
        let started = std::time::Instant::now();
        reporter.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
