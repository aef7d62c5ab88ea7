mod config_commands;

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    clap::{Parser, Subcommand},
    courier_config::{CourierConfig, Severity},
    courier_gateway::{AppState, ListenerProbe, build_app, dispatcher_from_config},
    courier_ingest::{HttpPushProbe, IngestService, RecoveryKind, actions::ProbeReconnect},
    courier_telegram::{PlatformProbe, TelegramClassifier, TelegramPlatform},
    secrecy::Secret,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

/// Upper bound on how long shutdown waits for loops and the HTTP server.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "courier", about = "courier: resilient Telegram update ingestion", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery in ./ and ~/.config/courier/).
    #[arg(long, global = true, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,
    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Public webhook URL for push mode (overrides config value).
    #[arg(long, global = true)]
    push_url: Option<String>,
    /// Bot token (overrides config value).
    #[arg(long, global = true, env = "COURIER_TELEGRAM_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start ingesting updates (default when no subcommand is provided).
    Run,
    /// Validate the configuration and report errors/warnings.
    CheckConfig,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Load the config file, then apply command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<(CourierConfig, Option<PathBuf>)> {
    let source = cli.config.clone().or_else(courier_config::find_config_file);
    let mut config = match &source {
        Some(path) => courier_config::load_config(path)?,
        None => CourierConfig::default(),
    };
    apply_overrides(cli, &mut config);
    Ok((config, source))
}

fn apply_overrides(cli: &Cli, config: &mut CourierConfig) {
    if let Some(bind) = &cli.bind {
        config.server.bind.clone_from(bind);
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(url) = &cli.push_url {
        config.telegram.push_url = Some(url.clone());
    }
    if let Some(token) = &cli.token {
        config.telegram.token = Secret::new(token.clone());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let (config, source) = load_config(&cli)?;
    match cli.command {
        None | Some(Commands::Run) => run(config).await,
        Some(Commands::CheckConfig) => {
            if config_commands::check(&config, source.as_deref()) > 0 {
                std::process::exit(1);
            }
            Ok(())
        },
    }
}

async fn run(config: CourierConfig) -> anyhow::Result<()> {
    let validation = courier_config::validate(&config);
    for d in &validation.diagnostics {
        match d.severity {
            Severity::Error => error!(path = %d.path, "{}", d.message),
            Severity::Warning => warn!(path = %d.path, "{}", d.message),
        }
    }
    if validation.has_errors() {
        anyhow::bail!("invalid configuration, run `courier check-config` for details");
    }

    let listener = courier_gateway::bind(&config.server).await?;
    let local_addr = listener.local_addr()?;

    let platform = Arc::new(TelegramPlatform::new(&config.telegram)?);
    match platform.get_me().await {
        Ok(username) => info!(username = ?username, "telegram credentials verified"),
        Err(e) => warn!(error = %e, "could not reach telegram, continuing with recovery"),
    }

    let ingest = Arc::new(IngestService::new(
        &config,
        Arc::clone(&platform) as Arc<dyn courier_ingest::Platform>,
        Arc::new(HttpPushProbe::new(config.transport.push_probe_timeout())?),
        dispatcher_from_config(&config.dispatch)?,
        Arc::new(TelegramClassifier::new(&config.telegram)),
    )?);

    let platform_probe = Arc::new(PlatformProbe::new(Arc::clone(&platform)));
    ingest.register_probe("platform-api", RecoveryKind::PlatformApi, platform_probe.clone());
    ingest.register_probe(
        "http-listener",
        RecoveryKind::Listener,
        Arc::new(ListenerProbe::new(local_addr, config.health.probe_timeout())?),
    );
    ingest
        .recovery()
        .strategies()
        .register(RecoveryKind::Network, Arc::new(ProbeReconnect::new(platform_probe)));

    // The listener must be up before the transport probes the push URL.
    let cancel = CancellationToken::new();
    let app = build_app(
        AppState {
            ingest: Arc::clone(&ingest),
        },
        &config.server.webhook_path,
    );
    let mut server = tokio::spawn(courier_gateway::serve(listener, app, cancel.clone()));

    let mode = ingest.start().await?;
    info!(addr = %local_addr, mode = ?mode, "courier running");

    tokio::select! {
        () = shutdown_signal() => info!("shutdown requested"),
        result = &mut server => {
            match result {
                Ok(Ok(())) => warn!("http server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "http server failed"),
                Err(e) => error!(error = %e, "http server task panicked"),
            }
        },
    }

    cancel.cancel();
    ingest.shutdown(SHUTDOWN_GRACE).await;
    if !server.is_finished() && tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
        warn!("http server did not stop within grace period");
    }
    info!("courier stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {},
                    _ = tokio::signal::ctrl_c() => {},
                }
            },
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            },
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::parse_from([
            "courier",
            "--bind",
            "0.0.0.0",
            "--port",
            "9000",
            "--push-url",
            "https://bot.example.com/webhook",
            "--token",
            "123:ABC",
        ]);
        let mut config = CourierConfig::default();
        apply_overrides(&cli, &mut config);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.telegram.push_url.as_deref(),
            Some("https://bot.example.com/webhook")
        );
        assert_eq!(config.telegram.token.expose_secret(), "123:ABC");
    }

    #[test]
    fn check_config_subcommand_parses() {
        let cli = Cli::parse_from(["courier", "check-config", "--json-logs"]);
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert!(cli.json_logs);
    }

    #[test]
    fn explicit_config_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, "[server]\nport = 7000\n").unwrap();
        let cli = Cli::parse_from(["courier", "--config", path.to_str().unwrap()]);
        let (config, source) = load_config(&cli).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(source.as_deref(), Some(path.as_path()));
    }
}
