//! DanHeng Proxy - redirects game traffic to a private server.
//!
//! This binary loads the redirect rules from `config.json` (created from
//! `config.tmpl.json` on first run), starts the MITM proxy and runs until
//! Ctrl-C. Clients must use the proxy and trust the generated root CA.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use danheng_core::config::{self, CONFIG_PATH, CONFIG_TEMPLATE_PATH};
use danheng_core::RuleSet;
use danheng_proxy::{CaManager, ProxyConfig, ProxyServer};
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variables that route the proxy's own upstream traffic elsewhere.
const PROXY_ENV_VARS: [&str; 6] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];

/// DanHeng Proxy - redirecting MITM proxy
#[derive(Parser, Debug)]
#[command(name = "danheng", version, about)]
struct Args {
    /// Path of the runtime config file
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Template copied to the config path when it does not exist
    #[arg(long, default_value = CONFIG_TEMPLATE_PATH)]
    template: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    listen: IpAddr,

    /// Directory holding the root CA (defaults to the app data directory)
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// PEM file with extra CA certificates trusted for upstream connections
    #[arg(long)]
    upstream_ca: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log to the console only
    #[arg(long)]
    no_log_file: bool,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "danheng", "DanHengProxy").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("danheng={},warn", log_level)));

    if !args.no_log_file {
        if let Some(log_dir) = logs_dir() {
            if std::fs::create_dir_all(&log_dir).is_ok() {
                // Rotates daily, keeps the last 5 files
                let file_appender = RollingFileAppender::builder()
                    .rotation(Rotation::DAILY)
                    .max_log_files(5)
                    .filename_prefix("danheng")
                    .filename_suffix("log")
                    .build(&log_dir)
                    .ok();

                if let Some(appender) = file_appender {
                    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stdout))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();

                    tracing::info!("Logging to {:?}", log_dir);
                    return Some(guard);
                }
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if !args.no_log_file {
        tracing::warn!("File logging unavailable, using console only");
    }
    None
}

/// Returns the proxy environment variables that are set.
fn proxy_env_vars<F>(lookup: F) -> Vec<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    PROXY_ENV_VARS
        .iter()
        .filter_map(|name| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .map(|value| (*name, value))
        })
        .collect()
}

/// Warns when upstream traffic may be sent through another proxy.
fn warn_on_proxy_env() {
    for (name, value) in proxy_env_vars(|name| std::env::var(name).ok()) {
        tracing::warn!(
            "{} is set to {:?}; clients that honour it may bypass or loop through this proxy",
            name,
            value
        );
    }
}

/// Builds the proxy configuration from the CLI flags.
fn proxy_config(args: &Args, rules: RuleSet) -> anyhow::Result<ProxyConfig> {
    let config = match &args.ca_dir {
        Some(dir) => ProxyConfig::with_ca_manager(rules, CaManager::new(dir.clone())),
        None => ProxyConfig::new(rules).context("failed to locate the CA directory")?,
    };
    let config = config.with_listen_ip(args.listen);

    Ok(match &args.upstream_ca {
        Some(path) => config.with_upstream_ca(path.clone()),
        None => config,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting DanHeng Proxy v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Args: {:?}", args);
    warn_on_proxy_env();

    let rules = config::load_or_init(&args.config, &args.template)
        .with_context(|| format!("failed to load config {:?}", args.config))?;
    let target = format!(
        "{}://{}:{}",
        rules.target_scheme(),
        rules.destination_host(),
        rules.destination_port()
    );

    let server = ProxyServer::new(proxy_config(&args, rules)?).context("failed to prepare proxy")?;

    tracing::info!("Redirecting matching traffic to {}", target);
    tracing::info!(
        "Point clients at {} and trust the CA at {:?}",
        server.addr(),
        server.ca_cert_path()
    );

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
        .context("proxy stopped with an error")?;

    tracing::info!("DanHeng Proxy shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["danheng"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert_eq!(args.template, PathBuf::from("config.tmpl.json"));
        assert_eq!(args.listen, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(args.log_level, "info");
        assert!(args.ca_dir.is_none());
        assert!(!args.debug);
    }

    #[test]
    fn args_overrides() {
        let args = Args::try_parse_from([
            "danheng",
            "-c",
            "conf/live.json",
            "--listen",
            "0.0.0.0",
            "--ca-dir",
            "/tmp/ca",
            "--no-log-file",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("conf/live.json"));
        assert_eq!(args.listen, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(args.ca_dir, Some(PathBuf::from("/tmp/ca")));
        assert!(args.no_log_file);
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        assert!(Args::try_parse_from(["danheng", "--listen", "localhost:80"]).is_err());
    }

    #[test]
    fn detects_proxy_env_vars() {
        let found = proxy_env_vars(|name| match name {
            "HTTPS_PROXY" => Some("http://10.0.0.1:3128".to_string()),
            "all_proxy" => Some(String::new()),
            _ => None,
        });
        assert_eq!(found, vec![("HTTPS_PROXY", "http://10.0.0.1:3128".to_string())]);
    }

    #[test]
    fn proxy_config_applies_flags() {
        let temp_dir = TempDir::new().unwrap();
        let ca_dir = temp_dir.path().join("ca");
        let args = Args::try_parse_from([
            "danheng".into(),
            "--listen".into(),
            "0.0.0.0".into(),
            "--ca-dir".into(),
            ca_dir.clone().into_os_string(),
            "--upstream-ca".into(),
            "extra.pem".into(),
        ])
        .unwrap();

        let config = proxy_config(&args, RuleSet::new("127.0.0.1", 21000)).unwrap();
        assert_eq!(config.listen_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.ca_manager.cert_path().parent(), Some(ca_dir.as_path()));
        assert_eq!(config.upstream_ca, Some(PathBuf::from("extra.pem")));
    }
}
