//! Tideway CLI - stream a torrent's files over HTTP
//!
//! Resolves the locator, starts the proxy and serves until the listener
//! stops or the process is interrupted.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tideway_core::TidewayConfig;
use tideway_core::tracing_setup::{CliLogLevel, init_tracing};
use tideway_web::{ProxyConfig, TorrentProxy};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tideway")]
#[command(about = "Serve the files of a torrent over HTTP while it downloads")]
struct Cli {
    /// Magnet link or http(s) URL of a .torrent file
    locator: String,

    /// DHT bootstrap node as host:port (repeatable)
    #[arg(long = "dht", value_name = "HOST:PORT")]
    dht: Vec<String>,

    /// HTTP listen address
    #[arg(long, default_value = "localhost:0")]
    http: String,

    /// Listen address for incoming peer connections
    #[arg(long, default_value = "0.0.0.0:0")]
    listen: String,

    /// Directory downloaded data is stored in
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full trace log of this run
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Fail reads that wait longer than this for pieces
    #[arg(long)]
    read_timeout_secs: Option<u64>,
}

impl Cli {
    fn proxy_config(self) -> ProxyConfig {
        let mut settings = TidewayConfig::from_env();
        if let Some(seconds) = self.read_timeout_secs {
            settings.streaming.read_timeout = Some(Duration::from_secs(seconds));
        }

        ProxyConfig {
            locator: self.locator,
            seed_nodes: self.dht,
            http_listen_addr: self.http,
            torrent_listen_addr: self.listen,
            data_dir: self.data_dir,
            settings,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let run_log = init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("Failed to initialize logging")?;
    info!("Full log of this run: {}", run_log.display());

    let proxy = TorrentProxy::start(cli.proxy_config())
        .await
        .context("Failed to start proxy")?;

    println!("{}", proxy.url());

    tokio::select! {
        result = proxy.run() => result.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    proxy.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["tideway", "magnet:?xt=urn:btih:abc"]).unwrap();
        assert_eq!(cli.log_level, CliLogLevel::Info);

        let config = cli.proxy_config();
        assert_eq!(config.locator, "magnet:?xt=urn:btih:abc");
        assert!(config.seed_nodes.is_empty());
        assert_eq!(config.http_listen_addr, "localhost:0");
        assert_eq!(config.torrent_listen_addr, "0.0.0.0:0");
        assert_eq!(config.data_dir, PathBuf::from("."));
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::try_parse_from([
            "tideway",
            "--dht",
            "router.example:6881",
            "--dht",
            "10.0.0.2:6881",
            "--http",
            ":8080",
            "--listen",
            ":50007",
            "--data-dir",
            "/tmp/tideway",
            "--log-level",
            "debug",
            "--read-timeout-secs",
            "20",
            "http://example.com/a.torrent",
        ])
        .unwrap();
        assert_eq!(cli.log_level, CliLogLevel::Debug);

        let config = cli.proxy_config();
        assert_eq!(config.seed_nodes, vec!["router.example:6881", "10.0.0.2:6881"]);
        assert_eq!(config.http_listen_addr, ":8080");
        assert_eq!(config.torrent_listen_addr, ":50007");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/tideway"));
        assert_eq!(config.settings.streaming.read_timeout, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_locator_is_required() {
        assert!(Cli::try_parse_from(["tideway"]).is_err());
    }
}
