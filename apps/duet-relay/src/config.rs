use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub identity_secret: String,
    pub sweep_interval: Duration,
    pub stale_room_age: chrono::Duration,
    pub heartbeat_timeout: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "duet-relay",
    author,
    version,
    about = "Two-party room registry and signaling relay"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "DUET_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Shared secret used to verify participant identity tokens.
    #[arg(long, env = "DUET_RELAY_IDENTITY_SECRET", hide_env_values = true)]
    pub identity_secret: String,

    /// How often empty rooms are checked for expiry.
    #[arg(long, env = "DUET_RELAY_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub sweep_interval_secs: u64,

    /// Empty rooms older than this are deleted by the sweep.
    #[arg(long, env = "DUET_RELAY_STALE_ROOM_HOURS", default_value_t = 24)]
    pub stale_room_hours: i64,

    /// A connection silent for this long is treated as lost.
    #[arg(long, env = "DUET_RELAY_HEARTBEAT_TIMEOUT_SECS", default_value_t = 90)]
    pub heartbeat_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "DUET_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.identity_secret.trim().is_empty() {
            bail!("identity secret must not be empty");
        }
        if cli.sweep_interval_secs == 0 {
            bail!("sweep interval must be at least one second");
        }
        if cli.heartbeat_timeout_secs == 0 {
            bail!("heartbeat timeout must be at least one second");
        }
        Ok(RelayConfig {
            listen_addr,
            identity_secret: cli.identity_secret,
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            stale_room_age: chrono::Duration::hours(cli.stale_room_hours),
            heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_match_documented_values() {
        let cli = Cli::parse_from(["duet-relay", "--identity-secret", "s3cret"]);
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.stale_room_age, chrono::Duration::hours(24));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(90));
    }

    #[test_timeout::timeout]
    fn bad_listen_address_is_rejected() {
        let cli = Cli::parse_from([
            "duet-relay",
            "--identity-secret",
            "s3cret",
            "--listen-addr",
            "not-an-addr",
        ]);
        assert!(RelayConfig::try_from(cli).is_err());
    }
}
