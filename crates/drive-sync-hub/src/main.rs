mod relay;

use clap::Parser;
use relay::{AcceptedToken, HubConfig, HubState};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:8000";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    hub: HubConfig,
}

#[derive(Parser, Debug)]
#[command(name = "drive-sync-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Accepted token, `TOKEN` or `TOKEN:NAME`; repeatable. None accepts any.
    #[arg(long = "token")]
    tokens: Vec<String>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 40)]
    word_delay_ms: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(config.debug);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }
    if config.hub.tokens.is_empty() {
        warn!(event = "open_access", "no --token given; any token is accepted as guest");
    }

    let hub = Arc::new(HubState::new(config.hub.clone()));
    let app = relay::router(hub);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        tokens = config.hub.tokens.len()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_addr(&args.addr);
    let debug = args.debug || env_true("DRIVE_SYNC_HUB_DEBUG");
    Config {
        addr,
        debug,
        hub: HubConfig {
            tokens: resolve_tokens(&args.tokens),
            word_delay: Duration::from_millis(args.word_delay_ms),
            write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        },
    }
}

/// The hub is a foreground dev tool, so it only logs to stdout.
fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(debug)));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn log_level(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    match std::env::var("DRIVE_SYNC_LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => level.trim().to_string(),
        _ => "info".to_string(),
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.trim().to_string();
    }
    match std::env::var("DRIVE_SYNC_HUB_ADDR") {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => DEFAULT_ADDR.to_string(),
    }
}

/// Flags first; otherwise a comma-separated `DRIVE_SYNC_HUB_TOKENS`.
fn resolve_tokens(flags: &[String]) -> Vec<AcceptedToken> {
    let raw: Vec<String> = if flags.is_empty() {
        std::env::var("DRIVE_SYNC_HUB_TOKENS")
            .map(|value| value.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    } else {
        flags.to_vec()
    };
    raw.iter().filter_map(|spec| AcceptedToken::parse(spec)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_flags_skip_blank_specs() {
        let tokens = resolve_tokens(&["a:Ann".to_string(), " ".to_string(), "b".to_string()]);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].display_name, "Ann");
        assert_eq!(tokens[1].token, "b");
    }

    #[test]
    fn debug_flag_forces_debug_level() {
        assert_eq!(log_level(true), "debug");
    }

    #[test]
    fn explicit_addr_wins() {
        assert_eq!(resolve_addr(" 127.0.0.1:9100 "), "127.0.0.1:9100");
    }
}
