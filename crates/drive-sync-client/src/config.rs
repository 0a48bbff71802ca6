use crate::backoff::ReconnectPolicy;
use crate::error::ClientError;
use clap::Parser;
use std::{env, path::PathBuf, time::Duration};
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
const WS_PATH: &str = "/api/v1/ws/drive";
const REST_PATH: &str = "/api/v1";

#[derive(Parser, Debug, Default)]
#[command(name = "drive-sync")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub api_url: String,
    #[arg(long, default_value = "")]
    pub token: String,
    #[arg(long, default_value = "")]
    pub email: String,
    #[arg(long, default_value = "")]
    pub password: String,
    #[arg(long, default_value = "")]
    pub session_file: String,
    #[arg(long, default_value = "")]
    pub conversation: String,
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval: u64,
    #[arg(long, default_value_t = 1000)]
    pub reconnect_base_ms: u64,
    #[arg(long, default_value_t = 15000)]
    pub reconnect_max_ms: u64,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub api_url: Url,
    pub token: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub session_file: PathBuf,
    pub conversation: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub log_dir: String,
    pub log_stdout: bool,
}

impl RuntimeConfig {
    pub fn ws_endpoint(&self) -> Result<Url, ClientError> {
        ws_endpoint(&self.api_url)
    }

    pub fn rest_base(&self) -> String {
        rest_base(&self.api_url)
    }
}

pub fn load_config(args: Args) -> Result<RuntimeConfig, ClientError> {
    let api_url = resolve_api_url(&args.api_url)?;
    if args.heartbeat_interval == 0 {
        return Err(ClientError::Config(
            "heartbeat interval must be positive".to_string(),
        ));
    }
    Ok(RuntimeConfig {
        api_url,
        token: resolve_opt(&args.token, "DRIVE_SYNC_TOKEN"),
        email: resolve_opt(&args.email, "DRIVE_SYNC_EMAIL"),
        password: resolve_opt(&args.password, "DRIVE_SYNC_PASSWORD"),
        session_file: resolve_session_file(&args.session_file),
        conversation: resolve_opt(&args.conversation, "DRIVE_SYNC_CONVERSATION"),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        reconnect: ReconnectPolicy::new(
            Duration::from_millis(args.reconnect_base_ms),
            Duration::from_millis(args.reconnect_max_ms),
        ),
        log_dir: resolve_log_dir(&args.log_dir),
        log_stdout: resolve_log_stdout(),
    })
}

fn resolve_opt(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn resolve_api_url(flag: &str) -> Result<Url, ClientError> {
    let raw = resolve_opt(flag, "DRIVE_SYNC_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let url = Url::parse(raw.trim_end_matches('/'))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClientError::Config(format!(
            "api url must be http or https, got {other}"
        ))),
    }
}

fn resolve_session_file(flag: &str) -> PathBuf {
    resolve_opt(flag, "DRIVE_SYNC_SESSION_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".drive-sync/session.json"))
}

fn resolve_log_dir(flag: &str) -> String {
    resolve_opt(flag, "DRIVE_SYNC_LOG_DIR").unwrap_or_else(|| ".drive-sync/logs".to_string())
}

fn resolve_log_stdout() -> bool {
    env::var("DRIVE_SYNC_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(false)
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn base_path(api: &Url) -> String {
    api.path().trim_end_matches('/').to_string()
}

/// Realtime endpoint for an API base: the scheme follows the API's
/// (`https` -> `wss`), the token is added per dial.
pub fn ws_endpoint(api: &Url) -> Result<Url, ClientError> {
    let scheme = match api.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ClientError::Config(format!(
                "unsupported api scheme: {other}"
            )))
        }
    };
    let host = api
        .host_str()
        .ok_or_else(|| ClientError::Config("api url has no host".to_string()))?;
    let port = api.port().map(|p| format!(":{p}")).unwrap_or_default();
    let url = Url::parse(&format!(
        "{scheme}://{host}{port}{}{WS_PATH}",
        base_path(api)
    ))?;
    Ok(url)
}

/// Dial URL with the bearer token as a url-encoded query parameter.
pub fn transport_url(endpoint: &Url, token: &str) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut().clear().append_pair("token", token);
    url
}

pub fn rest_base(api: &Url) -> String {
    let origin = api.origin().ascii_serialization();
    format!("{origin}{}{REST_PATH}", base_path(api))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).expect("url")
    }

    #[test]
    fn ws_scheme_mirrors_api_scheme() {
        assert_eq!(
            ws_endpoint(&url("http://localhost:8000")).expect("ws").as_str(),
            "ws://localhost:8000/api/v1/ws/drive"
        );
        assert_eq!(
            ws_endpoint(&url("https://drive.example.com")).expect("ws").as_str(),
            "wss://drive.example.com/api/v1/ws/drive"
        );
        assert!(ws_endpoint(&url("ftp://example.com")).is_err());
    }

    #[test]
    fn token_is_url_encoded() {
        let endpoint = ws_endpoint(&url("http://127.0.0.1:9000")).expect("ws");
        let dial = transport_url(&endpoint, "a b+c/=");
        assert_eq!(
            dial.as_str(),
            "ws://127.0.0.1:9000/api/v1/ws/drive?token=a+b%2Bc%2F%3D"
        );
        let again = transport_url(&dial, "next");
        assert_eq!(again.query(), Some("token=next"));
    }

    #[test]
    fn rest_base_keeps_mount_path() {
        assert_eq!(rest_base(&url("http://localhost:8000")), "http://localhost:8000/api/v1");
        assert_eq!(
            rest_base(&url("https://example.com/drive/")),
            "https://example.com/drive/api/v1"
        );
    }

    #[test]
    fn bool_env_values() {
        assert_eq!(parse_bool_env("YES"), Some(true));
        assert_eq!(parse_bool_env(" off "), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }

    #[test]
    fn explicit_flags_win() {
        let config = load_config(Args {
            api_url: "https://example.com/".to_string(),
            token: "tok".to_string(),
            session_file: "/tmp/s.json".to_string(),
            conversation: "c1".to_string(),
            heartbeat_interval: 5,
            reconnect_base_ms: 10,
            reconnect_max_ms: 40,
            log_dir: "/tmp/logs".to_string(),
            ..Args::default()
        })
        .expect("config");
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert_eq!(config.conversation.as_deref(), Some("c1"));
        assert_eq!(config.session_file, PathBuf::from("/tmp/s.json"));
        assert_eq!(config.reconnect.delay(3), Duration::from_millis(40));
        assert_eq!(config.rest_base(), "https://example.com/api/v1");

        let zero = load_config(Args {
            api_url: "http://localhost".to_string(),
            heartbeat_interval: 0,
            ..Args::default()
        });
        assert!(matches!(zero, Err(ClientError::Config(_))));
    }
}
