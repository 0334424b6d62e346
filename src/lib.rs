pub mod config;
pub mod database;
pub mod progress;
pub mod queue;
pub mod record;
pub mod routes;
pub mod sandbox;
pub mod status;
pub mod validator;
pub mod web_server;
pub mod webhook;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Name of this instance as reported in `queue_host`/`execution_host`.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}
