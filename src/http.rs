use reqwest::Client;
use std::time::Duration;

/// Shared outbound client; `HTTP_CONNECT_TIMEOUT_SECS` bounds the handshake.
pub fn build_client(timeout: Duration) -> Client {
    let connect = crate::config::parse_env("HTTP_CONNECT_TIMEOUT_SECS")
        .filter(|v: &u64| *v > 0)
        .unwrap_or(5);
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub fn default_timeout() -> Duration {
    Duration::from_secs(
        crate::config::parse_env("HTTP_TIMEOUT_SECS")
            .filter(|v: &u64| *v > 0)
            .unwrap_or(15),
    )
}
