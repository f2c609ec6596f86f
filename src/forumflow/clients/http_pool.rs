//! HTTP client pool keeping one persistent connection pool per base URL.
//!
//! Reviews for many concurrent tasks go to the same one or two endpoints, so
//! every [`OpenAIClient`](super::openai::OpenAIClient) built for a base URL
//! shares the same `reqwest::Client`:
//! - connections are reused across reviews
//! - DNS lookups and TLS handshakes happen once per host
//! - TCP keepalive stops idle connections from being dropped between phases

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    static ref HTTP_CLIENT_POOL: Mutex<HashMap<String, reqwest::Client>> =
        Mutex::new(HashMap::new());
}

fn build_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        // Keep idle connections alive for 90 seconds
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_else(|err| {
            log::warn!("falling back to a default HTTP client: {}", err);
            reqwest::Client::new()
        })
}

/// Get or create the shared HTTP client for `base_url`.
pub fn get_http_client(base_url: &str) -> reqwest::Client {
    let mut pool = match HTTP_CLIENT_POOL.lock() {
        Ok(pool) => pool,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(client) = pool.get(base_url) {
        return client.clone();
    }

    let client = build_client();
    pool.insert(base_url.to_string(), client.clone());
    client
}

/// Number of base URLs with a pooled client.
pub fn pooled_hosts() -> usize {
    HTTP_CLIENT_POOL
        .lock()
        .map(|pool| pool.len())
        .unwrap_or_default()
}
