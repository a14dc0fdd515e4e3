use crate::constants::{
    HTTP_TIMEOUT, POOL_IDLE_TIMEOUT, POOL_MAX_IDLE_PER_HOST, TCP_KEEPALIVE,
};
use reqwest::{Client, ClientBuilder};

/// HTTP client with connection pooling tuned for feed queries.
pub fn build_http_client() -> Client {
    ClientBuilder::new()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .tcp_nodelay(true)
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("depot/", env!("CARGO_PKG_VERSION")))
        .gzip(true)
        .brotli(true)
        .build()
        .expect("Failed to create HTTP client")
}
