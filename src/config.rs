use regex::Regex;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the server binds to.
    pub host: String,
    /// Port the server binds to.
    pub port: u16,
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Shared secret presented by the privileged web-server client.
    pub server_key: String,
    /// Allow-list for the `Origin` header at handshake time.
    pub origin_regex: Regex,
    /// Secret mixed into IP fingerprints so raw addresses are never stored.
    pub fingerprint_secret: String,
    /// Remote sources for the trusted reverse-proxy address ranges.
    pub ranges_v4_url: String,
    pub ranges_v6_url: String,
    /// Development flag: include the caller's own connection in status output.
    pub localhost: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing
    /// or malformed.
    pub fn from_env() -> Self {
        let origin_regex = std::env::var("ORIGIN_REGEX")
            .unwrap_or_else(|_| "^http://localhost".to_string());

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3672),
            database_url: required_var("DATABASE_URL"),
            server_key: required_var("SERVER_KEY"),
            origin_regex: Regex::new(&origin_regex)
                .unwrap_or_else(|e| panic!("ORIGIN_REGEX is not a valid regex: {e}")),
            fingerprint_secret: required_var("FINGERPRINT_SECRET"),
            ranges_v4_url: std::env::var("RANGES_V4_URL")
                .unwrap_or_else(|_| "https://www.cloudflare.com/ips-v4".to_string()),
            ranges_v6_url: std::env::var("RANGES_V6_URL")
                .unwrap_or_else(|_| "https://www.cloudflare.com/ips-v6".to_string()),
            localhost: std::env::var("LOCALHOST")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}
