use std::time::Duration;

/// Broker connection parameters. Built by the caller (CLI, settings layer);
/// the core never reads environment variables or files itself.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub client_id: String,
    /// Node assumed for commands to devices never observed on the wire.
    pub default_node: String,
    /// How long `connect()` waits for the broker's ConnAck.
    pub connect_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            use_tls: false,
            client_id: format!("hydrocore-{}", uuid::Uuid::new_v4()),
            default_node: "rpi".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_default_node(mut self, node: impl Into<String>) -> Self {
        self.default_node = node.into();
        self
    }
}

/// Time-series store session parameters (InfluxDB v2 style).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// Tag stamped on every written point.
    pub project: String,
    /// Lookback window for "latest per series" queries.
    pub latest_lookback: Duration,
}

impl StoreConfig {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        org: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            org: org.into(),
            bucket: bucket.into(),
            project: "hydroponics".to_string(),
            latest_lookback: Duration::from_secs(24 * 60 * 60),
        }
    }
}
