//! Server configuration

/// Configuration loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret for webhook signature verification. Absent means every
    /// delivery is rejected with a configuration error.
    pub webhook_secret: Option<String>,
    /// Bearer token guarding the admin endpoints. Absent means they are
    /// disabled.
    pub admin_token: Option<String>,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            webhook_secret: non_empty_var("WEBHOOK_SECRET"),
            admin_token: non_empty_var("ADMIN_TOKEN"),
            bind_addr: non_empty_var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
