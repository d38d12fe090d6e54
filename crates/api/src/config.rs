//! API server configuration

/// Runtime configuration, read once at startup.
#[derive(Clone)]
pub struct Config {
    /// Token required on /admin routes.
    pub admin_api_token: String,
    /// Listen port. Defaults to 8080.
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let admin_api_token = std::env::var("ADMIN_API_TOKEN")
            .map_err(|_| anyhow::anyhow!("ADMIN_API_TOKEN must be set"))?;
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a number, got {raw:?}"))?,
            Err(_) => 8080,
        };

        Ok(Self {
            admin_api_token,
            port,
        })
    }
}
