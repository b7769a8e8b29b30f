use anyhow::{bail, Context, Result};
use axum::http::HeaderValue;
use tracing::{info, warn};

const DEFAULT_FRONTEND_URL: &str = "http://localhost:8501";
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub allowed_origin: HeaderValue,
    pub port: u16,
}

impl Config {
    /// Reads the process environment, after merging in a `.env` file if one
    /// is present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = match lookup("OPENAI_API_KEY") {
            Some(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENAI_API_KEY is not set. Please set it in your environment or .env file"),
        };
        if !api_key.starts_with("sk-") {
            warn!("OPENAI_API_KEY doesn't start with 'sk-', requests will probably be rejected");
        }
        info!("OpenAI API key loaded successfully");

        let frontend_url = lookup("FRONTEND_URL").unwrap_or_else(|| DEFAULT_FRONTEND_URL.to_string());
        let allowed_origin = HeaderValue::from_str(&frontend_url)
            .with_context(|| format!("FRONTEND_URL is not a valid origin: {frontend_url}"))?;

        let port = match lookup("BACKEND_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("BACKEND_PORT is not a valid port: {raw}"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            api_key,
            allowed_origin,
            port,
        })
    }
}
