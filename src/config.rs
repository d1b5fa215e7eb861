use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const API_KEY_VAR: &str = "GEMINI_API_KEY";
const ENDPOINT_VAR: &str = "LIVE_CONSULT_ENDPOINT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key: {0}")]
    InvalidKey(String),
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Credentials and endpoint for the remote consultation service
#[derive(Debug)]
pub struct ApiConfig {
    api_key: SecretBox<String>,
    endpoint: Url,
}

impl ApiConfig {
    /// Load API configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let key = env::var(API_KEY_VAR).map_err(|_| ConfigError::MissingEnvVar(API_KEY_VAR.to_string()))?;
        let endpoint = env::var(ENDPOINT_VAR).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        Self::new(key, &endpoint)
    }

    pub fn new(api_key: String, endpoint: &str) -> Result<Self, ConfigError> {
        if api_key.trim().is_empty() {
            return Err(ConfigError::InvalidKey("API key cannot be empty".to_string()));
        }

        Ok(Self {
            api_key: SecretBox::new(Box::new(api_key)),
            endpoint: Self::parse_endpoint(endpoint)?,
        })
    }

    fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
        let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: format!("expected ws or wss scheme, got '{}'", other),
            }),
        }
    }

    /// Get the API key (use only when opening the connection)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!("Loaded API configuration (endpoint: {})", config.endpoint().host_str().unwrap_or("?"));
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Per-session tuning. Defaults mirror what the consultation UI ships with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    /// Sent once as a user turn right after the transport opens
    pub greeting: String,
    /// Rate assumed for inbound audio when the chunk doesn't say
    pub output_sample_rate_hz: u32,
    pub output_channels: u16,
    /// Mean absolute amplitude above which a frame counts as local speech
    pub speech_threshold: f32,
    /// Samples per capture frame
    pub frame_size: usize,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.0-flash-exp".to_string(),
            voice_name: "Charon".to_string(),
            system_instruction: "You are an Elite Business Consulting Expert. You are professional, \
                analytical, and direct. Help the founder build their specific venture. Use \
                'highlightCanvasSection' when introducing a canvas section, 'proposeCanvasEntry' \
                to propose content, and 'updateQuizState' to test their understanding of their \
                own risks. Be concise. Drive the founder to decisions."
                .to_string(),
            greeting: "[System Event] Connection established. Greet the user by name (if known) \
                or as 'Founder', state your role as their Adaptive Strategy Consultant, and ask \
                how you can help build their venture today."
                .to_string(),
            output_sample_rate_hz: 24000,
            output_channels: 1,
            speech_threshold: 0.01,
            frame_size: 4096,
            connect_timeout: Duration::from_secs(10),
        }
    }
}
