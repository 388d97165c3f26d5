use vett_core::{env_var_bool, non_empty_env_var};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_VISION_MODEL: &str = "gpt-4o";
const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 1_024;

#[derive(Debug, Clone)]
/// Text/vision endpoint configuration, resolved from the environment once at
/// engine start.
pub struct ModelConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub vision_model: String,
    pub vision_endpoint: Option<String>,
    pub organization: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_ms: u64,
    pub debug_llm: bool,
}

impl ModelConfig {
    /// Reads `OPENAI_*` / `VISION_MODEL*` / `DEBUG_LLM` from the environment.
    pub fn from_env() -> Self {
        Self {
            api_base: non_empty_env_var("OPENAI_API_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: non_empty_env_var("OPENAI_API_KEY").unwrap_or_default(),
            model: non_empty_env_var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            vision_model: non_empty_env_var("VISION_MODEL")
                .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            vision_endpoint: non_empty_env_var("VISION_MODEL_ENDPOINT"),
            organization: non_empty_env_var("OPENAI_ORG_ID"),
            temperature: non_empty_env_var("OPENAI_TEMPERATURE")
                .and_then(|raw| raw.parse::<f32>().ok())
                .unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: non_empty_env_var("OPENAI_MAX_TOKENS")
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(DEFAULT_MAX_TOKENS),
            request_timeout_ms: 30_000,
            debug_llm: env_var_bool("DEBUG_LLM", false),
        }
    }

    /// Configuration for tests: no network defaults leak in.
    pub fn for_tests(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            vision_endpoint: None,
            organization: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout_ms: 5_000,
            debug_llm: false,
        }
    }
}
