use std::time::Duration;

use tracing::warn;

pub const SYSTEM_PROMPT: &str = "You are an AI assistant specialized in helping researchers explore and \
understand a hierarchical single-cell atlas. You have access to cellular programs with gene expression \
patterns, UMAP visualizations, cell type distributions, program correlation heatmaps, and gene loadings.\n\n\
You also have access to external tools that can search the web for current research and query genetics \
databases for credible sets, phenotype associations, and variant data.\n\n\
You can help users understand what they are seeing in visualizations, interpret gene programs and their \
biological significance, navigate the data, and find relevant research papers.\n\n\
When you call a tool, ALWAYS extract the specific search terms from the user's request and pass them as \
the \"query\" parameter. Never call a tool with empty parameters.\n\n\
Be concise but informative. Reference specific data when relevant. If you are unsure about something, say \
so rather than guessing, and consider searching for more information.";

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct SearchProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct GeneticsProviderConfig {
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_message_len: usize,
    pub max_history: usize,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub search_provider: Option<SearchProviderConfig>,
    pub genetics_provider: Option<GeneticsProviderConfig>,
}

impl ChatConfig {
    pub fn from_env() -> Self {
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("ANTHROPIC_API_KEY not set; chat backend will be unavailable");
        }

        let search_provider = std::env::var("PERPLEXITY_API_KEY").ok().filter(|k| !k.is_empty()).map(|key| {
            SearchProviderConfig {
                command: std::env::var("SEARCH_MCP_COMMAND").unwrap_or_else(|_| "npx".into()),
                args: vec!["-y".into(), "server-perplexity-ask".into()],
                env: vec![("PERPLEXITY_API_KEY".into(), key)],
                timeout_secs: 60,
            }
        });

        let genetics_provider = std::env::var("GENETICS_API_URL").ok().filter(|u| !u.is_empty()).and_then(|u| {
            match url::Url::parse(&u) {
                Ok(_) => Some(GeneticsProviderConfig { url: u, timeout_secs: 60 }),
                Err(e) => {
                    warn!(url = %u, error = %e, "invalid GENETICS_API_URL; genetics tools disabled");
                    None
                }
            }
        });

        Self {
            enabled: env_flag("CHAT_ENABLED", true),
            api_key,
            base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".into()),
            model: std::env::var("CHAT_MODEL").unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            max_tokens: 4096,
            temperature: 0.7,
            max_message_len: 10_000,
            max_history: 50,
            session_ttl_secs: 3600,
            sweep_interval_secs: 900,
            search_provider,
            genetics_provider,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(300)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://api.anthropic.com/v1".into(),
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 4096,
            temperature: 0.7,
            max_message_len: 10_000,
            max_history: 50,
            session_ttl_secs: 3600,
            sweep_interval_secs: 900,
            search_provider: None,
            genetics_provider: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flag_parses_common_forms() {
        assert!(env_flag("ATLAS_CHAT_TEST_MISSING_FLAG", true));
        assert!(!env_flag("ATLAS_CHAT_TEST_MISSING_FLAG", false));
    }

    #[test]
    fn default_config_has_original_limits() {
        let cfg = ChatConfig::default();
        assert_eq!(cfg.max_history, 50);
        assert_eq!(cfg.max_message_len, 10_000);
        assert_eq!(cfg.session_ttl_secs, 3600);
        assert_eq!(cfg.sweep_interval_secs, 900);
    }
}
