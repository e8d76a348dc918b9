//! Model name to provider mapping

/// Providers whose API keys users store as secrets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    Mistral,
}

impl Provider {
    /// Infer the provider from a model name such as `gpt-4o` or `anthropic/claude-3-5-sonnet`
    pub fn from_model(model: &str) -> Option<Self> {
        let model = model.trim().to_ascii_lowercase();
        if let Some((prefix, _)) = model.split_once('/') {
            return match prefix {
                "openai" => Some(Provider::OpenAi),
                "anthropic" => Some(Provider::Anthropic),
                "google" => Some(Provider::Google),
                "mistral" | "mistralai" => Some(Provider::Mistral),
                _ => None,
            };
        }

        if model.starts_with("gpt-")
            || model.starts_with("o1")
            || model.starts_with("o3")
            || model.starts_with("o4")
        {
            Some(Provider::OpenAi)
        } else if model.starts_with("claude-") {
            Some(Provider::Anthropic)
        } else if model.starts_with("gemini-") {
            Some(Provider::Google)
        } else if model.starts_with("mistral-") {
            Some(Provider::Mistral)
        } else {
            None
        }
    }

    /// Secret name holding this provider's API key
    pub fn api_key_name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
            Provider::Mistral => "MISTRAL_API_KEY",
        }
    }
}

/// Secret name for a model's provider key, if the provider is known
pub fn api_key_name(model: &str) -> Option<&'static str> {
    Provider::from_model(model).map(|p| p.api_key_name())
}
