use serde::{Deserialize, Serialize};

/// An entry of the `/v1/models` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
}

/// `/v1/models` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelsResponse {
    #[serde(default)]
    pub object: String,
    pub data: Vec<Model>,
}

/// The backend's `model` parameter: `persona_id/llm_model`, or a bare
/// `persona_id` when the backend default LLM should be used.
///
/// Only the first `/` separates the two parts; LLM names such as
/// `deepseek-ai/DeepSeek-V3.2` keep their own slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelector<'a> {
    pub persona_id: &'a str,
    pub llm_model: Option<&'a str>,
}

impl<'a> ModelSelector<'a> {
    #[must_use]
    pub fn parse(model: &'a str) -> Self {
        match model.split_once('/') {
            Some((persona_id, llm_model)) => Self {
                persona_id,
                llm_model: Some(llm_model),
            },
            None => Self {
                persona_id: model,
                llm_model: None,
            },
        }
    }
}
