use serde_json::{Map, Value, json};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Sampling knobs forwarded to the provider as-is.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
}

impl SamplingParams {
    pub const fn new(temperature: f64, top_p: f64, top_k: u32) -> Self {
        Self {
            temperature: Some(temperature),
            top_p: Some(top_p),
            top_k: Some(top_k),
        }
    }

    /// Gemini nests nucleus/top-k settings under `generationConfig`.
    pub fn gemini_additional_params(&self) -> Option<Value> {
        let mut generation_config = Map::new();
        if let Some(top_p) = self.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }
        if let Some(top_k) = self.top_k {
            generation_config.insert("topK".to_string(), json!(top_k));
        }

        if generation_config.is_empty() {
            None
        } else {
            Some(json!({ "generationConfig": generation_config }))
        }
    }

    /// OpenAI has no top-k, so only `top_p` is forwarded.
    pub fn openai_additional_params(&self) -> Option<Value> {
        self.top_p.map(|top_p| json!({ "top_p": top_p }))
    }
}
