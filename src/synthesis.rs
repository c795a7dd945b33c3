//! Answer synthesis.
//!
//! Turns a question plus the retrieved grounding context into a final answer
//! via a chat model. The model is instructed to answer only from the provided
//! context; prior conversation turns are replayed between the system prompt
//! and the grounded question.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::SynthesisConfig;
use crate::models::ChatTurn;
use crate::openrouter::{chat_content, OpenRouterClient};

const SYSTEM_PROMPT: &str = "You are a financial analyst assistant. \
Answer the user's question based ONLY on the context provided below. \
The context includes text from the report and summaries of data tables. \
Cite which table or page supports your answer if possible.";

/// Trait for answer-synthesis backends.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Produce an answer for `question` grounded in `context`.
    async fn synthesize(
        &self,
        question: &str,
        context: &str,
        history: &[ChatTurn],
    ) -> Result<String>;
}

/// The grounded user message sent as the final chat turn.
pub fn grounded_user_message(question: &str, context: &str) -> String {
    format!(
        "Context:\n{}\n\nUser Question: {}\nAnswer:",
        context, question
    )
}

/// Full message list for a synthesis call: system prompt, replayed history,
/// then the grounded question. Unknown history roles are sent as `user`.
pub fn build_messages(
    question: &str,
    context: &str,
    history: &[ChatTurn],
) -> Vec<serde_json::Value> {
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": SYSTEM_PROMPT,
    })];

    for turn in history {
        let role = match turn.role.as_str() {
            "assistant" => "assistant",
            _ => "user",
        };
        messages.push(serde_json::json!({
            "role": role,
            "content": turn.content,
        }));
    }

    messages.push(serde_json::json!({
        "role": "user",
        "content": grounded_user_message(question, context),
    }));

    messages
}

// ============ Disabled Synthesizer ============

/// Synthesizer used when `synthesis.provider = "disabled"`; always errors.
pub struct DisabledSynthesizer;

#[async_trait]
impl Synthesizer for DisabledSynthesizer {
    async fn synthesize(
        &self,
        _question: &str,
        _context: &str,
        _history: &[ChatTurn],
    ) -> Result<String> {
        bail!("Synthesis provider is disabled; set synthesis.provider = \"openrouter\"")
    }
}

// ============ OpenRouter Synthesizer ============

/// Synthesizer backed by OpenRouter chat completions.
pub struct OpenRouterSynthesizer {
    model: String,
    max_retries: u32,
    client: OpenRouterClient,
}

impl OpenRouterSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let client =
            OpenRouterClient::new(&config.base_url, &config.api_key_env, config.timeout_secs)?;
        Ok(Self {
            model: config.model.clone(),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Synthesizer for OpenRouterSynthesizer {
    async fn synthesize(
        &self,
        question: &str,
        context: &str,
        history: &[ChatTurn],
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": build_messages(question, context, history),
        });

        let json = self
            .client
            .post_json("/chat/completions", &body, self.max_retries)
            .await?;
        chat_content(&json)
    }
}

/// Create the configured [`Synthesizer`].
pub fn create_synthesizer(config: &SynthesisConfig) -> Result<Arc<dyn Synthesizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledSynthesizer)),
        "openrouter" => Ok(Arc::new(OpenRouterSynthesizer::new(config)?)),
        other => bail!("Unknown synthesis provider: {}", other),
    }
}
