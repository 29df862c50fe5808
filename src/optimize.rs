use std::path::PathBuf;

use crate::providers::OpenRouterChat;
use crate::{RelayError, Result};

pub(crate) const OPTIMIZER_MODEL: &str = "anthropic/claude-3.5-sonnet";
pub const DEFAULT_ROLE_FILE: &str = "prompt-optimizer-role.txt";

const DEFAULT_ROLE_PROMPT: &str = "You are an expert at writing prompts for AI image \
generation models. Rewrite the prompt you are given into a more precise, more effective \
version for the target model, keeping the original intent.";

const TRANSLATOR_ROLE_PROMPT: &str = "You are a professional translator. Translate the \
prompt you are given into accurate English, preserving technical terms, and return only \
the translation.";

/// Model families that only accept English prompts; their optimized prompt
/// gets a second, translation pass.
const ENGLISH_ONLY_TARGETS: &[&str] = &["flux", "kontext", "krea"];

const OPTIMIZE_MAX_TOKENS: u32 = 1000;
const OPTIMIZE_TEMPERATURE: f64 = 0.7;
const TRANSLATE_TEMPERATURE: f64 = 0.3;

/// Rewrites a user's raw prompt through a general-purpose text model, with
/// an optional machine-translation pass for English-only target models.
pub struct PromptOptimizer {
    chat: OpenRouterChat,
    role_file: PathBuf,
}

impl PromptOptimizer {
    pub fn new(chat: OpenRouterChat) -> Self {
        Self {
            chat: chat.with_model(OPTIMIZER_MODEL),
            role_file: PathBuf::from(DEFAULT_ROLE_FILE),
        }
    }

    pub fn with_role_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.role_file = path.into();
        self
    }

    /// The optimizer persona is operator-editable on disk; an unreadable or
    /// empty file falls back to the built-in prompt.
    async fn role_prompt(&self) -> String {
        match tokio::fs::read_to_string(&self.role_file).await {
            Ok(contents) if !contents.trim().is_empty() => contents,
            Ok(_) => DEFAULT_ROLE_PROMPT.to_string(),
            Err(err) => {
                tracing::warn!(
                    path = %self.role_file.display(),
                    %err,
                    "could not read optimizer role file"
                );
                DEFAULT_ROLE_PROMPT.to_string()
            }
        }
    }

    pub async fn optimize(&self, prompt: &str, target_model: &str) -> Result<String> {
        let system_prompt = self.role_prompt().await;
        let user_prompt = format!(
            "Optimize the following prompt for the {target_model} model:\n\n\
             Original prompt: {prompt}\n\n\
             Return only the optimized prompt, without explanations or prefixes."
        );
        let optimized = self
            .chat
            .complete_text(
                &system_prompt,
                &user_prompt,
                OPTIMIZE_MAX_TOKENS,
                OPTIMIZE_TEMPERATURE,
            )
            .await?;
        let mut optimized = if optimized.is_empty() {
            prompt.to_string()
        } else {
            optimized
        };

        if needs_english(target_model) {
            let user_prompt = format!(
                "Translate the following prompt into English:\n\n{optimized}\n\n\
                 Return only the English translation, without explanations or prefixes."
            );
            match self
                .chat
                .complete_text(
                    TRANSLATOR_ROLE_PROMPT,
                    &user_prompt,
                    OPTIMIZE_MAX_TOKENS,
                    TRANSLATE_TEMPERATURE,
                )
                .await
            {
                Ok(translated) if !translated.is_empty() => optimized = translated,
                Ok(_) => {}
                // Upstream rejecting the translation is degraded mode, not
                // failure; transport errors still propagate.
                Err(RelayError::Api { status, .. }) => {
                    tracing::warn!(%status, "translation failed, keeping untranslated prompt");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(optimized)
    }
}

fn needs_english(target_model: &str) -> bool {
    let target = target_model.to_lowercase();
    ENGLISH_ONLY_TARGETS.iter().any(|known| *known == target)
}
