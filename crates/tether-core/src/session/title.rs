//! Session titles.
//!
//! A title is either the first user message, whitespace-collapsed and
//! truncated, or a short summary produced by the host's completion endpoint.
//! Generation happens at most once per session; renames go through
//! [`SessionTitleService::update_title`].

use std::sync::Arc;

use serde_json::Value;

use super::state::{SessionStateManager, PENDING_TITLE};
use crate::config::TitleSettings;
use crate::error::{Error, Result};
use crate::model::{HostMessage, UpdateSessionRequest};
use crate::ports::{HostMessenger, RemoteSessionStore};

/// Longest title kept without truncation, in characters.
pub const MAX_TITLE_LENGTH: usize = 140;

/// Length a long title is cut to before the ellipsis is appended.
pub const TITLE_CUT_LENGTH: usize = MAX_TITLE_LENGTH - 3;

const TITLE_PROMPT: &str = "Summarize the following request as a short title of at most ten \
words. Reply with the title only, without quotes or punctuation at the end.\n\nRequest:\n";

/// Derives, generates and persists session titles.
pub struct SessionTitleService {
    remote: Arc<dyn RemoteSessionStore>,
    host: Arc<dyn HostMessenger>,
    state: Arc<SessionStateManager>,
    settings: TitleSettings,
}

impl std::fmt::Debug for SessionTitleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTitleService")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionTitleService {
    /// Create a title service.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteSessionStore>,
        host: Arc<dyn HostMessenger>,
        state: Arc<SessionStateManager>,
        settings: TitleSettings,
    ) -> Self {
        Self {
            remote,
            host,
            state,
            settings,
        }
    }

    /// Text of the first message with non-empty content, whitespace-collapsed.
    ///
    /// With `truncate`, text longer than [`MAX_TITLE_LENGTH`] is cut to
    /// [`TITLE_CUT_LENGTH`] characters and suffixed with `...`.
    #[must_use]
    pub fn first_message_text(messages: &[Value], truncate: bool) -> Option<String> {
        let text = messages
            .iter()
            .filter_map(|message| message.get("text").and_then(Value::as_str))
            .map(collapse_whitespace)
            .find(|text| !text.is_empty())?;

        Some(if truncate { truncate_title(&text) } else { text })
    }

    /// Produce a title for a conversation. Never fails.
    ///
    /// Asks the host for a summary of the first message under the configured
    /// timeout; any failure or empty answer falls back to the truncated first
    /// message. Returns `None` only when no message has text.
    pub async fn generate_title(&self, messages: &[Value]) -> Option<String> {
        let text = Self::first_message_text(messages, false)?;
        let excerpt: String = text.chars().take(self.settings.max_prompt_chars).collect();
        let prompt = format!("{TITLE_PROMPT}{excerpt}");

        let completion = tokio::time::timeout(
            self.settings.timeout,
            self.host.request_completion(&prompt, self.settings.timeout),
        )
        .await;

        match completion {
            Ok(Ok(raw)) => {
                let cleaned = clean_generated_title(&raw);
                if !cleaned.is_empty() {
                    return Some(truncate_title(&cleaned));
                }
                tracing::debug!("Title completion was empty, using first message");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Title generation failed, using first message");
            }
            Err(_) => {
                let e = Error::Timeout(self.settings.timeout.as_secs());
                tracing::warn!(error = %e, "Title generation timed out, using first message");
            }
        }

        Some(truncate_title(&text))
    }

    /// Give a session a title unless it already has one.
    ///
    /// A pending placeholder is recorded first so a second call for the same
    /// session returns immediately. A title already present remotely is
    /// adopted. Failures fall back to the truncated first message, with one
    /// more remote update attempt.
    pub async fn generate_and_update_title(&self, session_id: &str, messages: &[Value]) {
        if !self.state.set_title_if_absent(session_id, PENDING_TITLE).await {
            tracing::debug!(session_id, "Title already present or pending");
            return;
        }

        match self.remote.get_session(session_id, false).await {
            Ok(Some(session)) => {
                if let Some(title) = session.non_empty_title() {
                    tracing::debug!(session_id, "Adopting existing remote title");
                    self.state.set_title(session_id, title).await;
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(session_id, error = %e, "Could not check remote title");
            }
        }

        let Some(title) = self.generate_title(messages).await else {
            tracing::debug!(session_id, "No message text to derive a title from");
            self.state.clear_title(session_id).await;
            return;
        };

        let Err(e) = self.update_title(session_id, &title).await else {
            return;
        };
        tracing::warn!(session_id, error = %e, "Failed to store generated title");

        let Some(fallback) = Self::first_message_text(messages, true) else {
            self.state.clear_title(session_id).await;
            return;
        };
        self.state.set_title(session_id, fallback.as_str()).await;
        if let Err(e) = self.update_title(session_id, &fallback).await {
            tracing::debug!(session_id, error = %e, "Retry with fallback title failed");
        }
    }

    /// Set a session's title remotely and locally.
    ///
    /// Emits [`HostMessage::TitleGenerated`] on success.
    pub async fn update_title(&self, session_id: &str, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::InvalidTitle);
        }

        let updated = self
            .remote
            .update_session(UpdateSessionRequest {
                session_id: session_id.to_string(),
                title: Some(title.to_string()),
                ..Default::default()
            })
            .await?;

        self.state.set_title(session_id, title).await;
        self.state
            .update_timestamp(session_id, &updated.updated_at)
            .await;
        self.host.post_message(HostMessage::TitleGenerated {
            session_id: session_id.to_string(),
            title: title.to_string(),
        });

        tracing::info!(session_id, "Session title updated");
        Ok(())
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_title(text: &str) -> String {
    if text.chars().count() <= MAX_TITLE_LENGTH {
        return text.to_string();
    }
    let cut: String = text.chars().take(TITLE_CUT_LENGTH).collect();
    format!("{}...", cut.trim_end())
}

fn clean_generated_title(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw);
    let mut title = collapsed.as_str();
    for (open, close) in [('"', '"'), ('\'', '\''), ('`', '`'), ('\u{201c}', '\u{201d}')] {
        if title.len() >= 2 && title.starts_with(open) && title.ends_with(close) {
            title = &title[open.len_utf8()..title.len() - close.len_utf8()];
            break;
        }
    }
    title.trim().to_string()
}
