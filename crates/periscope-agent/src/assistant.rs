//! The seam to the AI coding session.
//!
//! `/say` text reaches the AI through an [`AssistantAdapter`]. The default
//! adapter drives the on-screen session: it types the text into the
//! focused chat input and submits it. Responses and proposed actions flow
//! back out of band as agent events.

use std::sync::Arc;

use async_trait::async_trait;

use crate::capture::{ControllerError, ScreenController};

/// Relays free-form text to the AI session.
#[async_trait]
pub trait AssistantAdapter: Send + Sync {
    async fn relay(&self, text: &str) -> Result<(), ControllerError>;
}

/// Adapter that drives the visible session through the screen controller.
pub struct ScreenAssistant {
    controller: Arc<dyn ScreenController>,
}

impl ScreenAssistant {
    pub fn new(controller: Arc<dyn ScreenController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl AssistantAdapter for ScreenAssistant {
    async fn relay(&self, text: &str) -> Result<(), ControllerError> {
        self.controller.inject_text(text).await?;
        self.controller.key_combo("Return").await
    }
}
