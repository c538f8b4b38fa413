//! Screen-level controllers. Each owns the state one screen shows and turns
//! every failure into a short banner, logging the detail.

pub mod chat;
pub mod flows;
pub mod knowledge;

pub use chat::ChatView;
pub use flows::FlowsView;
pub use knowledge::{KnowledgeBaseListView, KnowledgeBaseView};

use crate::error::{ErrorKind, FlowChatError};

/// User-facing failure notice. Server detail never reaches `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub text: String,
    pub kind: ErrorKind,
}

impl Banner {
    pub(crate) fn from_error(text: &str, err: &FlowChatError) -> Self {
        tracing::error!("{}: {}", text, err);
        Self {
            text: text.to_string(),
            kind: err.kind(),
        }
    }

    /// Missing identity; the caller should send the user to login.
    pub fn needs_login(&self) -> bool {
        self.kind == ErrorKind::Unauthorized
    }
}

impl std::fmt::Display for Banner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

impl std::error::Error for Banner {}
