use std::sync::Arc;

use crate::error::FlowChatError;
use crate::identity::Identity;
use crate::models::Flow;
use crate::transcript::{Location, TranscriptManager};
use crate::transport::Transport;
use crate::views::Banner;

type ViewResult<T> = std::result::Result<T, Banner>;

/// Chat screen: flow picker, thread list and the open transcript.
pub struct ChatView {
    transport: Arc<dyn Transport>,
    transcript: TranscriptManager,
    flows: Vec<Flow>,
    banner: Option<Banner>,
}

impl ChatView {
    pub fn new(transport: Arc<dyn Transport>, identity: Option<Identity>) -> Self {
        Self {
            transcript: TranscriptManager::new(transport.clone(), identity),
            transport,
            flows: Vec::new(),
            banner: None,
        }
    }

    pub fn transcript(&self) -> &TranscriptManager {
        &self.transcript
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn banner(&self) -> Option<&Banner> {
        self.banner.as_ref()
    }

    pub fn location(&self) -> Location {
        self.transcript.location()
    }

    fn settle<T>(&mut self, text: &str, result: Result<T, FlowChatError>) -> ViewResult<T> {
        match result {
            Ok(value) => {
                self.banner = None;
                Ok(value)
            }
            Err(e) => {
                let banner = Banner::from_error(text, &e);
                self.banner = Some(banner.clone());
                Err(banner)
            }
        }
    }

    pub async fn load_flows(&mut self) -> ViewResult<()> {
        let result = self.transport.list_flows(None).await;
        let flows = self.settle("Failed to load flows", result)?;
        self.flows = flows;
        Ok(())
    }

    pub async fn select_flow(&mut self, flow_id: &str) -> ViewResult<()> {
        let result = self.transcript.select_flow(flow_id).await;
        self.settle("Failed to select flow", result)
    }

    pub async fn select_thread(&mut self, thread_id: &str) -> ViewResult<()> {
        let result = self.transcript.select_thread(thread_id).await;
        self.settle("Failed to load thread", result)
    }

    /// Re-opens the flow and thread named by a saved location.
    pub async fn restore(&mut self, location: &Location) -> ViewResult<()> {
        let Some(flow_id) = location.flow.as_deref() else {
            return self.clear_flow();
        };
        self.select_flow(flow_id).await?;
        if let Some(thread_id) = location.thread.as_deref() {
            self.select_thread(thread_id).await?;
        }
        Ok(())
    }

    pub fn new_chat(&mut self) -> ViewResult<()> {
        let result = self.transcript.new_chat();
        self.settle("Failed to start a new chat", result)
    }

    pub fn back(&mut self) -> ViewResult<()> {
        let result = self.transcript.back();
        self.settle("Failed to leave thread", result)
    }

    pub fn clear_flow(&mut self) -> ViewResult<()> {
        let result = self.transcript.clear_flow();
        self.settle("Failed to leave flow", result)
    }

    pub async fn send(&mut self, input: &str) -> ViewResult<()> {
        let result = self.transcript.send(input).await;
        self.settle("Failed to send message", result)
    }

    /// `Ok(false)` when the title was blank and nothing was sent. A flow must
    /// be selected first.
    pub async fn rename(&mut self, thread_id: &str, title: &str) -> ViewResult<bool> {
        let result = self.transcript.rename_thread(thread_id, title).await;
        self.settle("Failed to update thread title", result)
    }

    pub async fn delete_thread(&mut self, thread_id: &str) -> ViewResult<()> {
        let result = self.transcript.delete_thread(thread_id).await;
        self.settle("Failed to delete thread", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{ChatResponse, ChatSession, Message, ThreadInfo};
    use crate::transcript::ViewState;
    use crate::transport::MockTransport;
    use chrono::Utc;

    fn flow(id: &str) -> Flow {
        Flow {
            id: id.to_string(),
            name: "Support".to_string(),
            description: Some("Customer support".to_string()),
            system_prompt: "Be helpful".to_string(),
            model: "mistralai/mistral-7b-instruct".to_string(),
            creator_email: "b@x.com".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn identity() -> Option<Identity> {
        Some(Identity::new("a@x.com").expect("valid email"))
    }

    #[tokio::test]
    async fn test_unknown_flow_shows_select_banner() {
        let mut transport = MockTransport::new();
        transport.expect_get_flow().returning(|id| {
            Err(FlowChatError::Http {
                endpoint: format!("GET /flows/{id}"),
                status: 404,
                body: "{\"detail\":\"Flow not found\"}".to_string(),
            })
        });

        let mut view = ChatView::new(Arc::new(transport), identity());
        let banner = view.select_flow("missing").await.expect_err("not found");
        assert_eq!(banner.text, "Failed to select flow");
        assert_eq!(banner.kind, ErrorKind::NotFound);
        assert_eq!(view.transcript().state(), ViewState::NoFlowSelected);
    }

    #[tokio::test]
    async fn test_send_failure_banner_then_recovery_clears_it() {
        let mut transport = MockTransport::new();
        transport.expect_get_flow().returning(|id| Ok(flow(id)));
        transport
            .expect_list_threads()
            .returning(|_, _| Ok(Vec::<ThreadInfo>::new()));
        transport.expect_send_chat().times(1).returning(|_| {
            Err(FlowChatError::Http {
                endpoint: "POST /chat/".to_string(),
                status: 500,
                body: String::new(),
            })
        });
        transport
            .expect_get_session()
            .returning(|id| {
                Ok(ChatSession {
                    id: id.to_string(),
                    flow_id: "F1".to_string(),
                    user_email: "a@x.com".to_string(),
                    title: "Earlier".to_string(),
                    messages: vec![Message::user("hi"), Message::assistant("hello")],
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
            });

        let mut view = ChatView::new(Arc::new(transport), identity());
        view.select_flow("F1").await.expect("select");
        let banner = view.send("hello").await.expect_err("send fails");
        assert_eq!(banner.text, "Failed to send message");
        assert_eq!(view.transcript().messages().len(), 1);

        view.select_thread("S1").await.expect("thread");
        assert!(view.banner().is_none());
        assert_eq!(view.transcript().title(), "Earlier");
    }

    #[tokio::test]
    async fn test_restore_location_opens_thread() {
        let mut transport = MockTransport::new();
        transport.expect_get_flow().returning(|id| Ok(flow(id)));
        transport.expect_list_threads().returning(|_, _| Ok(Vec::new()));
        transport.expect_get_session().returning(|id| {
            Ok(ChatSession {
                id: id.to_string(),
                flow_id: "F1".to_string(),
                user_email: "a@x.com".to_string(),
                title: "New Chat".to_string(),
                messages: Vec::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
        });
        transport.expect_send_chat().returning(|req| {
            Ok(ChatResponse {
                session_id: req.session_id.clone().unwrap_or_default(),
                response: "ok".to_string(),
                messages: vec![Message::user(req.message.clone()), Message::assistant("ok")],
            })
        });

        let mut view = ChatView::new(Arc::new(transport), identity());
        let location = Location {
            flow: Some("F1".to_string()),
            thread: Some("S7".to_string()),
        };
        view.restore(&location).await.expect("restore");
        assert_eq!(view.location(), location);

        view.send("again").await.expect("send");
        assert_eq!(view.transcript().session_id(), Some("S7"));
        assert_eq!(view.transcript().messages().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_blank_title_is_silent() {
        let mut transport = MockTransport::new();
        transport.expect_update_session_title().times(0);

        let mut view = ChatView::new(Arc::new(transport), identity());
        assert!(!view.rename("S1", "  ").await.expect("no-op"));
        assert!(view.banner().is_none());
    }

    #[tokio::test]
    async fn test_rename_without_flow_shows_banner_and_sends_nothing() {
        let mut transport = MockTransport::new();
        transport.expect_update_session_title().times(0);

        let mut view = ChatView::new(Arc::new(transport), identity());
        let banner = view.rename("S1", "Billing").await.expect_err("no flow");
        assert_eq!(banner.text, "Failed to update thread title");
        assert_eq!(banner.kind, ErrorKind::Validation);
    }
}
