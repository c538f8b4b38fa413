//! Chat transcript state for one flow.
//!
//! A send is split in two: [`TranscriptManager::begin_send`] appends the
//! user's message locally and hands back the request, and
//! [`TranscriptManager::complete_send`] folds the server's answer in. The
//! server's message list always wins over the local copy.

use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorKind, FlowChatError, Result};
use crate::identity::Identity;
use crate::models::{ChatRequest, ChatResponse, Flow, Message, ThreadInfo, default_thread_title};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    NoFlowSelected,
    FlowSelected { flow_id: String },
    ThreadActive { flow_id: String, thread_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendState {
    Idle,
    /// The optimistic message is shown, the request is in flight.
    Pending(Message),
    Committed,
    Failed { kind: ErrorKind, message: String },
}

/// Flow and thread ids that reproduce the current view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub flow: Option<String>,
    pub thread: Option<String>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(flow) = &self.flow {
            parts.push(format!("flow={flow}"));
        }
        if let Some(thread) = &self.thread {
            parts.push(format!("thread={thread}"));
        }
        f.write_str(&parts.join("&"))
    }
}

/// A send that has been shown locally but not yet answered.
#[derive(Debug)]
pub struct PendingSend {
    request: ChatRequest,
}

impl PendingSend {
    pub fn request(&self) -> &ChatRequest {
        &self.request
    }
}

pub struct TranscriptManager {
    transport: Arc<dyn Transport>,
    identity: Option<Identity>,
    flow: Option<Flow>,
    session_id: Option<String>,
    title: String,
    messages: Vec<Message>,
    threads: Vec<ThreadInfo>,
    send_state: SendState,
}

impl TranscriptManager {
    pub fn new(transport: Arc<dyn Transport>, identity: Option<Identity>) -> Self {
        Self {
            transport,
            identity,
            flow: None,
            session_id: None,
            title: String::new(),
            messages: Vec::new(),
            threads: Vec::new(),
            send_state: SendState::Idle,
        }
    }

    pub fn state(&self) -> ViewState {
        match (&self.flow, &self.session_id) {
            (None, _) => ViewState::NoFlowSelected,
            (Some(flow), None) => ViewState::FlowSelected {
                flow_id: flow.id.clone(),
            },
            (Some(flow), Some(thread_id)) => ViewState::ThreadActive {
                flow_id: flow.id.clone(),
                thread_id: thread_id.clone(),
            },
        }
    }

    pub fn location(&self) -> Location {
        Location {
            flow: self.flow.as_ref().map(|f| f.id.clone()),
            thread: self.session_id.clone(),
        }
    }

    pub fn flow(&self) -> Option<&Flow> {
        self.flow.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn threads(&self) -> &[ThreadInfo] {
        &self.threads
    }

    pub fn send_state(&self) -> &SendState {
        &self.send_state
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.send_state, SendState::Pending(_))
    }

    fn identity(&self) -> Result<&Identity> {
        self.identity.as_ref().ok_or(FlowChatError::Unauthenticated)
    }

    fn selected_flow_id(&self) -> Result<String> {
        self.flow
            .as_ref()
            .map(|f| f.id.clone())
            .ok_or_else(|| FlowChatError::Validation("No flow selected".to_string()))
    }

    /// Navigation is refused while a send is in flight so its answer lands in
    /// the thread it was sent to.
    fn ensure_idle(&self) -> Result<()> {
        if self.is_sending() {
            return Err(FlowChatError::Validation(
                "A message is being sent".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the view still shows the flow and thread `request` was sent from.
    fn is_current(&self, request: &ChatRequest) -> bool {
        self.flow.as_ref().map(|f| f.id.as_str()) == Some(request.flow_id.as_str())
            && self.session_id == request.session_id
    }

    fn reset_thread(&mut self) {
        self.session_id = None;
        self.title.clear();
        self.messages.clear();
        self.send_state = SendState::Idle;
    }

    /// Switches to `flow_id`, dropping any open thread, and loads its threads.
    pub async fn select_flow(&mut self, flow_id: &str) -> Result<()> {
        self.identity()?;
        self.ensure_idle()?;
        let flow = self.transport.get_flow(flow_id).await?;
        tracing::debug!("Selected flow {} ({})", flow.name, flow.id);
        self.flow = Some(flow);
        self.reset_thread();
        self.threads.clear();
        self.refresh_threads().await
    }

    pub fn clear_flow(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.flow = None;
        self.threads.clear();
        self.reset_thread();
        Ok(())
    }

    pub async fn refresh_threads(&mut self) -> Result<()> {
        let email = self.identity()?.email().to_string();
        let flow_id = self.selected_flow_id()?;
        self.threads = self.transport.list_threads(&email, &flow_id).await?;
        Ok(())
    }

    /// Opens an existing thread of the selected flow.
    pub async fn select_thread(&mut self, thread_id: &str) -> Result<()> {
        self.identity()?;
        self.selected_flow_id()?;
        self.ensure_idle()?;
        let session = self.transport.get_session(thread_id).await?;
        self.session_id = Some(thread_id.to_string());
        self.title = session.title;
        self.messages = session.messages;
        self.send_state = SendState::Idle;
        Ok(())
    }

    /// Starts an empty thread; the server assigns its id on the first send.
    pub fn new_chat(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.reset_thread();
        self.title = default_thread_title();
        Ok(())
    }

    /// Leaves the open thread for the flow's thread list.
    pub fn back(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.reset_thread();
        Ok(())
    }

    /// Re-derives the view from a flow id and an optional thread id.
    pub async fn restore(&mut self, flow_id: &str, thread_id: Option<&str>) -> Result<()> {
        self.select_flow(flow_id).await?;
        if let Some(thread_id) = thread_id {
            self.select_thread(thread_id).await?;
        }
        Ok(())
    }

    /// Validates the input and shows it immediately as a user message.
    pub fn begin_send(&mut self, input: &str) -> Result<PendingSend> {
        let content = input.trim();
        if content.is_empty() {
            return Err(FlowChatError::Validation("Message is empty".to_string()));
        }
        let email = self.identity()?.email().to_string();
        let flow_id = self.selected_flow_id()?;
        if self.is_sending() {
            return Err(FlowChatError::Validation(
                "A message is already being sent".to_string(),
            ));
        }

        let local = Message::user(content);
        self.messages.push(local.clone());
        self.send_state = SendState::Pending(local);

        Ok(PendingSend {
            request: ChatRequest::new(flow_id, email, content, self.session_id.clone()),
        })
    }

    /// Applies the outcome of a send started with [`Self::begin_send`].
    ///
    /// On success the transcript becomes the server's list. A first message
    /// also adopts the new session id, reloads the thread list and picks up
    /// the title the server chose. Failures of those follow-up reads are
    /// logged and leave the committed transcript in place. On failure the
    /// optimistic message stays visible.
    ///
    /// An answer for a flow or thread that is no longer open is dropped and
    /// the transcript on screen is left alone.
    pub async fn complete_send(
        &mut self,
        pending: PendingSend,
        result: Result<ChatResponse>,
    ) -> Result<()> {
        if !self.is_current(&pending.request) {
            tracing::warn!(
                "Dropping send result for flow {} thread {:?}; view has moved on",
                pending.request.flow_id,
                pending.request.session_id
            );
            if self.is_sending() {
                self.send_state = SendState::Idle;
            }
            return result.map(|_| ());
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.send_state = SendState::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                };
                return Err(e);
            }
        };

        self.messages = response.messages;
        self.send_state = SendState::Committed;

        if pending.request.new_thread {
            tracing::info!("Started thread {}", response.session_id);
            self.session_id = Some(response.session_id.clone());
            if let Err(e) = self.refresh_threads().await {
                tracing::warn!("Failed to reload threads after send: {}", e);
            }
            match self.transport.get_session(&response.session_id).await {
                Ok(session) => self.title = session.title,
                Err(e) => tracing::warn!("Failed to load title of {}: {}", response.session_id, e),
            }
        }
        Ok(())
    }

    pub async fn send(&mut self, input: &str) -> Result<()> {
        let pending = self.begin_send(input)?;
        let result = self.transport.send_chat(pending.request()).await;
        self.complete_send(pending, result).await
    }

    /// Renames the open thread. Returns `false` without a request when the
    /// title is blank or no thread is open.
    pub async fn rename(&mut self, title: &str) -> Result<bool> {
        match self.session_id.clone() {
            Some(thread_id) => self.rename_thread(&thread_id, title).await,
            None => Ok(false),
        }
    }

    pub async fn rename_thread(&mut self, thread_id: &str, title: &str) -> Result<bool> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(false);
        }
        self.identity()?;
        self.selected_flow_id()?;
        self.transport.update_session_title(thread_id, title).await?;
        if self.session_id.as_deref() == Some(thread_id) {
            self.title = title.to_string();
        }
        self.refresh_threads().await?;
        Ok(true)
    }

    pub async fn delete_thread(&mut self, thread_id: &str) -> Result<()> {
        self.identity()?;
        self.selected_flow_id()?;
        self.ensure_idle()?;
        self.transport.delete_session(thread_id).await?;
        if self.session_id.as_deref() == Some(thread_id) {
            tracing::debug!("Deleted the open thread {}", thread_id);
            self.reset_thread();
        }
        self.refresh_threads().await
    }
}
