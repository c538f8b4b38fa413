use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::{FlowChatError, Result};

/// Accepts RFC 3339 as well as the naive UTC form the backend emits
/// (`2024-05-01T10:00:00.123456`).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
    }
}

pub fn default_thread_title() -> String {
    "New Chat".to_string()
}

// ───────────────────────────────────────────────────────────────────────────────
// Users
// ───────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct User {
    pub email: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Clone)]
pub struct UserCreate {
    pub email: String,
}

// ───────────────────────────────────────────────────────────────────────────────
// Flows
// ───────────────────────────────────────────────────────────────────────────────

/// A named assistant configuration owned by its creator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub system_prompt: String,
    pub model: String,
    pub creator_email: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FlowCreate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub system_prompt: String,
    pub model: String,
    pub creator_email: String,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct FlowUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl FlowUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.system_prompt.is_none()
            && self.model.is_none()
    }
}

/// Model identifiers offered when creating a flow.
pub const AVAILABLE_MODELS: &[(&str, &str)] = &[
    ("openai/gpt-3.5-turbo", "GPT-3.5 Turbo"),
    ("anthropic/claude-3-haiku", "Claude 3 Haiku"),
    ("google/gemma-7b-it", "Gemma 7B"),
    ("mistralai/mistral-7b-instruct", "Mistral 7B"),
];

// ───────────────────────────────────────────────────────────────────────────────
// Chat sessions
// ───────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A user message stamped with the local clock.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatSession {
    #[serde(default)]
    pub id: String,
    pub flow_id: String,
    pub user_email: String,
    #[serde(default = "default_thread_title")]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// Summary projection of a session used by thread lists.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ThreadInfo {
    pub id: String,
    #[serde(default = "default_thread_title")]
    pub title: String,
    pub flow_id: String,
    #[serde(default)]
    pub message_count: u32,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub flow_id: String,
    pub user_email: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub new_thread: bool,
}

impl ChatRequest {
    /// `new_thread` is derived from the absence of a session id.
    pub fn new(
        flow_id: impl Into<String>,
        user_email: impl Into<String>,
        message: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        let new_thread = session_id.is_none();
        Self {
            flow_id: flow_id.into(),
            user_email: user_email.into(),
            message: message.into(),
            session_id,
            new_thread,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    pub messages: Vec<Message>,
}

// ───────────────────────────────────────────────────────────────────────────────
// Knowledge bases
// ───────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Failed,
    #[serde(other)]
    Unknown,
}

impl DocumentStatus {
    /// Anything other than `processing` ends polling.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentStatus::Processing)
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DocumentInfo {
    pub doc_id: String,
    pub file_name: String,
    pub file_type: String,
    pub status: DocumentStatus,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub upload_time: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KnowledgeBase {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub user_email: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub documents: Vec<DocumentInfo>,
}

impl KnowledgeBase {
    /// Swap in a fresh record for the document with the same id, keeping
    /// every other entry and the order. Returns false when no entry matched.
    pub fn replace_document(&mut self, doc: DocumentInfo) -> bool {
        match self.documents.iter_mut().find(|d| d.doc_id == doc.doc_id) {
            Some(slot) => {
                *slot = doc;
                true
            }
            None => false,
        }
    }

    pub fn document(&self, doc_id: &str) -> Option<&DocumentInfo> {
        self.documents.iter().find(|d| d.doc_id == doc_id)
    }

    pub fn processing_documents(&self) -> impl Iterator<Item = &DocumentInfo> {
        self.documents
            .iter()
            .filter(|d| d.status == DocumentStatus::Processing)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct KnowledgeBaseCreate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct KnowledgeBaseUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Retrieval excerpt attached to a knowledge-base answer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Citation {
    #[serde(alias = "document_id")]
    pub doc_id: String,
    pub text: String,
    #[serde(default, alias = "similarity")]
    pub score: f64,
    #[serde(default, alias = "document_name")]
    pub file_name: String,
    #[serde(default, alias = "page")]
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KbChatRequest {
    pub query: String,
    pub user_email: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KbChatResponse {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// A file staged for upload into a knowledge base.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl DocumentUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            file_name,
            mime_type,
            bytes,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                FlowChatError::Validation(format!("Not a file path: {}", path.display()))
            })?
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(file_name, bytes))
    }
}
