use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, PercentEncode, utf8_percent_encode};
use reqwest::{Client, RequestBuilder, Response, multipart};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::config::Config;
use crate::error::{FlowChatError, Result};
use crate::models::{
    ChatRequest, ChatResponse, ChatSession, DocumentInfo, DocumentUpload, Flow, FlowCreate,
    FlowUpdate, KbChatRequest, KbChatResponse, KnowledgeBase, KnowledgeBaseCreate,
    KnowledgeBaseUpdate, ThreadInfo, User, UserCreate,
};

#[cfg(test)]
use mockall::automock;

const API_PREFIX: &str = "/api/v1";
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Everything outside the RFC 3986 unreserved set is escaped in path segments.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn segment(raw: &str) -> PercentEncode<'_> {
    utf8_percent_encode(raw, PATH_SEGMENT)
}

/// Typed binding to the flow service. Every call is a single request; a
/// non-2xx answer is an error and nothing is retried.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_user(&self, email: &str) -> Result<User>;
    async fn get_user(&self, email: &str) -> Result<User>;

    async fn create_flow(&self, flow: &FlowCreate) -> Result<Flow>;
    async fn get_flow(&self, flow_id: &str) -> Result<Flow>;
    async fn list_flows(&self, creator_email: Option<String>) -> Result<Vec<Flow>>;
    async fn update_flow(&self, flow_id: &str, update: &FlowUpdate) -> Result<Flow>;
    async fn delete_flow(&self, flow_id: &str) -> Result<()>;

    async fn send_chat(&self, req: &ChatRequest) -> Result<ChatResponse>;
    async fn get_session(&self, session_id: &str) -> Result<ChatSession>;
    async fn update_session_title(&self, session_id: &str, title: &str) -> Result<()>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;
    async fn list_threads(&self, user_email: &str, flow_id: &str) -> Result<Vec<ThreadInfo>>;

    async fn create_knowledge_base(
        &self,
        user_email: &str,
        kb: &KnowledgeBaseCreate,
    ) -> Result<KnowledgeBase>;
    async fn list_knowledge_bases(&self, user_email: &str) -> Result<Vec<KnowledgeBase>>;
    async fn get_knowledge_base(&self, kb_id: &str) -> Result<KnowledgeBase>;
    async fn update_knowledge_base(
        &self,
        kb_id: &str,
        update: &KnowledgeBaseUpdate,
    ) -> Result<KnowledgeBase>;
    async fn delete_knowledge_base(&self, kb_id: &str) -> Result<()>;
    async fn upload_document(&self, kb_id: &str, upload: DocumentUpload) -> Result<DocumentInfo>;
    async fn document_status(&self, kb_id: &str, doc_id: &str) -> Result<DocumentInfo>;
    async fn chat_with_knowledge_base(
        &self,
        kb_id: &str,
        req: &KbChatRequest,
    ) -> Result<KbChatResponse>;
}

pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FlowChatError::Config(format!("Failed to build HTTP client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        tracing::debug!("HTTP transport targeting {}", base_url);
        Ok(Self { client, base_url })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(cfg.api_base_url(), cfg.request_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn dispatch(&self, endpoint: &str, request: RequestBuilder) -> Result<Response> {
        tracing::debug!(endpoint, "sending request");
        let response = request
            .send()
            .await
            .map_err(|source| FlowChatError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string())
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        tracing::warn!(endpoint, status = status.as_u16(), "request rejected");
        Err(FlowChatError::Http {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: String,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.dispatch(&endpoint, request).await?;
        response.json::<T>().await.map_err(|e| FlowChatError::Decode {
            endpoint,
            message: e.to_string(),
        })
    }

    async fn execute(&self, endpoint: String, request: RequestBuilder) -> Result<()> {
        self.dispatch(&endpoint, request).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_user(&self, email: &str) -> Result<User> {
        let body = UserCreate {
            email: email.to_string(),
        };
        let req = self.client.post(self.url("/users/")).json(&body);
        self.fetch("POST /users/".into(), req).await
    }

    async fn get_user(&self, email: &str) -> Result<User> {
        let path = format!("/users/{}", segment(email));
        let req = self.client.get(self.url(&path));
        self.fetch(format!("GET {path}"), req).await
    }

    async fn create_flow(&self, flow: &FlowCreate) -> Result<Flow> {
        let req = self.client.post(self.url("/flows/")).json(flow);
        self.fetch("POST /flows/".into(), req).await
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Flow> {
        let path = format!("/flows/{}", segment(flow_id));
        let req = self.client.get(self.url(&path));
        self.fetch(format!("GET {path}"), req).await
    }

    async fn list_flows(&self, creator_email: Option<String>) -> Result<Vec<Flow>> {
        let mut req = self.client.get(self.url("/flows/"));
        if let Some(email) = creator_email {
            req = req.query(&[("creator_email", email)]);
        }
        self.fetch("GET /flows/".into(), req).await
    }

    async fn update_flow(&self, flow_id: &str, update: &FlowUpdate) -> Result<Flow> {
        let path = format!("/flows/{}", segment(flow_id));
        let req = self.client.put(self.url(&path)).json(update);
        self.fetch(format!("PUT {path}"), req).await
    }

    async fn delete_flow(&self, flow_id: &str) -> Result<()> {
        let path = format!("/flows/{}", segment(flow_id));
        let req = self.client.delete(self.url(&path));
        self.execute(format!("DELETE {path}"), req).await
    }

    async fn send_chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let request = self.client.post(self.url("/chat/")).json(req);
        self.fetch("POST /chat/".into(), request).await
    }

    async fn get_session(&self, session_id: &str) -> Result<ChatSession> {
        let path = format!("/chat/session/{}", segment(session_id));
        let req = self.client.get(self.url(&path));
        self.fetch(format!("GET {path}"), req).await
    }

    async fn update_session_title(&self, session_id: &str, title: &str) -> Result<()> {
        let path = format!("/chat/session/{}/title", segment(session_id));
        let req = self
            .client
            .put(self.url(&path))
            .query(&[("title", title)]);
        self.execute(format!("PUT {path}"), req).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let path = format!("/chat/session/{}", segment(session_id));
        let req = self.client.delete(self.url(&path));
        self.execute(format!("DELETE {path}"), req).await
    }

    async fn list_threads(&self, user_email: &str, flow_id: &str) -> Result<Vec<ThreadInfo>> {
        let req = self
            .client
            .get(self.url("/chat/threads"))
            .query(&[("user_email", user_email), ("flow_id", flow_id)]);
        self.fetch("GET /chat/threads".into(), req).await
    }

    async fn create_knowledge_base(
        &self,
        user_email: &str,
        kb: &KnowledgeBaseCreate,
    ) -> Result<KnowledgeBase> {
        let req = self
            .client
            .post(self.url("/knowledge-bases"))
            .query(&[("user_email", user_email)])
            .json(kb);
        self.fetch("POST /knowledge-bases".into(), req).await
    }

    async fn list_knowledge_bases(&self, user_email: &str) -> Result<Vec<KnowledgeBase>> {
        let req = self
            .client
            .get(self.url("/knowledge-bases"))
            .query(&[("user_email", user_email)]);
        self.fetch("GET /knowledge-bases".into(), req).await
    }

    async fn get_knowledge_base(&self, kb_id: &str) -> Result<KnowledgeBase> {
        let path = format!("/knowledge-bases/{}", segment(kb_id));
        let req = self.client.get(self.url(&path));
        self.fetch(format!("GET {path}"), req).await
    }

    async fn update_knowledge_base(
        &self,
        kb_id: &str,
        update: &KnowledgeBaseUpdate,
    ) -> Result<KnowledgeBase> {
        let path = format!("/knowledge-bases/{}", segment(kb_id));
        let req = self.client.put(self.url(&path)).json(update);
        self.fetch(format!("PUT {path}"), req).await
    }

    async fn delete_knowledge_base(&self, kb_id: &str) -> Result<()> {
        let path = format!("/knowledge-bases/{}", segment(kb_id));
        let req = self.client.delete(self.url(&path));
        self.execute(format!("DELETE {path}"), req).await
    }

    async fn upload_document(&self, kb_id: &str, upload: DocumentUpload) -> Result<DocumentInfo> {
        let path = format!("/knowledge-bases/{}/documents", segment(kb_id));
        let size = upload.bytes.len();
        let part = multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime_type)
            .map_err(|e| {
                FlowChatError::Validation(format!(
                    "Invalid MIME type {} for {}: {e}",
                    upload.mime_type, upload.file_name
                ))
            })?;
        let form = multipart::Form::new().part("file", part);

        tracing::info!(kb_id, file = %upload.file_name, size, "uploading document");
        let req = self.client.post(self.url(&path)).multipart(form);
        self.fetch(format!("POST {path}"), req).await
    }

    async fn document_status(&self, kb_id: &str, doc_id: &str) -> Result<DocumentInfo> {
        let path = format!(
            "/knowledge-bases/{}/documents/{}",
            segment(kb_id),
            segment(doc_id)
        );
        let req = self.client.get(self.url(&path));
        self.fetch(format!("GET {path}"), req).await
    }

    async fn chat_with_knowledge_base(
        &self,
        kb_id: &str,
        req: &KbChatRequest,
    ) -> Result<KbChatResponse> {
        let path = format!("/knowledge-bases/{}/chat", segment(kb_id));
        let mut form = multipart::Form::new()
            .text("query", req.query.clone())
            .text("user_email", req.user_email.clone());
        if let Some(session_id) = &req.session_id {
            form = form.text("session_id", session_id.clone());
        }
        let request = self.client.post(self.url(&path)).multipart(form);
        self.fetch(format!("POST {path}"), request).await
    }
}
