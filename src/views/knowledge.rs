use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};

use crate::error::{FlowChatError, Result};
use crate::identity::Identity;
use crate::models::{
    Citation, DocumentInfo, DocumentUpload, KbChatRequest, KnowledgeBase,
    KnowledgeBaseCreate, KnowledgeBaseUpdate, Role,
};
use crate::poller::{
    DocumentPoller, PollEvent, PollPolicy, PollRegistry, PollReport, SharedKnowledgeBase,
};
use crate::transport::Transport;
use crate::views::Banner;

type ViewResult<T> = std::result::Result<T, Banner>;

/// Shown in place of an answer when retrieval chat fails.
pub const KB_CHAT_APOLOGY: &str = "Sorry, I encountered an error while processing your request.";

fn require_email(identity: Option<&Identity>) -> Result<String> {
    identity
        .map(|i| i.email().to_string())
        .ok_or(FlowChatError::Unauthenticated)
}

fn record<T>(banner: &mut Option<Banner>, text: &str, result: Result<T>) -> ViewResult<T> {
    match result {
        Ok(value) => {
            *banner = None;
            Ok(value)
        }
        Err(e) => {
            let b = Banner::from_error(text, &e);
            *banner = Some(b.clone());
            Err(b)
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Knowledge-base list
// ───────────────────────────────────────────────────────────────────────────────

pub struct KnowledgeBaseListView {
    transport: Arc<dyn Transport>,
    identity: Option<Identity>,
    knowledge_bases: Vec<KnowledgeBase>,
    banner: Option<Banner>,
}

impl KnowledgeBaseListView {
    pub fn new(transport: Arc<dyn Transport>, identity: Option<Identity>) -> Self {
        Self {
            transport,
            identity,
            knowledge_bases: Vec::new(),
            banner: None,
        }
    }

    pub fn knowledge_bases(&self) -> &[KnowledgeBase] {
        &self.knowledge_bases
    }

    pub fn banner(&self) -> Option<&Banner> {
        self.banner.as_ref()
    }

    pub async fn load(&mut self) -> ViewResult<()> {
        let result = match require_email(self.identity.as_ref()) {
            Ok(email) => self.transport.list_knowledge_bases(&email).await,
            Err(e) => Err(e),
        };
        self.knowledge_bases = record(&mut self.banner, "Failed to fetch knowledge bases", result)?;
        Ok(())
    }

    /// Creates a knowledge base and lists it first.
    pub async fn create(
        &mut self,
        name: &str,
        description: Option<&str>,
    ) -> ViewResult<KnowledgeBase> {
        let name = name.trim();
        let result = if name.is_empty() {
            Err(FlowChatError::Validation(
                "Knowledge base name is required".to_string(),
            ))
        } else {
            let request = KnowledgeBaseCreate {
                name: name.to_string(),
                description: description
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string),
            };
            match require_email(self.identity.as_ref()) {
                Ok(email) => self.transport.create_knowledge_base(&email, &request).await,
                Err(e) => Err(e),
            }
        };
        let kb = record(&mut self.banner, "Failed to create knowledge base", result)?;
        tracing::info!("Created knowledge base {} ({})", kb.name, kb.id);
        self.knowledge_bases.insert(0, kb.clone());
        Ok(kb)
    }

    pub async fn update(
        &mut self,
        kb_id: &str,
        update: KnowledgeBaseUpdate,
    ) -> ViewResult<KnowledgeBase> {
        let result = if update.name.is_none() && update.description.is_none() {
            Err(FlowChatError::Validation("Nothing to update".to_string()))
        } else {
            self.transport.update_knowledge_base(kb_id, &update).await
        };
        let kb = record(&mut self.banner, "Failed to update knowledge base", result)?;
        if let Some(slot) = self.knowledge_bases.iter_mut().find(|k| k.id == kb.id) {
            *slot = kb.clone();
        }
        Ok(kb)
    }

    pub async fn delete(&mut self, kb_id: &str) -> ViewResult<()> {
        let result = self.transport.delete_knowledge_base(kb_id).await;
        record(&mut self.banner, "Failed to delete knowledge base", result)?;
        self.knowledge_bases.retain(|k| k.id != kb_id);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Single knowledge base
// ───────────────────────────────────────────────────────────────────────────────

/// One retrieval-chat entry. Citations only accompany assistant answers.
#[derive(Debug, Clone, PartialEq)]
pub struct KbTurn {
    pub role: Role,
    pub content: String,
    pub citations: Vec<Citation>,
}

/// Document list, uploads and retrieval chat for one knowledge base.
/// Its polls live in the owned [`PollRegistry`] and stop when the view is
/// dropped.
pub struct KnowledgeBaseView {
    transport: Arc<dyn Transport>,
    identity: Option<Identity>,
    kb: Option<SharedKnowledgeBase>,
    registry: PollRegistry,
    turns: Vec<KbTurn>,
    session_id: Option<String>,
    banner: Option<Banner>,
}

impl KnowledgeBaseView {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: Option<Identity>,
        policy: PollPolicy,
        events: Option<mpsc::UnboundedSender<PollEvent>>,
    ) -> Self {
        let poller = Arc::new(DocumentPoller::new(transport.clone(), policy));
        let mut registry = PollRegistry::new(poller);
        if let Some(events) = events {
            registry = registry.with_events(events);
        }
        Self {
            transport,
            identity,
            kb: None,
            registry,
            turns: Vec::new(),
            session_id: None,
            banner: None,
        }
    }

    pub fn banner(&self) -> Option<&Banner> {
        self.banner.as_ref()
    }

    pub fn turns(&self) -> &[KbTurn] {
        &self.turns
    }

    pub fn registry(&self) -> &PollRegistry {
        &self.registry
    }

    /// Copy of the knowledge base as the polls have left it.
    pub async fn snapshot(&self) -> Option<KnowledgeBase> {
        match &self.kb {
            Some(kb) => Some(kb.read().await.clone()),
            None => None,
        }
    }

    /// Loads the knowledge base and starts a poll for every document still
    /// being processed. Returns how many polls were started.
    pub async fn load(&mut self, kb_id: &str) -> ViewResult<usize> {
        let result = match require_email(self.identity.as_ref()) {
            Ok(_) => self.transport.get_knowledge_base(kb_id).await,
            Err(e) => Err(e),
        };
        let kb = record(&mut self.banner, "Failed to fetch knowledge base", result)?;

        self.registry.cancel_all();
        self.turns.clear();
        self.session_id = None;

        let processing: Vec<String> = kb
            .processing_documents()
            .map(|d| d.doc_id.clone())
            .collect();
        let kb_id = kb.id.clone();
        let shared: SharedKnowledgeBase = Arc::new(RwLock::new(kb));
        self.kb = Some(shared.clone());

        let mut started = 0;
        for doc_id in &processing {
            if self.registry.start(&kb_id, doc_id, shared.clone()) {
                started += 1;
            }
        }
        tracing::debug!(kb_id = %kb_id, started, "knowledge base loaded");
        Ok(started)
    }

    fn loaded(&self) -> Result<SharedKnowledgeBase> {
        self.kb
            .clone()
            .ok_or_else(|| FlowChatError::Validation("No knowledge base loaded".to_string()))
    }

    async fn push_upload(&self, upload: DocumentUpload) -> Result<(String, DocumentInfo)> {
        require_email(self.identity.as_ref())?;
        let shared = self.loaded()?;
        let kb_id = shared.read().await.id.clone();
        let doc = self.transport.upload_document(&kb_id, upload).await?;
        shared.write().await.documents.push(doc.clone());
        Ok((kb_id, doc))
    }

    /// Uploads a file, lists it and polls it until indexing settles.
    pub async fn upload(&mut self, upload: DocumentUpload) -> ViewResult<DocumentInfo> {
        let file_name = upload.file_name.clone();
        let result = self.push_upload(upload).await;
        let (kb_id, doc) = record(&mut self.banner, "Failed to upload document", result)?;
        tracing::info!(kb_id = %kb_id, doc_id = %doc.doc_id, "uploaded {}", file_name);

        if let Some(shared) = &self.kb {
            self.registry.start(&kb_id, &doc.doc_id, shared.clone());
        }
        Ok(doc)
    }

    /// Asks the knowledge base a question. The question is listed before the
    /// request goes out; a failed request is answered with an apology rather
    /// than a banner.
    pub async fn ask(&mut self, query: &str) -> ViewResult<KbTurn> {
        let query = query.trim();
        let ready = if query.is_empty() {
            Err(FlowChatError::Validation("Question is empty".to_string()))
        } else {
            require_email(self.identity.as_ref())
                .and_then(|email| self.loaded().map(|kb| (email, kb)))
        };
        let (email, shared) = record(&mut self.banner, "Failed to get response", ready)?;
        let kb_id = shared.read().await.id.clone();

        self.turns.push(KbTurn {
            role: Role::User,
            content: query.to_string(),
            citations: Vec::new(),
        });

        let request = KbChatRequest {
            query: query.to_string(),
            user_email: email,
            session_id: self.session_id.clone(),
        };
        let answer = match self.transport.chat_with_knowledge_base(&kb_id, &request).await {
            Ok(response) => {
                if response.session_id.is_some() {
                    self.session_id = response.session_id;
                }
                KbTurn {
                    role: Role::Assistant,
                    content: response.answer,
                    citations: response.citations,
                }
            }
            Err(e) => {
                tracing::error!(kb_id = %kb_id, "Failed to get response: {}", e);
                KbTurn {
                    role: Role::Assistant,
                    content: KB_CHAT_APOLOGY.to_string(),
                    citations: Vec::new(),
                }
            }
        };
        self.turns.push(answer.clone());
        Ok(answer)
    }

    /// Waits for every running poll to finish.
    pub async fn wait_for_polls(&mut self) -> Vec<PollReport> {
        self.registry.join_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentStatus;
    use crate::poller::PollOutcome;
    use crate::transport::MockTransport;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn identity() -> Option<Identity> {
        Some(Identity::new("a@x.com").expect("valid email"))
    }

    fn doc(id: &str, status: DocumentStatus) -> DocumentInfo {
        DocumentInfo {
            doc_id: id.to_string(),
            file_name: format!("{id}.pdf"),
            file_type: "application/pdf".to_string(),
            status,
            upload_time: Utc::now(),
            size_bytes: 2048,
        }
    }

    fn kb(id: &str, documents: Vec<DocumentInfo>) -> KnowledgeBase {
        KnowledgeBase {
            id: id.to_string(),
            name: format!("KB {id}"),
            description: None,
            user_email: "a@x.com".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            documents,
        }
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(3),
            max_attempts: 20,
            max_consecutive_errors: None,
        }
    }

    #[tokio::test]
    async fn test_create_lists_newest_first() {
        let mut transport = MockTransport::new();
        transport
            .expect_list_knowledge_bases()
            .withf(|email: &str| email == "a@x.com")
            .returning(|_| Ok(vec![kb("K1", Vec::new())]));
        transport
            .expect_create_knowledge_base()
            .withf(|email: &str, req: &KnowledgeBaseCreate| {
                email == "a@x.com" && req.name == "Manuals" && req.description.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(kb("K2", Vec::new())));

        let mut view = KnowledgeBaseListView::new(Arc::new(transport), identity());
        view.load().await.expect("load");
        view.create("  Manuals ", Some(" ")).await.expect("create");
        let ids: Vec<_> = view.knowledge_bases().iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec!["K2", "K1"]);
    }

    #[tokio::test]
    async fn test_blank_name_is_rejected_locally() {
        let mut transport = MockTransport::new();
        transport.expect_create_knowledge_base().times(0);

        let mut view = KnowledgeBaseListView::new(Arc::new(transport), identity());
        let banner = view.create("   ", None).await.expect_err("blank");
        assert_eq!(banner.text, "Failed to create knowledge base");
        assert!(view.knowledge_bases().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_locally() {
        let mut transport = MockTransport::new();
        transport
            .expect_list_knowledge_bases()
            .returning(|_| Ok(vec![kb("K1", Vec::new()), kb("K2", Vec::new())]));
        transport
            .expect_delete_knowledge_base()
            .withf(|id: &str| id == "K1")
            .returning(|_| Ok(()));

        let mut view = KnowledgeBaseListView::new(Arc::new(transport), identity());
        view.load().await.expect("load");
        view.delete("K1").await.expect("delete");
        assert_eq!(view.knowledge_bases().len(), 1);
        assert_eq!(view.knowledge_bases()[0].id, "K2");
    }

    #[tokio::test]
    async fn test_list_without_identity_needs_login() {
        let mut transport = MockTransport::new();
        transport.expect_list_knowledge_bases().times(0);

        let mut view = KnowledgeBaseListView::new(Arc::new(transport), None);
        assert!(view.load().await.expect_err("anonymous").needs_login());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_polls_until_ready_with_one_terminal_update() {
        let fetches = Arc::new(AtomicU32::new(0));
        let counter = fetches.clone();
        let mut transport = MockTransport::new();
        transport
            .expect_get_knowledge_base()
            .returning(|id| Ok(kb(id, vec![doc("D0", DocumentStatus::Ready)])));
        transport
            .expect_upload_document()
            .withf(|kb_id: &str, upload: &DocumentUpload| {
                kb_id == "K1" && upload.file_name == "guide.pdf"
            })
            .times(1)
            .returning(|_, _| Ok(doc("D1", DocumentStatus::Processing)));
        transport
            .expect_document_status()
            .returning(move |_, doc_id| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let status = if n < 2 {
                    DocumentStatus::Processing
                } else {
                    DocumentStatus::Ready
                };
                Ok(doc(doc_id, status))
            });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut view =
            KnowledgeBaseView::new(Arc::new(transport), identity(), fast_policy(), Some(tx));
        assert_eq!(view.load("K1").await.expect("load"), 0);

        let uploaded = view
            .upload(DocumentUpload::new("guide.pdf", b"%PDF-1.4".to_vec()))
            .await
            .expect("upload");
        assert_eq!(uploaded.status, DocumentStatus::Processing);
        assert!(view.registry().is_polling("K1", "D1"));

        let reports = view.wait_for_polls().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, PollOutcome::Terminal(DocumentStatus::Ready));
        assert_eq!(fetches.load(Ordering::SeqCst), 3);

        let snapshot = view.snapshot().await.expect("loaded");
        let ids: Vec<_> = snapshot.documents.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["D0", "D1"]);
        assert_eq!(
            snapshot.document("D1").map(|d| d.status),
            Some(DocumentStatus::Ready)
        );

        let mut terminal_updates = 0;
        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                PollEvent::Observed { doc, .. } if doc.status.is_terminal() => terminal_updates += 1,
                PollEvent::Finished { .. } => finished += 1,
                _ => {}
            }
        }
        assert_eq!(terminal_updates, 1);
        assert_eq!(finished, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_polls_processing_documents_and_drop_cancels() {
        let fetches = Arc::new(AtomicU32::new(0));
        let counter = fetches.clone();
        let mut transport = MockTransport::new();
        transport.expect_get_knowledge_base().returning(|id| {
            Ok(kb(
                id,
                vec![
                    doc("D1", DocumentStatus::Processing),
                    doc("D2", DocumentStatus::Ready),
                    doc("D3", DocumentStatus::Processing),
                ],
            ))
        });
        transport
            .expect_document_status()
            .returning(move |_, doc_id| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(doc(doc_id, DocumentStatus::Processing))
            });

        let mut view = KnowledgeBaseView::new(Arc::new(transport), identity(), fast_policy(), None);
        assert_eq!(view.load("K1").await.expect("load"), 2);
        assert_eq!(view.registry().active(), 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let seen = fetches.load(Ordering::SeqCst);
        assert!(seen >= 2);

        drop(view);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_ask_with_citations_then_apology() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut transport = MockTransport::new();
        transport
            .expect_get_knowledge_base()
            .returning(|id| Ok(kb(id, Vec::new())));
        transport
            .expect_chat_with_knowledge_base()
            .withf(|kb_id: &str, req: &KbChatRequest| {
                kb_id == "K1" && req.user_email == "a@x.com"
            })
            .returning(move |_, req| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    assert_eq!(req.session_id, None);
                    Ok(crate::models::KbChatResponse {
                        answer: "Press the reset button.".to_string(),
                        citations: vec![Citation {
                            doc_id: "D1".to_string(),
                            text: "Hold reset for five seconds".to_string(),
                            score: 0.91,
                            file_name: "guide.pdf".to_string(),
                            page_number: Some(4),
                        }],
                        session_id: Some("KS1".to_string()),
                    })
                } else {
                    assert_eq!(req.session_id.as_deref(), Some("KS1"));
                    Err(FlowChatError::Http {
                        endpoint: "POST /knowledge-bases/K1/chat".to_string(),
                        status: 502,
                        body: String::new(),
                    })
                }
            });

        let mut view = KnowledgeBaseView::new(Arc::new(transport), identity(), fast_policy(), None);
        view.load("K1").await.expect("load");

        let answer = view.ask(" How do I reset? ").await.expect("answer");
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(view.turns()[0].content, "How do I reset?");
        assert_eq!(view.turns()[0].role, Role::User);

        let apology = view.ask("And then?").await.expect("apology");
        assert_eq!(apology.content, KB_CHAT_APOLOGY);
        assert!(apology.citations.is_empty());
        assert_eq!(view.turns().len(), 4);
        assert!(view.banner().is_none());
    }

    #[tokio::test]
    async fn test_ask_blank_sends_nothing() {
        let mut transport = MockTransport::new();
        transport.expect_chat_with_knowledge_base().times(0);

        let mut view = KnowledgeBaseView::new(Arc::new(transport), identity(), fast_policy(), None);
        assert!(view.ask("  ").await.is_err());
        assert!(view.turns().is_empty());
    }
}
