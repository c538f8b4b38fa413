//! Document ingestion status tracking.
//!
//! A freshly uploaded document sits in `processing` until the service has
//! indexed it. [`DocumentPoller::run`] refetches its status on a fixed
//! interval, writing every observation into the shared knowledge-base view,
//! until the status turns terminal or the attempt budget runs out.
//! [`PollRegistry`] runs one such loop per document as a cancellable task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::PollerConfig;
use crate::models::{DocumentInfo, DocumentStatus, KnowledgeBase};
use crate::transport::Transport;

/// Knowledge-base view shared between its owner and the poll tasks.
pub type SharedKnowledgeBase = Arc<RwLock<KnowledgeBase>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The document reached a non-`processing` status.
    Terminal(DocumentStatus),
    /// Still `processing` after the last permitted attempt.
    AttemptsExhausted,
    /// Too many consecutive fetch errors.
    Aborted,
    /// Stopped by the owner.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Observed {
        kb_id: String,
        doc: DocumentInfo,
        attempt: u32,
    },
    Finished {
        kb_id: String,
        doc_id: String,
        outcome: PollOutcome,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub kb_id: String,
    pub doc_id: String,
    pub outcome: PollOutcome,
    /// Zero for cancelled polls.
    pub fetches: u32,
}

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub max_consecutive_errors: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollerConfig::default())
    }
}

impl From<&PollerConfig> for PollPolicy {
    fn from(cfg: &PollerConfig) -> Self {
        Self {
            interval: cfg.interval(),
            max_attempts: cfg.max_attempts,
            max_consecutive_errors: cfg.max_consecutive_errors,
        }
    }
}

pub struct DocumentPoller {
    transport: Arc<dyn Transport>,
    policy: PollPolicy,
}

impl DocumentPoller {
    pub fn new(transport: Arc<dyn Transport>, policy: PollPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Poll one document to completion. Attempts are numbered from 0 and the
    /// last one fetched is `max_attempts`, so a document that never leaves
    /// `processing` costs `max_attempts + 1` fetches.
    pub async fn run(
        &self,
        kb_id: &str,
        doc_id: &str,
        view: &SharedKnowledgeBase,
        events: Option<&mpsc::UnboundedSender<PollEvent>>,
    ) -> PollReport {
        let mut attempt: u32 = 0;
        let mut fetches: u32 = 0;
        let mut consecutive_errors: u32 = 0;

        tracing::debug!(kb_id, doc_id, "polling document status");

        let outcome = loop {
            fetches += 1;
            match self.transport.document_status(kb_id, doc_id).await {
                Ok(doc) => {
                    consecutive_errors = 0;
                    let status = doc.status;

                    if !view.write().await.replace_document(doc.clone()) {
                        tracing::debug!(kb_id, doc_id, "document not present in view");
                    }
                    if let Some(tx) = events {
                        let _ = tx.send(PollEvent::Observed {
                            kb_id: kb_id.to_string(),
                            doc,
                            attempt,
                        });
                    }

                    if status.is_terminal() {
                        tracing::info!(kb_id, doc_id, %status, attempt, "document settled");
                        break PollOutcome::Terminal(status);
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(kb_id, doc_id, attempt, "Error polling document status: {}", e);
                    if let Some(max) = self.policy.max_consecutive_errors
                        && consecutive_errors >= max
                    {
                        break PollOutcome::Aborted;
                    }
                }
            }

            attempt += 1;
            if attempt > self.policy.max_attempts {
                tracing::debug!(kb_id, doc_id, "poll budget exhausted");
                break PollOutcome::AttemptsExhausted;
            }
            sleep(self.policy.interval).await;
        };

        PollReport {
            kb_id: kb_id.to_string(),
            doc_id: doc_id.to_string(),
            outcome,
            fetches,
        }
    }
}

struct PollTask {
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<PollReport>,
}

impl PollTask {
    /// Running and not yet told to stop.
    fn is_live(&self) -> bool {
        self.cancel.is_some() && !self.handle.is_finished()
    }
}

/// Live poll tasks keyed by (knowledge-base id, document id). Dropping the
/// registry cancels everything it started.
pub struct PollRegistry {
    poller: Arc<DocumentPoller>,
    events: Option<mpsc::UnboundedSender<PollEvent>>,
    tasks: HashMap<(String, String), PollTask>,
}

impl PollRegistry {
    pub fn new(poller: Arc<DocumentPoller>) -> Self {
        Self {
            poller,
            events: None,
            tasks: HashMap::new(),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PollEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Start polling a document. Returns false when a poll for the same
    /// document is still running; the existing one is left alone.
    pub fn start(&mut self, kb_id: &str, doc_id: &str, view: SharedKnowledgeBase) -> bool {
        let key = (kb_id.to_string(), doc_id.to_string());
        if self
            .tasks
            .get(&key)
            .is_some_and(PollTask::is_live)
        {
            tracing::debug!(kb_id, doc_id, "poll already running");
            return false;
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let poller = Arc::clone(&self.poller);
        let events = self.events.clone();
        let (kb, doc) = key.clone();

        let handle = tokio::spawn(async move {
            let report = tokio::select! {
                report = poller.run(&kb, &doc, &view, events.as_ref()) => report,
                _ = &mut cancel_rx => {
                    tracing::debug!(kb_id = %kb, doc_id = %doc, "poll cancelled");
                    PollReport {
                        kb_id: kb.clone(),
                        doc_id: doc.clone(),
                        outcome: PollOutcome::Cancelled,
                        fetches: 0,
                    }
                }
            };
            if let Some(tx) = &events {
                let _ = tx.send(PollEvent::Finished {
                    kb_id: report.kb_id.clone(),
                    doc_id: report.doc_id.clone(),
                    outcome: report.outcome,
                });
            }
            report
        });

        self.tasks.insert(
            key,
            PollTask {
                cancel: Some(cancel_tx),
                handle,
            },
        );
        true
    }

    pub fn is_polling(&self, kb_id: &str, doc_id: &str) -> bool {
        self.tasks
            .get(&(kb_id.to_string(), doc_id.to_string()))
            .is_some_and(PollTask::is_live)
    }

    pub fn active(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| task.is_live())
            .count()
    }

    pub fn cancel(&mut self, kb_id: &str, doc_id: &str) -> bool {
        match self.tasks.get_mut(&(kb_id.to_string(), doc_id.to_string())) {
            Some(task) => task
                .cancel
                .take()
                .map(|tx| tx.send(()).is_ok())
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for task in self.tasks.values_mut() {
            if let Some(tx) = task.cancel.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Wait for every started poll and hand back their reports.
    pub async fn join_all(&mut self) -> Vec<PollReport> {
        let tasks: Vec<_> = self.tasks.drain().map(|(_, task)| task).collect();
        let mut cancels = Vec::with_capacity(tasks.len());
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            cancels.push(task.cancel);
            handles.push(task.handle);
        }

        let results = futures::future::join_all(handles).await;
        drop(cancels);
        results
            .into_iter()
            .filter_map(|res| match res {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!("poll task failed: {}", e);
                    None
                }
            })
            .collect()
    }
}

impl Drop for PollRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
