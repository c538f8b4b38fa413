pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod poller;
pub mod transcript;
pub mod transport;
pub mod views;
pub mod visual;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Result;
use crate::identity::{Auth, FileIdentityStore, Identity, IdentityStore};
use crate::poller::{PollEvent, PollPolicy};
use crate::transport::{HttpTransport, Transport};
use crate::views::{ChatView, FlowsView, KnowledgeBaseListView, KnowledgeBaseView};

/// Entry point wiring configuration, the HTTP transport and the signed-in
/// identity into the screen controllers.
pub struct FlowChat {
    config: Config,
    transport: Arc<dyn Transport>,
    auth: Auth,
}

impl FlowChat {
    pub fn new(config: Config) -> Result<Self> {
        let transport = Arc::new(HttpTransport::from_config(&config)?);
        let store = Arc::new(FileIdentityStore::new(config.identity.path.clone()));
        Self::with_parts(config, transport, store)
    }

    pub fn with_parts(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdentityStore>,
    ) -> Result<Self> {
        let auth = Auth::new(store)?;
        Ok(Self {
            config,
            transport,
            auth,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.auth.current()
    }

    pub async fn login(&mut self, email: &str) -> Result<Identity> {
        self.auth.login(self.transport.as_ref(), email).await
    }

    pub fn logout(&mut self) -> Result<()> {
        self.auth.logout()
    }

    pub fn flows_view(&self) -> FlowsView {
        FlowsView::new(self.transport.clone(), self.auth.current().cloned())
    }

    pub fn chat_view(&self) -> ChatView {
        ChatView::new(self.transport.clone(), self.auth.current().cloned())
    }

    pub fn knowledge_bases_view(&self) -> KnowledgeBaseListView {
        KnowledgeBaseListView::new(self.transport.clone(), self.auth.current().cloned())
    }

    pub fn knowledge_base_view(
        &self,
        events: Option<mpsc::UnboundedSender<PollEvent>>,
    ) -> KnowledgeBaseView {
        KnowledgeBaseView::new(
            self.transport.clone(),
            self.auth.current().cloned(),
            PollPolicy::from(&self.config.poller),
            events,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;
    use crate::models::{Flow, User};
    use crate::transport::MockTransport;
    use chrono::Utc;

    #[tokio::test]
    async fn test_views_carry_identity_after_login() {
        let mut transport = MockTransport::new();
        transport.expect_create_user().returning(|email| {
            Ok(User {
                email: email.to_string(),
                created_at: Utc::now(),
                last_login: Some(Utc::now()),
            })
        });
        transport
            .expect_list_flows()
            .withf(|creator: &Option<String>| creator.as_deref() == Some("a@x.com"))
            .times(1)
            .returning(|creator| {
                Ok(vec![Flow {
                    id: "F1".to_string(),
                    name: "Support".to_string(),
                    description: None,
                    system_prompt: "Be helpful".to_string(),
                    model: "openai/gpt-3.5-turbo".to_string(),
                    creator_email: creator.unwrap_or_default(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                }])
            });

        let mut app = FlowChat::with_parts(
            Config::default(),
            Arc::new(transport),
            Arc::new(MemoryIdentityStore::default()),
        )
        .expect("app");

        let mut anonymous = app.flows_view();
        assert!(anonymous.load_own().await.expect_err("anonymous").needs_login());

        app.login("a@x.com").await.expect("login");
        assert_eq!(app.identity().map(|i| i.email()), Some("a@x.com"));

        let mut flows = app.flows_view();
        flows.load_own().await.expect("load");
        assert_eq!(flows.flows()[0].creator_email, "a@x.com");

        app.logout().expect("logout");
        assert!(app.identity().is_none());
    }
}
