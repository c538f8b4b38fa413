use std::sync::Arc;

use crate::error::{FlowChatError, Result};
use crate::identity::Identity;
use crate::models::{AVAILABLE_MODELS, Flow, FlowCreate, FlowUpdate};
use crate::transport::Transport;
use crate::views::Banner;

/// Form input for a new flow. The creator is filled in from the identity.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDraft {
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    pub model: String,
}

impl FlowDraft {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            system_prompt: system_prompt.into(),
            model: AVAILABLE_MODELS[0].0.to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("name", &self.name),
            ("system prompt", &self.system_prompt),
            ("model", &self.model),
        ] {
            if value.trim().is_empty() {
                return Err(FlowChatError::Validation(format!("Flow {field} is required")));
            }
        }
        Ok(())
    }

    fn into_create(self, creator_email: &str) -> FlowCreate {
        FlowCreate {
            name: self.name.trim().to_string(),
            description: self
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            system_prompt: self.system_prompt,
            model: self.model.trim().to_string(),
            creator_email: creator_email.to_string(),
        }
    }
}

/// Flow catalogue: browse, create, edit and delete flows.
pub struct FlowsView {
    transport: Arc<dyn Transport>,
    identity: Option<Identity>,
    flows: Vec<Flow>,
    banner: Option<Banner>,
}

impl FlowsView {
    pub fn new(transport: Arc<dyn Transport>, identity: Option<Identity>) -> Self {
        Self {
            transport,
            identity,
            flows: Vec::new(),
            banner: None,
        }
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn banner(&self) -> Option<&Banner> {
        self.banner.as_ref()
    }

    /// Model ids a flow may use, with their display names.
    pub fn models() -> &'static [(&'static str, &'static str)] {
        AVAILABLE_MODELS
    }

    fn fail<T>(&mut self, text: &str, err: FlowChatError) -> std::result::Result<T, Banner> {
        let banner = Banner::from_error(text, &err);
        self.banner = Some(banner.clone());
        Err(banner)
    }

    fn email(&self) -> Result<String> {
        self.identity
            .as_ref()
            .map(|i| i.email().to_string())
            .ok_or(FlowChatError::Unauthenticated)
    }

    async fn fetch(&self, own_only: bool) -> Result<Vec<Flow>> {
        let creator = if own_only { Some(self.email()?) } else { None };
        self.transport.list_flows(creator).await
    }

    pub async fn load_all(&mut self) -> std::result::Result<(), Banner> {
        self.load(false).await
    }

    /// Only the flows the signed-in user created.
    pub async fn load_own(&mut self) -> std::result::Result<(), Banner> {
        self.load(true).await
    }

    async fn load(&mut self, own_only: bool) -> std::result::Result<(), Banner> {
        self.banner = None;
        match self.fetch(own_only).await {
            Ok(flows) => {
                tracing::debug!("Loaded {} flows", flows.len());
                self.flows = flows;
                Ok(())
            }
            Err(e) => self.fail("Failed to load flows", e),
        }
    }

    pub async fn show(&mut self, flow_id: &str) -> std::result::Result<Flow, Banner> {
        self.banner = None;
        let result = self.transport.get_flow(flow_id).await;
        result.or_else(|e| self.fail("Failed to load flow", e))
    }

    pub async fn create(&mut self, draft: FlowDraft) -> std::result::Result<Flow, Banner> {
        self.banner = None;
        let result = match draft.validate().and_then(|_| self.email()) {
            Ok(email) => {
                self.transport
                    .create_flow(&draft.into_create(&email))
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(flow) => {
                tracing::info!("Created flow {} ({})", flow.name, flow.id);
                self.flows.push(flow.clone());
                Ok(flow)
            }
            Err(e) => self.fail("Failed to create flow", e),
        }
    }

    pub async fn update(
        &mut self,
        flow_id: &str,
        update: FlowUpdate,
    ) -> std::result::Result<Flow, Banner> {
        self.banner = None;
        let result = if update.is_empty() {
            Err(FlowChatError::Validation("Nothing to update".to_string()))
        } else {
            self.transport.update_flow(flow_id, &update).await
        };
        match result {
            Ok(flow) => {
                if let Some(slot) = self.flows.iter_mut().find(|f| f.id == flow.id) {
                    *slot = flow.clone();
                }
                Ok(flow)
            }
            Err(e) => self.fail("Failed to update flow", e),
        }
    }

    pub async fn delete(&mut self, flow_id: &str) -> std::result::Result<(), Banner> {
        self.banner = None;
        let result = self.transport.delete_flow(flow_id).await;
        match result {
            Ok(()) => {
                self.flows.retain(|f| f.id != flow_id);
                Ok(())
            }
            Err(e) => self.fail("Failed to delete flow", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::MockTransport;
    use chrono::Utc;

    fn flow(id: &str, name: &str) -> Flow {
        Flow {
            id: id.to_string(),
            name: name.to_string(),
            description: None,
            system_prompt: "Be brief".to_string(),
            model: "anthropic/claude-3-haiku".to_string(),
            creator_email: "a@x.com".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn view(transport: MockTransport) -> FlowsView {
        FlowsView::new(
            Arc::new(transport),
            Some(Identity::new("a@x.com").expect("valid email")),
        )
    }

    #[tokio::test]
    async fn test_load_own_filters_by_creator() {
        let mut transport = MockTransport::new();
        transport
            .expect_list_flows()
            .withf(|creator: &Option<String>| creator.as_deref() == Some("a@x.com"))
            .times(1)
            .returning(|_| Ok(vec![flow("F1", "Support")]));

        let mut view = view(transport);
        view.load_own().await.expect("load");
        assert_eq!(view.flows().len(), 1);
        assert!(view.banner().is_none());
    }

    #[tokio::test]
    async fn test_load_failure_sets_generic_banner() {
        let mut transport = MockTransport::new();
        transport.expect_list_flows().returning(|_| {
            Err(FlowChatError::Http {
                endpoint: "GET /flows/".to_string(),
                status: 503,
                body: "upstream unavailable".to_string(),
            })
        });

        let mut view = view(transport);
        let banner = view.load_all().await.expect_err("fails");
        assert_eq!(banner.text, "Failed to load flows");
        assert_eq!(view.banner(), Some(&banner));
    }

    #[tokio::test]
    async fn test_create_validates_before_request() {
        let mut transport = MockTransport::new();
        transport.expect_create_flow().times(0);

        let mut view = view(transport);
        let banner = view
            .create(FlowDraft::new("   ", "Be brief"))
            .await
            .expect_err("blank name");
        assert_eq!(banner.kind, ErrorKind::Validation);
        assert!(view.flows().is_empty());
    }

    #[tokio::test]
    async fn test_create_sets_creator_and_appends() {
        let mut transport = MockTransport::new();
        transport
            .expect_create_flow()
            .withf(|req: &FlowCreate| {
                req.creator_email == "a@x.com"
                    && req.name == "Support"
                    && req.model == "openai/gpt-3.5-turbo"
                    && req.description.is_none()
            })
            .times(1)
            .returning(|req| Ok(flow("F9", &req.name)));

        let mut view = view(transport);
        let mut draft = FlowDraft::new(" Support ", "Be brief");
        draft.description = Some("  ".to_string());
        let created = view.create(draft).await.expect("create");
        assert_eq!(created.id, "F9");
        assert_eq!(view.flows().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_touch_local_list() {
        let mut transport = MockTransport::new();
        transport
            .expect_list_flows()
            .returning(|_| Ok(vec![flow("F1", "One"), flow("F2", "Two")]));
        transport
            .expect_update_flow()
            .times(1)
            .returning(|id, update: &FlowUpdate| {
                Ok(flow(id, update.name.as_deref().unwrap_or("?")))
            });
        transport
            .expect_delete_flow()
            .withf(|id: &str| id == "F2")
            .times(1)
            .returning(|_| Ok(()));

        let mut view = view(transport);
        view.load_all().await.expect("load");

        let nothing = view.update("F1", FlowUpdate::default()).await;
        assert_eq!(nothing.expect_err("empty").kind, ErrorKind::Validation);

        let update = FlowUpdate {
            name: Some("Renamed".to_string()),
            ..Default::default()
        };
        view.update("F1", update).await.expect("update");
        assert_eq!(view.flows()[0].name, "Renamed");

        view.delete("F2").await.expect("delete");
        assert_eq!(view.flows().len(), 1);
        assert_eq!(view.flows()[0].id, "F1");
    }

    #[tokio::test]
    async fn test_anonymous_own_listing_needs_login() {
        let mut transport = MockTransport::new();
        transport.expect_list_flows().times(0);

        let mut view = FlowsView::new(Arc::new(transport), None);
        let banner = view.load_own().await.expect_err("no identity");
        assert!(banner.needs_login());
    }

    #[test]
    fn test_model_catalogue() {
        assert!(FlowsView::models().iter().any(|(id, _)| *id == "google/gemma-7b-it"));
    }
}
