use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{FlowChatError, Result};
use crate::transport::Transport;

/// The signed-in user. The email is the only credential the service knows;
/// it is sent as a plain parameter on every authenticated call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    user_email: String,
}

impl Identity {
    pub fn new(email: &str) -> Result<Self> {
        let email = email.trim();
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
            && !email.contains(char::is_whitespace);
        if !well_formed {
            return Err(FlowChatError::Validation(format!(
                "Not an email address: {email:?}"
            )));
        }
        Ok(Self {
            user_email: email.to_string(),
        })
    }

    pub fn email(&self) -> &str {
        &self.user_email
    }
}

/// Where the identity survives between runs.
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<Option<Identity>>;
    fn save(&self, identity: &Identity) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file store, the local stand-in for browser storage.
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<Identity>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<Identity>(&contents) {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable identity file {}: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(identity)?)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<Identity>>,
}

impl MemoryIdentityStore {
    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Identity>>> {
        self.slot
            .lock()
            .map_err(|_| FlowChatError::Internal("identity store lock poisoned".to_string()))
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<Identity>> {
        Ok(self.slot()?.clone())
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        *self.slot()? = Some(identity.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot()? = None;
        Ok(())
    }
}

/// Login/logout lifecycle around an injected store. Components receive the
/// resulting [`Identity`] explicitly instead of looking it up.
pub struct Auth {
    store: Arc<dyn IdentityStore>,
    current: Option<Identity>,
}

impl Auth {
    pub fn new(store: Arc<dyn IdentityStore>) -> Result<Self> {
        let current = store.load()?;
        Ok(Self { store, current })
    }

    /// Registers the email with the service (idempotent on the server side)
    /// and remembers it.
    pub async fn login(&mut self, transport: &dyn Transport, email: &str) -> Result<Identity> {
        let identity = Identity::new(email)?;
        let user = transport.create_user(identity.email()).await?;
        tracing::info!("Signed in as {}", user.email);
        self.store.save(&identity)?;
        self.current = Some(identity.clone());
        Ok(identity)
    }

    pub fn logout(&mut self) -> Result<()> {
        if let Some(identity) = self.current.take() {
            tracing::info!("Signed out {}", identity.email());
        }
        self.store.clear()
    }

    pub fn current(&self) -> Option<&Identity> {
        self.current.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.is_some()
    }

    /// The identity, or `Unauthenticated` so the caller sends the user to login.
    pub fn require(&self) -> Result<Identity> {
        self.current.clone().ok_or(FlowChatError::Unauthenticated)
    }
}
