use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Opaque credentials needed to open the push transport and authorize pulls.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub role: String,
    pub token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            token: token.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.user_id.is_empty() && !self.token.is_empty()
    }

    pub fn token_preview(&self) -> String {
        let head: String = self.token.chars().take(8).collect();
        format!("{head}...")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("token", &self.token_preview())
            .finish()
    }
}

/// Shared holder for the signed-in user's credentials. Constructed by the
/// application and handed to the channel; login/logout swap its contents.
#[derive(Clone, Default)]
pub struct SessionContext {
    inner: Arc<RwLock<Option<Credentials>>>,
}

impl SessionContext {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credentials)),
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.read().clone().filter(Credentials::is_complete)
    }

    pub fn sign_in(&self, credentials: Credentials) {
        *self.inner.write() = Some(credentials);
    }

    pub fn sign_out(&self) {
        *self.inner.write() = None;
    }
}
