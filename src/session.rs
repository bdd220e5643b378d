use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::auth::{CredentialProvider, Session};
use crate::error::BoardError;

/// Tracks who is signed in.
pub struct Manager {
    credentials: Arc<dyn CredentialProvider>,
    active: RwLock<Option<Session>>,
}

impl Manager {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            credentials,
            active: RwLock::new(None),
        }
    }

    pub fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.credentials.sign_in(email, password)?;
        *self.active.write() = Some(session.clone());
        Ok(session)
    }

    pub fn sign_up(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.credentials.sign_up(email, password)?;
        *self.active.write() = Some(session.clone());
        Ok(session)
    }

    pub fn sign_out(&self) {
        *self.active.write() = None;
    }

    pub fn current(&self) -> Option<Session> {
        self.active.read().clone()
    }

    pub fn require(&self) -> Result<Session, BoardError> {
        self.current().ok_or(BoardError::NotSignedIn)
    }
}
