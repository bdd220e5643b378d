use std::sync::Arc;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::format;
use crate::model::ACCOUNTS;
use crate::store::{self, DocumentStore, Query};

pub const MIN_PASSWORD_LEN: usize = 6;
const SALT_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email address")]
    InvalidEmail,
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    WeakPassword,
    #[error("email already in use")]
    EmailInUse,
    #[error("wrong email or password")]
    InvalidCredentials,
}

/// Signed-in user. `user_id` is the owner id stamped on posts and comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub email: String,
}

pub trait CredentialProvider: Send + Sync {
    fn sign_up(&self, email: &str, password: &str) -> Result<Session>;
    fn sign_in(&self, email: &str, password: &str) -> Result<Session>;
}

/// Email/password accounts kept in the `accounts` collection.
pub struct LocalCredentials {
    store: Arc<dyn DocumentStore>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountRecord<'a> {
    email: &'a str,
    salt: String,
    password_hash: String,
    created_at: String,
}

impl LocalCredentials {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn find(&self, email: &str) -> Result<Option<store::Document>> {
        let docs = self
            .store
            .query(&Query::collection(ACCOUNTS).where_eq("email", email).limit(1))
            .context("auth: look up account")?;
        Ok(docs.into_iter().next())
    }
}

impl CredentialProvider for LocalCredentials {
    fn sign_up(&self, email: &str, password: &str) -> Result<Session> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword.into());
        }
        if self.find(&email)?.is_some() {
            return Err(AuthError::EmailInUse.into());
        }

        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let record = AccountRecord {
            email: &email,
            salt: hex::encode(salt),
            password_hash: password_digest(&salt, password),
            created_at: format::now_value(),
        };
        let user_id = self
            .store
            .add(ACCOUNTS, store::fields_of(&record)?)
            .context("auth: create account")?;
        Ok(Session { user_id, email })
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let email = normalize_email(email)?;
        let account = self.find(&email)?.ok_or(AuthError::InvalidCredentials)?;

        let salt = account
            .get("salt")
            .and_then(Value::as_str)
            .and_then(|salt| hex::decode(salt).ok())
            .ok_or(AuthError::InvalidCredentials)?;
        let stored = account.get("passwordHash").and_then(Value::as_str);
        if stored != Some(password_digest(&salt, password).as_str()) {
            return Err(AuthError::InvalidCredentials.into());
        }

        Ok(Session {
            user_id: account.id,
            email,
        })
    }
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(AuthError::InvalidEmail),
    }
}

fn password_digest(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
