use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::warn;
use serde_json::Value;

use crate::auth::Session;
use crate::backfill::{Backfill, BackfillReport, ProfileField};
use crate::blob::BlobStore;
use crate::error::BoardError;
use crate::model::{Comment, Post, UserProfile, USERS};
use crate::store::{DocumentStore, Fields, MAX_LOOKUP_IDS};

pub const ANONYMOUS_NICKNAME: &str = "Anonymous";

/// Read side of user profiles.
pub struct ProfileDirectory {
    store: Arc<dyn DocumentStore>,
}

impl ProfileDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// A user without a profile document gets an empty profile.
    pub fn profile(&self, user_id: &str) -> Result<UserProfile> {
        let doc = self
            .store
            .get(USERS, user_id)
            .with_context(|| format!("profile: load {user_id}"))?;
        match doc {
            Some(doc) => Ok(UserProfile::try_from(&doc)?),
            None => Ok(UserProfile::default()),
        }
    }

    /// Looks profiles up in chunks the store accepts. A failed chunk is
    /// logged and its users are simply missing from the result.
    pub fn profiles_by_ids<'a, I>(&self, ids: I) -> HashMap<String, UserProfile>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        let unique: Vec<String> = ids
            .into_iter()
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .map(str::to_string)
            .collect();

        let mut profiles = HashMap::new();
        for chunk in unique.chunks(MAX_LOOKUP_IDS) {
            let docs = match self.store.get_many(USERS, chunk) {
                Ok(docs) => docs,
                Err(err) => {
                    warn!("profile: lookup of {} users failed: {err}", chunk.len());
                    continue;
                }
            };
            for doc in docs {
                match UserProfile::try_from(&doc) {
                    Ok(profile) => {
                        profiles.insert(doc.id, profile);
                    }
                    Err(err) => warn!("profile: skipping: {err}"),
                }
            }
        }
        profiles
    }

    pub fn resolve_posts(&self, posts: &mut [Post]) {
        let profiles = self.profiles_by_ids(posts.iter().map(|p| p.user_id.as_str()));
        for post in posts {
            if let Some(profile) = profiles.get(&post.user_id) {
                if let Some(nickname) = profile.nickname() {
                    post.nickname = Some(nickname.to_string());
                }
                if let Some(url) = profile.profile_image_url() {
                    post.profile_image_url = Some(url.to_string());
                }
            }
        }
    }

    /// Like [`resolve_posts`](Self::resolve_posts), but a comment with no
    /// nickname at all is shown as anonymous.
    pub fn resolve_comments(&self, comments: &mut [Comment]) {
        let profiles = self.profiles_by_ids(comments.iter().map(|c| c.user_id.as_str()));
        for comment in comments {
            if let Some(profile) = profiles.get(&comment.user_id) {
                if let Some(nickname) = profile.nickname() {
                    comment.nickname = Some(nickname.to_string());
                }
                if let Some(url) = profile.profile_image_url() {
                    comment.photo_url = Some(url.to_string());
                }
            }
            if comment.nickname.is_none() {
                comment.nickname = Some(ANONYMOUS_NICKNAME.to_string());
            }
        }
    }
}

/// Profile edits. The profile document is written first; copies on the
/// user's posts and comments are rewritten in the background.
pub struct ProfileService {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    backfill: Arc<Backfill>,
}

impl ProfileService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        backfill: Arc<Backfill>,
    ) -> Self {
        Self {
            store,
            blobs,
            backfill,
        }
    }

    pub fn update_nickname(
        &self,
        session: &Session,
        nickname: &str,
    ) -> Result<JoinHandle<BackfillReport>> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(BoardError::EmptyNickname.into());
        }
        self.commit_field(session, ProfileField::Nickname, nickname)?;
        Ok(self.backfill.spawn(
            ProfileField::Nickname,
            nickname.to_string(),
            session.user_id.clone(),
        ))
    }

    /// Uploads `image` and makes it the avatar. Returns the new URL.
    pub fn update_avatar(
        &self,
        session: &Session,
        image: &Path,
    ) -> Result<(String, JoinHandle<BackfillReport>)> {
        let bytes =
            fs::read(image).with_context(|| format!("profile: read {}", image.display()))?;
        let url = self
            .blobs
            .upload(&bytes, &format!("profile-{}", session.user_id))
            .context("profile: upload avatar")?;
        self.commit_field(session, ProfileField::Avatar, &url)?;
        let handle = self
            .backfill
            .spawn(ProfileField::Avatar, url.clone(), session.user_id.clone());
        Ok((url, handle))
    }

    fn commit_field(&self, session: &Session, field: ProfileField, value: &str) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert(
            field.profile_field().to_string(),
            Value::String(value.to_string()),
        );
        self.store
            .set(USERS, &session.user_id, fields)
            .with_context(|| format!("profile: save {}", field.profile_field()))
    }
}
