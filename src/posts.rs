use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::warn;
use parking_lot::Mutex;

use crate::auth::Session;
use crate::blob::{self, BlobStore, ImageSource};
use crate::error::BoardError;
use crate::feed::PagedFeed;
use crate::format;
use crate::model::{Comment, NewComment, NewPost, Post, PostEdit, UserProfile, COMMENTS, POSTS};
use crate::profile::ProfileDirectory;
use crate::store::{self, Direction, DocumentStore, Query};

const POST_IMAGE_PREFIX: &str = "post-image";

/// How many of their own posts the profile screen lists.
pub const OWN_POSTS_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
    pub images: Vec<ImageSource>,
}

/// Post and comment operations for the signed-in user.
///
/// Every post write invalidates the injected feed so the next refresh
/// reflects it.
pub struct PostService {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    directory: Arc<ProfileDirectory>,
    feed: Arc<PagedFeed>,
    dirty: Mutex<HashSet<String>>,
}

impl PostService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        directory: Arc<ProfileDirectory>,
        feed: Arc<PagedFeed>,
    ) -> Self {
        Self {
            store,
            blobs,
            directory,
            feed,
            dirty: Mutex::new(HashSet::new()),
        }
    }

    pub fn write_post(&self, session: &Session, draft: &PostDraft) -> Result<String> {
        let (title, content) = validate(draft)?;
        let images = blob::collect_images(self.blobs.as_ref(), &draft.images, POST_IMAGE_PREFIX);
        let author = self.author(session);

        let record = NewPost {
            user_id: &session.user_id,
            title,
            content,
            images: &images,
            created_at: format::now_value(),
            comments: Vec::new(),
            nickname: author.nickname(),
            profile_image_url: author.profile_image_url(),
        };
        let id = self
            .store
            .add(POSTS, store::fields_of(&record)?)
            .context("posts: write")?;
        self.feed.invalidate();
        Ok(id)
    }

    pub fn update_post(&self, session: &Session, post_id: &str, draft: &PostDraft) -> Result<()> {
        let (title, content) = validate(draft)?;
        self.owned_post(session, post_id)?;
        let images = blob::collect_images(self.blobs.as_ref(), &draft.images, POST_IMAGE_PREFIX);

        let edit = PostEdit {
            title,
            content,
            images: &images,
        };
        self.store
            .update(POSTS, post_id, store::fields_of(&edit)?)
            .with_context(|| format!("posts: update {post_id}"))?;
        self.mark_dirty(post_id);
        self.feed.invalidate();
        Ok(())
    }

    pub fn delete_post(&self, session: &Session, post_id: &str) -> Result<()> {
        self.owned_post(session, post_id)?;
        self.store
            .delete(POSTS, post_id)
            .with_context(|| format!("posts: delete {post_id}"))?;
        self.dirty.lock().remove(post_id);
        self.feed.invalidate();
        Ok(())
    }

    /// Post with its author resolved from the live profile.
    pub fn post(&self, post_id: &str) -> Result<Option<Post>> {
        let Some(doc) = self
            .store
            .get(POSTS, post_id)
            .with_context(|| format!("posts: load {post_id}"))?
        else {
            return Ok(None);
        };
        let mut post = Post::try_from(&doc)?;
        self.directory.resolve_posts(std::slice::from_mut(&mut post));
        Ok(Some(post))
    }

    /// The signed-in user's newest `limit` posts, newest first.
    pub fn posts_by_user(&self, session: &Session, limit: usize) -> Result<Vec<Post>> {
        let query = Query::collection(POSTS)
            .where_eq("userId", session.user_id.as_str())
            .order_by("createdAt", Direction::Descending)
            .limit(limit.max(1));
        let docs = self
            .store
            .query(&query)
            .with_context(|| format!("posts: load posts of {}", session.user_id))?;

        let mut posts: Vec<Post> = docs
            .iter()
            .filter_map(|doc| match Post::try_from(doc) {
                Ok(post) => Some(post),
                Err(err) => {
                    warn!("posts: skipping post: {err}");
                    None
                }
            })
            .collect();
        self.directory.resolve_posts(&mut posts);
        Ok(posts)
    }

    pub fn add_comment(&self, session: &Session, post_id: &str, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BoardError::EmptyComment.into());
        }
        let exists = self
            .store
            .get(POSTS, post_id)
            .with_context(|| format!("posts: load {post_id}"))?
            .is_some();
        if !exists {
            return Err(BoardError::PostNotFound(post_id.to_string()).into());
        }

        let author = self.author(session);
        let record = NewComment {
            post_id,
            user_id: &session.user_id,
            comment: text,
            created_at: format::now_value(),
            user_nickname: author.nickname(),
            user_photo_url: author.profile_image_url(),
        };
        self.store
            .add(COMMENTS, store::fields_of(&record)?)
            .context("posts: write comment")
    }

    /// Comments on a post, oldest first.
    pub fn comments(&self, post_id: &str) -> Result<Vec<Comment>> {
        let query = Query::collection(COMMENTS)
            .where_eq("postId", post_id)
            .order_by("createdAt", Direction::Ascending);
        let docs = self
            .store
            .query(&query)
            .with_context(|| format!("posts: load comments of {post_id}"))?;

        let mut comments: Vec<Comment> = docs
            .iter()
            .filter_map(|doc| match Comment::try_from(doc) {
                Ok(comment) => Some(comment),
                Err(err) => {
                    warn!("posts: skipping comment: {err}");
                    None
                }
            })
            .collect();
        self.directory.resolve_comments(&mut comments);
        Ok(comments)
    }

    pub fn mark_dirty(&self, post_id: &str) {
        self.dirty.lock().insert(post_id.to_string());
    }

    /// True once after the post was edited, so a detail view reloads it.
    pub fn consume_dirty(&self, post_id: &str) -> bool {
        self.dirty.lock().remove(post_id)
    }

    fn owned_post(&self, session: &Session, post_id: &str) -> Result<Post> {
        let doc = self
            .store
            .get(POSTS, post_id)
            .with_context(|| format!("posts: load {post_id}"))?
            .ok_or_else(|| BoardError::PostNotFound(post_id.to_string()))?;
        let post = Post::try_from(&doc)?;
        if post.user_id != session.user_id {
            return Err(BoardError::NotOwner(post_id.to_string()).into());
        }
        Ok(post)
    }

    fn author(&self, session: &Session) -> UserProfile {
        self.directory
            .profile(&session.user_id)
            .unwrap_or_else(|err| {
                warn!("posts: author profile unavailable: {err:#}");
                UserProfile::default()
            })
    }
}

fn validate(draft: &PostDraft) -> Result<(&str, &str), BoardError> {
    let title = draft.title.trim();
    let content = draft.content.trim();
    if title.is_empty() || content.is_empty() {
        return Err(BoardError::EmptyTitleOrContent);
    }
    Ok((title, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::feed::FetchOutcome;
    use crate::model::USERS;
    use crate::testing::{fields, seed_post, ScriptedStore};
    use serde_json::json;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        dir_path: std::path::PathBuf,
        store: Arc<ScriptedStore>,
        feed: Arc<PagedFeed>,
        posts: PostService,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();
        let store = ScriptedStore::new();
        let directory = Arc::new(ProfileDirectory::new(store.clone()));
        let feed = Arc::new(PagedFeed::new(store.clone(), 10));
        let blobs = Arc::new(FsBlobStore::open(Some(dir_path.join("blobs"))).unwrap());
        let posts = PostService::new(store.clone(), blobs, directory, feed.clone());
        Fixture {
            _dir: dir,
            dir_path,
            store,
            feed,
            posts,
        }
    }

    fn session(user_id: &str) -> Session {
        Session {
            user_id: user_id.into(),
            email: format!("{user_id}@example.com"),
        }
    }

    fn draft(title: &str, content: &str) -> PostDraft {
        PostDraft {
            title: title.into(),
            content: content.into(),
            images: Vec::new(),
        }
    }

    fn board_error(err: anyhow::Error) -> BoardError {
        err.downcast::<BoardError>().unwrap()
    }

    #[test]
    fn write_denormalizes_author_and_invalidates_feed() {
        let fx = fixture();
        fx.store
            .set(USERS, "u1", fields(json!({"nickname": "mina"})))
            .unwrap();
        fx.feed.refresh();

        let id = fx
            .posts
            .write_post(&session("u1"), &draft(" Hello ", "first post"))
            .unwrap();
        assert!(fx.feed.is_empty());

        let doc = fx.store.get(POSTS, &id).unwrap().unwrap();
        let stored = Post::try_from(&doc).unwrap();
        assert_eq!(stored.title, "Hello");
        assert_eq!(stored.nickname.as_deref(), Some("mina"));
        assert!(stored.comments.is_empty());

        assert_eq!(fx.feed.refresh(), FetchOutcome::Loaded { added: 1 });
    }

    #[test]
    fn empty_title_or_content_is_refused() {
        let fx = fixture();
        let err = fx
            .posts
            .write_post(&session("u1"), &draft("title", "   "))
            .unwrap_err();
        assert_eq!(board_error(err), BoardError::EmptyTitleOrContent);
    }

    #[test]
    fn local_images_are_uploaded() {
        let fx = fixture();
        let local = fx.dir_path.join("pic.jpg");
        fs::write(&local, [0xFF, 0xD8, 0xFF, 0xE0, 9, 9]).unwrap();
        let mut with_image = draft("pics", "look");
        with_image.images.push(ImageSource::Local(local));

        let id = fx.posts.write_post(&session("u1"), &with_image).unwrap();
        let post = fx.posts.post(&id).unwrap().unwrap();
        assert_eq!(post.images.len(), 1);
        assert!(post.images[0].starts_with("file://"));
    }

    #[test]
    fn only_owner_edits_and_edit_marks_dirty() {
        let fx = fixture();
        let id = fx
            .posts
            .write_post(&session("u1"), &draft("a", "b"))
            .unwrap();

        let err = fx
            .posts
            .update_post(&session("u2"), &id, &draft("x", "y"))
            .unwrap_err();
        assert_eq!(board_error(err), BoardError::NotOwner(id.clone()));
        assert!(!fx.posts.consume_dirty(&id));

        fx.posts
            .update_post(&session("u1"), &id, &draft("edited", "y"))
            .unwrap();
        assert!(fx.posts.consume_dirty(&id));
        assert!(!fx.posts.consume_dirty(&id));
        assert_eq!(fx.posts.post(&id).unwrap().unwrap().title, "edited");
    }

    #[test]
    fn delete_checks_existence_and_owner() {
        let fx = fixture();
        let id = fx
            .posts
            .write_post(&session("u1"), &draft("a", "b"))
            .unwrap();

        let err = fx.posts.delete_post(&session("u2"), &id).unwrap_err();
        assert_eq!(board_error(err), BoardError::NotOwner(id.clone()));

        fx.posts.delete_post(&session("u1"), &id).unwrap();
        assert!(fx.posts.post(&id).unwrap().is_none());

        let err = fx.posts.delete_post(&session("u1"), &id).unwrap_err();
        assert_eq!(board_error(err), BoardError::PostNotFound(id));
    }

    #[test]
    fn comments_are_oldest_first_with_live_authors() {
        let fx = fixture();
        let post_id = fx
            .posts
            .write_post(&session("u1"), &draft("a", "b"))
            .unwrap();
        fx.store
            .set(USERS, "u2", fields(json!({"nickname": "jun"})))
            .unwrap();

        fx.posts
            .add_comment(&session("u2"), &post_id, "first")
            .unwrap();
        fx.posts
            .add_comment(&session("u3"), &post_id, " second ")
            .unwrap();

        let comments = fx.posts.comments(&post_id).unwrap();
        assert_eq!(comments.len(), 2);
        assert!(comments[0].created_at <= comments[1].created_at);
        let bodies: Vec<_> = comments.iter().map(|c| c.body.as_str()).collect();
        assert!(bodies.contains(&"first") && bodies.contains(&"second"));
        let jun = comments.iter().find(|c| c.user_id == "u2").unwrap();
        assert_eq!(jun.nickname.as_deref(), Some("jun"));
        let other = comments.iter().find(|c| c.user_id == "u3").unwrap();
        assert_eq!(other.nickname.as_deref(), Some("Anonymous"));
    }

    #[test]
    fn own_posts_are_newest_first_and_limited() {
        let fx = fixture();
        for n in 0..6 {
            let owner = if n % 2 == 0 { "u1" } else { "u2" };
            seed_post(fx.store.as_ref(), &format!("p{n}"), owner, n);
        }
        fx.store
            .set(USERS, "u1", fields(json!({"nickname": "mina"})))
            .unwrap();

        let mine = fx.posts.posts_by_user(&session("u1"), OWN_POSTS_LIMIT).unwrap();
        let ids: Vec<_> = mine.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["p4", "p2", "p0"]);
        assert!(mine.iter().all(|p| p.nickname.as_deref() == Some("mina")));

        let newest = fx.posts.posts_by_user(&session("u1"), 2).unwrap();
        let ids: Vec<_> = newest.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["p4", "p2"]);

        assert!(fx.posts.posts_by_user(&session("u3"), 5).unwrap().is_empty());
    }

    #[test]
    fn comments_in_mixed_timestamp_shapes_are_oldest_first() {
        let fx = fixture();
        seed_post(fx.store.as_ref(), "p1", "u1", 0);
        let shapes = [
            ("late", json!(1_700_000_000)),
            ("early", json!({"seconds": 1_699_999_990})),
            ("middle", json!("2023-11-14T22:13:15.000Z")),
        ];
        for (id, created_at) in shapes {
            fx.store
                .set(
                    COMMENTS,
                    id,
                    fields(json!({
                        "postId": "p1",
                        "userId": "u2",
                        "comment": id,
                        "createdAt": created_at,
                    })),
                )
                .unwrap();
        }

        let comments = fx.posts.comments("p1").unwrap();
        let ids: Vec<_> = comments.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["early", "middle", "late"]);
    }

    #[test]
    fn comment_needs_text_and_post() {
        let fx = fixture();
        let err = fx
            .posts
            .add_comment(&session("u1"), "missing", "hi")
            .unwrap_err();
        assert_eq!(board_error(err), BoardError::PostNotFound("missing".into()));

        let err = fx
            .posts
            .add_comment(&session("u1"), "missing", "  ")
            .unwrap_err();
        assert_eq!(board_error(err), BoardError::EmptyComment);
    }
}
