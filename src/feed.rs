use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::model::{Post, POSTS};
use crate::profile::ProfileDirectory;
use crate::store::{Cursor, Direction, DocumentStore, Query};

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A page arrived; `added` posts were new to the cache.
    Loaded { added: usize },
    /// The next page was empty and the cursor has been dropped.
    Exhausted,
    /// Nothing to do: no cursor, a fetch already running, or the result went
    /// stale before it landed.
    Skipped,
    /// The store call failed; cached posts are untouched.
    Failed,
}

#[derive(Debug, Default)]
struct FeedState {
    posts: Vec<Post>,
    cursor: Option<Cursor>,
    page_size: usize,
    generation: u64,
}

struct LoadedPage {
    posts: Vec<Post>,
    cursor: Option<Cursor>,
    fetched: usize,
}

/// Newest-first post list, one page at a time.
pub struct PagedFeed {
    store: Arc<dyn DocumentStore>,
    authors: Option<Arc<ProfileDirectory>>,
    default_page_size: usize,
    state: Mutex<FeedState>,
    loading: AtomicBool,
}

struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PagedFeed {
    pub fn new(store: Arc<dyn DocumentStore>, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            store,
            authors: None,
            default_page_size: page_size,
            state: Mutex::new(FeedState {
                page_size,
                ..FeedState::default()
            }),
            loading: AtomicBool::new(false),
        }
    }

    /// Overwrite each post's cached author fields with the live profile.
    pub fn with_authors(mut self, authors: Arc<ProfileDirectory>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn refresh(&self) -> FetchOutcome {
        self.fetch_first_page(self.default_page_size)
    }

    /// Replaces the cache with the newest `page_size` posts.
    pub fn fetch_first_page(&self, page_size: usize) -> FetchOutcome {
        let page_size = page_size.max(1);
        let query = Query::collection(POSTS)
            .order_by("createdAt", Direction::Descending)
            .limit(page_size);
        let page = match self.load(&query) {
            Ok(page) => page,
            Err(err) => {
                warn!("feed: first page failed: {err:#}");
                return FetchOutcome::Failed;
            }
        };

        let added = page.posts.len();
        let mut state = self.state.lock();
        state.posts = page.posts;
        state.cursor = if page.fetched < page_size {
            None
        } else {
            page.cursor
        };
        state.page_size = page_size;
        state.generation += 1;
        debug!(
            "feed: first page with {added} posts, more: {}",
            state.cursor.is_some()
        );
        FetchOutcome::Loaded { added }
    }

    /// Appends the page after the stored cursor, skipping known post ids.
    pub fn fetch_next_page(&self) -> FetchOutcome {
        let Some(_guard) = self.begin() else {
            return FetchOutcome::Skipped;
        };

        let (cursor, page_size, generation) = {
            let state = self.state.lock();
            match &state.cursor {
                Some(cursor) => (cursor.clone(), state.page_size, state.generation),
                None => return FetchOutcome::Skipped,
            }
        };

        let query = Query::collection(POSTS)
            .order_by("createdAt", Direction::Descending)
            .start_after(cursor)
            .limit(page_size);
        let page = match self.load(&query) {
            Ok(page) => page,
            Err(err) => {
                warn!("feed: next page failed: {err:#}");
                return FetchOutcome::Failed;
            }
        };

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("feed: dropping next page fetched before a refresh");
            return FetchOutcome::Skipped;
        }
        if page.fetched == 0 {
            state.cursor = None;
            return FetchOutcome::Exhausted;
        }

        let mut seen: HashSet<String> = state.posts.iter().map(|p| p.id.clone()).collect();
        let mut added = 0;
        for post in page.posts {
            if seen.insert(post.id.clone()) {
                state.posts.push(post);
                added += 1;
            }
        }
        state.cursor = if page.fetched < page_size {
            None
        } else {
            page.cursor
        };
        debug!("feed: appended {added} posts, total {}", state.posts.len());
        FetchOutcome::Loaded { added }
    }

    /// Drops cached posts and cursor; an in-flight next page is discarded.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.posts.clear();
        state.cursor = None;
        state.generation += 1;
    }

    pub fn posts(&self) -> Vec<Post> {
        self.state.lock().posts.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_more(&self) -> bool {
        self.state.lock().cursor.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    fn begin(&self) -> Option<LoadingGuard<'_>> {
        self.loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoadingGuard(&self.loading))
    }

    fn load(&self, query: &Query) -> Result<LoadedPage> {
        let docs = self.store.query(query).context("feed: query posts")?;
        let cursor = docs.last().map(|doc| query.cursor_after(doc));
        let fetched = docs.len();

        let mut posts: Vec<Post> = docs
            .iter()
            .filter_map(|doc| match Post::try_from(doc) {
                Ok(post) => Some(post),
                Err(err) => {
                    warn!("feed: skipping post: {err}");
                    None
                }
            })
            .collect();
        if let Some(authors) = &self.authors {
            authors.resolve_posts(&mut posts);
        }

        Ok(LoadedPage {
            posts,
            cursor,
            fetched,
        })
    }
}
