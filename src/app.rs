use std::sync::Arc;

use anyhow::{bail, Context, Result};
use env_logger::Env;

use crate::auth::LocalCredentials;
use crate::backfill::Backfill;
use crate::blob::{BlobStore, FsBlobStore};
use crate::config::{self, Config, LoadOptions};
use crate::feed::{FetchOutcome, PagedFeed};
use crate::format;
use crate::posts::PostService;
use crate::profile::{ProfileDirectory, ProfileService, ANONYMOUS_NICKNAME};
use crate::session;
use crate::store::{self, DocumentStore, SqliteStore};

/// Everything a board screen needs, wired over one store and blob store.
pub struct Board {
    pub sessions: session::Manager,
    pub feed: Arc<PagedFeed>,
    pub posts: PostService,
    pub profiles: ProfileService,
    pub directory: Arc<ProfileDirectory>,
}

impl Board {
    pub fn open(cfg: &Config) -> Result<Self> {
        let store = SqliteStore::open(store::Options {
            path: cfg.storage.path.clone(),
        })
        .context("board: open store")?;
        let blobs = FsBlobStore::open(cfg.blobs.dir.clone()).context("board: open blobs")?;
        Ok(Self::with_backends(cfg, Arc::new(store), Arc::new(blobs)))
    }

    pub fn with_backends(
        cfg: &Config,
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let directory = Arc::new(ProfileDirectory::new(store.clone()));
        let mut feed = PagedFeed::new(store.clone(), cfg.feed.page_size);
        if cfg.feed.resolve_authors {
            feed = feed.with_authors(directory.clone());
        }
        let feed = Arc::new(feed);
        let backfill = Arc::new(Backfill::new(store.clone(), cfg.backfill.chunk_size));

        Self {
            sessions: session::Manager::new(Arc::new(LocalCredentials::new(store.clone()))),
            posts: PostService::new(
                store.clone(),
                blobs.clone(),
                directory.clone(),
                feed.clone(),
            ),
            profiles: ProfileService::new(store, blobs, backfill),
            feed,
            directory,
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("warn")).try_init();
}

/// Prints the first page of the feed.
pub fn run() -> Result<()> {
    init_logging();
    let cfg = config::load(LoadOptions::default())?;
    let board = Board::open(&cfg)?;

    if board.feed.refresh() == FetchOutcome::Failed {
        bail!("could not load the feed");
    }
    let posts = board.feed.posts();
    if posts.is_empty() {
        println!("No posts yet.");
        return Ok(());
    }
    for post in posts {
        println!(
            "{}  {}  ({})",
            format::format_timestamp(&post.created_at),
            post.title,
            post.nickname.as_deref().unwrap_or(ANONYMOUS_NICKNAME),
        );
    }
    if board.feed.has_more() {
        println!("...");
    }
    Ok(())
}
