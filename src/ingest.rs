//! One ingestion cycle: pick the stalest feed, fetch it, store its items.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dates;
use crate::db::{Database, NewPost, StoreError};
use crate::fetcher::{FetchError, Fetcher, RawItem};

/// Source of "now" for fetch marks and post timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no feeds registered, add one with `gator addfeed <name> <url>`")]
    NoFeedsRegistered,
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Fetch failures leave the feed unmarked, so the next cycle picks it
    /// again. Anything else will not fix itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Fetch { .. })
    }
}

/// What happened to one feed during one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub feed_id: String,
    pub feed_name: String,
    pub feed_url: String,
    pub channel_title: String,
    pub inserted: usize,
    pub duplicates: usize,
    /// Stored without a publish date
    pub undated: usize,
    /// Dropped for having no link
    pub skipped: usize,
    pub failed: usize,
}

/// Fetch the feed that has waited longest and store its items.
///
/// The feed is marked fetched as soon as the download succeeds, before any
/// item is written, so item failures never hold up the rotation. A failed
/// download leaves the mark alone.
pub async fn run_once(
    db: &Database,
    fetcher: &Fetcher,
    clock: &dyn Clock,
) -> Result<CycleReport, IngestError> {
    let feed = match db.get_next_feed_to_fetch().await {
        Ok(feed) => feed,
        Err(StoreError::NotFound) => return Err(IngestError::NoFeedsRegistered),
        Err(err) => return Err(err.into()),
    };

    info!(feed = %feed.name, url = %feed.url, "fetching feed");

    let raw = fetcher
        .fetch(&feed.url)
        .await
        .map_err(|source| IngestError::Fetch {
            url: feed.url.clone(),
            source,
        })?;

    db.mark_feed_fetched(&feed.id, clock.now()).await?;

    let mut report = CycleReport {
        feed_id: feed.id.clone(),
        feed_name: feed.name.clone(),
        feed_url: feed.url.clone(),
        channel_title: raw.title,
        ..Default::default()
    };

    for item in raw.items {
        store_item(db, &feed.id, item, clock.now(), &mut report).await;
    }

    info!(
        feed = %report.feed_name,
        channel = %report.channel_title,
        inserted = report.inserted,
        duplicates = report.duplicates,
        undated = report.undated,
        skipped = report.skipped,
        failed = report.failed,
        "feed ingested"
    );

    Ok(report)
}

async fn store_item(
    db: &Database,
    feed_id: &str,
    item: RawItem,
    now: DateTime<Utc>,
    report: &mut CycleReport,
) {
    if item.link.is_empty() {
        warn!(title = %item.title, "skipping item with no link");
        report.skipped += 1;
        return;
    }

    let published_at = match dates::normalize(&item.pub_date) {
        Ok(published_at) => Some(published_at),
        Err(err) => {
            warn!(title = %item.title, error = %err, "storing post without a publish date");
            report.undated += 1;
            None
        }
    };

    let post = NewPost {
        id: Uuid::new_v4().to_string(),
        feed_id: feed_id.to_string(),
        title: item.title,
        url: item.link,
        description: Some(item.description).filter(|d| !d.is_empty()),
        published_at,
        created_at: now,
    };

    match db.create_post(&post).await {
        Ok(()) => report.inserted += 1,
        Err(StoreError::DuplicateKey(_)) => {
            debug!(url = %post.url, "post already stored");
            report.duplicates += 1;
        }
        Err(err) => {
            error!(url = %post.url, error = %err, "failed to save post");
            report.failed += 1;
        }
    }
}
