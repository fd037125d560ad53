use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, SqlitePool,
};
use thiserror::Error;

/// Store failures, tagged by kind so callers never have to look at messages.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("database error: {0}")]
    Other(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                StoreError::DuplicateKey(db_err.message().to_string())
            }
            other => StoreError::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct User {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Feed {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub url: String,
    pub user_id: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// A follow row joined with the names it links.
#[derive(Debug, Clone, FromRow)]
pub struct FeedFollow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: String,
    pub feed_id: String,
    pub feed_name: String,
    pub user_name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct FeedListing {
    pub name: String,
    pub url: String,
    pub user_name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct FollowedFeed {
    pub feed_name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Post {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: String,
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database gets its own database,
        // so keep exactly one and never recycle it.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                last_fetched_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_follows (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                feed_id TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                UNIQUE(user_id, feed_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                description TEXT,
                published_at TEXT,
                feed_id TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_last_fetched ON feeds(last_fetched_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_posts_feed_published
            ON posts(feed_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user(&self, name: &str) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn create_user(
        &self,
        id: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, created_at, updated_at, name)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM users ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().map(|(name,)| name).collect())
    }

    pub async fn create_feed(
        &self,
        id: &str,
        user_id: &str,
        name: &str,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Feed, StoreError> {
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            INSERT INTO feeds (id, created_at, updated_at, name, url, user_id)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .bind(name)
        .bind(url)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn get_feed(&self, feed_id: &str) -> Result<Feed, StoreError> {
        sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn get_feed_id_by_url(&self, url: &str) -> Result<String, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(id,)| id).ok_or(StoreError::NotFound)
    }

    pub async fn list_feeds(&self) -> Result<Vec<FeedListing>, StoreError> {
        let feeds = sqlx::query_as::<_, FeedListing>(
            r#"
            SELECT feeds.name, feeds.url, users.name AS user_name
            FROM feeds
            JOIN users ON users.id = feeds.user_id
            ORDER BY feeds.created_at, feeds.rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    pub async fn create_feed_follow(
        &self,
        id: &str,
        user_id: &str,
        feed_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FeedFollow, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feed_follows (id, created_at, updated_at, user_id, feed_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .bind(user_id)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        let follow = sqlx::query_as::<_, FeedFollow>(
            r#"
            SELECT ff.id, ff.created_at, ff.updated_at, ff.user_id, ff.feed_id,
                   feeds.name AS feed_name, users.name AS user_name
            FROM feed_follows ff
            JOIN feeds ON feeds.id = ff.feed_id
            JOIN users ON users.id = ff.user_id
            WHERE ff.id = ?
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(follow)
    }

    pub async fn delete_feed_follow(&self, user_id: &str, feed_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM feed_follows WHERE user_id = ? AND feed_id = ?")
            .bind(user_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn list_feed_follows_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<FollowedFeed>, StoreError> {
        let feeds = sqlx::query_as::<_, FollowedFeed>(
            r#"
            SELECT feeds.name AS feed_name, feeds.url
            FROM feed_follows ff
            JOIN feeds ON feeds.id = ff.feed_id
            WHERE ff.user_id = ?
            ORDER BY ff.created_at, ff.rowid
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// The feed fetched longest ago. Feeds never fetched come first.
    pub async fn get_next_feed_to_fetch(&self) -> Result<Feed, StoreError> {
        sqlx::query_as::<_, Feed>(
            r#"
            SELECT * FROM feeds
            ORDER BY last_fetched_at ASC NULLS FIRST, created_at ASC, rowid ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    pub async fn mark_feed_fetched(
        &self,
        feed_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET last_fetched_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Insert a post. A post whose URL is already stored fails with
    /// [`StoreError::DuplicateKey`].
    pub async fn create_post(&self, post: &NewPost) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, created_at, updated_at, title, url, description, published_at, feed_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(post.created_at)
        .bind(post.created_at)
        .bind(&post.title)
        .bind(&post.url)
        .bind(&post.description)
        .bind(post.published_at)
        .bind(&post.feed_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_post_by_url(&self, url: &str) -> Result<Post, StoreError> {
        sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn count_posts_for_feed(&self, feed_id: &str) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Newest posts across the feeds a user follows; undated posts sort last.
    pub async fn list_posts_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Post>, StoreError> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT posts.* FROM posts
            JOIN feed_follows ff ON ff.feed_id = posts.feed_id
            WHERE ff.user_id = ?
            ORDER BY posts.published_at DESC NULLS LAST, posts.created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Erase every user, feed, follow and post.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["posts", "feed_follows", "feeds", "users"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
