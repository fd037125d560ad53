//! Command registry and handlers for the `gator` CLI.
//!
//! Handlers receive the shared [`State`] and the parsed [`Command`]. Handlers
//! that act on behalf of a user are wrapped with [`logged_in`], which resolves
//! the current user before the handler runs.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::db::{Database, StoreError, User};
use crate::fetcher::Fetcher;
use crate::ingest::{self, IngestError, SystemClock};
use crate::scheduler::{self, InvalidInterval};

/// Posts shown by `browse` when no limit is given.
pub const DEFAULT_BROWSE_LIMIT: i64 = 2;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("usage: gator {0}")]
    Usage(&'static str),
    #[error("no user logged in, run `gator register <username>` first")]
    NotLoggedIn,
    #[error("user {0} does not exist, run `gator register {0}` first")]
    UnknownUser(String),
    #[error("user {0} already exists")]
    UserExists(String),
    #[error("feed {0} not found, add it first with `gator addfeed <name> <url>`")]
    FeedNotFound(String),
    #[error("a feed with url {0} already exists, follow it with `gator follow {0}`")]
    FeedExists(String),
    #[error("{user} already follows {url}")]
    AlreadyFollowing { user: String, url: String },
    #[error("{user} does not follow {url}")]
    NotFollowing { user: String, url: String },
    #[error("invalid limit {0:?}, expected a positive number")]
    InvalidLimit(String),
    #[error(transparent)]
    Interval(#[from] InvalidInterval),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Everything a handler may touch.
pub struct State {
    pub config: Config,
    pub config_path: PathBuf,
    pub db: Database,
    pub fetcher: Fetcher,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a command from process arguments, program name already skipped.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Option<Self> {
        let mut args = args.into_iter();
        let name = args.next()?;
        Some(Self {
            name,
            args: args.collect(),
        })
    }
}

pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), CommandError>>;

pub type Handler =
    Box<dyn for<'a> Fn(&'a mut State, &'a Command) -> HandlerFuture<'a> + Send + Sync>;

/// A handler that needs the logged-in user.
pub type UserHandler = for<'a> fn(&'a mut State, &'a Command, User) -> HandlerFuture<'a>;

pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut State, &'a Command) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Box::new(f)
}

/// Wrap `wrapped` so it only runs with a resolved current user.
///
/// Fails with [`CommandError::NotLoggedIn`] when the config names no user or
/// names one the database doesn't know. The wrapped handler is not invoked
/// in either case.
pub fn logged_in(wrapped: UserHandler) -> Handler {
    handler(move |state, cmd| {
        Box::pin(async move {
            let user = current_user(state).await?;
            wrapped(state, cmd, user).await
        })
    })
}

async fn current_user(state: &State) -> Result<User, CommandError> {
    let name = state.config.current_user().ok_or(CommandError::NotLoggedIn)?;
    match state.db.get_user(name).await {
        Ok(user) => Ok(user),
        Err(StoreError::NotFound) => {
            warn!(user = name, "logged-in user is not in the database");
            Err(CommandError::NotLoggedIn)
        }
        Err(err) => Err(err.into()),
    }
}

pub struct Commands {
    handlers: HashMap<&'static str, Handler>,
}

impl Commands {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in command.
    pub fn builtin() -> Self {
        let mut commands = Self::new();
        commands.register("login", handler(handle_login));
        commands.register("register", handler(handle_register));
        commands.register("reset", handler(handle_reset));
        commands.register("users", handler(handle_users));
        commands.register("agg", handler(handle_agg));
        commands.register("addfeed", logged_in(handle_add_feed));
        commands.register("feeds", handler(handle_feeds));
        commands.register("follow", logged_in(handle_follow));
        commands.register("unfollow", logged_in(handle_unfollow));
        commands.register("following", logged_in(handle_following));
        commands.register("browse", logged_in(handle_browse));
        commands
    }

    pub fn register(&mut self, name: &'static str, handler: Handler) {
        self.handlers.insert(name, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn run(&self, state: &mut State, cmd: &Command) -> Result<(), CommandError> {
        let handler = self
            .handlers
            .get(cmd.name.as_str())
            .ok_or_else(|| CommandError::NotFound(cmd.name.clone()))?;
        handler(state, cmd).await
    }
}

impl Default for Commands {
    fn default() -> Self {
        Self::builtin()
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn handle_login<'a>(state: &'a mut State, cmd: &'a Command) -> HandlerFuture<'a> {
    Box::pin(async move {
        let [name] = cmd.args.as_slice() else {
            return Err(CommandError::Usage("login <username>"));
        };

        let user = match state.db.get_user(name).await {
            Ok(user) => user,
            Err(StoreError::NotFound) => return Err(CommandError::UnknownUser(name.clone())),
            Err(err) => return Err(err.into()),
        };

        state.config.set_user(&user.name);
        state.config.save(&state.config_path)?;

        println!("Logged in as {}", user.name);
        Ok(())
    })
}

fn handle_register<'a>(state: &'a mut State, cmd: &'a Command) -> HandlerFuture<'a> {
    Box::pin(async move {
        let [name] = cmd.args.as_slice() else {
            return Err(CommandError::Usage("register <username>"));
        };

        let user = match state.db.create_user(&new_id(), name, Utc::now()).await {
            Ok(user) => user,
            Err(StoreError::DuplicateKey(_)) => return Err(CommandError::UserExists(name.clone())),
            Err(err) => return Err(err.into()),
        };

        state.config.set_user(&user.name);
        state.config.save(&state.config_path)?;

        info!(user = %user.name, id = %user.id, "user registered");
        println!("User {} created and logged in", user.name);
        Ok(())
    })
}

fn handle_reset<'a>(state: &'a mut State, _cmd: &'a Command) -> HandlerFuture<'a> {
    Box::pin(async move {
        state.db.reset().await?;
        println!("Database reset");
        Ok(())
    })
}

fn handle_users<'a>(state: &'a mut State, _cmd: &'a Command) -> HandlerFuture<'a> {
    Box::pin(async move {
        let current = state.config.current_user();
        for name in state.db.list_users().await? {
            if Some(name.as_str()) == current {
                println!(" * {} (current)", name);
            } else {
                println!(" * {}", name);
            }
        }
        Ok(())
    })
}

fn handle_agg<'a>(state: &'a mut State, cmd: &'a Command) -> HandlerFuture<'a> {
    Box::pin(async move {
        let [raw_interval] = cmd.args.as_slice() else {
            return Err(CommandError::Usage("agg <interval>, e.g. 30s, 1m or 1h"));
        };
        let interval = scheduler::parse_interval(raw_interval)?;

        println!("Collecting feeds every {}", raw_interval.trim());

        let db = &state.db;
        let fetcher = &state.fetcher;
        scheduler::run(
            interval,
            move || ingest::run_once(db, fetcher, &SystemClock),
            shutdown_signal(),
        )
        .await?;
        Ok(())
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
}

fn handle_add_feed<'a>(state: &'a mut State, cmd: &'a Command, user: User) -> HandlerFuture<'a> {
    Box::pin(async move {
        let [name, url] = cmd.args.as_slice() else {
            return Err(CommandError::Usage("addfeed <name> <url>"));
        };

        let now = Utc::now();
        let feed = match state.db.create_feed(&new_id(), &user.id, name, url, now).await {
            Ok(feed) => feed,
            Err(StoreError::DuplicateKey(_)) => return Err(CommandError::FeedExists(url.clone())),
            Err(err) => return Err(err.into()),
        };
        let follow = state
            .db
            .create_feed_follow(&new_id(), &user.id, &feed.id, now)
            .await?;

        info!(feed = %feed.name, url = %feed.url, user = %user.name, "feed added");
        println!("Added feed {} ({})", feed.name, feed.url);
        println!("{} now follows {}", follow.user_name, follow.feed_name);
        Ok(())
    })
}

fn handle_feeds<'a>(state: &'a mut State, _cmd: &'a Command) -> HandlerFuture<'a> {
    Box::pin(async move {
        let feeds = state.db.list_feeds().await?;
        if feeds.is_empty() {
            println!("No feeds registered");
            return Ok(());
        }
        for feed in feeds {
            println!(" * {} -- {} (added by {})", feed.name, feed.url, feed.user_name);
        }
        Ok(())
    })
}

async fn feed_id_for(db: &Database, url: &str) -> Result<String, CommandError> {
    match db.get_feed_id_by_url(url).await {
        Ok(id) => Ok(id),
        Err(StoreError::NotFound) => Err(CommandError::FeedNotFound(url.to_string())),
        Err(err) => Err(err.into()),
    }
}

fn handle_follow<'a>(state: &'a mut State, cmd: &'a Command, user: User) -> HandlerFuture<'a> {
    Box::pin(async move {
        let [url] = cmd.args.as_slice() else {
            return Err(CommandError::Usage("follow <url>"));
        };

        let feed_id = feed_id_for(&state.db, url).await?;
        let follow = match state
            .db
            .create_feed_follow(&new_id(), &user.id, &feed_id, Utc::now())
            .await
        {
            Ok(follow) => follow,
            Err(StoreError::DuplicateKey(_)) => {
                return Err(CommandError::AlreadyFollowing {
                    user: user.name,
                    url: url.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        println!("{} now follows {}", follow.user_name, follow.feed_name);
        Ok(())
    })
}

fn handle_unfollow<'a>(state: &'a mut State, cmd: &'a Command, user: User) -> HandlerFuture<'a> {
    Box::pin(async move {
        let [url] = cmd.args.as_slice() else {
            return Err(CommandError::Usage("unfollow <url>"));
        };

        let feed_id = feed_id_for(&state.db, url).await?;
        match state.db.delete_feed_follow(&user.id, &feed_id).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                return Err(CommandError::NotFollowing {
                    user: user.name,
                    url: url.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        }

        println!("{} unfollowed {}", user.name, url);
        Ok(())
    })
}

fn handle_following<'a>(state: &'a mut State, _cmd: &'a Command, user: User) -> HandlerFuture<'a> {
    Box::pin(async move {
        let follows = state.db.list_feed_follows_for_user(&user.id).await?;
        println!("{} follows {} feed(s)", user.name, follows.len());
        for follow in follows {
            println!(" * {} -- {}", follow.feed_name, follow.url);
        }
        Ok(())
    })
}

fn parse_limit(args: &[String]) -> Result<i64, CommandError> {
    match args {
        [] => Ok(DEFAULT_BROWSE_LIMIT),
        [raw] => match raw.parse::<i64>() {
            Ok(limit) if limit > 0 => Ok(limit),
            _ => Err(CommandError::InvalidLimit(raw.clone())),
        },
        _ => Err(CommandError::Usage("browse [limit]")),
    }
}

fn handle_browse<'a>(state: &'a mut State, cmd: &'a Command, user: User) -> HandlerFuture<'a> {
    Box::pin(async move {
        let limit = parse_limit(&cmd.args)?;
        let posts = state.db.list_posts_for_user(&user.id, limit).await?;

        if posts.is_empty() {
            println!("No posts yet, follow a feed and run `gator agg`");
            return Ok(());
        }

        for post in posts {
            match post.published_at {
                Some(published) => println!("{} ({})", post.title, published.format("%a %d %b %Y %H:%M")),
                None => println!("{}", post.title),
            }
            println!("    {}", post.url);
            if let Some(description) = post.description {
                println!("    {}", description);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE_NAME;
    use crate::fetcher::DEFAULT_DEADLINE;
    use tempfile::TempDir;

    async fn test_state(dir: &TempDir) -> State {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();

        State {
            config: Config::new("sqlite::memory:"),
            config_path: dir.path().join(CONFIG_FILE_NAME),
            db,
            fetcher: Fetcher::new(DEFAULT_DEADLINE).unwrap(),
        }
    }

    fn cmd(name: &str, args: &[&str]) -> Command {
        Command::new(name, args.iter().copied())
    }

    async fn run(state: &mut State, name: &str, args: &[&str]) -> Result<(), CommandError> {
        Commands::builtin().run(state, &cmd(name, args)).await
    }

    mod registry_tests {
        use super::*;

        #[test]
        fn test_from_args() {
            let args = vec!["follow".to_string(), "https://example.com/rss".to_string()];
            let command = Command::from_args(args).unwrap();
            assert_eq!(command, cmd("follow", &["https://example.com/rss"]));

            assert_eq!(Command::from_args(Vec::<String>::new()), None);
        }

        #[test]
        fn test_builtin_names() {
            assert_eq!(
                Commands::builtin().names(),
                vec![
                    "addfeed", "agg", "browse", "feeds", "follow", "following", "login",
                    "register", "reset", "unfollow", "users"
                ]
            );
        }

        #[test]
        fn test_contains() {
            let commands = Commands::builtin();
            assert!(commands.contains("agg"));
            assert!(commands.contains("browse"));
            assert!(!commands.contains("frobnicate"));
            assert!(!Commands::new().contains("agg"));
        }

        #[tokio::test]
        async fn test_unknown_command() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            let result = run(&mut state, "frobnicate", &[]).await;
            assert!(matches!(result, Err(CommandError::NotFound(name)) if name == "frobnicate"));
        }

        #[tokio::test]
        async fn test_missing_arguments() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            for name in ["login", "register", "agg"] {
                let result = run(&mut state, name, &[]).await;
                assert!(matches!(result, Err(CommandError::Usage(_))), "{}", name);
            }
        }
    }

    mod user_tests {
        use super::*;

        #[tokio::test]
        async fn test_register_logs_in_and_saves_config() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            run(&mut state, "register", &["kahya"]).await.unwrap();

            assert_eq!(state.config.current_user(), Some("kahya"));
            let saved = Config::load(&state.config_path).unwrap();
            assert_eq!(saved.current_user(), Some("kahya"));
            assert_eq!(state.db.get_user("kahya").await.unwrap().name, "kahya");
        }

        #[tokio::test]
        async fn test_register_twice_fails() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            run(&mut state, "register", &["kahya"]).await.unwrap();
            let result = run(&mut state, "register", &["kahya"]).await;
            assert!(matches!(result, Err(CommandError::UserExists(name)) if name == "kahya"));
        }

        #[tokio::test]
        async fn test_login_unknown_user_leaves_config_untouched() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            let result = run(&mut state, "login", &["nobody"]).await;

            assert!(matches!(result, Err(CommandError::UnknownUser(name)) if name == "nobody"));
            assert_eq!(state.config.current_user(), None);
            assert!(!state.config_path.exists());
        }

        #[tokio::test]
        async fn test_login_switches_user() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            run(&mut state, "register", &["kahya"]).await.unwrap();
            run(&mut state, "register", &["holgith"]).await.unwrap();
            run(&mut state, "login", &["kahya"]).await.unwrap();

            assert_eq!(state.config.current_user(), Some("kahya"));
            assert_eq!(
                Config::load(&state.config_path).unwrap().current_user(),
                Some("kahya")
            );
        }

        #[tokio::test]
        async fn test_reset_removes_everything() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            run(&mut state, "register", &["kahya"]).await.unwrap();
            run(&mut state, "addfeed", &["Blog", "https://blog.example.com/rss"])
                .await
                .unwrap();
            run(&mut state, "reset", &[]).await.unwrap();

            assert!(state.db.list_users().await.unwrap().is_empty());
            assert!(state.db.list_feeds().await.unwrap().is_empty());
        }
    }

    mod middleware_tests {
        use super::*;

        fn expect_kahya<'a>(_state: &'a mut State, cmd: &'a Command, user: User) -> HandlerFuture<'a> {
            Box::pin(async move {
                assert_eq!(user.name, "kahya");
                assert_eq!(cmd.args, vec!["x".to_string()]);
                Ok(())
            })
        }

        fn never_called<'a>(_state: &'a mut State, _cmd: &'a Command, _user: User) -> HandlerFuture<'a> {
            Box::pin(async move { Err(CommandError::Usage("handler ran without a user")) })
        }

        #[tokio::test]
        async fn test_passes_resolved_user() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;
            state.db.create_user("u1", "kahya", Utc::now()).await.unwrap();
            state.config.set_user("kahya");

            let mut commands = Commands::new();
            commands.register("probe", logged_in(expect_kahya));
            commands.run(&mut state, &cmd("probe", &["x"])).await.unwrap();
        }

        #[tokio::test]
        async fn test_no_user_configured() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            let mut commands = Commands::new();
            commands.register("probe", logged_in(never_called));
            let result = commands.run(&mut state, &cmd("probe", &[])).await;

            assert!(matches!(result, Err(CommandError::NotLoggedIn)));
        }

        #[tokio::test]
        async fn test_configured_user_missing_from_database() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;
            state.config.set_user("ghost");

            let mut commands = Commands::new();
            commands.register("probe", logged_in(never_called));
            let result = commands.run(&mut state, &cmd("probe", &[])).await;

            assert!(matches!(result, Err(CommandError::NotLoggedIn)));
        }

        #[tokio::test]
        async fn test_addfeed_without_login_writes_nothing() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            let result = run(&mut state, "addfeed", &["Blog", "https://blog.example.com/rss"]).await;

            assert!(matches!(result, Err(CommandError::NotLoggedIn)));
            assert!(state.db.list_feeds().await.unwrap().is_empty());
        }
    }

    mod feed_tests {
        use super::*;

        const URL: &str = "https://blog.example.com/rss";

        async fn logged_in_state(dir: &TempDir, name: &str) -> State {
            let mut state = test_state(dir).await;
            run(&mut state, "register", &[name]).await.unwrap();
            state
        }

        #[tokio::test]
        async fn test_addfeed_creates_feed_and_follow() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = logged_in_state(&dir, "kahya").await;

            run(&mut state, "addfeed", &["Blog", URL]).await.unwrap();

            let feeds = state.db.list_feeds().await.unwrap();
            assert_eq!(feeds.len(), 1);
            assert_eq!(feeds[0].name, "Blog");
            assert_eq!(feeds[0].user_name, "kahya");

            let user = state.db.get_user("kahya").await.unwrap();
            let follows = state.db.list_feed_follows_for_user(&user.id).await.unwrap();
            assert_eq!(follows.len(), 1);
            assert_eq!(follows[0].url, URL);
        }

        #[tokio::test]
        async fn test_addfeed_duplicate_url() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = logged_in_state(&dir, "kahya").await;

            run(&mut state, "addfeed", &["Blog", URL]).await.unwrap();
            let result = run(&mut state, "addfeed", &["Same Blog", URL]).await;

            assert!(matches!(result, Err(CommandError::FeedExists(url)) if url == URL));
        }

        #[tokio::test]
        async fn test_follow_unknown_url() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = logged_in_state(&dir, "kahya").await;

            let err = run(&mut state, "follow", &[URL]).await.unwrap_err();

            assert!(matches!(err, CommandError::FeedNotFound(_)));
            assert!(err.to_string().contains("add it first"));
            let user = state.db.get_user("kahya").await.unwrap();
            assert!(state
                .db
                .list_feed_follows_for_user(&user.id)
                .await
                .unwrap()
                .is_empty());
        }

        #[tokio::test]
        async fn test_follow_and_unfollow() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = logged_in_state(&dir, "kahya").await;
            run(&mut state, "addfeed", &["Blog", URL]).await.unwrap();

            run(&mut state, "register", &["holgith"]).await.unwrap();
            run(&mut state, "follow", &[URL]).await.unwrap();

            let result = run(&mut state, "follow", &[URL]).await;
            assert!(matches!(result, Err(CommandError::AlreadyFollowing { .. })));

            run(&mut state, "unfollow", &[URL]).await.unwrap();
            let result = run(&mut state, "unfollow", &[URL]).await;
            assert!(matches!(result, Err(CommandError::NotFollowing { .. })));

            let kahya = state.db.get_user("kahya").await.unwrap();
            assert_eq!(
                state.db.list_feed_follows_for_user(&kahya.id).await.unwrap().len(),
                1
            );
        }

        #[tokio::test]
        async fn test_browse_limits() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = logged_in_state(&dir, "kahya").await;

            run(&mut state, "browse", &[]).await.unwrap();
            run(&mut state, "browse", &["5"]).await.unwrap();

            for bad in ["0", "-3", "many"] {
                let result = run(&mut state, "browse", &[bad]).await;
                assert!(matches!(result, Err(CommandError::InvalidLimit(_))), "{}", bad);
            }
        }

        #[test]
        fn test_parse_limit() {
            assert_eq!(parse_limit(&[]).unwrap(), DEFAULT_BROWSE_LIMIT);
            assert_eq!(parse_limit(&["10".to_string()]).unwrap(), 10);
            assert!(matches!(
                parse_limit(&["1".to_string(), "2".to_string()]),
                Err(CommandError::Usage(_))
            ));
        }

        #[tokio::test]
        async fn test_agg_rejects_bad_interval() {
            let dir = tempfile::tempdir().unwrap();
            let mut state = test_state(&dir).await;

            let result = run(&mut state, "agg", &["soon"]).await;
            assert!(matches!(result, Err(CommandError::Interval(_))));
        }
    }
}
