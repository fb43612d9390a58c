use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, SqlitePool,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use super::types::{PodcastId, PodcastStore, StoreError, StoredPodcast};
use crate::feed::{Episode, Owner, Podcast};

/// Episodes written per INSERT statement (16 binds each).
const EPISODE_BATCH_SIZE: usize = 100;

/// Podcast row insert; an id or feed URL that already exists is a constraint violation.
const INSERT_PODCAST: &str = r#"
    INSERT INTO podcasts (
        id, rss_feed_url, auto_update, import_date, last_updated,
        title, description, link, language, copyright, last_build_date,
        pub_date, generator, author, explicit, category, subcategory,
        image, owner_name, owner_email
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// Appended to [`INSERT_PODCAST`] for `save`.
const UPSERT_PODCAST: &str = r#"
    ON CONFLICT(id) DO UPDATE SET
        rss_feed_url = excluded.rss_feed_url,
        auto_update = excluded.auto_update,
        import_date = excluded.import_date,
        last_updated = excluded.last_updated,
        title = excluded.title,
        description = excluded.description,
        link = excluded.link,
        language = excluded.language,
        copyright = excluded.copyright,
        last_build_date = excluded.last_build_date,
        pub_date = excluded.pub_date,
        generator = excluded.generator,
        author = excluded.author,
        explicit = excluded.explicit,
        category = excluded.category,
        subcategory = excluded.subcategory,
        image = excluded.image,
        owner_name = excluded.owner_name,
        owner_email = excluded.owner_email
"#;

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Upsert,
    Insert,
}

// ============================================================================
// SqliteStore
// ============================================================================

/// SQLite-backed [`PodcastStore`].
///
/// Podcasts live in one row each; episodes are rewritten in feed order on
/// every save, inside the same transaction as the podcast row.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a database connection and run migrations.
    ///
    /// `":memory:"` opens a private in-memory database held by a single
    /// connection for the lifetime of the store.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Pre-create the database file user-only before SQLite touches it
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() && db_path.parent().is_some_and(|p| p.exists()) {
                // If creation fails, SQLite will report the error at connect_with.
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok();
            }
        }

        // busy_timeout=5000: concurrent writers wait for the lock instead of failing
        let options = SqliteConnectOptions::from_str(&url)?
            .pragma("busy_timeout", "5000")
            .foreign_keys(true);

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(10));
        pool_options = if in_memory {
            // Every connection would get its own empty database otherwise
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store
            .migrate()
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::debug!(path = %path, "Opened podcast database");
        Ok(store)
    }

    /// Create tables atomically. Idempotent (`IF NOT EXISTS` throughout).
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS podcasts (
                id INTEGER PRIMARY KEY,
                rss_feed_url TEXT UNIQUE NOT NULL,
                auto_update INTEGER NOT NULL DEFAULT 0,
                import_date INTEGER NOT NULL,
                last_updated INTEGER,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                link TEXT NOT NULL,
                language TEXT NOT NULL,
                copyright TEXT NOT NULL,
                last_build_date TEXT NOT NULL,
                pub_date TEXT NOT NULL,
                generator TEXT NOT NULL,
                author TEXT NOT NULL,
                explicit INTEGER NOT NULL DEFAULT 0,
                category TEXT NOT NULL,
                subcategory TEXT NOT NULL,
                image TEXT NOT NULL,
                owner_name TEXT NOT NULL,
                owner_email TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                podcast_id INTEGER NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                pub_date TEXT NOT NULL,
                link TEXT NOT NULL,
                guid TEXT NOT NULL,
                audio_url TEXT NOT NULL,
                audio_type TEXT NOT NULL,
                audio_size INTEGER NOT NULL DEFAULT 0,
                duration TEXT NOT NULL,
                explicit INTEGER NOT NULL DEFAULT 0,
                episode_number TEXT NOT NULL,
                season TEXT NOT NULL,
                episode_type TEXT NOT NULL,
                image TEXT NOT NULL,
                PRIMARY KEY (podcast_id, position)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Scheduler sweeps select by flag
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_podcasts_auto_update ON podcasts(auto_update)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn write(
        &self,
        stored: &StoredPodcast,
        mode: WriteMode,
    ) -> Result<StoredPodcast, StoreError> {
        let podcast = &stored.podcast;
        let sql = match mode {
            WriteMode::Insert => INSERT_PODCAST.to_string(),
            WriteMode::Upsert => format!("{INSERT_PODCAST} {UPSERT_PODCAST}"),
        };
        let mut tx = self.pool.begin().await?;

        sqlx::query(&sql)
            .bind(stored.id)
            .bind(&stored.rss_feed_url)
            .bind(stored.auto_update)
            .bind(stored.import_date.timestamp_millis())
            .bind(stored.last_updated.map(|t| t.timestamp_millis()))
            .bind(&podcast.title)
            .bind(&podcast.description)
            .bind(&podcast.link)
            .bind(&podcast.language)
            .bind(&podcast.copyright)
            .bind(&podcast.last_build_date)
            .bind(&podcast.pub_date)
            .bind(&podcast.generator)
            .bind(&podcast.author)
            .bind(podcast.explicit)
            .bind(&podcast.category)
            .bind(&podcast.subcategory)
            .bind(&podcast.image)
            .bind(&podcast.owner.name)
            .bind(&podcast.owner.email)
            .execute(&mut *tx)
            .await
            .map_err(reject_constraint_violation)?;

        sqlx::query("DELETE FROM episodes WHERE podcast_id = ?")
            .bind(stored.id)
            .execute(&mut *tx)
            .await?;

        let positioned: Vec<(usize, &Episode)> = podcast.episodes.iter().enumerate().collect();
        for chunk in positioned.chunks(EPISODE_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO episodes (podcast_id, position, title, description, pub_date, link, \
                 guid, audio_url, audio_type, audio_size, duration, explicit, episode_number, \
                 season, episode_type, image) ",
            );
            builder.push_values(chunk, |mut b, (position, episode)| {
                b.push_bind(stored.id)
                    .push_bind(*position as i64)
                    .push_bind(&episode.title)
                    .push_bind(&episode.description)
                    .push_bind(&episode.pub_date)
                    .push_bind(&episode.link)
                    .push_bind(&episode.guid)
                    .push_bind(&episode.audio_url)
                    .push_bind(&episode.audio_type)
                    .push_bind(i64::try_from(episode.audio_size).unwrap_or(i64::MAX))
                    .push_bind(&episode.duration)
                    .push_bind(episode.explicit)
                    .push_bind(&episode.episode_number)
                    .push_bind(&episode.season)
                    .push_bind(&episode.episode_type)
                    .push_bind(&episode.image);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            podcast_id = stored.id,
            episodes = podcast.episodes.len(),
            insert = matches!(mode, WriteMode::Insert),
            "Saved podcast"
        );

        // Timestamps are stored at millisecond precision; hand back what a load would see
        self.load(stored.id).await
    }

    async fn episodes_for(&self, id: PodcastId) -> Result<Vec<Episode>, StoreError> {
        let rows = sqlx::query_as::<_, EpisodeDbRow>(
            "SELECT * FROM episodes WHERE podcast_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EpisodeDbRow::into_episode).collect())
    }
}

#[async_trait]
impl PodcastStore for SqliteStore {
    async fn save(&self, stored: &StoredPodcast) -> Result<StoredPodcast, StoreError> {
        self.write(stored, WriteMode::Upsert).await
    }

    async fn insert(&self, stored: &StoredPodcast) -> Result<StoredPodcast, StoreError> {
        self.write(stored, WriteMode::Insert).await
    }

    async fn load(&self, id: PodcastId) -> Result<StoredPodcast, StoreError> {
        let row = sqlx::query_as::<_, PodcastDbRow>("SELECT * FROM podcasts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let episodes = self.episodes_for(id).await?;
        Ok(row.into_stored(episodes))
    }

    async fn list(&self) -> Result<Vec<StoredPodcast>, StoreError> {
        let rows = sqlx::query_as::<_, PodcastDbRow>("SELECT * FROM podcasts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        // One query for every episode instead of one per podcast
        let episode_rows = sqlx::query_as::<_, EpisodeDbRow>(
            "SELECT * FROM episodes ORDER BY podcast_id, position",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_podcast: HashMap<PodcastId, Vec<Episode>> = HashMap::new();
        for row in episode_rows {
            by_podcast
                .entry(row.podcast_id)
                .or_default()
                .push(row.into_episode());
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let episodes = by_podcast.remove(&row.id).unwrap_or_default();
                row.into_stored(episodes)
            })
            .collect())
    }

    async fn find_by_feed_url(&self, url: &str) -> Result<Option<StoredPodcast>, StoreError> {
        let id: Option<(i64,)> = sqlx::query_as("SELECT id FROM podcasts WHERE rss_feed_url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;

        match id {
            Some((id,)) => self.load(id).await.map(Some),
            None => Ok(None),
        }
    }
}

fn reject_constraint_violation(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::Rejected(db_err.message().to_string());
        }
    }
    StoreError::Database(err)
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct PodcastDbRow {
    id: i64,
    rss_feed_url: String,
    auto_update: bool,
    import_date: i64,
    last_updated: Option<i64>,
    title: String,
    description: String,
    link: String,
    language: String,
    copyright: String,
    last_build_date: String,
    pub_date: String,
    generator: String,
    author: String,
    explicit: bool,
    category: String,
    subcategory: String,
    image: String,
    owner_name: String,
    owner_email: String,
}

impl PodcastDbRow {
    fn into_stored(self, episodes: Vec<Episode>) -> StoredPodcast {
        StoredPodcast {
            id: self.id,
            rss_feed_url: self.rss_feed_url,
            auto_update: self.auto_update,
            import_date: millis_to_utc(self.import_date),
            last_updated: self.last_updated.map(millis_to_utc),
            podcast: Podcast {
                title: self.title,
                description: self.description,
                link: self.link,
                language: self.language,
                copyright: self.copyright,
                last_build_date: self.last_build_date,
                pub_date: self.pub_date,
                generator: self.generator,
                author: self.author,
                explicit: self.explicit,
                category: self.category,
                subcategory: self.subcategory,
                image: self.image,
                owner: Owner {
                    name: self.owner_name,
                    email: self.owner_email,
                },
                episodes,
            },
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EpisodeDbRow {
    podcast_id: i64,
    title: String,
    description: String,
    pub_date: String,
    link: String,
    guid: String,
    audio_url: String,
    audio_type: String,
    audio_size: i64,
    duration: String,
    explicit: bool,
    episode_number: String,
    season: String,
    episode_type: String,
    image: String,
}

impl EpisodeDbRow {
    fn into_episode(self) -> Episode {
        Episode {
            title: self.title,
            description: self.description,
            pub_date: self.pub_date,
            link: self.link,
            guid: self.guid,
            audio_url: self.audio_url,
            audio_type: self.audio_type,
            audio_size: u64::try_from(self.audio_size).unwrap_or(0),
            duration: self.duration,
            explicit: self.explicit,
            episode_number: self.episode_number,
            season: self.season,
            episode_type: self.episode_type,
            image: self.image,
        }
    }
}
