use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use podfeed::config::Config;
use podfeed::feed::FeedFetcher;
use podfeed::ingest::FeedIngestionService;
use podfeed::scheduler::{BatchOutcome, BatchReport, UpdateScheduler};
use podfeed::storage::{PodcastId, PodcastStore, SqliteStore, StoredPodcast};

/// Get the config directory path (~/.config/podfeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("podfeed"))
}

fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "podfeed", about = "Podcast RSS feed importer and updater")]
struct Args {
    /// Config file (default: ~/.config/podfeed/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the config file)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and parse a feed without storing it
    Preview {
        url: String,
        /// Print the parsed podcast as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import a podcast from its feed URL
    Import {
        url: String,
        /// Include the podcast in scheduled updates
        #[arg(long, conflicts_with = "no_auto_update")]
        auto_update: bool,
        /// Exclude the podcast from scheduled updates
        #[arg(long)]
        no_auto_update: bool,
    },
    /// Refresh one stored podcast from its feed
    Update { id: PodcastId },
    /// Refresh every stored podcast now
    UpdateAll,
    /// List stored podcasts
    List,
    /// Run the update scheduler until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let fetcher = FeedFetcher::with_user_agent(&config.user_agent, config.max_feed_size_bytes)
        .context("Failed to build HTTP client")?;

    if let Command::Preview { url, json } = &args.command {
        return preview(&fetcher, url, *json).await;
    }

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => {
            ensure_config_dir(&config_dir)?;
            config.database_path(&config_dir)
        }
    };
    let db_path_str = db_path.to_str().context("Database path is not valid UTF-8")?;
    let store: Arc<dyn PodcastStore> = Arc::new(
        SqliteStore::open(db_path_str)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );

    let service = Arc::new(FeedIngestionService::new(
        Arc::new(fetcher),
        Arc::clone(&store),
    ));

    match args.command {
        Command::Preview { .. } => Ok(()),
        Command::Import {
            url,
            auto_update,
            no_auto_update,
        } => {
            let auto_update = if auto_update {
                true
            } else if no_auto_update {
                false
            } else {
                config.default_auto_update
            };
            let podcast = service.fetch_and_parse(&url).await?;
            let stored = service.import_podcast(&url, podcast, auto_update).await?;
            println!(
                "Imported [{}] {} ({} episodes)",
                stored.id,
                stored.podcast.title,
                stored.podcast.episodes.len()
            );
            Ok(())
        }
        Command::Update { id } => {
            let existing = store
                .load(id)
                .await
                .with_context(|| format!("Podcast {} not found", id))?;
            let updated = service.update_podcast_from_feed(&existing).await?;
            println!(
                "Updated [{}] {} ({} episodes)",
                updated.id,
                updated.podcast.title,
                updated.podcast.episodes.len()
            );
            Ok(())
        }
        Command::UpdateAll => {
            let podcasts = store.list().await.context("Failed to list podcasts")?;
            let scheduler = build_scheduler(&config, service)?;
            let outcome = scheduler.trigger_manual_update(&podcasts).await?;
            print_outcome(&outcome);
            Ok(())
        }
        Command::List => {
            let podcasts = store.list().await.context("Failed to list podcasts")?;
            if podcasts.is_empty() {
                println!("No podcasts imported yet");
            }
            for podcast in &podcasts {
                print_podcast_line(podcast);
            }
            Ok(())
        }
        Command::Watch => {
            let scheduler = Arc::new(build_scheduler(&config, service)?);
            let handle = scheduler.start(Arc::clone(&store));
            println!("Watching for updates, press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            handle.stop().await;
            Ok(())
        }
    }
}

fn build_scheduler(config: &Config, service: Arc<FeedIngestionService>) -> Result<UpdateScheduler> {
    UpdateScheduler::builder()
        .update_interval(config.update_interval())
        .check_interval(config.check_interval())
        .updater(service)
        .build()
        .context("Invalid scheduler configuration")
}

async fn preview(fetcher: &FeedFetcher, url: &str, json: bool) -> Result<()> {
    use podfeed::feed::{parse_feed, FeedSource};

    let text = fetcher.fetch_text(url).await?;
    let podcast = parse_feed(&text).with_context(|| format!("Failed to parse feed {}", url))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&podcast)?);
        return Ok(());
    }

    println!("{}", podcast.title);
    if !podcast.author.is_empty() {
        println!("  by {}", podcast.author);
    }
    println!("  {} episodes", podcast.episodes.len());
    for episode in podcast.episodes.iter().take(10) {
        let duration = if episode.duration.is_empty() {
            "-"
        } else {
            episode.duration.as_str()
        };
        println!("  - {} [{}]", episode.title, duration);
    }
    Ok(())
}

fn print_podcast_line(podcast: &StoredPodcast) {
    let last_updated = podcast
        .last_updated
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "[{}] {} | {} episodes | auto-update: {} | last updated: {} | {}",
        podcast.id,
        podcast.podcast.title,
        podcast.podcast.episodes.len(),
        if podcast.auto_update { "on" } else { "off" },
        last_updated,
        podcast.rss_feed_url
    );
}

fn print_outcome(outcome: &BatchOutcome) {
    match outcome {
        BatchOutcome::Completed(BatchReport { updated, failed }) => {
            println!("Updated {} podcast(s), {} failed", updated.len(), failed.len());
            for (id, message) in failed {
                println!("  [{}] {}", id, message);
            }
        }
        BatchOutcome::Skipped(reason) => println!("Update skipped: {:?}", reason),
    }
}
