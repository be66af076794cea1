use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use moyclass_attendance_watch::config::Config;
use moyclass_attendance_watch::{db, report, risk};
use moyclass_attendance_watch::{
    CacheStore, ClassificationResult, Entity, EntityTable, FileCacheStore, LazyClient,
    PagedEntityLoader, PgCacheStore, QueryParams,
};

#[derive(Parser)]
#[command(name = "attendance-watch")]
#[command(about = "Loads MoyClass CRM data and flags students who stopped attending", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the Postgres cache schema
    InitDb,
    /// Load an entity collection into the cache
    Load {
        #[arg(value_enum)]
        entity: Entity,
        /// Query filter as key=value, may be repeated
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long)]
        refresh: bool,
    },
    /// Write an entity collection to a CSV file
    Export {
        #[arg(value_enum)]
        entity: Entity,
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        out: PathBuf,
    },
    /// Classify students by recent attendance
    Score {
        #[command(flatten)]
        scope: ScoreScope,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Generate a markdown report of struggling students
    Report {
        #[command(flatten)]
        scope: ScoreScope,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[derive(Args)]
struct ScoreScope {
    #[arg(long, default_value_t = 31)]
    window_days: i64,
    /// Client state a student must be in to be evaluated
    #[arg(long, default_value_t = risk::STUDYING_STATUS_ID)]
    status_id: i64,
    /// Only count classes joined with this join status
    #[arg(long)]
    join_status_id: Option<i64>,
    #[arg(long)]
    refresh: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to read configuration")?;

    let remote = LazyClient::new(config.base_url.clone(), config.api_key.clone());

    match cli.command {
        Commands::InitDb => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to use the Postgres cache")?;
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await
                .context("failed to connect to Postgres")?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Load {
            entity,
            params,
            refresh,
        } => {
            let loader = open_loader(&config).await?;
            let params = QueryParams::parse_pairs(&params)?;
            let table = load_entity(&loader, &remote, entity, &params, refresh).await?;
            println!(
                "{} {} rows loaded ({} columns).",
                table.len(),
                entity,
                table.columns().len()
            );
        }
        Commands::Export {
            entity,
            params,
            refresh,
            out,
        } => {
            let loader = open_loader(&config).await?;
            let params = QueryParams::parse_pairs(&params)?;
            let table = load_entity(&loader, &remote, entity, &params, refresh).await?;
            let written = report::write_table_csv(&table, &out)?;
            println!("Wrote {written} {entity} rows to {}.", out.display());
        }
        Commands::Score { scope, limit, csv } => {
            let loader = open_loader(&config).await?;
            let results = score(&loader, &remote, &scope).await?;
            if results.is_empty() {
                println!("No attendance found for this window.");
                return Ok(());
            }

            let struggling: Vec<_> = risk::struggling(&results).collect();
            println!("{} of {} students struggling:", struggling.len(), results.len());
            for result in struggling.iter().take(limit) {
                println!("- {}: {}", result.user_id, result.display_name);
            }

            if let Some(path) = csv {
                report::write_results_csv(&results, &path)?;
                println!("Results written to {}.", path.display());
            }
        }
        Commands::Report { scope, out } => {
            let loader = open_loader(&config).await?;
            let results = score(&loader, &remote, &scope).await?;
            let report = report::build_report(
                &results,
                scope.window_days,
                risk::cutoff_date(scope.window_days),
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn open_loader(config: &Config) -> anyhow::Result<PagedEntityLoader<Box<dyn CacheStore>>> {
    let cache = open_cache(config).await?;
    Ok(PagedEntityLoader::new(cache).with_default_limit(config.page_limit))
}

async fn open_cache(config: &Config) -> anyhow::Result<Box<dyn CacheStore>> {
    match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await
                .context("failed to connect to Postgres")?;
            info!("using Postgres entity cache");
            Ok(Box::new(PgCacheStore::new(pool)))
        }
        None => {
            info!(dir = %config.cache_dir.display(), "using file entity cache");
            Ok(Box::new(FileCacheStore::new(&config.cache_dir)))
        }
    }
}

async fn load_entity<C: CacheStore>(
    loader: &PagedEntityLoader<C>,
    remote: &LazyClient,
    entity: Entity,
    params: &QueryParams,
    refresh: bool,
) -> anyhow::Result<EntityTable> {
    loader
        .load(&remote.endpoint(entity), entity.name(), params, refresh)
        .await
        .with_context(|| format!("failed to load {entity}"))
}

async fn score<C: CacheStore>(
    loader: &PagedEntityLoader<C>,
    remote: &LazyClient,
    scope: &ScoreScope,
) -> anyhow::Result<Vec<ClassificationResult>> {
    let users = load_entity(loader, remote, Entity::Users, &QueryParams::new(), scope.refresh).await?;
    let profiles = risk::profiles_from_users(&users);

    let today = Utc::now().date_naive();
    let lesson_params = QueryParams::new()
        .and("date", risk::cutoff_date(scope.window_days).to_string())
        .and("date", today.to_string())
        .and("includeRecords", "true");
    let lessons = load_entity(loader, remote, Entity::Lessons, &lesson_params, scope.refresh).await?;

    let enrollments = match scope.join_status_id {
        Some(status_id) => {
            let joins =
                load_entity(loader, remote, Entity::Joins, &QueryParams::new(), scope.refresh).await?;
            Some(risk::enrollments_from_joins(&joins, "statusId", &json!(status_id)))
        }
        None => None,
    };

    Ok(risk::classify(
        &lessons,
        &profiles,
        enrollments.as_ref(),
        scope.window_days,
        risk::status_is(scope.status_id),
    ))
}
