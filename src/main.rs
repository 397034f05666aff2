//! # Ingestion CLI
//!
//! Operational entry point for the ingestion workers.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingestion migrate` | Apply database migrations |
//! | `ingestion store-token` | Seed a tenant's HubSpot OAuth token |
//! | `ingestion access-token` | Print a valid access token, refreshing if needed |
//! | `ingestion refresh-token` | Force a refresh through the coordinator |
//! | `ingestion search` | Stream HubSpot search results as JSON lines |
//!
//! Logs go to stderr so `search` output can be piped.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use ingestion::{
    config::{AppConfig, ConfigLoader},
    connectors::{
        AccessTokenSource, HUBSPOT_PROVIDER_SLUG, HubSpotSearchSource, HubSpotTokenEndpoint,
        StaticAccessToken, TenantAccessToken,
    },
    crypto::CryptoKey,
    db,
    migration::{Migrator, MigratorTrait},
    pagination::{PaginationLimits, SearchPaginator, SearchWindow},
    repositories::SecretStore,
    retry::{RetryPolicy, Retrying},
    telemetry,
    token_refresh::{ClientCredentials, TokenRecord, TokenRefreshCoordinator, expiry_after},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ingestion", version, about = "Vendor ingestion workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,

    /// Store an OAuth token for a tenant (after an app install).
    StoreToken {
        #[arg(long)]
        tenant_id: Uuid,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: String,
        /// Seconds until the access token expires
        #[arg(long, default_value_t = 1800)]
        expires_in: i64,
    },

    /// Print an access token valid past the safety margin.
    AccessToken {
        #[arg(long)]
        tenant_id: Uuid,
    },

    /// Refresh the tenant's token unless another worker just did.
    RefreshToken {
        #[arg(long)]
        tenant_id: Uuid,
    },

    /// Stream every record of a CRM object modified in a time range.
    Search {
        #[arg(long)]
        tenant_id: Option<Uuid>,
        /// Private app token; bypasses the OAuth token store
        #[arg(long)]
        private_app_token: Option<String>,
        #[arg(long, default_value = "contacts")]
        object: String,
        #[arg(long, default_value = "hs_lastmodifieddate")]
        sort_field: String,
        /// Window start (RFC 3339)
        #[arg(long)]
        since: DateTime<Utc>,
        /// Window end (RFC 3339), defaults to now
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long = "property")]
        properties: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(configuration = %redacted, "Effective configuration");
    }

    let db = Arc::new(
        db::init_pool(&config)
            .await
            .context("initializing database connection pool")?,
    );
    db::health_check(&db).await?;

    match cli.command {
        Commands::Migrate => {
            Migrator::up(db.as_ref(), None)
                .await
                .context("applying migrations")?;
            info!("Migrations applied");
        }
        Commands::StoreToken {
            tenant_id,
            access_token,
            refresh_token,
            expires_in,
        } => {
            let expires_at = expiry_after(Utc::now(), expires_in)
                .with_context(|| format!("--expires-in {} is out of range", expires_in))?;
            let coordinator = build_coordinator(&config, db)?;
            let record = TokenRecord {
                access_token,
                refresh_token: Some(refresh_token),
                expires_at,
            };
            coordinator.store_token(tenant_id, &record).await?;
        }
        Commands::AccessToken { tenant_id } => {
            let coordinator = build_coordinator(&config, db)?;
            let token = coordinator.get_valid_access_token(tenant_id).await?;
            println!("{}", token);
        }
        Commands::RefreshToken { tenant_id } => {
            let coordinator = build_coordinator(&config, db)?;
            coordinator.refresh_token(tenant_id).await?;
            if let Some(record) = coordinator.load_token(tenant_id).await? {
                info!(%tenant_id, expires_at = %record.expires_at, "Token is current");
            }
        }
        Commands::Search {
            tenant_id,
            private_app_token,
            object,
            sort_field,
            since,
            until,
            properties,
        } => {
            let token: Arc<dyn AccessTokenSource> = match (private_app_token, tenant_id) {
                (Some(token), _) => Arc::new(StaticAccessToken::new(token)),
                (None, Some(tenant_id)) => Arc::new(TenantAccessToken::new(
                    Arc::new(build_coordinator(&config, db)?),
                    tenant_id,
                )),
                (None, None) => {
                    anyhow::bail!("either --tenant-id or --private-app-token is required")
                }
            };

            let until = until.unwrap_or_else(Utc::now);
            anyhow::ensure!(since <= until, "--since must not be after --until");
            let window = SearchWindow::new(since, until, sort_field);

            let source = HubSpotSearchSource::new(
                &config.hubspot_api_base,
                object,
                properties,
                config.search.page_limit,
                token,
            )?;
            let source = Retrying::new(source, RetryPolicy::from(&config.retry));

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_token.cancel();
                }
            });

            run_search(source, window, PaginationLimits::from(&config.search), shutdown).await?;
        }
    }

    Ok(())
}

fn build_coordinator(
    config: &AppConfig,
    db: Arc<DatabaseConnection>,
) -> Result<TokenRefreshCoordinator> {
    let key_bytes = config
        .crypto_key
        .clone()
        .context("crypto key not present in configuration")?;
    let secrets = SecretStore::new(CryptoKey::new(key_bytes).context("initializing crypto key")?);

    let endpoint = Retrying::new(
        HubSpotTokenEndpoint::new(&config.hubspot_oauth_base)?,
        RetryPolicy::from(&config.retry),
    );

    let credentials = match (&config.hubspot_client_id, &config.hubspot_client_secret) {
        (Some(client_id), Some(client_secret)) => Some(ClientCredentials {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
        }),
        _ => None,
    };

    Ok(TokenRefreshCoordinator::new(
        db,
        secrets,
        Arc::new(endpoint),
        credentials,
        HUBSPOT_PROVIDER_SLUG,
        config.token_refresh.clone(),
    ))
}

async fn run_search(
    source: Retrying<HubSpotSearchSource>,
    window: SearchWindow,
    limits: PaginationLimits,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut paginator = SearchPaginator::new(source, window, limits);
    let mut stdout = std::io::stdout().lock();
    let mut rows_written = 0u64;

    loop {
        let page = tokio::select! {
            _ = shutdown.cancelled() => {
                warn!(rows_written, "Search interrupted");
                break;
            }
            page = paginator.next_page() => page?,
        };

        let Some(rows) = page else {
            break;
        };

        for row in rows {
            serde_json::to_writer(&mut stdout, &row)?;
            stdout.write_all(b"\n")?;
            rows_written += 1;
        }
    }
    stdout.flush()?;

    let stats = paginator.stats();
    info!(
        rows_written,
        pages_fetched = stats.pages_fetched,
        window_slides = stats.window_slides,
        duplicates_filtered = stats.duplicates_filtered,
        final_window_start = %paginator.window().start,
        "Search finished"
    );
    Ok(())
}
