//! Database module - SQLx pools for the legacy MySQL source and the
//! PostgreSQL destination

use std::sync::Arc;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, MySqlPool, PgPool};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::services::SyncEngine;
use crate::store::{DestinationStore, LegacyStore, MySqlLegacyStore, PgDestinationStore};

/// Room for the concatenated line-item blobs of large invoices
const GROUP_CONCAT_SESSION: &str = "SET SESSION group_concat_max_len = 1048576";

/// Both connection pools
#[derive(Clone)]
pub struct Database {
    pub source: MySqlPool,
    pub destination: PgPool,
}

impl Database {
    /// Open both pools and bootstrap the sync schema
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let source_url = config.source_url()?;
        let destination_url = config.destination_url()?;

        log::info!(
            "Connecting to source database: {}",
            crate::config::mask_url(source_url)
        );
        let source = MySqlPoolOptions::new()
            .max_connections(config.source_max_connections)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute(GROUP_CONCAT_SESSION).await?;
                    Ok(())
                })
            })
            .connect(source_url)
            .await?;

        log::info!(
            "Connecting to destination database: {}",
            crate::config::mask_url(destination_url)
        );
        let destination = PgPoolOptions::new()
            .max_connections(config.destination_max_connections)
            .connect(destination_url)
            .await?;

        let db = Self {
            source,
            destination,
        };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Create the sync-owned schema. Business tables are never touched.
    async fn run_migrations(&self) -> Result<()> {
        log::info!("Running sync schema bootstrap...");

        sqlx::query("CREATE SCHEMA IF NOT EXISTS sync")
            .execute(&self.destination)
            .await?;

        // Legacy key -> destination primary key, written with every insert
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync.legacy_mapping (
                entity TEXT NOT NULL,
                legacy_key TEXT NOT NULL,
                internal_id TEXT NOT NULL,
                internal_created_at TIMESTAMP NOT NULL,
                migrated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (entity, legacy_key)
            )
            "#,
        )
        .execute(&self.destination)
        .await?;

        // Records that failed and have not been migrated since
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync.failed_record (
                job TEXT NOT NULL,
                legacy_key TEXT NOT NULL,
                record_at TIMESTAMP NOT NULL,
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                first_failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (job, legacy_key)
            )
            "#,
        )
        .execute(&self.destination)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failed_record_last ON sync.failed_record(last_failed_at DESC)",
        )
        .execute(&self.destination)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failed_record_job_at ON sync.failed_record(job, record_at)",
        )
        .execute(&self.destination)
        .await?;

        log::info!("Sync schema ready");
        Ok(())
    }

    /// Store implementations over the pools
    pub fn stores(&self) -> (Arc<dyn LegacyStore>, Arc<dyn DestinationStore>) {
        (
            Arc::new(MySqlLegacyStore::new(self.source.clone())),
            Arc::new(PgDestinationStore::new(self.destination.clone())),
        )
    }

    /// Sync engine over both pools
    pub fn engine(&self, config: SyncConfig) -> SyncEngine {
        let (legacy, destination) = self.stores();
        SyncEngine::new(legacy, destination, config)
    }

    /// Close both pools
    pub async fn close(&self) {
        self.source.close().await;
        self.destination.close().await;
    }
}
