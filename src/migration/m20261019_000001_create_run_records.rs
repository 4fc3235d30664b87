//! Migration: Create run_records table.
//!
//! Cluster directory: one row per run, naming the node that owns it.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE TABLE run_records (
                    run_id UUID PRIMARY KEY, -- UUIDv7 for time-ordered sorting
                    test_id UUID NOT NULL,

                    -- Owning node and where peers reach it
                    node_id VARCHAR(255) NOT NULL,
                    node_url VARCHAR(500) NOT NULL,

                    engine VARCHAR(50) NOT NULL,
                    state VARCHAR(20) NOT NULL DEFAULT 'running'
                        CHECK (state IN ('running', 'stopped', 'completed', 'failed')),
                    exclusive BOOLEAN NOT NULL DEFAULT TRUE,
                    error_message TEXT,

                    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    finished_at TIMESTAMPTZ,

                    CHECK ((state = 'running') = (finished_at IS NULL))
                );

                -- At most one exclusive running run per load test, cluster-wide
                CREATE UNIQUE INDEX idx_run_records_running_test ON run_records(test_id)
                    WHERE state = 'running' AND exclusive;

                -- Startup reaping by node
                CREATE INDEX idx_run_records_node_running ON run_records(node_id)
                    WHERE state = 'running';

                -- Retention purge
                CREATE INDEX idx_run_records_finished_at ON run_records(finished_at)
                    WHERE finished_at IS NOT NULL;
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                DROP TABLE IF EXISTS run_records CASCADE;
                "#,
            )
            .await?;

        Ok(())
    }
}
