//! Cluster directory backed by the run_records table.
//!
//! The partial unique index on running rows makes the database the arbiter
//! of the cluster-wide at-most-one-running policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, SqlErr};
use uuid::Uuid;

use crate::cluster::{DirectoryEntry, ORPHANED_RUN_ERROR, RunDirectory};
use crate::entity::run_record::{self as run, ActiveModel, Entity as RunRecordEntity};
use crate::error::{AppError, AppResult};
use crate::models::{NodeId, RunId, RunState};

use super::DbPool;

impl TryFrom<run::Model> for DirectoryEntry {
    type Error = AppError;

    fn try_from(model: run::Model) -> Result<Self, Self::Error> {
        let state = RunState::parse(&model.state).ok_or_else(|| {
            AppError::Database(format!(
                "Invalid state '{}' for run {}",
                model.state, model.run_id
            ))
        })?;

        Ok(DirectoryEntry {
            run_id: RunId::from(model.run_id),
            test_id: model.test_id,
            node_id: NodeId::new(model.node_id),
            node_url: model.node_url,
            engine: model.engine,
            state,
            exclusive: model.exclusive,
            started_at: model.started_at,
            finished_at: model.finished_at,
            error: model.error_message,
        })
    }
}

fn active_model(entry: &DirectoryEntry) -> ActiveModel {
    ActiveModel {
        run_id: Set(entry.run_id.as_uuid()),
        test_id: Set(entry.test_id),
        node_id: Set(entry.node_id.as_str().to_string()),
        node_url: Set(entry.node_url.clone()),
        engine: Set(entry.engine.clone()),
        state: Set(entry.state.as_str().to_string()),
        exclusive: Set(entry.exclusive),
        error_message: Set(entry.error.clone()),
        started_at: Set(entry.started_at),
        finished_at: Set(entry.finished_at),
    }
}

#[async_trait]
impl RunDirectory for DbPool {
    async fn claim(&self, entry: &DirectoryEntry) -> AppResult<()> {
        let result = active_model(entry).insert(self.connection()).await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                let existing = self.running_for_test(entry.test_id).await?;
                Err(AppError::AlreadyRunning {
                    test_id: entry.test_id,
                    run_id: existing.map(|e| e.run_id).unwrap_or(entry.run_id),
                })
            }
            Err(e) => Err(AppError::Database(format!(
                "Failed to insert run record: {}",
                e
            ))),
        }
    }

    async fn locate(&self, run_id: RunId) -> AppResult<Option<DirectoryEntry>> {
        let model = RunRecordEntity::find_by_id(run_id.as_uuid())
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get run record: {}", e)))?;

        model.map(DirectoryEntry::try_from).transpose()
    }

    async fn running_for_test(&self, test_id: Uuid) -> AppResult<Option<DirectoryEntry>> {
        let model = RunRecordEntity::find()
            .filter(run::Column::TestId.eq(test_id))
            .filter(run::Column::State.eq(RunState::Running.as_str()))
            .one(self.connection())
            .await
            .map_err(|e| {
                AppError::Database(format!("Failed to get running record for test: {}", e))
            })?;

        model.map(DirectoryEntry::try_from).transpose()
    }

    async fn mark_terminal(
        &self,
        run_id: RunId,
        state: RunState,
        error: Option<String>,
    ) -> AppResult<bool> {
        let result = RunRecordEntity::update_many()
            .col_expr(run::Column::State, Expr::value(state.as_str()))
            .col_expr(run::Column::ErrorMessage, Expr::value(error))
            .col_expr(run::Column::FinishedAt, Expr::value(Utc::now()))
            .filter(run::Column::RunId.eq(run_id.as_uuid()))
            .filter(run::Column::State.eq(RunState::Running.as_str()))
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to update run record: {}", e)))?;

        Ok(result.rows_affected > 0)
    }

    async fn reap_node(&self, node_id: &NodeId) -> AppResult<u64> {
        let result = RunRecordEntity::update_many()
            .col_expr(run::Column::State, Expr::value(RunState::Failed.as_str()))
            .col_expr(
                run::Column::ErrorMessage,
                Expr::value(ORPHANED_RUN_ERROR.to_string()),
            )
            .col_expr(run::Column::FinishedAt, Expr::value(Utc::now()))
            .filter(run::Column::NodeId.eq(node_id.as_str()))
            .filter(run::Column::State.eq(RunState::Running.as_str()))
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to reap run records: {}", e)))?;

        Ok(result.rows_affected)
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = RunRecordEntity::delete_many()
            .filter(run::Column::State.ne(RunState::Running.as_str()))
            .filter(run::Column::FinishedAt.lt(cutoff))
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to purge run records: {}", e)))?;

        Ok(result.rows_affected)
    }
}
