//! Run record entity for SeaORM.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "run_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub run_id: Uuid,
    pub test_id: Uuid,
    pub node_id: String,
    /// Base URL of the owning node
    pub node_url: String,
    pub engine: String,
    /// running, stopped, completed, failed
    pub state: String,
    /// Subject to the one-running-run-per-test index
    pub exclusive: bool,
    pub error_message: Option<String>,
    pub started_at: DateTimeUtc,
    pub finished_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
