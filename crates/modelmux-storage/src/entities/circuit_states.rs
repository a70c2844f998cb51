use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "circuit_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub upstream_id: Uuid,
    pub state: String,
    pub failure_count: i32,
    pub success_count: i32,
    pub opened_at: Option<OffsetDateTime>,
    pub last_probe_at: Option<OffsetDateTime>,
    pub last_failure_at: Option<OffsetDateTime>,
    pub config_override: Option<Json>,
    /// Optimistic concurrency column for conditional transitions.
    pub version: i64,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
