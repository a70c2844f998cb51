use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "health_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub upstream_id: Uuid,
    pub healthy: bool,
    pub last_check_at: Option<OffsetDateTime>,
    pub last_success_at: Option<OffsetDateTime>,
    pub failure_count: i32,
    pub latency_ms: Option<i64>,
    pub last_error: Option<String>,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
