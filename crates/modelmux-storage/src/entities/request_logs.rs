use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub upstream_id: Uuid,
    pub at: OffsetDateTime,
    pub provider_type: String,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub response_status: Option<i32>,
    pub latency_ms: Option<i64>,
    pub decision: Option<Json>,
}

impl ActiveModelBehavior for ActiveModel {}
