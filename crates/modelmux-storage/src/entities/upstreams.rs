use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstreams")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique_key = "upstream_name")]
    pub name: String,
    pub provider_type: String,
    pub base_url: String,
    pub api_key_encrypted: String,
    pub active: bool,
    pub weight: i32,
    pub priority: i32,
    pub route_capabilities: Json,
    pub allowed_models: Option<Json>,
    pub model_redirects: Option<Json>,
    pub migration_policy: Option<Json>,
    pub quota_policy: Option<Json>,
    pub breaker_override: Option<Json>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
