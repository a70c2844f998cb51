use std::collections::HashMap;

use async_trait::async_trait;
use sea_orm::sea_query::Index;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Schema, Statement,
};
use time::OffsetDateTime;

use modelmux_common::{
    CircuitBreakerOverride, MigrationPolicy, ProviderType, QuotaPolicy, RouteCapability, Upstream,
    UpstreamId,
};
use modelmux_routing::{
    CircuitState, HealthRecord, LatencyAggregate, PersistedCircuitState, RoutingSnapshot,
};

use crate::entities;
use crate::storage::{
    AggregateWindow, CircuitExpectation, HealthPatch, RequestLogInsert, Storage, StorageError,
    StorageResult, UpstreamWithState,
};

#[derive(Debug, FromQueryResult)]
struct PercentileRow {
    p50: Option<f64>,
    p95: Option<f64>,
    p99: Option<f64>,
}

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Ensure sqlite enforces foreign keys (required for cascade + integrity).
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn ensure_performance_indexes(&self) -> StorageResult<()> {
        use entities::request_logs::Column as LogColumn;
        use entities::upstreams::Column as UpstreamColumn;

        let statements = vec![
            Index::create()
                .name("idx_request_logs_upstream_at")
                .table(entities::RequestLogs)
                .col(LogColumn::UpstreamId)
                .col(LogColumn::At)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_request_logs_at")
                .table(entities::RequestLogs)
                .col(LogColumn::At)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstreams_provider_active")
                .table(entities::Upstreams)
                .col(UpstreamColumn::ProviderType)
                .col(UpstreamColumn::Active)
                .if_not_exists()
                .to_owned(),
        ];

        for statement in statements {
            self.db.execute(&statement).await?;
        }
        Ok(())
    }

    async fn latency_at_offset(
        &self,
        upstream_id: UpstreamId,
        window: &AggregateWindow,
        offset: u64,
    ) -> StorageResult<Option<i64>> {
        use entities::request_logs::Column;
        let row = entities::RequestLogs::find()
            .filter(Column::UpstreamId.eq(upstream_id))
            .filter(Column::At.gte(window.from))
            .filter(Column::At.lt(window.to))
            .filter(Column::LatencyMs.is_not_null())
            .order_by_asc(Column::LatencyMs)
            .offset(offset)
            .one(&self.db)
            .await?;
        Ok(row.and_then(|model| model.latency_ms))
    }

    async fn percentiles_sorted_offset(
        &self,
        upstream_id: UpstreamId,
        window: &AggregateWindow,
        samples: u64,
    ) -> StorageResult<(Option<f64>, Option<f64>, Option<f64>)> {
        let offset_for = |fraction: f64| (((samples - 1) as f64) * fraction).round() as u64;
        let p50 = self
            .latency_at_offset(upstream_id, window, offset_for(0.50))
            .await?;
        let p95 = self
            .latency_at_offset(upstream_id, window, offset_for(0.95))
            .await?;
        let p99 = self
            .latency_at_offset(upstream_id, window, offset_for(0.99))
            .await?;
        Ok((
            p50.map(|v| v as f64),
            p95.map(|v| v as f64),
            p99.map(|v| v as f64),
        ))
    }

    async fn percentiles_postgres(
        &self,
        upstream_id: UpstreamId,
        window: &AggregateWindow,
    ) -> StorageResult<(Option<f64>, Option<f64>, Option<f64>)> {
        let statement = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            r#"SELECT
                 CAST(PERCENTILE_CONT(0.50) WITHIN GROUP (ORDER BY latency_ms) AS DOUBLE PRECISION) AS p50,
                 CAST(PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY latency_ms) AS DOUBLE PRECISION) AS p95,
                 CAST(PERCENTILE_CONT(0.99) WITHIN GROUP (ORDER BY latency_ms) AS DOUBLE PRECISION) AS p99
               FROM request_logs
               WHERE upstream_id = $1 AND at >= $2 AND at < $3 AND latency_ms IS NOT NULL"#,
            [upstream_id.into(), window.from.into(), window.to.into()],
        );
        let row = PercentileRow::find_by_statement(statement)
            .one(&self.db)
            .await?;
        Ok(row
            .map(|row| (row.p50, row.p95, row.p99))
            .unwrap_or((None, None, None)))
    }
}

fn parse_circuit_state(value: &str) -> Option<CircuitState> {
    match value {
        "closed" => Some(CircuitState::Closed),
        "open" => Some(CircuitState::Open),
        "half_open" => Some(CircuitState::HalfOpen),
        _ => None,
    }
}

fn upstream_from_model(model: entities::upstreams::Model) -> StorageResult<Upstream> {
    let provider_type = ProviderType::parse(&model.provider_type).ok_or_else(|| {
        StorageError::InvalidRow(format!("unknown provider type: {}", model.provider_type))
    })?;
    let raw_capabilities: Vec<String> = serde_json::from_value(model.route_capabilities)?;
    // Unknown tokens are dropped here; the capability normalizer rewrites the
    // persisted row on its own schedule.
    let route_capabilities = raw_capabilities
        .iter()
        .filter_map(|token| RouteCapability::parse(token.trim()))
        .collect();

    let allowed_models: Option<Vec<String>> = model
        .allowed_models
        .map(serde_json::from_value)
        .transpose()?;
    let model_redirects: Option<HashMap<String, String>> = model
        .model_redirects
        .map(serde_json::from_value)
        .transpose()?;
    let migration: Option<MigrationPolicy> = model
        .migration_policy
        .map(serde_json::from_value)
        .transpose()?;
    let quota: Option<QuotaPolicy> = model.quota_policy.map(serde_json::from_value).transpose()?;
    let breaker_override: Option<CircuitBreakerOverride> = model
        .breaker_override
        .map(serde_json::from_value)
        .transpose()?;

    Ok(Upstream {
        id: model.id,
        name: model.name,
        provider_type,
        base_url: model.base_url,
        api_key_encrypted: model.api_key_encrypted,
        active: model.active,
        weight: u32::try_from(model.weight).unwrap_or(0),
        priority: u32::try_from(model.priority).unwrap_or(0),
        route_capabilities,
        allowed_models,
        model_redirects,
        migration,
        quota,
        breaker_override,
    })
}

fn circuit_from_model(
    model: entities::circuit_states::Model,
) -> StorageResult<PersistedCircuitState> {
    let state = parse_circuit_state(&model.state)
        .ok_or_else(|| StorageError::InvalidRow(format!("unknown circuit state: {}", model.state)))?;
    let config_override: Option<CircuitBreakerOverride> = model
        .config_override
        .map(serde_json::from_value)
        .transpose()?;
    Ok(PersistedCircuitState {
        state,
        failure_count: u32::try_from(model.failure_count).unwrap_or(0),
        success_count: u32::try_from(model.success_count).unwrap_or(0),
        opened_at: model.opened_at,
        last_failure_at: model.last_failure_at,
        config_override,
    })
}

fn health_from_model(model: entities::health_records::Model) -> HealthRecord {
    HealthRecord {
        healthy: model.healthy,
        last_check_at: model.last_check_at,
        last_success_at: model.last_success_at,
        failure_count: u32::try_from(model.failure_count).unwrap_or(0),
        latency_ms: model.latency_ms.and_then(|v| u64::try_from(v).ok()),
        last_error: model.last_error,
    }
}

fn capabilities_json(capabilities: &[RouteCapability]) -> serde_json::Value {
    serde_json::Value::Array(
        capabilities
            .iter()
            .map(|capability| serde_json::Value::String(capability.as_str().to_string()))
            .collect(),
    )
}

/// Non-key circuit columns for a write; the caller decides whether the
/// primary key is part of the model (insert) or a filter (update).
fn circuit_active_columns(
    next: &PersistedCircuitState,
    version: i64,
    now: OffsetDateTime,
) -> StorageResult<entities::circuit_states::ActiveModel> {
    let config_override = next
        .config_override
        .map(serde_json::to_value)
        .transpose()?;
    Ok(entities::circuit_states::ActiveModel {
        upstream_id: ActiveValue::NotSet,
        state: ActiveValue::Set(next.state.as_str().to_string()),
        failure_count: ActiveValue::Set(next.failure_count as i32),
        success_count: ActiveValue::Set(next.success_count as i32),
        opened_at: ActiveValue::Set(next.opened_at),
        last_probe_at: ActiveValue::NotSet,
        last_failure_at: ActiveValue::Set(next.last_failure_at),
        config_override: ActiveValue::Set(config_override),
        version: ActiveValue::Set(version),
        updated_at: ActiveValue::Set(now),
    })
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Upstreams)
            .register(entities::CircuitStates)
            .register(entities::HealthRecords)
            .register(entities::RequestLogs)
            .sync(&self.db)
            .await?;
        self.ensure_performance_indexes().await?;
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<RoutingSnapshot> {
        let upstream_rows = entities::Upstreams::find().all(&self.db).await?;
        let mut upstreams = Vec::with_capacity(upstream_rows.len());
        for row in upstream_rows {
            upstreams.push(upstream_from_model(row)?);
        }

        let circuit_rows = entities::CircuitStates::find().all(&self.db).await?;
        let mut circuit_states = Vec::with_capacity(circuit_rows.len());
        for row in circuit_rows {
            let upstream_id = row.upstream_id;
            circuit_states.push((upstream_id, circuit_from_model(row)?));
        }

        let health_rows = entities::HealthRecords::find().all(&self.db).await?;
        let health_records = health_rows
            .into_iter()
            .map(|row| (row.upstream_id, health_from_model(row)))
            .collect();

        Ok(RoutingSnapshot {
            upstreams,
            circuit_states,
            health_records,
        })
    }

    async fn upsert_upstream(&self, upstream: &Upstream) -> StorageResult<()> {
        use entities::upstreams::{ActiveModel as UpstreamActive, Column};

        let now = OffsetDateTime::now_utc();
        let allowed_models = upstream
            .allowed_models
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let model_redirects = upstream
            .model_redirects
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let migration_policy = upstream.migration.map(serde_json::to_value).transpose()?;
        let quota_policy = upstream.quota.map(serde_json::to_value).transpose()?;
        let breaker_override = upstream
            .breaker_override
            .map(serde_json::to_value)
            .transpose()?;

        let existing = entities::Upstreams::find()
            .filter(Column::Id.eq(upstream.id))
            .one(&self.db)
            .await?;

        let mut active = UpstreamActive {
            id: ActiveValue::Set(upstream.id),
            name: ActiveValue::Set(upstream.name.clone()),
            provider_type: ActiveValue::Set(upstream.provider_type.as_str().to_string()),
            base_url: ActiveValue::Set(upstream.base_url.clone()),
            api_key_encrypted: ActiveValue::Set(upstream.api_key_encrypted.clone()),
            active: ActiveValue::Set(upstream.active),
            weight: ActiveValue::Set(upstream.weight as i32),
            priority: ActiveValue::Set(upstream.priority as i32),
            route_capabilities: ActiveValue::Set(capabilities_json(&upstream.route_capabilities)),
            allowed_models: ActiveValue::Set(allowed_models),
            model_redirects: ActiveValue::Set(model_redirects),
            migration_policy: ActiveValue::Set(migration_policy),
            quota_policy: ActiveValue::Set(quota_policy),
            breaker_override: ActiveValue::Set(breaker_override),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };

        match existing {
            Some(model) => {
                active.created_at = ActiveValue::Set(model.created_at);
                active.update(&self.db).await?;
            }
            None => {
                entities::Upstreams::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn set_upstream_active(
        &self,
        upstream_id: UpstreamId,
        active: bool,
    ) -> StorageResult<()> {
        let Some(model) = entities::Upstreams::find_by_id(upstream_id)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let mut row: entities::upstreams::ActiveModel = model.into();
        row.active = ActiveValue::Set(active);
        row.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        row.update(&self.db).await?;
        Ok(())
    }

    async fn find_upstreams_by_provider_type(
        &self,
        provider_type: ProviderType,
    ) -> StorageResult<Vec<UpstreamWithState>> {
        use entities::upstreams::Column;

        let rows = entities::Upstreams::find()
            .filter(Column::ProviderType.eq(provider_type.as_str()))
            .filter(Column::Active.eq(true))
            .all(&self.db)
            .await?;

        let ids: Vec<UpstreamId> = rows.iter().map(|row| row.id).collect();
        let circuit_rows = entities::CircuitStates::find()
            .filter(entities::circuit_states::Column::UpstreamId.is_in(ids.clone()))
            .all(&self.db)
            .await?;
        let mut circuits = HashMap::with_capacity(circuit_rows.len());
        for row in circuit_rows {
            let upstream_id = row.upstream_id;
            circuits.insert(upstream_id, circuit_from_model(row)?);
        }

        let health_rows = entities::HealthRecords::find()
            .filter(entities::health_records::Column::UpstreamId.is_in(ids))
            .all(&self.db)
            .await?;
        let mut health: HashMap<UpstreamId, HealthRecord> = health_rows
            .into_iter()
            .map(|row| (row.upstream_id, health_from_model(row)))
            .collect();

        let mut joined = Vec::with_capacity(rows.len());
        for row in rows {
            let upstream = upstream_from_model(row)?;
            let circuit = circuits.remove(&upstream.id);
            let health = health.remove(&upstream.id);
            joined.push(UpstreamWithState {
                upstream,
                circuit,
                health,
            });
        }
        Ok(joined)
    }

    async fn update_route_capabilities(
        &self,
        upstream_id: UpstreamId,
        capabilities: &[RouteCapability],
    ) -> StorageResult<()> {
        let Some(model) = entities::Upstreams::find_by_id(upstream_id)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };
        let canonical = capabilities_json(capabilities);
        if model.route_capabilities == canonical {
            return Ok(());
        }
        let mut row: entities::upstreams::ActiveModel = model.into();
        row.route_capabilities = ActiveValue::Set(canonical);
        row.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        row.update(&self.db).await?;
        Ok(())
    }

    async fn circuit_get(
        &self,
        upstream_id: UpstreamId,
    ) -> StorageResult<Option<PersistedCircuitState>> {
        let row = entities::CircuitStates::find_by_id(upstream_id)
            .one(&self.db)
            .await?;
        row.map(circuit_from_model).transpose()
    }

    async fn circuit_upsert_conditional(
        &self,
        upstream_id: UpstreamId,
        expected: Option<CircuitExpectation>,
        next: &PersistedCircuitState,
    ) -> StorageResult<bool> {
        use entities::circuit_states::Column;

        let now = OffsetDateTime::now_utc();
        match expected {
            Some(expected) => {
                let active = circuit_active_columns(next, expected.version + 1, now)?;
                let result = entities::CircuitStates::update_many()
                    .set(active)
                    .filter(Column::UpstreamId.eq(upstream_id))
                    .filter(Column::State.eq(expected.state.as_str()))
                    .filter(Column::Version.eq(expected.version))
                    .exec(&self.db)
                    .await?;
                Ok(result.rows_affected == 1)
            }
            None => {
                if entities::CircuitStates::find_by_id(upstream_id)
                    .one(&self.db)
                    .await?
                    .is_some()
                {
                    return Ok(false);
                }
                let mut active = circuit_active_columns(next, 1, now)?;
                active.upstream_id = ActiveValue::Set(upstream_id);
                entities::CircuitStates::insert(active).exec(&self.db).await?;
                Ok(true)
            }
        }
    }

    async fn circuit_set(
        &self,
        upstream_id: UpstreamId,
        state: &PersistedCircuitState,
    ) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::CircuitStates::find_by_id(upstream_id)
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let version = model.version + 1;
                let mut active = circuit_active_columns(state, version, now)?;
                active.upstream_id = ActiveValue::Set(upstream_id);
                active.update(&self.db).await?;
            }
            None => {
                let mut active = circuit_active_columns(state, 1, now)?;
                active.upstream_id = ActiveValue::Set(upstream_id);
                entities::CircuitStates::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn health_update(
        &self,
        upstream_id: UpstreamId,
        patch: HealthPatch,
    ) -> StorageResult<()> {
        use entities::health_records::ActiveModel as HealthActive;

        let now = OffsetDateTime::now_utc();
        let existing = entities::HealthRecords::find_by_id(upstream_id)
            .one(&self.db)
            .await?;
        let exists = existing.is_some();

        let mut active: HealthActive = match existing {
            Some(model) => model.into(),
            None => HealthActive {
                upstream_id: ActiveValue::Set(upstream_id),
                healthy: ActiveValue::Set(true),
                last_check_at: ActiveValue::Set(None),
                last_success_at: ActiveValue::Set(None),
                failure_count: ActiveValue::Set(0),
                latency_ms: ActiveValue::Set(None),
                last_error: ActiveValue::Set(None),
                updated_at: ActiveValue::Set(now),
            },
        };

        if let Some(healthy) = patch.healthy {
            active.healthy = ActiveValue::Set(healthy);
        }
        if let Some(failure_count) = patch.failure_count {
            active.failure_count = ActiveValue::Set(failure_count as i32);
        }
        if let Some(latency_ms) = patch.latency_ms {
            active.latency_ms = ActiveValue::Set(Some(latency_ms as i64));
        }
        if let Some(last_error) = patch.last_error {
            active.last_error = ActiveValue::Set(last_error);
        }
        if let Some(last_check_at) = patch.last_check_at {
            active.last_check_at = ActiveValue::Set(Some(last_check_at));
        }
        if let Some(last_success_at) = patch.last_success_at {
            active.last_success_at = ActiveValue::Set(Some(last_success_at));
        }
        active.updated_at = ActiveValue::Set(now);

        if exists {
            active.update(&self.db).await?;
        } else {
            entities::HealthRecords::insert(active).exec(&self.db).await?;
        }
        Ok(())
    }

    async fn health_get(&self, upstream_id: UpstreamId) -> StorageResult<Option<HealthRecord>> {
        let row = entities::HealthRecords::find_by_id(upstream_id)
            .one(&self.db)
            .await?;
        Ok(row.map(health_from_model))
    }

    async fn append_request_log(&self, row: RequestLogInsert) -> StorageResult<i64> {
        use entities::request_logs::ActiveModel as LogActive;

        let active = LogActive {
            id: ActiveValue::NotSet,
            upstream_id: ActiveValue::Set(row.upstream_id),
            at: ActiveValue::Set(row.at),
            provider_type: ActiveValue::Set(row.provider_type.as_str().to_string()),
            model: ActiveValue::Set(row.model),
            session_id: ActiveValue::Set(row.session_id),
            response_status: ActiveValue::Set(row.response_status),
            latency_ms: ActiveValue::Set(row.latency_ms),
            decision: ActiveValue::Set(row.decision),
        };
        let inserted = entities::RequestLogs::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn aggregate_request_logs(
        &self,
        upstream_id: UpstreamId,
        window: AggregateWindow,
    ) -> StorageResult<LatencyAggregate> {
        use entities::request_logs::Column;

        let scoped = entities::RequestLogs::find()
            .filter(Column::UpstreamId.eq(upstream_id))
            .filter(Column::At.gte(window.from))
            .filter(Column::At.lt(window.to));

        let sample_count = scoped.clone().count(&self.db).await?;
        if sample_count == 0 {
            return Ok(LatencyAggregate::default());
        }

        let ok_count = scoped
            .clone()
            .filter(Column::ResponseStatus.gte(200))
            .filter(Column::ResponseStatus.lt(300))
            .count(&self.db)
            .await?;
        let availability = ok_count as f64 / sample_count as f64;

        let latency_samples = scoped
            .filter(Column::LatencyMs.is_not_null())
            .count(&self.db)
            .await?;
        let (p50_ms, p95_ms, p99_ms) = if latency_samples == 0 {
            (None, None, None)
        } else if self.db.get_database_backend() == DatabaseBackend::Postgres {
            self.percentiles_postgres(upstream_id, &window).await?
        } else {
            self.percentiles_sorted_offset(upstream_id, &window, latency_samples)
                .await?
        };

        Ok(LatencyAggregate {
            sample_count,
            availability,
            p50_ms,
            p95_ms,
            p99_ms,
        })
    }
}
