use async_trait::async_trait;
use sea_orm::EntityTrait;

use modelmux_common::{RouteCapability, UpstreamId};
use modelmux_routing::CapabilityStore;

use crate::entities;
use crate::seaorm::SeaOrmStorage;
use crate::storage::{Storage, StorageError};

/// Lets the capability normalizer run directly against the sea-orm store.
#[async_trait]
impl CapabilityStore for SeaOrmStorage {
    async fn list_route_capabilities(&self) -> anyhow::Result<Vec<(UpstreamId, Vec<String>)>> {
        let rows = entities::Upstreams::find()
            .all(self.connection())
            .await
            .map_err(StorageError::from)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: Vec<String> =
                serde_json::from_value(row.route_capabilities).map_err(StorageError::from)?;
            out.push((row.id, raw));
        }
        Ok(out)
    }

    async fn update_route_capabilities(
        &self,
        upstream_id: UpstreamId,
        capabilities: &[RouteCapability],
    ) -> anyhow::Result<()> {
        Storage::update_route_capabilities(self, upstream_id, capabilities).await?;
        Ok(())
    }
}
