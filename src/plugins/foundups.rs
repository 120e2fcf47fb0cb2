use crate::core::error::MarketError;
use crate::core::events::{EventPayload, EventRecord};
use crate::core::model::{Foundup, IdKind, MetadataPatch};
use crate::core::store::MarketStore;
use crate::core::time;
use std::sync::Arc;

/// Foundup creation, reads and write-once metadata updates.
#[derive(Clone)]
pub struct FoundupRegistry {
    store: Arc<dyn MarketStore>,
}

impl FoundupRegistry {
    pub fn new(store: Arc<dyn MarketStore>) -> Self {
        FoundupRegistry { store }
    }

    /// Token symbols are unique regardless of case.
    pub fn create_foundup(&self, mut foundup: Foundup) -> Result<Foundup, MarketError> {
        foundup.validate()?;
        if foundup.id.is_empty() {
            foundup.id = self.store.next_id(IdKind::Foundup);
        }
        let ts = time::now_epoch_z();
        foundup.created_at = ts.clone();
        foundup.updated_at = ts.clone();

        let event = EventRecord::new(
            self.store.next_id(IdKind::Event),
            &foundup.owner_id,
            EventPayload::FoundupCreated {
                name: foundup.name.clone(),
                token_symbol: foundup.token_symbol.clone(),
                owner_id: foundup.owner_id.clone(),
            },
            &ts,
        )
        .for_foundup(&foundup.id);
        let created = self.store.create_foundup(&foundup, &event)?;
        tracing::info!(foundup_id = %created.id, symbol = %created.token_symbol, "foundup created");
        Ok(created)
    }

    pub fn update_metadata(
        &self,
        foundup_id: &str,
        patch: &MetadataPatch,
        actor_id: &str,
    ) -> Result<Foundup, MarketError> {
        if patch.is_empty() {
            return Err(MarketError::ValidationError("metadata patch is empty".into()));
        }
        let ts = time::now_epoch_z();
        let event = EventRecord::new(
            self.store.next_id(IdKind::Event),
            actor_id,
            EventPayload::FoundupMetadataUpdated { keys: patch.keys() },
            &ts,
        )
        .for_foundup(foundup_id);
        let updated = self.store.update_foundup_metadata(foundup_id, patch, &event)?;
        tracing::info!(foundup_id, keys = ?patch.keys(), "foundup metadata updated");
        Ok(updated)
    }

    pub fn get(&self, foundup_id: &str) -> Result<Foundup, MarketError> {
        self.store.get_foundup(foundup_id)
    }

    pub fn list(&self) -> Result<Vec<Foundup>, MarketError> {
        self.store.list_foundups()
    }
}
