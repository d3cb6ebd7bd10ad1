//! # JSON Output Module
//!
//! Questo modulo gestisce l'output strutturato in JSON per host di embedding
//! (Electron, wrapper Python, test harness).
//!
//! ## Responsabilità:
//! - Emette messaggi JSON line-wise per gli eventi della pipeline
//! - Specchia lo stato degli item leggendo dallo store, mai duplicandolo
//! - Fornisce un'interfaccia standardizzata per comunicazione inter-processo
//!
//! ## Tipi di messaggi:
//! - `batch_start`: Inizio di un batch (numero item)
//! - `item_update`: Stato corrente di un item (status, progress, error)
//! - `item_removed`: Item rimosso dallo store
//! - `batch_complete`: Fine batch con statistiche aggregate
//! - `notice`: Messaggio informativo non bloccante (es. file rifiutati)

use crate::item::{ItemId, ItemStatus};
use crate::store::{ItemStore, StoreEvent};
use serde::Serialize;
use std::sync::Arc;

/// Tipo di messaggio JSON
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonEvent {
    /// Inizio di un batch
    BatchStart { items: usize },

    /// Stato corrente di un item
    ItemUpdate {
        id: ItemId,
        name: String,
        status: ItemStatus,
        progress: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Item rimosso dallo store
    ItemRemoved { id: ItemId },

    /// Batch completato
    BatchComplete {
        items: usize,
        completed: usize,
        errored: usize,
        input_bytes: u64,
        output_bytes: u64,
        duration_seconds: f64,
    },

    /// Messaggio informativo non bloccante
    Notice { message: String },
}

impl JsonEvent {
    /// Emette il messaggio JSON su stdout (una riga per evento)
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
        }
    }

    /// Snapshot di un item dallo store
    pub fn item_update(store: &ItemStore, id: ItemId) -> Option<Self> {
        store.with_item(id, |item| Self::ItemUpdate {
            id: item.id,
            name: item.name.clone(),
            status: item.status,
            progress: item.progress,
            error: item.error.clone(),
        })
    }
}

/// Specchia ogni mutazione dello store come evento JSON su stdout.
///
/// Ritorna l'id della subscription, da passare a `store.unsubscribe` quando
/// il mirror non serve più.
pub fn attach(store: Arc<ItemStore>) -> u64 {
    let mirror = store.clone();
    store.subscribe(move |event| match event {
        StoreEvent::Added(ids) => {
            for id in ids {
                if let Some(update) = JsonEvent::item_update(&mirror, *id) {
                    update.emit();
                }
            }
        }
        StoreEvent::Updated(id) => {
            if let Some(update) = JsonEvent::item_update(&mirror, *id) {
                update.emit();
            }
        }
        StoreEvent::Removed(id) => JsonEvent::ItemRemoved { id: *id }.emit(),
        StoreEvent::Cleared => JsonEvent::notice("store cleared").emit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{AppProfile, OutputFormat};
    use crate::item::ItemPatch;
    use crate::store::IntakeFile;

    #[test]
    fn test_item_update_serializes_without_null_error() {
        let store = ItemStore::new(AppProfile::Image);
        let report = store.add(vec![IntakeFile::new("a.jpg", vec![0])], OutputFormat::WebP);
        let event = JsonEvent::item_update(&store, report.accepted[0]).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"item_update""#));
        assert!(json.contains(r#""status":"pending""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_errored_item_carries_message() {
        let store = ItemStore::new(AppProfile::Image);
        let report = store.add(vec![IntakeFile::new("a.jpg", vec![0])], OutputFormat::WebP);
        store.update(report.accepted[0], ItemPatch::errored("decode failed"));
        let event = JsonEvent::item_update(&store, report.accepted[0]).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""error":"decode failed""#));
    }

    #[test]
    fn test_batch_complete_shape() {
        let event = JsonEvent::BatchComplete {
            items: 3,
            completed: 2,
            errored: 1,
            input_bytes: 300,
            output_bytes: 120,
            duration_seconds: 1.5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"batch_complete""#));
        assert!(json.contains(r#""completed":2"#));
    }
}
