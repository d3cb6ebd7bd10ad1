//! # Progress View Module
//!
//! Progress bar `indicatif` pilotata come subscriber dello store: la barra è
//! una vista, non partecipa alla pipeline. Un item che raggiunge uno stato
//! terminale incrementa la barra con un messaggio `[OK]`/`[ERROR]`.

use crate::formats;
use crate::item::ItemStatus;
use crate::store::{ItemStore, StoreEvent};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Terminal progress view over an item store
pub struct ProgressView {
    bar: ProgressBar,
    store: Arc<ItemStore>,
    subscription: u64,
}

impl ProgressView {
    /// Attach a bar sized for `total` items to the store's event stream
    pub fn attach(store: Arc<ItemStore>, total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        // a terminal item ticks the bar once, even if it is updated again later
        let settled: Arc<Mutex<HashSet<crate::item::ItemId>>> =
            Arc::new(Mutex::new(HashSet::new()));
        let listener_bar = bar.clone();
        let listener_store = store.clone();
        let subscription = store.subscribe(move |event| {
            let StoreEvent::Updated(id) = event else {
                return;
            };
            let snapshot =
                listener_store.with_item(*id, |item| (item.status, item.name.clone(), item.error.clone(), item.size, item.result_size()));
            let Some((status, name, error, size, result_size)) = snapshot else {
                return;
            };
            if !status.is_terminal() {
                return;
            }
            if let Ok(mut settled) = settled.lock() {
                if !settled.insert(*id) {
                    return;
                }
            }
            let message = match status {
                ItemStatus::Completed => {
                    let saved = result_size
                        .map(|out| 100.0 - (out as f64 / size.max(1) as f64) * 100.0)
                        .unwrap_or(0.0);
                    format!("[OK] {}: {:.1}% saved", name, saved)
                }
                ItemStatus::Error => {
                    format!("[ERROR] {}: {}", name, error.unwrap_or_default())
                }
                _ => return,
            };
            listener_bar.inc(1);
            listener_bar.set_message(message);
        });

        Self {
            bar,
            store,
            subscription,
        }
    }

    /// Finish the bar with an aggregate summary
    pub fn finish(&self) {
        let counts = self.store.counts();
        let input = self.store.total_input_bytes();
        let output = self.store.total_output_bytes();
        let saved = input.saturating_sub(output);
        self.bar.finish_with_message(format!(
            "Completed: {} | Errors: {} | Total saved: {}",
            counts.completed,
            counts.errored,
            formats::format_size(saved)
        ));
    }
}

impl Drop for ProgressView {
    fn drop(&mut self) {
        self.store.unsubscribe(self.subscription);
    }
}
