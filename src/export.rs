//! # Export Boundary Module
//!
//! Vista di export sugli item completati: coppie `{filename, bytes}` in
//! ordine di inserimento, con disambiguazione deterministica delle collisioni
//! di nome (suffisso numerico, mai overwrite silenzioso).

use crate::store::ItemStore;
use std::collections::HashSet;
use std::sync::Arc;

/// One file ready to be packaged or written out
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub filename: String,
    pub bytes: Arc<[u8]>,
}

/// Ordered export list derived from the store's completed items.
///
/// The output extension comes from each item's stamped output format; a name
/// already taken gets `-1`, `-2`, ... appended to its stem.
pub fn completed_exports(store: &ItemStore) -> Vec<ExportEntry> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut entries = Vec::new();

    for item in store.completed_items() {
        let stem = match item.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => item.name.clone(),
        };
        let ext = item.output_format.extension();

        let mut filename = format!("{}.{}", stem, ext);
        let mut suffix = 1u32;
        while !taken.insert(filename.clone()) {
            filename = format!("{}-{}.{}", stem, suffix, ext);
            suffix += 1;
        }

        entries.push(ExportEntry {
            filename,
            bytes: item.bytes,
        });
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecOutput, MediaMetadata};
    use crate::formats::{AppProfile, OutputFormat};
    use crate::item::ItemPatch;
    use crate::store::IntakeFile;

    fn completed_store(names: &[&str]) -> ItemStore {
        let store = ItemStore::new(AppProfile::Image);
        let files = names
            .iter()
            .map(|name| IntakeFile::new(*name, vec![1, 2, 3]))
            .collect();
        let report = store.add(files, OutputFormat::WebP);
        for id in report.accepted {
            store.update(
                id,
                ItemPatch::completed(CodecOutput::new(vec![9], MediaMetadata::default())),
            );
        }
        store
    }

    #[test]
    fn test_exports_follow_insertion_order_and_output_format() {
        let store = completed_store(&["b.png", "a.jpg"]);
        let entries = completed_exports(&store);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "b.webp");
        assert_eq!(entries[1].filename, "a.webp");
        assert_eq!(&entries[0].bytes[..], &[9]);
    }

    #[test]
    fn test_collisions_get_deterministic_suffixes() {
        // same stem from different folders/extensions collides after stamping
        let store = completed_store(&["photo.jpg", "photo.png", "photo.heic"]);
        let entries = completed_exports(&store);
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["photo.webp", "photo-1.webp", "photo-2.webp"]);
    }

    #[test]
    fn test_pending_items_are_not_exported() {
        let store = ItemStore::new(AppProfile::Image);
        store.add(vec![IntakeFile::new("a.jpg", vec![0])], OutputFormat::WebP);
        assert!(completed_exports(&store).is_empty());
    }

    #[test]
    fn test_extensionless_name_keeps_its_stem() {
        let store = ItemStore::new(AppProfile::Pdf);
        let report = store.add(
            vec![IntakeFile::with_mime("scan", "application/pdf", vec![0])],
            OutputFormat::Pdf,
        );
        store.update(
            report.accepted[0],
            ItemPatch::completed(CodecOutput::new(vec![1], MediaMetadata::default())),
        );
        let entries = completed_exports(&store);
        assert_eq!(entries[0].filename, "scan.pdf");
    }
}
