//! Opportunistic zstd compression of stored documents.
//!
//! A [`StoredDocument`] remembers which form it was written in, so reading it
//! back never depends on the options that are current at read time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{
    document::{Document, get_path, remove_path, set_path},
    error::DocumentStoreResult,
};

/// Compression settings for a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionOptions {
    pub enabled: bool,
    /// Serialized size in bytes above which a document (or field) is compressed.
    pub threshold: usize,
    /// zstd level.
    pub level: i32,
    /// Compress only these fields instead of whole documents.
    pub fields: Option<Vec<String>>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 1024,
            level: 3,
            fields: None,
        }
    }
}

impl CompressionOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    fn field_mode(&self) -> Option<&[String]> {
        self.fields.as_deref().filter(|fields| !fields.is_empty())
    }
}

/// A zstd-compressed byte block.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedBlock {
    data: Vec<u8>,
    original_size: usize,
}

impl CompressedBlock {
    pub fn compress(bytes: &[u8], level: i32) -> DocumentStoreResult<Self> {
        Ok(Self {
            data: zstd::encode_all(bytes, level)?,
            original_size: bytes.len(),
        })
    }

    pub fn decompress(&self) -> DocumentStoreResult<Vec<u8>> {
        Ok(zstd::decode_all(&self.data[..])?)
    }

    pub fn compressed_size(&self) -> usize {
        self.data.len()
    }

    pub fn original_size(&self) -> usize {
        self.original_size
    }
}

/// A document as held in collection storage.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredDocument {
    Plain(Document),
    /// The whole serialized document.
    Compressed(CompressedBlock),
    /// Selected fields compressed individually, the rest kept plain.
    Partial {
        document: Document,
        fields: BTreeMap<String, CompressedBlock>,
    },
}

impl StoredDocument {
    pub fn is_compressed(&self) -> bool {
        !matches!(self, StoredDocument::Plain(_))
    }

    /// Restores the original document.
    pub fn decode(&self) -> DocumentStoreResult<Document> {
        match self {
            StoredDocument::Plain(document) => Ok(document.clone()),
            StoredDocument::Compressed(block) => Ok(serde_json::from_slice(&block.decompress()?)?),
            StoredDocument::Partial { document, fields } => {
                let mut restored = document.clone();
                for (path, block) in fields {
                    let value: Value = serde_json::from_slice(&block.decompress()?)?;
                    set_path(restored.as_map_mut(), path, value)?;
                }
                Ok(restored)
            }
        }
    }

    /// Bytes this entry occupies, and the bytes it would occupy uncompressed.
    fn sizes(&self) -> DocumentStoreResult<(usize, usize)> {
        Ok(match self {
            StoredDocument::Plain(document) => {
                let size = serde_json::to_vec(document)?.len();
                (size, size)
            }
            StoredDocument::Compressed(block) => (block.compressed_size(), block.original_size()),
            StoredDocument::Partial { document, fields } => {
                let plain = serde_json::to_vec(document)?.len();
                fields.values().fold((plain, plain), |(stored, original), block| {
                    (stored + block.compressed_size(), original + block.original_size())
                })
            }
        })
    }
}

/// Aggregate compression figures for a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressionStats {
    pub documents: usize,
    pub compressed: usize,
    pub original_bytes: usize,
    pub stored_bytes: usize,
}

impl CompressionStats {
    /// Stored size over original size; 1.0 when nothing is stored.
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.stored_bytes as f64 / self.original_bytes as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompressionManager {
    options: CompressionOptions,
}

impl CompressionManager {
    pub fn new(options: CompressionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompressionOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: CompressionOptions) {
        self.options = options;
    }

    /// Chooses the stored form for a document under the current options.
    pub fn encode(&self, document: &Document) -> DocumentStoreResult<StoredDocument> {
        if !self.options.enabled {
            return Ok(StoredDocument::Plain(document.clone()));
        }

        match self.options.field_mode() {
            Some(paths) => self.encode_fields(document, paths),
            None => {
                let bytes = serde_json::to_vec(document)?;
                if bytes.len() <= self.options.threshold {
                    return Ok(StoredDocument::Plain(document.clone()));
                }
                Ok(StoredDocument::Compressed(CompressedBlock::compress(&bytes, self.options.level)?))
            }
        }
    }

    fn encode_fields(&self, document: &Document, paths: &[String]) -> DocumentStoreResult<StoredDocument> {
        let mut plain = document.clone();
        let mut fields = BTreeMap::new();

        for path in paths {
            let Some(value) = get_path(document.as_map(), path) else {
                continue;
            };
            let bytes = serde_json::to_vec(value)?;
            if bytes.len() <= self.options.threshold {
                continue;
            }
            // paths through arrays resolve for reads but cannot be detached
            if remove_path(plain.as_map_mut(), path).is_none() {
                continue;
            }
            fields.insert(path.clone(), CompressedBlock::compress(&bytes, self.options.level)?);
        }

        if fields.is_empty() {
            Ok(StoredDocument::Plain(plain))
        } else {
            Ok(StoredDocument::Partial { document: plain, fields })
        }
    }

    pub fn decode(&self, stored: &StoredDocument) -> DocumentStoreResult<Document> {
        stored.decode()
    }

    pub fn stats<'a>(&self, stored: impl IntoIterator<Item = &'a StoredDocument>) -> DocumentStoreResult<CompressionStats> {
        let mut stats = CompressionStats::default();
        for entry in stored {
            let (stored_bytes, original_bytes) = entry.sizes()?;
            stats.documents += 1;
            stats.compressed += usize::from(entry.is_compressed());
            stats.stored_bytes += stored_bytes;
            stats.original_bytes += original_bytes;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn big_document() -> Document {
        Document::from_value(json!({
            "id": "big",
            "title": "short",
            "body": "lorem ipsum dolor sit amet ".repeat(100),
            "meta": { "tags": ["a", "b"] },
        }))
        .unwrap()
    }

    #[test]
    fn test_disabled_keeps_plain() {
        let manager = CompressionManager::default();
        let stored = manager.encode(&big_document()).unwrap();

        assert!(!stored.is_compressed());
    }

    #[test]
    fn test_whole_document_round_trip() {
        let manager = CompressionManager::new(CompressionOptions::enabled());
        let document = big_document();
        let stored = manager.encode(&document).unwrap();

        assert!(matches!(stored, StoredDocument::Compressed(_)));
        assert_eq!(manager.decode(&stored).unwrap(), document);
    }

    #[test]
    fn test_small_documents_stay_plain() {
        let manager = CompressionManager::new(CompressionOptions::enabled());
        let small = Document::from_value(json!({ "id": "s", "n": 1 })).unwrap();

        assert_eq!(manager.encode(&small).unwrap(), StoredDocument::Plain(small));
    }

    #[test]
    fn test_field_mode_round_trip() {
        let manager = CompressionManager::new(CompressionOptions {
            enabled: true,
            threshold: 64,
            fields: Some(vec!["body".into(), "title".into(), "absent".into()]),
            ..CompressionOptions::default()
        });
        let document = big_document();
        let stored = manager.encode(&document).unwrap();

        match &stored {
            StoredDocument::Partial { document: plain, fields } => {
                assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["body"]);
                assert!(!plain.contains("body"));
                assert_eq!(plain.get("title"), Some(&json!("short")));
            }
            other => panic!("expected partial form, got {:?}", other),
        }
        assert_eq!(stored.decode().unwrap(), document);
    }

    #[test]
    fn test_array_paths_stay_inline() {
        let manager = CompressionManager::new(CompressionOptions {
            enabled: true,
            threshold: 16,
            fields: Some(vec!["parts.0".into()]),
            ..CompressionOptions::default()
        });
        let document = Document::from_value(json!({ "id": "p", "parts": ["x".repeat(200), "y"] })).unwrap();
        let stored = manager.encode(&document).unwrap();

        assert_eq!(stored, StoredDocument::Plain(document.clone()));
        assert_eq!(stored.decode().unwrap(), document);
    }

    #[test]
    fn test_floats_survive_compression() {
        let manager = CompressionManager::new(CompressionOptions {
            threshold: 0,
            ..CompressionOptions::enabled()
        });
        let document = Document::from_value(json!({ "id": "f", "x": 1.0715660391465826e-75, "y": 0.1 })).unwrap();
        let stored = manager.encode(&document).unwrap();

        assert!(stored.is_compressed());
        assert_eq!(stored.decode().unwrap(), document);
        assert_eq!(stored.decode().unwrap().get("x").and_then(|v| v.as_f64()), Some(1.0715660391465826e-75));
    }

    #[test]
    fn test_decode_ignores_current_options() {
        let mut manager = CompressionManager::new(CompressionOptions::enabled());
        let document = big_document();
        let stored = manager.encode(&document).unwrap();

        manager.set_options(CompressionOptions::default());
        assert_eq!(manager.decode(&stored).unwrap(), document);
    }

    #[test]
    fn test_stats() {
        let manager = CompressionManager::new(CompressionOptions::enabled());
        let small = Document::from_value(json!({ "id": "s" })).unwrap();
        let stored = vec![manager.encode(&big_document()).unwrap(), manager.encode(&small).unwrap()];
        let stats = manager.stats(&stored).unwrap();

        assert_eq!(stats.documents, 2);
        assert_eq!(stats.compressed, 1);
        assert!(stats.stored_bytes < stats.original_bytes);
        assert!(stats.ratio() < 1.0);
    }

    #[test]
    fn test_options_deserialize_partially() {
        let options: CompressionOptions = serde_json::from_value(json!({ "enabled": true, "threshold": 10 })).unwrap();

        assert!(options.enabled);
        assert_eq!(options.threshold, 10);
        assert_eq!(options.level, 3);
    }
}
