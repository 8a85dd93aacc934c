// ---------------------------------------------------------------------------
// Checkpoint persistence: gzipped JSON
// ---------------------------------------------------------------------------
//
// The whole engine state is written as one JSON document, gzipped, to
// `<dir>/engine.gz`:
//
//   { "version": 1, "savedAt": ..., "dimension": ...,
//     "topics": [...], "aliases": [[alias, canonical], ...],
//     "content": [...], "trends": [...], "users": [...], "snapshots": [...] }
//
// Embeddings are stored as base64 of Float32 little-endian bytes. The file is
// written to a unique temp name and renamed into place, so a crash mid-write leaves
// the previous checkpoint intact. The index graph itself is not stored; it is
// rebuilt from live content on load.
// ---------------------------------------------------------------------------

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cache::AggregateSnapshot;
use crate::content::{ContentItem, LearningMode};
use crate::profile::UserRecord;
use crate::trend::TopicRecord;

pub const CHECKPOINT_FILE: &str = "engine.gz";
pub const CHECKPOINT_VERSION: u32 = 1;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_LEVEL: u32 = 6;

#[derive(Debug, Error)]
pub enum PersistenceError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Corruption: {0}")]
	Corruption(String),
	#[error("Serialization: {0}")]
	Serialization(String),
}

// ---------------------------------------------------------------------------
// Embedding encode / decode
// ---------------------------------------------------------------------------

/// Base64 of the vector's Float32 little-endian bytes.
pub fn encode_embedding(embedding: &[f32]) -> String {
	let mut bytes = Vec::with_capacity(embedding.len() * 4);
	for value in embedding {
		bytes.extend_from_slice(&value.to_le_bytes());
	}
	STANDARD.encode(bytes)
}

pub fn decode_embedding(encoded: &str) -> Result<Vec<f32>, PersistenceError> {
	let bytes = STANDARD
		.decode(encoded)
		.map_err(|e| PersistenceError::Corruption(format!("embedding is not base64: {}", e)))?;
	let words = bytes.chunks_exact(4);
	if !words.remainder().is_empty() {
		return Err(PersistenceError::Corruption(format!(
			"embedding has {} bytes, not a whole number of floats",
			bytes.len()
		)));
	}
	Ok(words
		.map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
		.collect())
}

// ---------------------------------------------------------------------------
// Gzip
// ---------------------------------------------------------------------------

pub fn compress(data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
	let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::new(GZIP_LEVEL));
	encoder.write_all(data)?;
	Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
	let mut out = Vec::with_capacity(data.len() * 4);
	GzDecoder::new(data).read_to_end(&mut out)?;
	Ok(out)
}

pub fn is_gzipped(data: &[u8]) -> bool {
	data.starts_with(&GZIP_MAGIC)
}

// ---------------------------------------------------------------------------
// Checkpoint document
// ---------------------------------------------------------------------------

/// A content item with its embedding in wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredContent {
	pub id: String,
	pub embedding: String,
	pub tags: Vec<String>,
	pub modes: Vec<LearningMode>,
	pub duration_minutes: f64,
	pub novelty_base: f64,
	pub published_at: u64,
	pub retired: bool,
	pub trend_alignment: f64,
	pub novelty: f64,
	pub updated_at: u64,
}

impl StoredContent {
	pub fn from_item(item: &ContentItem) -> Self {
		Self {
			id: item.id.clone(),
			embedding: encode_embedding(&item.embedding),
			tags: item.tags.clone(),
			modes: item.modes.clone(),
			duration_minutes: item.duration_minutes,
			novelty_base: item.novelty_base,
			published_at: item.published_at,
			retired: item.retired,
			trend_alignment: item.trend_alignment,
			novelty: item.novelty,
			updated_at: item.updated_at,
		}
	}

	pub fn into_item(self) -> Result<ContentItem, PersistenceError> {
		let embedding = decode_embedding(&self.embedding).map_err(|e| {
			PersistenceError::Corruption(format!("content '{}': {}", self.id, e))
		})?;
		Ok(ContentItem {
			id: self.id,
			embedding: Arc::from(embedding),
			tags: self.tags,
			modes: self.modes,
			duration_minutes: self.duration_minutes,
			novelty_base: self.novelty_base,
			published_at: self.published_at,
			retired: self.retired,
			trend_alignment: self.trend_alignment,
			novelty: self.novelty,
			updated_at: self.updated_at,
		})
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Checkpoint {
	pub version: u32,
	pub saved_at: u64,
	pub dimension: usize,
	pub topics: Vec<String>,
	pub aliases: Vec<(String, String)>,
	pub content: Vec<StoredContent>,
	pub trends: Vec<TopicRecord>,
	pub users: Vec<UserRecord>,
	pub snapshots: Vec<AggregateSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSummary {
	pub path: String,
	pub bytes: usize,
	pub content: usize,
	pub topics: usize,
	pub users: usize,
	pub snapshots: usize,
}

pub fn checkpoint_path(dir: impl AsRef<Path>) -> PathBuf {
	dir.as_ref().join(CHECKPOINT_FILE)
}

/// Write `checkpoint` to `<dir>/engine.gz`, creating `dir` if needed.
pub fn save_checkpoint(
	dir: impl AsRef<Path>,
	checkpoint: &Checkpoint,
) -> Result<SaveSummary, PersistenceError> {
	let dir = dir.as_ref();
	std::fs::create_dir_all(dir)?;

	let json = serde_json::to_vec(checkpoint).map_err(|e| {
		PersistenceError::Serialization(format!("Failed to serialize checkpoint: {}", e))
	})?;
	let compressed = compress(&json)?;

	// Each writer gets its own temp file; the rename is the only shared step.
	let path = checkpoint_path(dir);
	let tmp = dir.join(format!("{}.{}.tmp", CHECKPOINT_FILE, Uuid::new_v4().simple()));
	let written = std::fs::write(&tmp, &compressed).and_then(|()| std::fs::rename(&tmp, &path));
	if let Err(e) = written {
		let _ = std::fs::remove_file(&tmp);
		return Err(e.into());
	}

	Ok(SaveSummary {
		path: path.display().to_string(),
		bytes: compressed.len(),
		content: checkpoint.content.len(),
		topics: checkpoint.trends.len(),
		users: checkpoint.users.len(),
		snapshots: checkpoint.snapshots.len(),
	})
}

/// Read the checkpoint in `dir`. A missing file is not an error.
pub fn load_checkpoint(dir: impl AsRef<Path>) -> Result<Option<Checkpoint>, PersistenceError> {
	let path = checkpoint_path(dir);
	if !path.exists() {
		return Ok(None);
	}
	let raw = std::fs::read(&path)?;
	let json = if is_gzipped(&raw) {
		decompress(&raw)?
	} else {
		raw
	};

	let checkpoint: Checkpoint = serde_json::from_slice(&json)
		.map_err(|e| PersistenceError::Corruption(format!("Invalid checkpoint JSON: {}", e)))?;
	if checkpoint.version != CHECKPOINT_VERSION {
		return Err(PersistenceError::Corruption(format!(
			"Unsupported checkpoint version: {}",
			checkpoint.version
		)));
	}
	Ok(Some(checkpoint))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn item(id: &str, embedding: &[f32]) -> ContentItem {
		ContentItem {
			id: id.into(),
			embedding: Arc::from(embedding.to_vec()),
			tags: vec!["ml".into()],
			modes: vec![LearningMode::Practice],
			duration_minutes: 12.5,
			novelty_base: 7.0,
			published_at: 0x1_FFFF_FFFF,
			retired: false,
			trend_alignment: 3.0,
			novelty: 6.5,
			updated_at: 99,
		}
	}

	#[test]
	fn embedding_encoding_is_float32_le() {
		let original = vec![1.0f32, -0.5, 0.0, 3.14159, -1e10, 1e-10];
		let decoded = decode_embedding(&encode_embedding(&original)).unwrap();
		assert_eq!(decoded, original);
		// 1.0f32 little-endian is 00 00 80 3f
		assert_eq!(encode_embedding(&[1.0]), STANDARD.encode([0u8, 0, 0x80, 0x3f]));
		assert_eq!(encode_embedding(&[]), "");
	}

	#[test]
	fn malformed_embeddings_are_corruption() {
		assert!(matches!(
			decode_embedding("!!!"),
			Err(PersistenceError::Corruption(_))
		));
		let three_bytes = STANDARD.encode([1u8, 2, 3]);
		match decode_embedding(&three_bytes) {
			Err(PersistenceError::Corruption(msg)) => assert!(msg.contains("3 bytes"), "{}", msg),
			other => panic!("expected corruption, got {:?}", other),
		}
	}

	#[test]
	fn gzip_detection() {
		let compressed = compress(b"momentum").unwrap();
		assert!(is_gzipped(&compressed));
		assert!(!is_gzipped(b"{}"));
		assert!(!is_gzipped(&[0x1f]));
		assert_eq!(decompress(&compressed).unwrap(), b"momentum");
		assert!(decompress(b"{\"version\":1}").is_err());
		assert!(is_gzipped(&compress(&[]).unwrap()));
	}

	#[test]
	fn stored_content_keeps_every_field() {
		let original = item("c1", &[0.25, -2.0, 8.0]);
		let back = StoredContent::from_item(&original).into_item().unwrap();
		assert_eq!(back.id, "c1");
		assert_eq!(&back.embedding[..], &original.embedding[..]);
		assert_eq!(back.published_at, 0x1_FFFF_FFFF);
		assert_eq!(back.modes, vec![LearningMode::Practice]);
		assert_eq!(back.novelty, 6.5);
	}

	#[test]
	fn save_then_load_directory() {
		let dir = tempfile::tempdir().unwrap();
		let nested = dir.path().join("a/b");
		let checkpoint = Checkpoint {
			version: CHECKPOINT_VERSION,
			saved_at: 10,
			dimension: 3,
			topics: vec!["ml".into(), "ml/llm".into()],
			aliases: vec![("machine-learning".into(), "ml".into())],
			content: vec![StoredContent::from_item(&item("c1", &[1.0, 0.0, 0.0]))],
			..Default::default()
		};

		let summary = save_checkpoint(&nested, &checkpoint).unwrap();
		assert_eq!(summary.content, 1);
		assert!(nested.join(CHECKPOINT_FILE).exists());
		assert!(!nested.join("engine.gz.tmp").exists());

		let loaded = load_checkpoint(&nested).unwrap().unwrap();
		assert_eq!(loaded.dimension, 3);
		assert_eq!(loaded.topics, checkpoint.topics);
		assert_eq!(loaded.aliases, checkpoint.aliases);
		assert_eq!(loaded.content.len(), 1);
	}

	#[test]
	fn concurrent_saves_never_collide() {
		let dir = tempfile::tempdir().unwrap();
		let checkpoint = Checkpoint {
			version: CHECKPOINT_VERSION,
			dimension: 3,
			content: vec![StoredContent::from_item(&item("a", &[1.0, 0.0, 0.0]))],
			..Default::default()
		};
		std::thread::scope(|s| {
			for _ in 0..4 {
				s.spawn(|| {
					for _ in 0..25 {
						save_checkpoint(dir.path(), &checkpoint).unwrap();
					}
				});
			}
		});
		let loaded = load_checkpoint(dir.path()).unwrap().unwrap();
		assert_eq!(loaded.content.len(), 1);
		let leftovers: Vec<_> = std::fs::read_dir(dir.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
			.collect();
		assert!(leftovers.is_empty());
	}

	#[test]
	fn missing_checkpoint_loads_as_none() {
		let dir = tempfile::tempdir().unwrap();
		assert!(load_checkpoint(dir.path()).unwrap().is_none());
	}

	#[test]
	fn plain_json_and_bad_versions() {
		let dir = tempfile::tempdir().unwrap();
		let path = checkpoint_path(dir.path());

		std::fs::write(&path, r#"{ "version": 1, "dimension": 4 }"#).unwrap();
		let loaded = load_checkpoint(dir.path()).unwrap().unwrap();
		assert_eq!(loaded.dimension, 4);
		assert!(loaded.content.is_empty());

		std::fs::write(&path, r#"{ "version": 7 }"#).unwrap();
		assert!(matches!(
			load_checkpoint(dir.path()),
			Err(PersistenceError::Corruption(_))
		));

		std::fs::write(&path, compress(b"not json").unwrap()).unwrap();
		assert!(matches!(
			load_checkpoint(dir.path()),
			Err(PersistenceError::Corruption(_))
		));
	}
}
