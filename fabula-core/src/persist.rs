//! Story persistence.
//!
//! Saves are versioned JSON snapshots of the whole session state. Manual and
//! auto saves live in the same directory and are distinguished by type; each
//! type has its own retention cap, enforced after every save.

use crate::retrieval::SharedVectorStore;
use crate::world::SessionState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current save file version.
const SAVE_VERSION: u32 = 1;

/// Retention caps per save type.
pub const MANUAL_RETENTION: usize = 10;
pub const AUTO_RETENTION: usize = 3;

/// How many characters of the latest narration go into the preview.
const PREVIEW_CHARS: usize = 120;

/// Whether a save was requested by the player or made automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveType {
    Manual,
    Auto,
}

/// A saved story with all state needed to resume play.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedStory {
    /// Save format version for compatibility checking.
    pub version: u32,

    /// The complete session state.
    pub state: SessionState,

    /// Quick-access metadata (duplicated fields for peek access).
    pub metadata: StoryMetadata,
}

/// Metadata about a save file, readable without deserializing the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryMetadata {
    /// Unique id of this save.
    pub save_id: Uuid,

    /// The world this save belongs to.
    pub world_id: Uuid,

    pub save_type: SaveType,

    /// Player character name.
    pub character_name: String,

    /// World genre.
    pub genre: String,

    /// Number of turns in the history.
    pub turn_count: usize,

    /// Opening of the most recent narration.
    pub preview: String,

    /// Unix timestamp of the save.
    pub saved_at: u64,
}

impl SavedStory {
    /// Snapshot the session state for saving.
    pub fn new(state: SessionState, world_id: Uuid, save_type: SaveType) -> Self {
        let preview = state
            .history
            .iter()
            .rev()
            .find(|t| t.kind == crate::world::TurnKind::Narration)
            .map(|t| truncate_chars(&t.text, PREVIEW_CHARS))
            .unwrap_or_default();

        let metadata = StoryMetadata {
            save_id: Uuid::new_v4(),
            world_id,
            save_type,
            character_name: state.character.name.clone(),
            genre: state.world_config.genre.clone(),
            turn_count: state.history.len(),
            preview,
            saved_at: unix_now(),
        };

        Self {
            version: SAVE_VERSION,
            state,
            metadata,
        }
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        let saved: Self = serde_json::from_str(&content)?;

        if saved.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: saved.version,
            });
        }

        Ok(saved)
    }

    /// Read a save's metadata without deserializing the full state.
    pub async fn peek_metadata(path: impl AsRef<Path>) -> Result<StoryMetadata, PersistError> {
        let content = fs::read_to_string(path).await?;

        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            metadata: StoryMetadata,
        }

        let partial: Partial = serde_json::from_str(&content)?;

        if partial.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: partial.version,
            });
        }

        Ok(partial.metadata)
    }
}

/// Information about a save file.
#[derive(Debug, Clone)]
pub struct SaveInfo {
    pub path: PathBuf,
    pub metadata: StoryMetadata,
}

/// List all saves in a directory, newest first. Unreadable files are skipped.
pub async fn list_saves(dir: impl AsRef<Path>) -> Result<Vec<SaveInfo>, PersistError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        fs::create_dir_all(dir).await?;
        return Ok(Vec::new());
    }

    let mut saves = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            if let Ok(metadata) = SavedStory::peek_metadata(&path).await {
                saves.push(SaveInfo { path, metadata });
            }
        }
    }

    saves.sort_by(|a, b| b.metadata.saved_at.cmp(&a.metadata.saved_at));
    Ok(saves)
}

/// Write a save into `dir` and enforce retention for its type.
pub async fn write_save(
    dir: impl AsRef<Path>,
    saved: &SavedStory,
    store: Option<&SharedVectorStore>,
) -> Result<PathBuf, PersistError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).await?;

    let path = save_path(dir, &saved.metadata);
    saved.save_json(&path).await?;
    enforce_retention(dir, store).await?;
    Ok(path)
}

/// Delete saves beyond the per-type retention caps, oldest first.
///
/// When a world loses its last remaining save its vector records are removed
/// from the store as well.
pub async fn enforce_retention(
    dir: impl AsRef<Path>,
    store: Option<&SharedVectorStore>,
) -> Result<(), PersistError> {
    let saves = list_saves(&dir).await?;

    let mut manual_seen = 0usize;
    let mut auto_seen = 0usize;
    let mut pruned: Vec<&SaveInfo> = Vec::new();

    // list_saves is newest first, so overflow past the cap is the oldest.
    for save in &saves {
        let over = match save.metadata.save_type {
            SaveType::Manual => {
                manual_seen += 1;
                manual_seen > MANUAL_RETENTION
            }
            SaveType::Auto => {
                auto_seen += 1;
                auto_seen > AUTO_RETENTION
            }
        };
        if over {
            pruned.push(save);
        }
    }

    if pruned.is_empty() {
        return Ok(());
    }

    let surviving_worlds: Vec<Uuid> = saves
        .iter()
        .filter(|s| !pruned.iter().any(|p| p.metadata.save_id == s.metadata.save_id))
        .map(|s| s.metadata.world_id)
        .collect();

    for save in &pruned {
        fs::remove_file(&save.path).await?;
        if let Some(store) = store {
            if !surviving_worlds.contains(&save.metadata.world_id) {
                store.write().await.remove_world(save.metadata.world_id);
            }
        }
    }

    Ok(())
}

fn save_path(dir: &Path, metadata: &StoryMetadata) -> PathBuf {
    let kind = match metadata.save_type {
        SaveType::Manual => "manual",
        SaveType::Auto => "auto",
    };
    dir.join(format!("{kind}_{}.json", metadata.save_id))
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max).collect();
        format!("{truncated}...")
    }
}

fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{Character, WorldConfig};
    use tempfile::TempDir;

    fn state() -> SessionState {
        let config = WorldConfig {
            genre: "mystery".to_string(),
            setting: "a fogbound port".to_string(),
            rules: Vec::new(),
            seed_entities: Vec::new(),
        };
        let mut state = SessionState::new(config, Character::new("Iris"));
        state.add_player_action("knock on the door");
        state.add_narration("The door creaks open onto a dark hallway.");
        state
    }

    #[test]
    fn test_metadata_from_state() {
        let saved = SavedStory::new(state(), Uuid::new_v4(), SaveType::Manual);
        assert_eq!(saved.version, SAVE_VERSION);
        assert_eq!(saved.metadata.character_name, "Iris");
        assert_eq!(saved.metadata.genre, "mystery");
        assert_eq!(saved.metadata.turn_count, 2);
        assert!(saved.metadata.preview.starts_with("The door creaks"));
    }

    #[test]
    fn test_preview_truncation() {
        let mut s = state();
        s.add_narration("x".repeat(500));
        let saved = SavedStory::new(s, Uuid::new_v4(), SaveType::Auto);
        assert!(saved.metadata.preview.ends_with("..."));
        assert!(saved.metadata.preview.chars().count() <= PREVIEW_CHARS + 3);
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let world_id = Uuid::new_v4();
        let saved = SavedStory::new(state(), world_id, SaveType::Manual);

        let path = write_save(dir.path(), &saved, None)
            .await
            .expect("save should succeed");
        let loaded = SavedStory::load_json(&path).await.expect("load should succeed");

        assert_eq!(loaded.metadata.world_id, world_id);
        assert_eq!(loaded.state.character.name, "Iris");
        assert_eq!(loaded.state.history.len(), 2);
    }

    #[tokio::test]
    async fn test_peek_metadata() {
        let dir = TempDir::new().expect("temp dir");
        let saved = SavedStory::new(state(), Uuid::new_v4(), SaveType::Auto);
        let path = write_save(dir.path(), &saved, None).await.expect("save");

        let metadata = SavedStory::peek_metadata(&path).await.expect("peek");
        assert_eq!(metadata.character_name, "Iris");
        assert_eq!(metadata.save_type, SaveType::Auto);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let mut saved = SavedStory::new(state(), Uuid::new_v4(), SaveType::Manual);
        saved.version = 999;
        let path = dir.path().join("bad.json");
        saved.save_json(&path).await.expect("save");

        assert!(matches!(
            SavedStory::load_json(&path).await,
            Err(PersistError::VersionMismatch { found: 999, .. })
        ));
    }

    #[tokio::test]
    async fn test_list_saves_on_missing_dir() {
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("saves");
        let saves = list_saves(&missing).await.expect("list");
        assert!(saves.is_empty());
        assert!(missing.exists());
    }

    #[tokio::test]
    async fn test_auto_retention() {
        let dir = TempDir::new().expect("temp dir");
        let world_id = Uuid::new_v4();

        for i in 0..5 {
            let mut saved = SavedStory::new(state(), world_id, SaveType::Auto);
            // Force distinct, ordered timestamps.
            saved.metadata.saved_at = 1000 + i;
            write_save(dir.path(), &saved, None).await.expect("save");
        }

        let saves = list_saves(dir.path()).await.expect("list");
        assert_eq!(saves.len(), AUTO_RETENTION);
        // The newest survive.
        assert_eq!(saves[0].metadata.saved_at, 1004);
        assert_eq!(saves[AUTO_RETENTION - 1].metadata.saved_at, 1002);
    }

    #[tokio::test]
    async fn test_retention_is_per_type() {
        let dir = TempDir::new().expect("temp dir");
        let world_id = Uuid::new_v4();

        for i in 0..4 {
            let mut saved = SavedStory::new(state(), world_id, SaveType::Auto);
            saved.metadata.saved_at = 2000 + i;
            write_save(dir.path(), &saved, None).await.expect("save");
        }
        for i in 0..4 {
            let mut saved = SavedStory::new(state(), world_id, SaveType::Manual);
            saved.metadata.saved_at = 3000 + i;
            write_save(dir.path(), &saved, None).await.expect("save");
        }

        let saves = list_saves(dir.path()).await.expect("list");
        let manual = saves
            .iter()
            .filter(|s| s.metadata.save_type == SaveType::Manual)
            .count();
        let auto = saves
            .iter()
            .filter(|s| s.metadata.save_type == SaveType::Auto)
            .count();
        assert_eq!(manual, 4);
        assert_eq!(auto, AUTO_RETENTION);
    }

    #[tokio::test]
    async fn test_prune_clears_orphaned_world_vectors() {
        use crate::dispatch::IndexSourceKind;
        use crate::retrieval::{VectorRecord, VectorStore};

        let dir = TempDir::new().expect("temp dir");
        let store = VectorStore::shared();

        let old_world = Uuid::new_v4();
        let new_world = Uuid::new_v4();
        for world_id in [old_world, new_world] {
            store.write().await.upsert(VectorRecord {
                id: Uuid::new_v4(),
                world_id,
                kind: IndexSourceKind::Turn,
                source_index: 0,
                text: "turn".to_string(),
                embedding: vec![1.0],
            });
        }

        // One old-world auto save, then enough new-world auto saves to push
        // it past the cap.
        let mut saved = SavedStory::new(state(), old_world, SaveType::Auto);
        saved.metadata.saved_at = 100;
        write_save(dir.path(), &saved, Some(&store)).await.expect("save");

        for i in 0..AUTO_RETENTION as u64 {
            let mut saved = SavedStory::new(state(), new_world, SaveType::Auto);
            saved.metadata.saved_at = 200 + i;
            write_save(dir.path(), &saved, Some(&store)).await.expect("save");
        }

        let store = store.read().await;
        assert!(store.records_for(old_world, IndexSourceKind::Turn).is_empty());
        assert_eq!(store.records_for(new_world, IndexSourceKind::Turn).len(), 1);
    }
}
