//! StorySession - the primary public API for interactive play.
//!
//! This module wraps the storyteller client, the response pipeline, the
//! retrieval subsystem, and persistence into a single interface. One call to
//! `player_action` runs a whole turn: retrieve context, prompt the model,
//! split and parse the response, apply the changes, and hand the new texts to
//! the background indexer.

use crate::dispatch::{apply_changes, IndexRequest, IndexSourceKind};
use crate::persist::{write_save, SaveType, SavedStory};
use crate::prompt::build_turn_prompt;
use crate::retrieval::{ContextRetriever, EmbeddingIndexer, KnowledgeDoc, VectorStore};
use crate::splitter::split_response;
use crate::tags::parse_change_list;
use crate::world::{Character, SessionState, WorldConfig};
use gemini::{Gemini, Request};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors from StorySession operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Storyteller error: {0}")]
    Generation(#[from] gemini::Error),

    #[error("A turn is already in progress")]
    Busy,

    #[error("Player action is empty")]
    EmptyAction,

    #[error("The storyteller produced no usable narration")]
    EmptyNarration,

    #[error("Save error: {0}")]
    Persist(#[from] crate::persist::PersistError),

    #[error("There is no narration to undo")]
    NothingToUndo,
}

/// Configuration for a story session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Temperature for narration.
    pub temperature: f32,

    /// Maximum tokens for narration responses.
    pub max_output_tokens: usize,

    /// Per-category budget for retrieved context.
    pub retrieval_top_k: usize,

    /// Where saves go. None disables auto-saving.
    pub save_dir: Option<PathBuf>,

    /// Background-knowledge documents for this world.
    pub knowledge: Vec<KnowledgeDoc>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            max_output_tokens: 4096,
            retrieval_top_k: 3,
            save_dir: None,
            knowledge: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: usize) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_retrieval_top_k(mut self, top_k: usize) -> Self {
        self.retrieval_top_k = top_k;
        self
    }

    pub fn with_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = Some(dir.into());
        self
    }

    pub fn with_knowledge(mut self, knowledge: Vec<KnowledgeDoc>) -> Self {
        self.knowledge = knowledge;
        self
    }
}

/// The visible result of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Sanitized narration shown to the player.
    pub narration: String,

    /// Number of change records that were applied.
    pub changes_applied: usize,
}

/// One ongoing interactive story.
///
/// Must be created inside a tokio runtime: the session spawns a background
/// indexing task.
pub struct StorySession {
    client: Gemini,
    config: SessionConfig,
    state: SessionState,
    world_id: Uuid,
    store: crate::retrieval::SharedVectorStore,
    indexer: EmbeddingIndexer,
    retriever: ContextRetriever,
    busy: bool,
}

impl StorySession {
    /// Start a new story.
    pub fn new(
        client: Gemini,
        config: SessionConfig,
        world_config: WorldConfig,
        character: Character,
    ) -> Self {
        let state = SessionState::new(world_config, character);
        Self::with_state(client, config, state, Uuid::new_v4())
    }

    /// Resume a story from a save.
    pub fn resume(client: Gemini, config: SessionConfig, saved: SavedStory) -> Self {
        let world_id = saved.metadata.world_id;
        Self::with_state(client, config, saved.state, world_id)
    }

    fn with_state(
        client: Gemini,
        config: SessionConfig,
        state: SessionState,
        world_id: Uuid,
    ) -> Self {
        let store = VectorStore::shared();
        let indexer = EmbeddingIndexer::spawn(client.clone(), store.clone());
        let retriever = ContextRetriever::new(client.clone(), store.clone())
            .with_knowledge(config.knowledge.clone());
        Self {
            client,
            config,
            state,
            world_id,
            store,
            indexer,
            retriever,
            busy: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn world_id(&self) -> Uuid {
        self.world_id
    }

    /// Run one turn from the player's action.
    ///
    /// On any failure the session state is exactly what it was before the
    /// call, so the player can simply retry.
    pub async fn player_action(&mut self, action: &str) -> Result<TurnOutcome, SessionError> {
        if self.busy {
            return Err(SessionError::Busy);
        }
        let action = action.trim();
        if action.is_empty() {
            return Err(SessionError::EmptyAction);
        }

        self.busy = true;
        let result = self.run_turn(action).await;
        self.busy = false;
        result
    }

    async fn run_turn(&mut self, action: &str) -> Result<TurnOutcome, SessionError> {
        let snapshot = self.state.clone();

        self.state.add_player_action(action);

        let context = self
            .retriever
            .retrieve_context(action, self.world_id, self.config.retrieval_top_k)
            .await;
        let prompt = build_turn_prompt(&self.state, &context);

        let request = Request::user(prompt)
            .with_temperature(self.config.temperature)
            .with_max_output_tokens(self.config.max_output_tokens);

        let response = match self.client.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                self.state = snapshot;
                return Err(SessionError::Generation(e));
            }
        };

        let ingested = ingest_response(&self.state, &response.text);
        if ingested.narration.is_empty() {
            self.state = snapshot;
            return Err(SessionError::EmptyNarration);
        }

        self.state = ingested.state;
        self.state.add_narration(&ingested.narration);

        let mut index_requests = ingested.index_requests;
        index_requests.push(IndexRequest {
            kind: IndexSourceKind::Turn,
            source_index: self.state.history.len() - 1,
            text: format!("Player: {action}\nNarrator: {}", ingested.narration),
        });
        self.indexer.submit(self.world_id, index_requests);

        self.auto_save().await;

        Ok(TurnOutcome {
            narration: ingested.narration,
            changes_applied: ingested.changes_applied,
        })
    }

    /// Remove the last narration so the player can retry their action.
    pub fn undo_last_narration(&mut self) -> Result<(), SessionError> {
        self.state
            .undo_last_narration()
            .map(|_| ())
            .ok_or(SessionError::NothingToUndo)
    }

    /// Write a manual save and enforce retention.
    pub async fn save(&self) -> Result<PathBuf, SessionError> {
        let dir = self
            .config
            .save_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let saved = SavedStory::new(self.state.clone(), self.world_id, SaveType::Manual);
        Ok(write_save(&dir, &saved, Some(&self.store)).await?)
    }

    /// A failed auto-save is logged, never fatal to the turn.
    async fn auto_save(&self) {
        let Some(ref dir) = self.config.save_dir else {
            return;
        };
        let saved = SavedStory::new(self.state.clone(), self.world_id, SaveType::Auto);
        if let Err(e) = write_save(dir, &saved, Some(&self.store)).await {
            warn!("auto-save failed: {e}");
        }
    }
}

/// Result of pushing one raw model response through the pipeline.
#[derive(Debug, Clone)]
pub struct IngestedResponse {
    /// Sanitized narration.
    pub narration: String,

    /// State after applying the change list.
    pub state: SessionState,

    /// Index requests emitted by the dispatcher.
    pub index_requests: Vec<IndexRequest>,

    pub changes_applied: usize,
}

/// Split a raw response, parse its change list, and apply it to `state`.
///
/// This is the whole turn pipeline minus the model call. Total: malformed
/// input degrades to all-narration with no changes.
pub fn ingest_response(state: &SessionState, raw: &str) -> IngestedResponse {
    let split = split_response(raw);
    let records = parse_change_list(&split.change_list);
    let changes_applied = records.len();
    let outcome = apply_changes(state, &records);
    IngestedResponse {
        narration: split.narration,
        state: outcome.state,
        index_requests: outcome.index_requests,
        changes_applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        let config = WorldConfig {
            genre: "fantasy".to_string(),
            setting: "a mountain pass".to_string(),
            rules: Vec::new(),
            seed_entities: Vec::new(),
        };
        SessionState::new(config, Character::new("Edda"))
    }

    #[test]
    fn test_ingest_full_response() {
        let mut s = state();
        s.add_player_action("search the wreck");
        let raw = "You pry open the chest and find a lantern.\n\n\
                   END_NARRATION\n\
                   [ITEM_ADD: name=Lantern, quantity=1]\n\
                   [TIME_ADVANCE: minutes=10]";

        let ingested = ingest_response(&s, raw);
        assert_eq!(ingested.narration, "You pry open the chest and find a lantern.");
        assert_eq!(ingested.changes_applied, 2);
        assert_eq!(ingested.state.inventory.len(), 1);
        assert_eq!(ingested.state.inventory[0].name, "Lantern");
        assert_eq!(ingested.state.clock.minute, 10);
    }

    #[test]
    fn test_ingest_without_marker_is_all_narration() {
        let s = state();
        let ingested = ingest_response(&s, "Just prose, nothing else.");
        assert_eq!(ingested.narration, "Just prose, nothing else.");
        assert_eq!(ingested.changes_applied, 0);
        assert_eq!(ingested.state, s);
    }

    #[test]
    fn test_ingest_emits_index_requests() {
        let s = state();
        let raw = "A stranger introduces herself as Vex.\n\nEND_NARRATION\n\
                   [ENTITY_DISCOVERED: name=Vex, kind=creature, description=\"a wandering tinker\"]";
        let ingested = ingest_response(&s, raw);
        assert_eq!(ingested.index_requests.len(), 1);
        assert_eq!(ingested.index_requests[0].kind, IndexSourceKind::Entity);
    }

    #[tokio::test]
    async fn test_empty_action_rejected() {
        let client = Gemini::new("test-key");
        let mut session = StorySession::new(
            client,
            SessionConfig::default(),
            state().world_config,
            Character::new("Edda"),
        );
        assert!(matches!(
            session.player_action("   ").await,
            Err(SessionError::EmptyAction)
        ));
        // The rejected action must not enter the history.
        assert!(session.state().history.is_empty());
    }

    #[tokio::test]
    async fn test_undo_without_narration() {
        let client = Gemini::new("test-key");
        let mut session = StorySession::new(
            client,
            SessionConfig::default(),
            state().world_config,
            Character::new("Edda"),
        );
        assert!(matches!(
            session.undo_last_narration(),
            Err(SessionError::NothingToUndo)
        ));
    }
}
