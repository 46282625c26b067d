//! Testing utilities for the story engine.
//!
//! This module provides tools for integration testing:
//! - `MockStoryteller` for deterministic testing without API calls
//! - `TestHarness` for scripted story scenarios
//! - Assertion helpers for verifying session state
//!
//! The mock returns scripted raw responses; everything downstream of the
//! model (splitting, parsing, dispatch) is the real pipeline, so scenario
//! tests exercise exactly the code production turns run.

use crate::session::{ingest_response, IngestedResponse};
use crate::world::{find_by_name, Character, SessionState, WorldConfig};

/// A mock storyteller that returns scripted raw responses in order.
pub struct MockStoryteller {
    responses: Vec<String>,
    response_index: usize,
}

impl MockStoryteller {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            response_index: 0,
        }
    }

    /// The next scripted response, or a fixed fallback when the script runs
    /// out.
    pub fn next_response(&mut self) -> String {
        if self.response_index < self.responses.len() {
            let r = self.responses[self.response_index].clone();
            self.response_index += 1;
            r
        } else {
            "The storyteller has no more scripted responses.".to_string()
        }
    }

    pub fn queue_response(&mut self, raw: impl Into<String>) {
        self.responses.push(raw.into());
    }

    /// Replay the script from the beginning.
    pub fn reset(&mut self) {
        self.response_index = 0;
    }
}

/// Test harness for running story scenarios against the real pipeline.
pub struct TestHarness {
    pub storyteller: MockStoryteller,
    pub state: SessionState,
}

impl TestHarness {
    /// Create a harness with a generic world and character.
    pub fn new() -> Self {
        let config = WorldConfig {
            genre: "fantasy".to_string(),
            setting: "a quiet valley town".to_string(),
            rules: Vec::new(),
            seed_entities: Vec::new(),
        };
        Self::with_world(config, Character::new("Test Hero"))
    }

    pub fn with_world(config: WorldConfig, character: Character) -> Self {
        Self {
            storyteller: MockStoryteller::new(Vec::new()),
            state: SessionState::new(config, character),
        }
    }

    /// Queue a raw storyteller response (narration, marker, tags and all).
    pub fn expect_response(&mut self, raw: impl Into<String>) -> &mut Self {
        self.storyteller.queue_response(raw);
        self
    }

    /// Run one turn: the player acts, the next scripted response is pushed
    /// through the real splitter, parser, and dispatcher.
    pub fn input(&mut self, action: &str) -> IngestedResponse {
        self.state.add_player_action(action);
        let raw = self.storyteller.next_response();
        let ingested = ingest_response(&self.state, &raw);
        self.state = ingested.state.clone();
        self.state.add_narration(&ingested.narration);
        ingested
    }

    pub fn item_quantity(&self, name: &str) -> Option<i64> {
        find_by_name(&self.state.inventory, name).map(|i| i.quantity)
    }

    pub fn has_npc(&self, name: &str) -> bool {
        find_by_name(&self.state.npcs, name).is_some()
    }

    pub fn has_quest(&self, name: &str) -> bool {
        find_by_name(&self.state.quests, name).is_some()
    }

    pub fn reputation_score(&self) -> i32 {
        self.state.reputation.score
    }

    /// The last narration shown to the player.
    pub fn last_narration(&self) -> Option<&str> {
        self.state
            .history
            .iter()
            .rev()
            .find(|t| t.kind == crate::world::TurnKind::Narration)
            .map(|t| t.text.as_str())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the inventory holds exactly `quantity` of the item.
#[track_caller]
pub fn assert_item_quantity(harness: &TestHarness, name: &str, quantity: i64) {
    let actual = harness.item_quantity(name);
    assert_eq!(
        actual,
        Some(quantity),
        "Expected {quantity} of '{name}', got {actual:?}"
    );
}

/// Assert the item is absent from the inventory.
#[track_caller]
pub fn assert_no_item(harness: &TestHarness, name: &str) {
    assert!(
        harness.item_quantity(name).is_none(),
        "Expected no '{name}' in inventory"
    );
}

/// Assert an NPC with the given name is tracked.
#[track_caller]
pub fn assert_has_npc(harness: &TestHarness, name: &str) {
    assert!(
        harness.has_npc(name),
        "Expected NPC '{name}' to be tracked"
    );
}

/// Assert the reputation score.
#[track_caller]
pub fn assert_reputation(harness: &TestHarness, score: i32) {
    let actual = harness.reputation_score();
    assert_eq!(
        actual, score,
        "Expected reputation {score}, got {actual}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_basic_narration() {
        let mut harness = TestHarness::new();
        harness.expect_response("You stand in a dusty square.");

        let response = harness.input("look around");

        assert_eq!(response.narration, "You stand in a dusty square.");
        assert_eq!(response.changes_applied, 0);
        assert_eq!(harness.last_narration(), Some("You stand in a dusty square."));
    }

    #[test]
    fn test_mock_applies_changes() {
        let mut harness = TestHarness::new();
        harness.expect_response(
            "The merchant hands you three apples.\n\nEND_NARRATION\n\
             [ITEM_ADD: name=Apple, quantity=3]",
        );

        harness.input("buy apples");
        assert_item_quantity(&harness, "Apple", 3);
    }

    #[test]
    fn test_mock_runs_out_of_script() {
        let mut harness = TestHarness::new();
        let response = harness.input("anything");
        assert!(response.narration.contains("no more scripted responses"));
    }

    #[test]
    fn test_mock_reset_replays() {
        let mut storyteller = MockStoryteller::new(vec!["first".to_string()]);
        assert_eq!(storyteller.next_response(), "first");
        storyteller.reset();
        assert_eq!(storyteller.next_response(), "first");
    }
}
