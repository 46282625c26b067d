//! World and session state.
//!
//! `SessionState` is the single aggregate root mutated once per turn by the
//! change dispatcher. Every named collection uses case-insensitive trimmed
//! names as identity; no two elements of a collection share a name.

use crate::calendar::WorldClock;
use serde::{Deserialize, Serialize};

/// Normalize a name for identity comparison: trimmed, Unicode-lowercased.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Whether two entity names refer to the same entity.
pub fn names_match(a: &str, b: &str) -> bool {
    normalize_name(a) == normalize_name(b)
}

/// An element of a named collection, mergeable by name.
///
/// `merge_from` implements the shallow-merge contract: the candidate's
/// non-empty fields win, empty or absent fields preserve the old value.
pub trait NamedEntity {
    fn name(&self) -> &str;
    fn merge_from(&mut self, candidate: Self);
}

/// Find an element by case-insensitive trimmed name.
pub fn find_by_name<'a, T: NamedEntity>(list: &'a [T], name: &str) -> Option<&'a T> {
    list.iter().find(|e| names_match(e.name(), name))
}

/// Find an element index by case-insensitive trimmed name.
pub fn position_by_name<T: NamedEntity>(list: &[T], name: &str) -> Option<usize> {
    list.iter().position(|e| names_match(e.name(), name))
}

/// Merge-by-name upsert: shallow-merge onto the first name match, or append.
///
/// Idempotent: applying the same candidate twice yields the same collection
/// as applying it once.
pub fn upsert_by_name<T: NamedEntity>(list: &mut Vec<T>, candidate: T) {
    match position_by_name(list, candidate.name()) {
        Some(idx) => list[idx].merge_from(candidate),
        None => list.push(candidate),
    }
}

/// Remove an element by name. Returns true if something was removed.
pub fn remove_by_name<T: NamedEntity>(list: &mut Vec<T>, name: &str) -> bool {
    match position_by_name(list, name) {
        Some(idx) => {
            list.remove(idx);
            true
        }
        None => false,
    }
}

fn merge_string(target: &mut String, candidate: String) {
    if !candidate.trim().is_empty() {
        *target = candidate;
    }
}

// ============================================================================
// Character
// ============================================================================

/// How a stat behaves under updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StatKind {
    /// Bounded, depletable, regenerates. Clamped to `[0, max_value]`.
    Resource,
    /// Unbounded or self-capped capability value, used for checks.
    #[default]
    Attribute,
}

/// A character stat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub name: String,
    pub kind: StatKind,
    pub value: f64,
    pub max_value: Option<f64>,
}

impl Stat {
    pub fn resource(name: impl Into<String>, value: f64, max_value: f64) -> Self {
        Self {
            name: name.into(),
            kind: StatKind::Resource,
            value,
            max_value: Some(max_value),
        }
    }

    pub fn attribute(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: StatKind::Attribute,
            value,
            max_value: None,
        }
    }

    /// Clamp a resource stat into `[0, max_value]`. Attributes pass through.
    pub fn clamp(&mut self) {
        if self.kind == StatKind::Resource {
            if let Some(max) = self.max_value {
                self.value = self.value.clamp(0.0, max);
            } else if self.value < 0.0 {
                self.value = 0.0;
            }
        }
    }
}

impl NamedEntity for Stat {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, candidate: Self) {
        self.kind = candidate.kind;
        self.value = candidate.value;
        if candidate.max_value.is_some() {
            self.max_value = candidate.max_value;
        }
        self.clamp();
    }
}

/// The player character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Character {
    pub name: String,
    pub biography: String,
    pub motivation: String,
    pub skills: Vec<String>,
    pub stats: Vec<Stat>,
}

impl Character {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn stat(&self, name: &str) -> Option<&Stat> {
        find_by_name(&self.stats, name)
    }
}

// ============================================================================
// Named collections
// ============================================================================

/// An inventory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub quantity: i64,
    pub description: String,
}

impl Item {
    pub fn new(name: impl Into<String>, quantity: i64) -> Self {
        Self {
            name: name.into(),
            quantity,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl NamedEntity for Item {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, candidate: Self) {
        self.quantity = candidate.quantity;
        merge_string(&mut self.description, candidate.description);
    }
}

/// Positive, negative, or neutral status effect on the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StatusPolarity {
    Positive,
    Negative,
    #[default]
    Neutral,
}

/// A transient status effect on the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEffect {
    pub name: String,
    pub description: String,
    pub polarity: StatusPolarity,
}

impl NamedEntity for StatusEffect {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, candidate: Self) {
        merge_string(&mut self.description, candidate.description);
        self.polarity = candidate.polarity;
    }
}

/// A travelling companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Companion {
    pub name: String,
    pub description: String,
}

impl NamedEntity for Companion {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, candidate: Self) {
        merge_string(&mut self.description, candidate.description);
    }
}

/// An NPC the player has encountered.
///
/// All fields besides the name are partial: an update supplying only
/// `thoughts` leaves the description intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Npc {
    pub name: String,
    pub description: String,
    /// The NPC's current opinion of the player.
    pub thoughts: String,
}

impl Npc {
    /// Minimal record for an NPC known only by name.
    pub fn stub(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl NamedEntity for Npc {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, candidate: Self) {
        merge_string(&mut self.description, candidate.description);
        merge_string(&mut self.thoughts, candidate.thoughts);
    }
}

/// A faction the player has encountered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Faction {
    pub name: String,
    pub description: String,
    /// The faction's stance toward the player.
    pub standing: String,
}

impl NamedEntity for Faction {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, candidate: Self) {
        merge_string(&mut self.description, candidate.description);
        merge_string(&mut self.standing, candidate.standing);
    }
}

/// Quest progression status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QuestStatus {
    #[default]
    InProgress,
    Completed,
}

impl QuestStatus {
    /// Parse from the loose strings the model emits.
    pub fn parse(s: &str) -> Option<Self> {
        match normalize_name(s).replace([' ', '_'], "-").as_str() {
            "in-progress" | "active" | "started" => Some(Self::InProgress),
            "completed" | "complete" | "done" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for QuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// A tracked quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    pub name: String,
    pub description: String,
    pub status: QuestStatus,
}

impl NamedEntity for Quest {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, candidate: Self) {
        merge_string(&mut self.description, candidate.description);
        self.status = candidate.status;
    }
}

/// Discriminant for discovered world entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntityKind {
    Location,
    Creature,
    Item,
    Organization,
    Concept,
    #[default]
    Other,
}

impl EntityKind {
    /// Parse from the loose strings the model emits.
    pub fn parse(s: &str) -> Self {
        match normalize_name(s).as_str() {
            "location" | "place" => Self::Location,
            "creature" | "monster" | "animal" => Self::Creature,
            "item" | "object" => Self::Item,
            "organization" | "faction" | "group" => Self::Organization,
            "concept" | "lore" => Self::Concept,
            _ => Self::Other,
        }
    }
}

/// A world entity surfaced by the narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEntity {
    pub name: String,
    pub kind: EntityKind,
    pub description: String,
}

impl NamedEntity for DiscoveredEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_from(&mut self, candidate: Self) {
        self.kind = candidate.kind;
        merge_string(&mut self.description, candidate.description);
    }
}

// ============================================================================
// Reputation
// ============================================================================

/// Bounds for the reputation score.
pub const REPUTATION_MIN: i32 = -100;
pub const REPUTATION_MAX: i32 = 100;

/// Tier label used when no threshold table has been configured.
pub const FALLBACK_TIER: &str = "Unknown";

/// Player reputation: a bounded score plus a tier derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reputation {
    pub score: i32,
    pub tier: String,
}

impl Default for Reputation {
    fn default() -> Self {
        Self {
            score: 0,
            tier: FALLBACK_TIER.to_string(),
        }
    }
}

impl Reputation {
    /// Map a score onto the 5-bucket tier table.
    ///
    /// Buckets: `<= -75`, `<= -25`, `< 25`, `< 75`, else top tier.
    pub fn tier_for_score(score: i32, tiers: &[String]) -> String {
        if tiers.len() < 5 {
            return FALLBACK_TIER.to_string();
        }
        let idx = if score <= -75 {
            0
        } else if score <= -25 {
            1
        } else if score < 25 {
            2
        } else if score < 75 {
            3
        } else {
            4
        };
        tiers[idx].clone()
    }

    /// Apply a signed delta, clamping to the score bounds and recomputing
    /// the tier.
    pub fn apply_delta(&mut self, delta: i32, tiers: &[String]) {
        self.score = (self.score + delta).clamp(REPUTATION_MIN, REPUTATION_MAX);
        self.tier = Self::tier_for_score(self.score, tiers);
    }
}

// ============================================================================
// History and world config
// ============================================================================

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnKind {
    PlayerAction,
    Narration,
}

/// One entry in the session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub kind: TurnKind,
    pub text: String,
}

/// Immutable-per-session world definition.
///
/// Read by the pipeline; never touched by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorldConfig {
    pub genre: String,
    pub setting: String,
    pub rules: Vec<String>,
    pub seed_entities: Vec<DiscoveredEntity>,
}

// ============================================================================
// Session state
// ============================================================================

/// The full serializable story snapshot, mutated once per turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub history: Vec<Turn>,
    pub character: Character,
    pub inventory: Vec<Item>,
    pub companions: Vec<Companion>,
    pub quests: Vec<Quest>,
    pub npcs: Vec<Npc>,
    pub factions: Vec<Faction>,
    pub discovered_entities: Vec<DiscoveredEntity>,
    pub player_status: Vec<StatusEffect>,
    pub clock: WorldClock,
    pub reputation: Reputation,
    /// 5 tier labels installed once per world by the init-only tag.
    pub reputation_tiers: Vec<String>,
    pub memories: Vec<String>,
    pub summaries: Vec<String>,
    pub world_config: WorldConfig,
}

impl SessionState {
    /// Create a fresh session at world start.
    pub fn new(world_config: WorldConfig, character: Character) -> Self {
        Self {
            history: Vec::new(),
            character,
            inventory: Vec::new(),
            companions: Vec::new(),
            quests: Vec::new(),
            npcs: Vec::new(),
            factions: Vec::new(),
            discovered_entities: Vec::new(),
            player_status: Vec::new(),
            clock: WorldClock::default(),
            reputation: Reputation::default(),
            reputation_tiers: Vec::new(),
            memories: Vec::new(),
            summaries: Vec::new(),
            world_config,
        }
    }

    /// Append a player action to the history.
    pub fn add_player_action(&mut self, text: impl Into<String>) {
        self.history.push(Turn {
            kind: TurnKind::PlayerAction,
            text: text.into(),
        });
    }

    /// Append a narration to the history.
    pub fn add_narration(&mut self, text: impl Into<String>) {
        self.history.push(Turn {
            kind: TurnKind::Narration,
            text: text.into(),
        });
    }

    /// Remove exactly the trailing narration turn, if the last turn is one.
    ///
    /// Returns the removed narration. The only way history ever shrinks.
    pub fn undo_last_narration(&mut self) -> Option<Turn> {
        match self.history.last() {
            Some(turn) if turn.kind == TurnKind::Narration => self.history.pop(),
            _ => None,
        }
    }

    /// Whether the session has produced any narration yet.
    ///
    /// Init-only tags are accepted only before the first narration commits.
    pub fn is_first_turn(&self) -> bool {
        !self
            .history
            .iter()
            .any(|t| t.kind == TurnKind::Narration)
    }

    /// Whether an entity of this name exists anywhere: seed entities or
    /// previously discovered ones.
    pub fn entity_known(&self, name: &str) -> bool {
        find_by_name(&self.world_config.seed_entities, name).is_some()
            || find_by_name(&self.discovered_entities, name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_case_and_trim() {
        assert!(names_match("Torch", "  torch "));
        assert!(names_match("Lý Tiêu", "lý tiêu"));
        assert!(!names_match("Torch", "Torches"));
    }

    #[test]
    fn test_upsert_merges_instead_of_duplicating() {
        let mut npcs = vec![Npc {
            name: "lý tiêu".to_string(),
            description: "A wandering swordsman".to_string(),
            thoughts: String::new(),
        }];

        upsert_by_name(
            &mut npcs,
            Npc {
                name: "Lý Tiêu".to_string(),
                description: String::new(),
                thoughts: "Respects the player".to_string(),
            },
        );

        assert_eq!(npcs.len(), 1);
        assert_eq!(npcs[0].description, "A wandering swordsman");
        assert_eq!(npcs[0].thoughts, "Respects the player");
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut quests: Vec<Quest> = Vec::new();
        let candidate = Quest {
            name: "Find the Amulet".to_string(),
            description: "Lost in the marsh".to_string(),
            status: QuestStatus::InProgress,
        };

        upsert_by_name(&mut quests, candidate.clone());
        let once = quests.clone();
        upsert_by_name(&mut quests, candidate);

        assert_eq!(quests, once);
    }

    #[test]
    fn test_remove_by_name_missing_is_noop() {
        let mut companions = vec![Companion {
            name: "Mira".to_string(),
            description: String::new(),
        }];
        assert!(!remove_by_name(&mut companions, "Ghost"));
        assert_eq!(companions.len(), 1);
        assert!(remove_by_name(&mut companions, " MIRA "));
        assert!(companions.is_empty());
    }

    #[test]
    fn test_resource_stat_clamps() {
        let mut hp = Stat::resource("Health", 120.0, 100.0);
        hp.clamp();
        assert_eq!(hp.value, 100.0);

        hp.value = -5.0;
        hp.clamp();
        assert_eq!(hp.value, 0.0);
    }

    #[test]
    fn test_attribute_stat_unclamped() {
        let mut str_stat = Stat::attribute("Strength", 250.0);
        str_stat.clamp();
        assert_eq!(str_stat.value, 250.0);
    }

    #[test]
    fn test_reputation_tiers() {
        let tiers: Vec<String> = ["A", "B", "C", "D", "E"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(Reputation::tier_for_score(-100, &tiers), "A");
        assert_eq!(Reputation::tier_for_score(-75, &tiers), "A");
        assert_eq!(Reputation::tier_for_score(-74, &tiers), "B");
        assert_eq!(Reputation::tier_for_score(-25, &tiers), "B");
        assert_eq!(Reputation::tier_for_score(0, &tiers), "C");
        assert_eq!(Reputation::tier_for_score(24, &tiers), "C");
        assert_eq!(Reputation::tier_for_score(60, &tiers), "D");
        assert_eq!(Reputation::tier_for_score(75, &tiers), "E");
        assert_eq!(Reputation::tier_for_score(100, &tiers), "E");
    }

    #[test]
    fn test_reputation_clamping() {
        let tiers: Vec<String> = ["A", "B", "C", "D", "E"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut rep = Reputation {
            score: 90,
            tier: "E".to_string(),
        };
        rep.apply_delta(1000, &tiers);
        assert_eq!(rep.score, 100);

        rep.score = -90;
        rep.apply_delta(-1000, &tiers);
        assert_eq!(rep.score, -100);
        assert_eq!(rep.tier, "A");
    }

    #[test]
    fn test_reputation_fallback_tier() {
        assert_eq!(Reputation::tier_for_score(50, &[]), FALLBACK_TIER);
    }

    #[test]
    fn test_quest_status_parsing() {
        assert_eq!(QuestStatus::parse("In Progress"), Some(QuestStatus::InProgress));
        assert_eq!(QuestStatus::parse("in-progress"), Some(QuestStatus::InProgress));
        assert_eq!(QuestStatus::parse("COMPLETED"), Some(QuestStatus::Completed));
        assert_eq!(QuestStatus::parse("abandoned"), None);
    }

    #[test]
    fn test_undo_last_narration() {
        let mut state = SessionState::new(WorldConfig::default(), Character::new("Ash"));
        state.add_player_action("I open the door");
        state.add_narration("The door creaks open.");

        assert!(state.undo_last_narration().is_some());
        assert_eq!(state.history.len(), 1);

        // Last turn is now a player action: undo must refuse.
        assert!(state.undo_last_narration().is_none());
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn test_first_turn_detection() {
        let mut state = SessionState::new(WorldConfig::default(), Character::new("Ash"));
        assert!(state.is_first_turn());
        state.add_player_action("Begin");
        assert!(state.is_first_turn());
        state.add_narration("It begins.");
        assert!(!state.is_first_turn());
    }

    #[test]
    fn test_entity_known_checks_seeds_and_discoveries() {
        let mut config = WorldConfig::default();
        config.seed_entities.push(DiscoveredEntity {
            name: "Blackreach".to_string(),
            kind: EntityKind::Location,
            description: "A buried city".to_string(),
        });

        let mut state = SessionState::new(config, Character::new("Ash"));
        assert!(state.entity_known("blackreach"));

        state.discovered_entities.push(DiscoveredEntity {
            name: "The Pale King".to_string(),
            kind: EntityKind::Creature,
            description: String::new(),
        });
        assert!(state.entity_known("the pale king"));
        assert!(!state.entity_known("Riverside"));
    }
}
