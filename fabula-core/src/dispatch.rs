//! Change dispatcher: folds parsed change records over the session state.
//!
//! One pure reducer per tag kind, dispatched by exhaustive match. The fold
//! never fails on a single bad record: it logs and moves on, because losing
//! one field update must not corrupt the rest of the turn.

use crate::calendar::{TimeDelta, WorldClock};
use crate::splitter::sanitize_narration;
use crate::tags::ChangeRecord;
use crate::world::{
    find_by_name, position_by_name, remove_by_name, upsert_by_name, Companion, DiscoveredEntity,
    EntityKind, Npc, Quest, QuestStatus, SessionState, Stat, StatKind, StatusEffect,
    StatusPolarity, Faction,
};
use tracing::{debug, warn};

/// What an index-update request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSourceKind {
    Turn,
    Summary,
    Entity,
}

/// A pending vector-index update emitted by the dispatcher, consumed
/// asynchronously by the retrieval subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub kind: IndexSourceKind,
    /// Position in the owning log (turn index, summary index) or 0 for
    /// entities.
    pub source_index: usize,
    pub text: String,
}

/// Result of applying a turn's change records.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub state: SessionState,
    pub index_requests: Vec<IndexRequest>,
}

/// The closed set of tag kinds the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    ItemAdd,
    ItemRemove,
    StatusAdd,
    StatusRemove,
    NpcUpdate,
    FactionUpdate,
    QuestUpdate,
    CompanionAdd,
    CompanionRemove,
    StatUpdate,
    TimeAdvance,
    ReputationChange,
    MemoryAdd,
    SummaryAdd,
    EntityDiscovered,
    // Session-initialization-only tags, valid before the first narration.
    WorldTimeSet,
    ReputationTiers,
}

impl TagKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "ITEM_ADD" => Some(Self::ItemAdd),
            "ITEM_REMOVE" => Some(Self::ItemRemove),
            "STATUS_ADD" => Some(Self::StatusAdd),
            "STATUS_REMOVE" => Some(Self::StatusRemove),
            "NPC_UPDATE" => Some(Self::NpcUpdate),
            "FACTION_UPDATE" => Some(Self::FactionUpdate),
            "QUEST_UPDATE" => Some(Self::QuestUpdate),
            "COMPANION_ADD" => Some(Self::CompanionAdd),
            "COMPANION_REMOVE" => Some(Self::CompanionRemove),
            "STAT_UPDATE" => Some(Self::StatUpdate),
            "TIME_ADVANCE" => Some(Self::TimeAdvance),
            "REPUTATION_CHANGE" => Some(Self::ReputationChange),
            "MEMORY_ADD" => Some(Self::MemoryAdd),
            "SUMMARY_ADD" => Some(Self::SummaryAdd),
            "ENTITY_DISCOVERED" => Some(Self::EntityDiscovered),
            "WORLD_TIME_SET" => Some(Self::WorldTimeSet),
            "REPUTATION_TIERS" => Some(Self::ReputationTiers),
            _ => None,
        }
    }
}

/// Apply the ordered record list to a state snapshot.
///
/// Pure and total: unknown tag kinds and records missing required fields are
/// logged and skipped; the function itself never fails.
pub fn apply_changes(state: &SessionState, records: &[ChangeRecord]) -> DispatchOutcome {
    let mut next = state.clone();
    let mut index_requests = Vec::new();

    for record in records {
        let Some(kind) = TagKind::parse(&record.kind) else {
            warn!("ignoring unknown tag kind: {}", record.kind);
            continue;
        };

        match kind {
            TagKind::ItemAdd => apply_item_add(&mut next, record, &mut index_requests),
            TagKind::ItemRemove => apply_item_remove(&mut next, record),
            TagKind::StatusAdd => apply_status_add(&mut next, record),
            TagKind::StatusRemove => apply_status_remove(&mut next, record),
            TagKind::NpcUpdate => apply_npc_update(&mut next, record),
            TagKind::FactionUpdate => apply_faction_update(&mut next, record),
            TagKind::QuestUpdate => apply_quest_update(&mut next, record),
            TagKind::CompanionAdd => apply_companion_add(&mut next, record),
            TagKind::CompanionRemove => apply_companion_remove(&mut next, record),
            TagKind::StatUpdate => apply_stat_update(&mut next, record),
            TagKind::TimeAdvance => apply_time_advance(&mut next, record),
            TagKind::ReputationChange => apply_reputation_change(&mut next, record),
            TagKind::MemoryAdd => apply_memory_add(&mut next, record),
            TagKind::SummaryAdd => apply_summary_add(&mut next, record, &mut index_requests),
            TagKind::EntityDiscovered => {
                apply_entity_discovered(&mut next, record, &mut index_requests)
            }
            TagKind::WorldTimeSet => apply_world_time_set(&mut next, record),
            TagKind::ReputationTiers => apply_reputation_tiers(&mut next, record),
        }
    }

    DispatchOutcome {
        state: next,
        index_requests,
    }
}

fn required_name(record: &ChangeRecord) -> Option<String> {
    match record.text_field("name") {
        Some(name) if !name.trim().is_empty() => Some(name.trim().to_string()),
        _ => {
            warn!("{} record missing name; skipped", record.kind);
            None
        }
    }
}

fn positive_quantity(record: &ChangeRecord) -> Option<i64> {
    let qty = record.int_field("quantity").unwrap_or(1);
    if qty <= 0 {
        warn!("{} record with non-positive quantity {qty}; skipped", record.kind);
        return None;
    }
    Some(qty)
}

// ============================================================================
// Reducers
// ============================================================================

fn apply_item_add(
    state: &mut SessionState,
    record: &ChangeRecord,
    index_requests: &mut Vec<IndexRequest>,
) {
    let Some(name) = required_name(record) else { return };
    let Some(qty) = positive_quantity(record) else { return };
    let description = record.text_field("description").unwrap_or_default();

    match position_by_name(&state.inventory, &name) {
        Some(idx) => {
            state.inventory[idx].quantity += qty;
            if !description.trim().is_empty() {
                state.inventory[idx].description = description;
            }
        }
        None => {
            index_requests.push(IndexRequest {
                kind: IndexSourceKind::Entity,
                source_index: 0,
                text: format!("Item: {name}. {description}"),
            });
            state.inventory.push(
                crate::world::Item::new(name, qty).with_description(description),
            );
        }
    }
}

fn apply_item_remove(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };
    let Some(qty) = positive_quantity(record) else { return };

    match position_by_name(&state.inventory, &name) {
        Some(idx) => {
            state.inventory[idx].quantity -= qty;
            if state.inventory[idx].quantity <= 0 {
                state.inventory.remove(idx);
            }
        }
        None => warn!("ITEM_REMOVE for unknown item '{name}'; no-op"),
    }
}

fn apply_status_add(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };
    let polarity = record
        .text_field("polarity")
        .map(|p| parse_polarity(&p))
        .unwrap_or_default();

    upsert_by_name(
        &mut state.player_status,
        StatusEffect {
            name,
            description: record.text_field("description").unwrap_or_default(),
            polarity,
        },
    );
}

fn parse_polarity(s: &str) -> StatusPolarity {
    match s.trim().to_lowercase().as_str() {
        "positive" | "buff" | "good" => StatusPolarity::Positive,
        "negative" | "debuff" | "bad" => StatusPolarity::Negative,
        _ => StatusPolarity::Neutral,
    }
}

fn apply_status_remove(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };
    // Removing a status that never existed is a silent no-op.
    remove_by_name(&mut state.player_status, &name);
}

fn apply_npc_update(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };

    if find_by_name(&state.npcs, &name).is_none() {
        // Update-only data for an unknown NPC upserts into a fresh stub
        // rather than failing, so the story keeps moving. Worth watching if
        // narrative consistency bugs appear.
        debug!("NPC_UPDATE for unknown NPC '{name}'; synthesizing stub");
        state.npcs.push(Npc::stub(name.clone()));
    }

    upsert_by_name(
        &mut state.npcs,
        Npc {
            name,
            description: record.text_field("description").unwrap_or_default(),
            thoughts: record.text_field("thoughts").unwrap_or_default(),
        },
    );
}

fn apply_faction_update(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };

    if find_by_name(&state.factions, &name).is_none() {
        debug!("FACTION_UPDATE for unknown faction '{name}'; creating stub");
    }

    upsert_by_name(
        &mut state.factions,
        Faction {
            name,
            description: record.text_field("description").unwrap_or_default(),
            standing: record.text_field("standing").unwrap_or_default(),
        },
    );
}

fn apply_quest_update(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };

    let status = match record.text_field("status") {
        Some(raw) => match QuestStatus::parse(&raw) {
            Some(status) => status,
            None => {
                warn!("QUEST_UPDATE with unrecognized status '{raw}'; keeping prior status");
                find_by_name(&state.quests, &name)
                    .map(|q| q.status)
                    .unwrap_or_default()
            }
        },
        None => find_by_name(&state.quests, &name)
            .map(|q| q.status)
            .unwrap_or_default(),
    };

    upsert_by_name(
        &mut state.quests,
        Quest {
            name,
            description: record.text_field("description").unwrap_or_default(),
            status,
        },
    );
}

fn apply_companion_add(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };
    upsert_by_name(
        &mut state.companions,
        Companion {
            name,
            description: record.text_field("description").unwrap_or_default(),
        },
    );
}

fn apply_companion_remove(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };
    remove_by_name(&mut state.companions, &name);
}

fn apply_stat_update(state: &mut SessionState, record: &ChangeRecord) {
    let Some(name) = required_name(record) else { return };
    let Some(value) = record.num_field("value") else {
        warn!("STAT_UPDATE for '{name}' missing numeric value; skipped");
        return;
    };
    let max_value = record.num_field("max");

    let kind = match record.text_field("kind").as_deref() {
        Some(raw) => parse_stat_kind(raw),
        // Unsupplied kind: a max implies a depletable resource.
        None => match position_by_name(&state.character.stats, &name) {
            Some(idx) => state.character.stats[idx].kind,
            None if max_value.is_some() => StatKind::Resource,
            None => StatKind::Attribute,
        },
    };

    let mut stat = Stat {
        name,
        kind,
        value,
        max_value,
    };
    stat.clamp();
    upsert_by_name(&mut state.character.stats, stat);
}

fn parse_stat_kind(s: &str) -> StatKind {
    match s.trim().to_lowercase().as_str() {
        "resource" => StatKind::Resource,
        _ => StatKind::Attribute,
    }
}

fn apply_time_advance(state: &mut SessionState, record: &ChangeRecord) {
    let field = |key: &str| -> u32 {
        match record.int_field(key) {
            Some(v) if v < 0 => {
                // The clock never runs backward.
                warn!("TIME_ADVANCE with negative {key} {v}; treated as 0");
                0
            }
            Some(v) => v as u32,
            None => 0,
        }
    };

    let delta = TimeDelta {
        minutes: field("minutes"),
        hours: field("hours"),
        days: field("days"),
        months: field("months"),
        years: field("years"),
    };

    state.clock.advance(&delta);
}

fn apply_reputation_change(state: &mut SessionState, record: &ChangeRecord) {
    let Some(delta) = record.int_field("amount") else {
        warn!("REPUTATION_CHANGE missing amount; skipped");
        return;
    };
    let tiers = state.reputation_tiers.clone();
    let delta = delta.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    state.reputation.apply_delta(delta, &tiers);
}

fn apply_memory_add(state: &mut SessionState, record: &ChangeRecord) {
    let Some(content) = log_text(record) else {
        warn!("MEMORY_ADD missing text; skipped");
        return;
    };
    state.memories.push(sanitize_narration(&content));
}

/// MEMORY_ADD and SUMMARY_ADD payload; the model uses `text` and `content`
/// interchangeably.
fn log_text(record: &ChangeRecord) -> Option<String> {
    record
        .text_field("text")
        .or_else(|| record.text_field("content"))
}

fn apply_summary_add(
    state: &mut SessionState,
    record: &ChangeRecord,
    index_requests: &mut Vec<IndexRequest>,
) {
    let Some(content) = log_text(record) else {
        warn!("SUMMARY_ADD missing text; skipped");
        return;
    };
    let cleaned = sanitize_narration(&content);
    state.summaries.push(cleaned.clone());
    index_requests.push(IndexRequest {
        kind: IndexSourceKind::Summary,
        source_index: state.summaries.len() - 1,
        text: cleaned,
    });
}

fn apply_entity_discovered(
    state: &mut SessionState,
    record: &ChangeRecord,
    index_requests: &mut Vec<IndexRequest>,
) {
    let Some(name) = required_name(record) else { return };

    // Rediscovering a known entity (seeded or already discovered) is a
    // silent no-op.
    if state.entity_known(&name) {
        return;
    }

    let kind = record
        .text_field("kind")
        .or_else(|| record.text_field("type"))
        .map(|t| EntityKind::parse(&t))
        .unwrap_or_default();
    let description = record.text_field("description").unwrap_or_default();

    index_requests.push(IndexRequest {
        kind: IndexSourceKind::Entity,
        source_index: 0,
        text: format!("{name}: {description}"),
    });
    state.discovered_entities.push(DiscoveredEntity {
        name,
        kind,
        description,
    });
}

fn apply_world_time_set(state: &mut SessionState, record: &ChangeRecord) {
    if !state.is_first_turn() {
        warn!("WORLD_TIME_SET outside session initialization; ignored");
        return;
    }

    let int = |key: &str, default: i64| record.int_field(key).unwrap_or(default);
    state.clock = WorldClock::new(
        int("year", 1) as i32,
        int("month", 1) as u8,
        int("day", 1) as u8,
        int("hour", 8) as u8,
        int("minute", 0) as u8,
    );
}

fn apply_reputation_tiers(state: &mut SessionState, record: &ChangeRecord) {
    if !state.is_first_turn() {
        warn!("REPUTATION_TIERS outside session initialization; ignored");
        return;
    }

    let Some(raw) = record.text_field("tiers") else {
        warn!("REPUTATION_TIERS missing tiers; skipped");
        return;
    };

    let tiers: Vec<String> = raw
        .split(['|', ','])
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if tiers.len() != 5 {
        warn!("REPUTATION_TIERS expects 5 labels, got {}; skipped", tiers.len());
        return;
    }

    state.reputation_tiers = tiers;
    if let Some(seed) = record.int_field("score") {
        state.reputation.score = (seed as i32).clamp(-100, 100);
    }
    state.reputation.tier =
        crate::world::Reputation::tier_for_score(state.reputation.score, &state.reputation_tiers);
}
