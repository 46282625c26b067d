//! Prompt assembly for the storyteller model.
//!
//! The turn prompt is built from sections: writing instructions, the change
//! grammar contract, the world sheet, retrieved context, and the recent
//! history window. Everything the model is expected to know must be in here;
//! the model keeps no state of its own.

use crate::retrieval::RetrievedContext;
use crate::splitter::END_NARRATION_MARKER;
use crate::world::{SessionState, Turn, TurnKind};

/// Turns quoted verbatim at the end of the prompt. Older turns arrive only
/// through retrieval.
pub const RECENT_HISTORY_TURNS: usize = 4;

const WRITING_INSTRUCTIONS: &str = "\
You are the narrator of an interactive story. Continue the story in second \
person, present tense, reacting to the player's latest action. Write vivid \
but concise prose, two to four paragraphs. Never speak for the player and \
never decide the player's next action. Plain prose only: no markdown, no \
asterisks, no stage directions.";

const CHANGE_GRAMMAR: &str = "\
After the narration, write the line END_NARRATION, then list every world \
change your narration implies, one tag per line, using this exact grammar:

[TAGNAME: key=value, key2=\"quoted value\"]

Available tags:
[ITEM_ADD: name=..., quantity=..., description=\"...\"]
[ITEM_REMOVE: name=..., quantity=...]
[STATUS_ADD: name=..., description=\"...\", polarity=positive|negative|neutral]
[STATUS_REMOVE: name=...]
[NPC_UPDATE: name=..., description=\"...\", thoughts=\"...\"]
[FACTION_UPDATE: name=..., description=\"...\", standing=...]
[QUEST_UPDATE: name=..., description=\"...\", status=in-progress|completed]
[COMPANION_ADD: name=..., description=\"...\"]
[COMPANION_REMOVE: name=...]
[STAT_UPDATE: name=..., value=..., max=...]
[TIME_ADVANCE: minutes=..., hours=..., days=...]
[REPUTATION_CHANGE: amount=...]
[MEMORY_ADD: text=\"...\"]
[SUMMARY_ADD: text=\"...\"]
[ENTITY_DISCOVERED: name=..., kind=location|creature|item|organization|concept|other, description=\"...\"]

Quote any value containing commas or brackets. Emit a tag only for changes \
that actually happened in your narration. If nothing changed, write nothing \
after END_NARRATION.";

const INIT_INSTRUCTIONS: &str = "\
This is the opening of the story. Before anything else you may set the \
starting date and the reputation scale, once, using:

[WORLD_TIME_SET: year=..., month=..., day=..., hour=..., minute=...]
[REPUTATION_TIERS: tiers=\"Lowest|Low|Neutral|High|Highest\", score=...]

Then open the story: establish the scene and end at a moment that invites \
the player to act.";

/// Build the full prompt for the next narration turn.
pub fn build_turn_prompt(state: &SessionState, context: &RetrievedContext) -> String {
    let mut prompt = String::new();

    prompt.push_str(WRITING_INSTRUCTIONS);
    prompt.push_str("\n\n");
    prompt.push_str(CHANGE_GRAMMAR);

    if state.is_first_turn() {
        prompt.push_str("\n\n");
        prompt.push_str(INIT_INSTRUCTIONS);
    }

    push_world_section(&mut prompt, state);
    push_character_section(&mut prompt, state);
    push_world_state_section(&mut prompt, state);
    push_context_section(&mut prompt, context);
    push_history_section(&mut prompt, state);

    prompt
}

fn push_world_section(prompt: &mut String, state: &SessionState) {
    let config = &state.world_config;
    prompt.push_str("\n\n## The World\n");
    prompt.push_str(&format!("Genre: {}\n", config.genre));
    prompt.push_str(&format!("Setting: {}\n", config.setting));
    if !config.rules.is_empty() {
        prompt.push_str("World rules:\n");
        for rule in &config.rules {
            prompt.push_str(&format!("- {rule}\n"));
        }
    }
}

fn push_character_section(prompt: &mut String, state: &SessionState) {
    let pc = &state.character;
    prompt.push_str("\n## The Player Character\n");
    prompt.push_str(&format!("Name: {}\n", pc.name));
    if !pc.biography.is_empty() {
        prompt.push_str(&format!("Biography: {}\n", pc.biography));
    }
    if !pc.motivation.is_empty() {
        prompt.push_str(&format!("Motivation: {}\n", pc.motivation));
    }
    if !pc.skills.is_empty() {
        prompt.push_str(&format!("Skills: {}\n", pc.skills.join(", ")));
    }
    for stat in &pc.stats {
        match stat.max_value {
            Some(max) => prompt.push_str(&format!("{}: {}/{}\n", stat.name, stat.value, max)),
            None => prompt.push_str(&format!("{}: {}\n", stat.name, stat.value)),
        }
    }
    if !state.player_status.is_empty() {
        prompt.push_str("Active statuses:\n");
        for status in &state.player_status {
            prompt.push_str(&format!("- {} ({})\n", status.name, status.description));
        }
    }
}

fn push_world_state_section(prompt: &mut String, state: &SessionState) {
    prompt.push_str("\n## Current State\n");
    prompt.push_str(&format!("Time: {}\n", state.clock));
    prompt.push_str(&format!(
        "Reputation: {} ({})\n",
        state.reputation.tier, state.reputation.score
    ));

    if !state.inventory.is_empty() {
        prompt.push_str("\nInventory:\n");
        for item in &state.inventory {
            if item.description.is_empty() {
                prompt.push_str(&format!("- {} x{}\n", item.name, item.quantity));
            } else {
                prompt.push_str(&format!(
                    "- {} x{}: {}\n",
                    item.name, item.quantity, item.description
                ));
            }
        }
    }

    if !state.companions.is_empty() {
        prompt.push_str("\nCompanions:\n");
        for companion in &state.companions {
            prompt.push_str(&format!("- {}: {}\n", companion.name, companion.description));
        }
    }

    if !state.quests.is_empty() {
        prompt.push_str("\nQuests:\n");
        for quest in &state.quests {
            prompt.push_str(&format!(
                "- {} [{}]: {}\n",
                quest.name, quest.status, quest.description
            ));
        }
    }

    if !state.npcs.is_empty() {
        prompt.push_str("\nKnown characters:\n");
        for npc in &state.npcs {
            prompt.push_str(&format!("- {}: {}", npc.name, npc.description));
            if !npc.thoughts.is_empty() {
                prompt.push_str(&format!(" (currently: {})", npc.thoughts));
            }
            prompt.push('\n');
        }
    }

    if !state.factions.is_empty() {
        prompt.push_str("\nFactions:\n");
        for faction in &state.factions {
            prompt.push_str(&format!(
                "- {} [{}]: {}\n",
                faction.name, faction.standing, faction.description
            ));
        }
    }

    if !state.memories.is_empty() {
        prompt.push_str("\nEstablished facts:\n");
        for memory in &state.memories {
            prompt.push_str(&format!("- {memory}\n"));
        }
    }
}

fn push_context_section(prompt: &mut String, context: &RetrievedContext) {
    if !context.knowledge.is_empty() {
        prompt.push_str("\n## Background\n");
        prompt.push_str(&context.knowledge);
        prompt.push('\n');
    }
    if !context.past_summaries.is_empty() {
        prompt.push_str("\n## Earlier in the Story\n");
        prompt.push_str(&context.past_summaries);
        prompt.push('\n');
    }
    if !context.past_turns.is_empty() {
        prompt.push_str("\n## Relevant Past Moments\n");
        prompt.push_str(&context.past_turns);
        prompt.push('\n');
    }
}

fn push_history_section(prompt: &mut String, state: &SessionState) {
    let recent = recent_history(state, RECENT_HISTORY_TURNS);
    if recent.is_empty() {
        return;
    }
    prompt.push_str("\n## Recent Exchange\n");
    for turn in recent {
        let speaker = match turn.kind {
            TurnKind::PlayerAction => "Player",
            TurnKind::Narration => "Narrator",
        };
        prompt.push_str(&format!("{speaker}: {}\n\n", turn.text));
    }
    prompt.push_str(&format!(
        "Continue the story now. End the narration with {END_NARRATION_MARKER} \
         followed by the change tags."
    ));
}

/// The last `window` turns, oldest first.
fn recent_history(state: &SessionState, window: usize) -> &[Turn] {
    let len = state.history.len();
    &state.history[len.saturating_sub(window)..]
}
