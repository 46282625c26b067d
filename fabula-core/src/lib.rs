//! Interactive-fiction engine driven by a generative storyteller.
//!
//! This crate provides:
//! - A turn pipeline that splits model output into narration and a tagged
//!   change list, parses the tags tolerantly, and applies them to the world
//! - A serializable session state (inventory, NPCs, quests, factions, clock,
//!   reputation) with merge-by-name semantics
//! - Hybrid vector + keyword context retrieval with a background embedding
//!   indexer
//! - Versioned save files with per-type retention
//!
//! # Quick Start
//!
//! ```ignore
//! use fabula_core::{Character, SessionConfig, StorySession, WorldConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = gemini::Gemini::from_env()?;
//!     let world = WorldConfig {
//!         genre: "low fantasy".to_string(),
//!         setting: "a river city in decline".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let mut session = StorySession::new(
//!         client,
//!         SessionConfig::default().with_save_dir("saves"),
//!         world,
//!         Character::new("Mara"),
//!     );
//!
//!     let outcome = session.player_action("I step off the barge").await?;
//!     println!("{}", outcome.narration);
//!     Ok(())
//! }
//! ```

pub mod calendar;
pub mod dispatch;
pub mod persist;
pub mod prompt;
pub mod retrieval;
pub mod session;
pub mod splitter;
pub mod tags;
pub mod testing;
pub mod world;

// Primary public API
pub use dispatch::{apply_changes, DispatchOutcome, IndexRequest, IndexSourceKind};
pub use persist::{list_saves, SaveType, SavedStory};
pub use session::{SessionConfig, SessionError, StorySession, TurnOutcome};
pub use splitter::split_response;
pub use tags::{parse_change_list, ChangeRecord, TagValue};
pub use testing::{MockStoryteller, TestHarness};
pub use world::{Character, SessionState, WorldConfig};
