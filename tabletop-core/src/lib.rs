//! Combat engine for a virtual tabletop.
//!
//! This crate provides:
//! - A dice expression language with advantage/disadvantage
//! - Area-of-effect geometry on a square grid
//! - Attack and spell targeting with range, AoE and multi-charge spells
//! - The combat state machine: initiative, turns, rounds, held actions and
//!   effect expiry
//! - Replicated state mutations for keeping every participant in sync
//!
//! # Quick Start
//!
//! ```ignore
//! use tabletop_core::{CombatEngine, EngineConfig, Participant, Point, Target};
//!
//! let mut engine = CombatEngine::new(
//!     EngineConfig::default(),
//!     Participant::moderator(),
//!     |notice: tabletop_core::Notice| println!("{}", notice.text),
//!     |update: &tabletop_core::SyncUpdate| send(update.to_json().unwrap()),
//! );
//!
//! let hero = engine.add_combatant(hero);
//! engine.place_token(hero, Point::new(25.0, 25.0))?;
//! engine.enter_pre_combat()?;
//! engine.start_active_combat()?;
//! engine.initiate_attack(hero, "Longsword")?;
//! engine.resolve_target(Target::Token(goblin))?;
//! engine.end_turn()?;
//! ```

pub mod actions;
pub mod combat;
pub mod config;
pub mod dice;
pub mod engine;
pub mod geometry;
pub mod saves;
pub mod stats;
pub mod sync;
pub mod targeting;
pub mod testing;
pub mod world;

// Primary public API
pub use actions::{ActionCategory, ActionDetail, AreaOfEffect, AreaShape, DamageType, Range};
pub use combat::{CombatPhase, CombatState, InitiativeEntry};
pub use config::EngineConfig;
pub use dice::{Advantage, DiceError, DiceRoller, RngRoller, RollResult};
pub use engine::{CombatEngine, EngineError, ErrorKind};
pub use geometry::{Cell, Grid, Point};
pub use sync::{Broadcaster, Notice, NoticeKind, Notifier, SyncUpdate};
pub use targeting::{Target, TargetingMode, TargetingSession};
pub use world::{Ability, Combatant, CombatantId, Participant, TableState, Token};
