//! State mutations and the collaborators that carry them.
//!
//! Every change to the shared table is a [`SyncUpdate`]. Rules code computes
//! updates from an immutable [`TableState`] and returns them in a
//! [`Resolution`]; the engine applies each one locally with [`apply_update`]
//! and publishes it through the [`Broadcaster`]. Inbound updates from other
//! participants go through the same `apply_update`, so every replica
//! converges. Conflicting updates from different senders are last-write-wins.

use crate::combat::{remove_from_combat, CombatPhase, InitiativeEntry};
use crate::world::{
    Combatant, CombatantId, HeldAction, PendingSaveId, PendingSpellSave, TableState, Token,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ============================================================================
// Notices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Message,
    Roll,
    Info,
}

/// Human-readable narration for the chat log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub text: String,
    pub kind: NoticeKind,
}

impl Notice {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: NoticeKind::Message,
        }
    }

    pub fn roll(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: NoticeKind::Roll,
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: NoticeKind::Info,
        }
    }
}

/// Output channel for narration.
pub trait Notifier {
    fn notify(&mut self, notice: Notice);
}

impl<F: FnMut(Notice)> Notifier for F {
    fn notify(&mut self, notice: Notice) {
        self(notice)
    }
}

// ============================================================================
// Updates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Combatant,
    Token,
    CombatState,
    Initiative,
    HeldAction,
    PendingSave,
}

/// A single replicated mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncUpdate {
    /// Full replacement of a combatant record (HP, effects, slots, movement).
    CombatantUpdated { combatant: Combatant },
    CombatantDeleted { id: CombatantId },
    TokenPlaced { token: Token },
    TokenRemoved { id: CombatantId },
    CombatStateChanged {
        phase: CombatPhase,
        current_turn: Option<CombatantId>,
        round: u32,
    },
    InitiativeChanged { order: Vec<InitiativeEntry> },
    HeldActionChanged {
        combatant_id: CombatantId,
        held: Option<HeldAction>,
    },
    PendingSaveAdded { save: PendingSpellSave },
    PendingSaveRemoved { id: PendingSaveId },
}

impl SyncUpdate {
    pub fn kind(&self) -> UpdateKind {
        match self {
            SyncUpdate::CombatantUpdated { .. } | SyncUpdate::CombatantDeleted { .. } => {
                UpdateKind::Combatant
            }
            SyncUpdate::TokenPlaced { .. } | SyncUpdate::TokenRemoved { .. } => UpdateKind::Token,
            SyncUpdate::CombatStateChanged { .. } => UpdateKind::CombatState,
            SyncUpdate::InitiativeChanged { .. } => UpdateKind::Initiative,
            SyncUpdate::HeldActionChanged { .. } => UpdateKind::HeldAction,
            SyncUpdate::PendingSaveAdded { .. } | SyncUpdate::PendingSaveRemoved { .. } => {
                UpdateKind::PendingSave
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Fire-and-forget publisher for outbound updates.
pub trait Broadcaster {
    fn publish(&mut self, update: &SyncUpdate);
}

impl<F: FnMut(&SyncUpdate)> Broadcaster for F {
    fn publish(&mut self, update: &SyncUpdate) {
        self(update)
    }
}

/// Apply one update to a replica.
pub fn apply_update(world: &mut TableState, update: &SyncUpdate) {
    apply_update_narrated(world, update);
}

/// Apply one update and return narration for any knock-on change, such as
/// the turn passing on when the current actor is deleted.
pub fn apply_update_narrated(world: &mut TableState, update: &SyncUpdate) -> Vec<Notice> {
    match update {
        SyncUpdate::CombatantUpdated { combatant } => {
            world.combatants.insert(combatant.id, combatant.clone());
        }
        SyncUpdate::CombatantDeleted { id } => {
            world.combatants.remove(id);
            world.tokens.retain(|t| t.combatant_id != *id);
            world.held_actions.remove(id);
            world
                .pending_saves
                .retain(|s| s.target_character_id != *id);
            return remove_from_combat(world, *id);
        }
        SyncUpdate::TokenPlaced { token } => {
            match world
                .tokens
                .iter_mut()
                .find(|t| t.combatant_id == token.combatant_id)
            {
                Some(existing) => *existing = token.clone(),
                None => world.tokens.push(token.clone()),
            }
        }
        SyncUpdate::TokenRemoved { id } => {
            world.tokens.retain(|t| t.combatant_id != *id);
        }
        SyncUpdate::CombatStateChanged {
            phase,
            current_turn,
            round,
        } => {
            world.combat.phase = *phase;
            world.combat.current_turn = *current_turn;
            world.combat.round = *round;
        }
        SyncUpdate::InitiativeChanged { order } => {
            world.combat.order = order.clone();
            world.combat.sort_order();
        }
        SyncUpdate::HeldActionChanged { combatant_id, held } => match held {
            Some(held) => {
                world.held_actions.insert(*combatant_id, held.clone());
            }
            None => {
                world.held_actions.remove(combatant_id);
            }
        },
        SyncUpdate::PendingSaveAdded { save } => {
            if world.pending_save(save.id).is_none() {
                world.pending_saves.push(save.clone());
            }
        }
        SyncUpdate::PendingSaveRemoved { id } => {
            let before = world.pending_saves.len();
            world.pending_saves.retain(|s| s.id != *id);
            if world.pending_saves.len() == before {
                warn!(save = ?id, "removal of unknown pending save");
            }
        }
    }
    Vec::new()
}

pub fn apply_updates(world: &mut TableState, updates: &[SyncUpdate]) {
    for update in updates {
        apply_update(world, update);
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Updates and narration produced by a rules operation.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub updates: Vec<SyncUpdate>,
    pub notices: Vec<Notice>,
}

impl Resolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, update: SyncUpdate) -> Self {
        self.updates.push(update);
        self
    }

    pub fn with_notice(mut self, notice: Notice) -> Self {
        self.notices.push(notice);
        self
    }

    pub fn push_update(&mut self, update: SyncUpdate) {
        self.updates.push(update);
    }

    pub fn push_notice(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    pub fn extend(&mut self, other: Resolution) {
        self.updates.extend(other.updates);
        self.notices.extend(other.notices);
    }
}

/// Copy-on-write scratch space for combatant records.
///
/// Several steps of one resolution may touch the same combatant (damage,
/// a new effect, a spent slot); edits accumulate here and become one
/// `CombatantUpdated` per combatant.
pub struct CombatantEdits<'a> {
    world: &'a TableState,
    edited: Vec<Combatant>,
}

impl<'a> CombatantEdits<'a> {
    pub fn new(world: &'a TableState) -> Self {
        Self {
            world,
            edited: Vec::new(),
        }
    }

    /// Current view, including edits made so far.
    pub fn get(&self, id: CombatantId) -> Option<&Combatant> {
        self.edited
            .iter()
            .find(|c| c.id == id)
            .or_else(|| self.world.combatant(id))
    }

    pub fn get_mut(&mut self, id: CombatantId) -> Option<&mut Combatant> {
        if let Some(index) = self.edited.iter().position(|c| c.id == id) {
            return self.edited.get_mut(index);
        }
        let original = self.world.combatant(id)?.clone();
        self.edited.push(original);
        self.edited.last_mut()
    }

    pub fn into_updates(self) -> Vec<SyncUpdate> {
        self.edited
            .into_iter()
            .map(|combatant| SyncUpdate::CombatantUpdated { combatant })
            .collect()
    }
}
