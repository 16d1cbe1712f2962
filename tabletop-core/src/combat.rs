//! Combat phase, initiative order, turns and rounds.
//!
//! Phases only move `None -> PreCombat -> Active -> None` (or straight from
//! `PreCombat` back to `None`). Commands are resolved against an immutable
//! [`TableState`] into a [`Resolution`] the engine then commits.

use crate::dice::{Advantage, DiceError, DiceExpression, DiceLimits, DiceRoller};
use crate::stats;
use crate::sync::{apply_updates, CombatantEdits, Notice, Resolution, SyncUpdate};
use crate::world::{CombatantId, HeldAction, Participant, TableState};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombatPhase {
    #[default]
    None,
    PreCombat,
    Active,
}

impl fmt::Display for CombatPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CombatPhase::None => "no combat",
            CombatPhase::PreCombat => "pre-combat",
            CombatPhase::Active => "active combat",
        };
        write!(f, "{name}")
    }
}

/// One slot in the initiative order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiativeEntry {
    pub combatant_id: CombatantId,
    pub score: i32,
    /// Dexterity score, the first tiebreak.
    pub dexterity: u8,
}

/// Initiative desc, dexterity desc, then id asc so the order is total.
pub fn compare_entries(a: &InitiativeEntry, b: &InitiativeEntry) -> Ordering {
    b.score
        .cmp(&a.score)
        .then(b.dexterity.cmp(&a.dexterity))
        .then(a.combatant_id.cmp(&b.combatant_id))
}

/// Combat state tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombatState {
    pub phase: CombatPhase,
    pub order: Vec<InitiativeEntry>,
    /// Tracked by id so re-sorting never moves the turn.
    pub current_turn: Option<CombatantId>,
    pub round: u32,
}

impl CombatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.phase == CombatPhase::Active
    }

    pub fn is_turn_of(&self, id: CombatantId) -> bool {
        self.is_active() && self.current_turn == Some(id)
    }

    pub fn sort_order(&mut self) {
        self.order.sort_by(compare_entries);
    }

    pub fn position(&self, id: CombatantId) -> Option<usize> {
        self.order.iter().position(|e| e.combatant_id == id)
    }

    pub fn contains(&self, id: CombatantId) -> bool {
        self.position(id).is_some()
    }

    pub fn entry(&self, id: CombatantId) -> Option<&InitiativeEntry> {
        self.order.iter().find(|e| e.combatant_id == id)
    }

    /// Drop a combatant from the order. If it held the turn, the turn passes
    /// to whoever followed it, advancing the round on wrap, and the new
    /// actor is returned so its turn can begin.
    pub fn remove_combatant(&mut self, id: CombatantId) -> Option<CombatantId> {
        let index = self.position(id)?;
        self.order.remove(index);
        if self.current_turn != Some(id) {
            return None;
        }
        if self.order.is_empty() {
            self.current_turn = None;
            return None;
        }
        let next_index = if index >= self.order.len() {
            self.round += 1;
            0
        } else {
            index
        };
        let next = self.order[next_index].combatant_id;
        self.current_turn = Some(next);
        Some(next)
    }

    fn state_update(
        phase: CombatPhase,
        current_turn: Option<CombatantId>,
        round: u32,
    ) -> SyncUpdate {
        SyncUpdate::CombatStateChanged {
            phase,
            current_turn,
            round,
        }
    }
}

/// Error type for combat state transitions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CombatError {
    #[error("Only the moderator can do that")]
    NotModerator,
    #[error("Not allowed during {actual} (needs {expected})")]
    WrongPhase {
        expected: &'static str,
        actual: CombatPhase,
    },
    #[error("No combatants have rolled initiative")]
    EmptyInitiative,
    #[error("It is not {0}'s turn")]
    NotYourTurn(String),
    #[error("You do not control {0}")]
    NotController(String),
    #[error("{0} is not in the initiative order")]
    NotInInitiative(String),
    #[error("{0} is already in the initiative order")]
    AlreadyInInitiative(String),
    #[error("{0} has no token on the map")]
    NoToken(String),
    #[error("Unknown combatant: {0}")]
    UnknownCombatant(CombatantId),
    #[error("{0} has no held action")]
    NoHeldAction(String),
    #[error("Initiative roll failed: {0}")]
    Dice(#[from] DiceError),
}

/// A requested combat transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CombatCommand {
    EnterPreCombat,
    StartActiveCombat,
    EndTurn,
    EndCombat,
    UpdateInitiativeScore {
        combatant_id: CombatantId,
        score: i32,
    },
    JoinInitiative {
        combatant_id: CombatantId,
    },
    SetHeldAction {
        combatant_id: CombatantId,
        action_name: String,
        trigger_description: String,
    },
    UseHeldAction {
        combatant_id: CombatantId,
    },
}

/// Turn-start steps for `actor` in `round`: expire the effects it cast
/// everywhere and reset its movement.
pub fn begin_turn(world: &TableState, actor: CombatantId, round: u32) -> Resolution {
    let mut resolution = Resolution::new();
    let mut edits = CombatantEdits::new(world);
    let mut expired = Vec::new();

    for (id, combatant) in &world.combatants {
        if combatant.effects.iter().any(|e| e.expires_for(actor, round)) {
            if let Some(edit) = edits.get_mut(*id) {
                edit.effects.retain(|e| {
                    let expires = e.expires_for(actor, round);
                    if expires {
                        expired.push(format!("{} on {} ends.", e.source_name, edit.name));
                    }
                    !expires
                });
            }
        }
    }

    if let Some(edit) = edits.get_mut(actor) {
        edit.remaining_movement = edit.speed;
    }

    resolution.updates.extend(edits.into_updates());
    resolution
        .notices
        .extend(expired.into_iter().map(Notice::info));
    resolution.push_notice(Notice::info(format!(
        "Round {round}: it is {}'s turn.",
        world.name_of(actor)
    )));
    resolution
}

/// Remove a deleted combatant from the order. When it held the turn, the
/// next actor's turn begins as it would after `end_turn`; the notices
/// narrate the handoff.
pub fn remove_from_combat(world: &mut TableState, id: CombatantId) -> Vec<Notice> {
    let Some(next) = world.combat.remove_combatant(id) else {
        return Vec::new();
    };
    let round = world.combat.round;
    info!(round, next = %world.name_of(next), "turn passed after removal");
    let start = begin_turn(world, next, round);
    apply_updates(world, &start.updates);
    start.notices
}

/// Resolves combat commands.
pub struct CombatRules<'a> {
    world: &'a TableState,
    who: &'a Participant,
    limits: &'a DiceLimits,
}

impl<'a> CombatRules<'a> {
    pub fn new(world: &'a TableState, who: &'a Participant, limits: &'a DiceLimits) -> Self {
        Self { world, who, limits }
    }

    pub fn resolve<R: DiceRoller + ?Sized>(
        &self,
        command: CombatCommand,
        roller: &mut R,
    ) -> Result<Resolution, CombatError> {
        match command {
            CombatCommand::EnterPreCombat => self.enter_pre_combat(roller),
            CombatCommand::StartActiveCombat => self.start_active_combat(),
            CombatCommand::EndTurn => self.end_turn(),
            CombatCommand::EndCombat => self.end_combat(),
            CombatCommand::UpdateInitiativeScore {
                combatant_id,
                score,
            } => self.update_initiative_score(combatant_id, score),
            CombatCommand::JoinInitiative { combatant_id } => {
                self.join_initiative(combatant_id, roller)
            }
            CombatCommand::SetHeldAction {
                combatant_id,
                action_name,
                trigger_description,
            } => self.set_held_action(combatant_id, action_name, trigger_description),
            CombatCommand::UseHeldAction { combatant_id } => self.use_held_action(combatant_id),
        }
    }

    fn combat(&self) -> &CombatState {
        &self.world.combat
    }

    fn require_moderator(&self) -> Result<(), CombatError> {
        if self.who.is_moderator {
            Ok(())
        } else {
            Err(CombatError::NotModerator)
        }
    }

    fn require_phase(
        &self,
        allowed: &[CombatPhase],
        expected: &'static str,
    ) -> Result<(), CombatError> {
        if allowed.contains(&self.combat().phase) {
            Ok(())
        } else {
            Err(CombatError::WrongPhase {
                expected,
                actual: self.combat().phase,
            })
        }
    }

    fn roll_initiative<R: DiceRoller + ?Sized>(
        &self,
        id: CombatantId,
        roller: &mut R,
    ) -> Result<(InitiativeEntry, Notice), CombatError> {
        let combatant = self
            .world
            .combatant(id)
            .ok_or(CombatError::UnknownCombatant(id))?;
        let command = format!(
            "{} Initiative for {}",
            stats::with_modifier("1d20", stats::initiative_modifier(combatant)),
            combatant.name
        );
        let roll = DiceExpression::parse_with_limits(&command, self.limits)?
            .roll(Advantage::Normal, roller);
        debug!(combatant = %combatant.name, total = roll.total, "initiative rolled");
        Ok((
            InitiativeEntry {
                combatant_id: id,
                score: roll.total,
                dexterity: combatant.ability_scores.dexterity,
            },
            Notice::roll(roll.transcript),
        ))
    }

    fn enter_pre_combat<R: DiceRoller + ?Sized>(
        &self,
        roller: &mut R,
    ) -> Result<Resolution, CombatError> {
        self.require_moderator()?;
        self.require_phase(&[CombatPhase::None], "no combat")?;

        let mut resolution = Resolution::new().with_notice(Notice::info("Roll for initiative!"));
        let mut order = Vec::new();
        for token in &self.world.tokens {
            if self.world.combatant(token.combatant_id).is_none() {
                continue;
            }
            let (entry, notice) = self.roll_initiative(token.combatant_id, roller)?;
            order.push(entry);
            resolution.push_notice(notice);
        }
        order.sort_by(compare_entries);

        info!(combatants = order.len(), "entering pre-combat");
        resolution.push_update(SyncUpdate::InitiativeChanged { order });
        resolution.push_update(CombatState::state_update(CombatPhase::PreCombat, None, 0));
        Ok(resolution)
    }

    fn start_active_combat(&self) -> Result<Resolution, CombatError> {
        self.require_moderator()?;
        self.require_phase(&[CombatPhase::PreCombat], "pre-combat")?;
        let first = self
            .combat()
            .order
            .first()
            .ok_or(CombatError::EmptyInitiative)?
            .combatant_id;

        info!("combat started");
        let mut resolution = Resolution::new().with_notice(Notice::info("Combat begins!"));
        resolution.push_update(CombatState::state_update(CombatPhase::Active, Some(first), 1));
        self.begin_turn(first, 1, &mut resolution);
        Ok(resolution)
    }

    fn begin_turn(&self, actor: CombatantId, round: u32, resolution: &mut Resolution) {
        resolution.extend(begin_turn(self.world, actor, round));
    }

    fn end_turn(&self) -> Result<Resolution, CombatError> {
        self.require_phase(&[CombatPhase::Active], "active combat")?;
        let combat = self.combat();
        let current = combat.current_turn.ok_or(CombatError::EmptyInitiative)?;
        if !self.who.controls(current) {
            return Err(CombatError::NotYourTurn(self.world.name_of(current)));
        }
        let index = combat
            .position(current)
            .ok_or_else(|| CombatError::NotInInitiative(self.world.name_of(current)))?;

        let mut resolution = Resolution::new();
        if let Some(held) = self.world.held_actions.get(&current) {
            resolution.push_notice(Notice::info(format!(
                "{}'s held action ({}) expires unused.",
                self.world.name_of(current),
                held.action_name
            )));
            resolution.push_update(SyncUpdate::HeldActionChanged {
                combatant_id: current,
                held: None,
            });
        }

        let (next_index, round) = if index + 1 >= combat.order.len() {
            (0, combat.round + 1)
        } else {
            (index + 1, combat.round)
        };
        let next = combat.order[next_index].combatant_id;

        info!(round, next = %self.world.name_of(next), "turn advanced");
        resolution.push_update(CombatState::state_update(CombatPhase::Active, Some(next), round));
        self.begin_turn(next, round, &mut resolution);
        Ok(resolution)
    }

    fn end_combat(&self) -> Result<Resolution, CombatError> {
        self.require_moderator()?;
        self.require_phase(&[CombatPhase::PreCombat, CombatPhase::Active], "combat")?;

        let mut resolution = Resolution::new().with_notice(Notice::info("Combat ends."));
        resolution.push_update(SyncUpdate::InitiativeChanged { order: Vec::new() });
        resolution.push_update(CombatState::state_update(CombatPhase::None, None, 0));
        for id in self.world.held_actions.keys() {
            resolution.push_update(SyncUpdate::HeldActionChanged {
                combatant_id: *id,
                held: None,
            });
        }

        let mut edits = CombatantEdits::new(self.world);
        for (id, combatant) in &self.world.combatants {
            if !combatant.effects.is_empty() || combatant.remaining_movement != combatant.speed {
                if let Some(edit) = edits.get_mut(*id) {
                    edit.effects.clear();
                    edit.remaining_movement = edit.speed;
                }
            }
        }
        resolution.updates.extend(edits.into_updates());

        info!("combat ended");
        Ok(resolution)
    }

    fn update_initiative_score(
        &self,
        id: CombatantId,
        score: i32,
    ) -> Result<Resolution, CombatError> {
        self.require_moderator()?;
        self.require_phase(&[CombatPhase::PreCombat, CombatPhase::Active], "combat")?;
        if !self.combat().contains(id) {
            return Err(CombatError::NotInInitiative(self.world.name_of(id)));
        }

        let mut order = self.combat().order.clone();
        for entry in order.iter_mut().filter(|e| e.combatant_id == id) {
            entry.score = score;
        }
        order.sort_by(compare_entries);

        Ok(Resolution::new()
            .with_update(SyncUpdate::InitiativeChanged { order })
            .with_notice(Notice::info(format!(
                "{}'s initiative is now {score}.",
                self.world.name_of(id)
            ))))
    }

    fn join_initiative<R: DiceRoller + ?Sized>(
        &self,
        id: CombatantId,
        roller: &mut R,
    ) -> Result<Resolution, CombatError> {
        self.require_moderator()?;
        self.roll_in(id, roller)
    }

    /// Roll a placed combatant into the current order and re-sort.
    pub fn roll_in<R: DiceRoller + ?Sized>(
        &self,
        id: CombatantId,
        roller: &mut R,
    ) -> Result<Resolution, CombatError> {
        self.require_phase(&[CombatPhase::PreCombat, CombatPhase::Active], "combat")?;
        let name = self.world.name_of(id);
        if self.combat().contains(id) {
            return Err(CombatError::AlreadyInInitiative(name));
        }
        if self.world.token(id).is_none() {
            return Err(CombatError::NoToken(name));
        }

        let (entry, notice) = self.roll_initiative(id, roller)?;
        let mut order = self.combat().order.clone();
        order.push(entry);
        order.sort_by(compare_entries);

        Ok(Resolution::new()
            .with_notice(notice)
            .with_notice(Notice::info(format!("{name} joins the fight.")))
            .with_update(SyncUpdate::InitiativeChanged { order }))
    }

    fn set_held_action(
        &self,
        id: CombatantId,
        action_name: String,
        trigger_description: String,
    ) -> Result<Resolution, CombatError> {
        self.require_phase(&[CombatPhase::Active], "active combat")?;
        let name = self.world.name_of(id);
        if !self.who.controls(id) {
            return Err(CombatError::NotController(name));
        }
        if !self.combat().is_turn_of(id) {
            return Err(CombatError::NotYourTurn(name));
        }

        let held = HeldAction {
            character_id: id,
            action_name,
            trigger_description,
            round_held: self.combat().round,
        };
        let notice = Notice::info(format!(
            "{name} holds {} until: {}",
            held.action_name, held.trigger_description
        ));
        Ok(Resolution::new()
            .with_update(SyncUpdate::HeldActionChanged {
                combatant_id: id,
                held: Some(held),
            })
            .with_notice(notice))
    }

    fn use_held_action(&self, id: CombatantId) -> Result<Resolution, CombatError> {
        let name = self.world.name_of(id);
        if !self.who.controls(id) {
            return Err(CombatError::NotController(name));
        }
        let held = self
            .world
            .held_actions
            .get(&id)
            .ok_or_else(|| CombatError::NoHeldAction(name.clone()))?;

        Ok(Resolution::new()
            .with_update(SyncUpdate::HeldActionChanged {
                combatant_id: id,
                held: None,
            })
            .with_notice(Notice::message(format!(
                "{name} uses their held action: {} ({})",
                held.action_name, held.trigger_description
            ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(score: i32, dexterity: u8) -> InitiativeEntry {
        InitiativeEntry {
            combatant_id: CombatantId::new(),
            score,
            dexterity,
        }
    }

    #[test]
    fn test_sort_order_score_then_dexterity() {
        let mut state = CombatState::new();
        state.order = vec![entry(10, 12), entry(15, 8), entry(10, 16), entry(3, 20)];
        state.sort_order();
        let keys: Vec<_> = state.order.iter().map(|e| (e.score, e.dexterity)).collect();
        assert_eq!(keys, vec![(15, 8), (10, 16), (10, 12), (3, 20)]);
    }

    #[test]
    fn test_sort_order_id_tiebreak_is_stable() {
        let a = entry(10, 10);
        let b = entry(10, 10);
        let mut forward = CombatState::new();
        forward.order = vec![a.clone(), b.clone()];
        forward.sort_order();
        let mut backward = CombatState::new();
        backward.order = vec![b, a];
        backward.sort_order();
        assert_eq!(forward.order, backward.order);
    }

    #[test]
    fn test_remove_current_passes_turn() {
        let mut state = CombatState::new();
        state.phase = CombatPhase::Active;
        state.round = 1;
        state.order = vec![entry(20, 10), entry(15, 10), entry(10, 10)];
        let first = state.order[0].combatant_id;
        let second = state.order[1].combatant_id;
        let third = state.order[2].combatant_id;
        state.current_turn = Some(second);
        assert_eq!(state.remove_combatant(second), Some(third));
        assert_eq!(state.current_turn, Some(third));
        assert_eq!(state.round, 1);

        // Last in the order: wraps to the top and starts a new round
        assert_eq!(state.remove_combatant(third), Some(first));
        assert_eq!(state.current_turn, Some(first));
        assert_eq!(state.round, 2);
    }

    #[test]
    fn test_remove_other_keeps_turn() {
        let mut state = CombatState::new();
        state.order = vec![entry(20, 10), entry(15, 10)];
        let first = state.order[0].combatant_id;
        let second = state.order[1].combatant_id;
        state.current_turn = Some(first);
        assert_eq!(state.remove_combatant(second), None);
        assert_eq!(state.current_turn, Some(first));
        assert_eq!(state.remove_combatant(first), None);
        assert_eq!(state.current_turn, None);
    }
}
