//! CombatEngine - the primary public API for table combat.
//!
//! Wraps one participant's replica of the table, the targeting session and
//! the combat rules behind a single interface. Every local operation commits
//! its updates to the replica first and then publishes them; inbound updates
//! from other participants arrive through [`CombatEngine::apply_remote`].
//!
//! Failures are returned and also narrated through the notifier, so a UI may
//! ignore the `Result` entirely.

use crate::actions::ActionDetail;
use crate::combat::{CombatCommand, CombatError, CombatPhase, CombatRules};
use crate::config::EngineConfig;
use crate::dice::{Advantage, DiceError, DiceExpression, DiceRoller, RngRoller, RollResult};
use crate::geometry::Point;
use crate::saves::{resolve_pending_save, SaveResolution};
use crate::stats;
use crate::sync::{
    apply_update, apply_update_narrated, Broadcaster, Notice, Notifier, Resolution, SyncUpdate,
};
use crate::targeting::{
    Target, TargetContext, TargetingError, TargetingMode, TargetingOutcome, TargetingSession,
};
use crate::world::{Combatant, CombatantId, Participant, PendingSaveId, TableState, Token};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from CombatEngine operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Dice(#[from] DiceError),

    #[error(transparent)]
    Targeting(#[from] TargetingError),

    #[error(transparent)]
    Combat(#[from] CombatError),

    #[error("Unknown combatant: {0}")]
    UnknownCombatant(CombatantId),

    #[error("{name} does not know {action}")]
    UnknownAction { name: String, action: String },

    #[error("Only the moderator can do that")]
    NotModerator,

    #[error("You do not control {0}")]
    NotController(String),

    #[error("{name} has only {remaining} ft of movement left")]
    NotEnoughMovement { name: String, remaining: u32 },
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input: syntax, range, turn order, missing token.
    Validation,
    /// The caller sequenced operations wrongly, e.g. resolving while idle.
    InvariantViolation,
    /// A dice cap was exceeded.
    LimitExceeded,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Dice(e)
            | EngineError::Targeting(TargetingError::Dice(e))
            | EngineError::Combat(CombatError::Dice(e))
                if e.is_limit() =>
            {
                ErrorKind::LimitExceeded
            }
            EngineError::Targeting(e) if e.is_invariant_violation() => {
                ErrorKind::InvariantViolation
            }
            _ => ErrorKind::Validation,
        }
    }
}

/// One participant's combat engine.
pub struct CombatEngine<N: Notifier, B: Broadcaster> {
    world: TableState,
    config: EngineConfig,
    participant: Participant,
    targeting: TargetingSession,
    global_advantage: Advantage,
    roller: Box<dyn DiceRoller>,
    notifier: N,
    broadcaster: B,
}

impl<N: Notifier, B: Broadcaster> CombatEngine<N, B> {
    /// Create an engine rolling with OS entropy.
    pub fn new(
        config: EngineConfig,
        participant: Participant,
        notifier: N,
        broadcaster: B,
    ) -> Self {
        Self {
            world: TableState::new(),
            config,
            participant,
            targeting: TargetingSession::Idle,
            global_advantage: Advantage::Normal,
            roller: Box::new(RngRoller::from_entropy()),
            notifier,
            broadcaster,
        }
    }

    /// Replace the dice source.
    pub fn with_roller(mut self, roller: impl DiceRoller + 'static) -> Self {
        self.roller = Box::new(roller);
        self
    }

    /// Start from an existing replica, e.g. a snapshot handed over on join.
    pub fn with_world(mut self, world: TableState) -> Self {
        self.world = world;
        self
    }

    pub fn world(&self) -> &TableState {
        &self.world
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn set_participant(&mut self, participant: Participant) {
        self.participant = participant;
    }

    pub fn targeting(&self) -> &TargetingSession {
        &self.targeting
    }

    pub fn phase(&self) -> CombatPhase {
        self.world.combat.phase
    }

    pub fn global_advantage(&self) -> Advantage {
        self.global_advantage
    }

    /// Arm advantage or disadvantage for the next d20 roll.
    pub fn set_global_advantage(&mut self, advantage: Advantage) {
        self.global_advantage = advantage;
    }

    pub fn combatant(&self, id: CombatantId) -> Option<&Combatant> {
        self.world.combatant(id)
    }

    /// Effective AC, recomputed from the current effect list.
    pub fn effective_ac(&self, id: CombatantId) -> Option<i32> {
        self.world.combatant(id).map(stats::effective_ac)
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    /// Apply locally, publish, then narrate.
    fn commit(&mut self, resolution: Resolution) {
        let mut knock_on = Vec::new();
        for update in &resolution.updates {
            knock_on.extend(apply_update_narrated(&mut self.world, update));
            self.broadcaster.publish(update);
        }
        for notice in resolution.notices.into_iter().chain(knock_on) {
            self.notifier.notify(notice);
        }
    }

    fn fail(&mut self, error: EngineError) -> EngineError {
        match error.kind() {
            ErrorKind::InvariantViolation => warn!(%error, "invariant violation"),
            ErrorKind::Validation | ErrorKind::LimitExceeded => debug!(%error, "rejected"),
        }
        self.notifier.notify(Notice::info(error.to_string()));
        error
    }

    fn checked<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        result.map_err(|e| self.fail(e))
    }

    fn cancel_targeting_where(&mut self, pred: impl Fn(&TargetingSession) -> bool) {
        if pred(&self.targeting) {
            if let Some(notice) = self.targeting.cancel() {
                self.notifier.notify(notice);
            }
        }
    }

    fn controlled(&self, id: CombatantId) -> Result<&Combatant, EngineError> {
        let combatant = self
            .world
            .combatant(id)
            .ok_or(EngineError::UnknownCombatant(id))?;
        if !self.participant.controls(id) {
            return Err(EngineError::NotController(combatant.name.clone()));
        }
        Ok(combatant)
    }

    // ========================================================================
    // Roster and tokens
    // ========================================================================

    /// Add or replace a combatant record.
    pub fn add_combatant(&mut self, combatant: Combatant) -> CombatantId {
        let id = combatant.id;
        info!(name = %combatant.name, "combatant added");
        self.commit(Resolution::new().with_update(SyncUpdate::CombatantUpdated { combatant }));
        id
    }

    /// Place (or move) a combatant's token. During pre-combat a newly placed
    /// combatant is rolled into initiative.
    pub fn place_token(&mut self, id: CombatantId, position: Point) -> Result<(), EngineError> {
        let result = self.controlled(id).map(|_| ());
        self.checked(result)?;

        let mut resolution = Resolution::new().with_update(SyncUpdate::TokenPlaced {
            token: Token::new(id, position),
        });
        let joins = self.world.combat.phase == CombatPhase::PreCombat
            && !self.world.combat.contains(id);
        if joins {
            let mut placed = self.world.clone();
            apply_update(&mut placed, &resolution.updates[0]);
            let rolled = CombatRules::new(&placed, &self.participant, &self.config.dice_limits)
                .roll_in(id, self.roller.as_mut())
                .map_err(EngineError::from);
            resolution.extend(self.checked(rolled)?);
        }
        self.commit(resolution);
        Ok(())
    }

    pub fn remove_token(&mut self, id: CombatantId) -> Result<(), EngineError> {
        let result = self.controlled(id).map(|_| ());
        self.checked(result)?;
        self.release_token(id);
        self.commit(Resolution::new().with_update(SyncUpdate::TokenRemoved { id }));
        Ok(())
    }

    fn release_token(&mut self, id: CombatantId) {
        if let Some(notice) = self.targeting.release_token(id) {
            self.notifier.notify(notice);
        }
    }

    /// Delete a combatant everywhere: roster, map, initiative, held actions
    /// and pending saves. Cancels any targeting that references it.
    pub fn delete_combatant(&mut self, id: CombatantId) -> Result<(), EngineError> {
        if !self.participant.is_moderator {
            return Err(self.fail(EngineError::NotModerator));
        }
        if self.world.combatant(id).is_none() {
            return Err(self.fail(EngineError::UnknownCombatant(id)));
        }
        self.cancel_targeting_where(|s| s.involves(id));
        let name = self.world.name_of(id);
        info!(%name, "combatant deleted");
        self.commit(
            Resolution::new()
                .with_update(SyncUpdate::CombatantDeleted { id })
                .with_notice(Notice::info(format!("{name} leaves the table."))),
        );
        Ok(())
    }

    /// Spend movement; returns what is left.
    pub fn spend_movement(&mut self, id: CombatantId, feet: u32) -> Result<u32, EngineError> {
        let result = self.controlled(id).and_then(|c| {
            if feet > c.remaining_movement {
                Err(EngineError::NotEnoughMovement {
                    name: c.name.clone(),
                    remaining: c.remaining_movement,
                })
            } else {
                Ok(c.clone())
            }
        });
        let mut combatant = self.checked(result)?;
        combatant.remaining_movement -= feet;
        let left = combatant.remaining_movement;
        self.commit(Resolution::new().with_update(SyncUpdate::CombatantUpdated { combatant }));
        Ok(left)
    }

    /// Roll a free-form command, honouring the global toggle.
    pub fn roll(&mut self, command: &str) -> Result<RollResult, EngineError> {
        let parsed = DiceExpression::parse_with_limits(command, &self.config.dice_limits)
            .map_err(EngineError::from);
        let expr = self.checked(parsed)?;
        let result = expr.roll(self.global_advantage, self.roller.as_mut());
        if result.consumed_global {
            self.global_advantage = Advantage::Normal;
        }
        self.notifier.notify(Notice::roll(result.transcript.clone()));
        Ok(result)
    }

    // ========================================================================
    // Combat
    // ========================================================================

    fn run_combat(&mut self, command: CombatCommand) -> Result<(), EngineError> {
        let result = CombatRules::new(&self.world, &self.participant, &self.config.dice_limits)
            .resolve(command, self.roller.as_mut())
            .map_err(EngineError::from);
        let resolution = self.checked(result)?;
        self.commit(resolution);
        Ok(())
    }

    pub fn enter_pre_combat(&mut self) -> Result<(), EngineError> {
        self.run_combat(CombatCommand::EnterPreCombat)
    }

    pub fn start_active_combat(&mut self) -> Result<(), EngineError> {
        self.run_combat(CombatCommand::StartActiveCombat)
    }

    pub fn end_turn(&mut self) -> Result<(), EngineError> {
        self.run_combat(CombatCommand::EndTurn)?;
        self.cancel_targeting_where(TargetingSession::is_active);
        Ok(())
    }

    pub fn end_combat(&mut self) -> Result<(), EngineError> {
        self.run_combat(CombatCommand::EndCombat)?;
        self.cancel_targeting_where(TargetingSession::is_active);
        Ok(())
    }

    pub fn update_initiative_score(
        &mut self,
        id: CombatantId,
        score: i32,
    ) -> Result<(), EngineError> {
        self.run_combat(CombatCommand::UpdateInitiativeScore {
            combatant_id: id,
            score,
        })
    }

    /// Roll a late arrival into active combat.
    pub fn join_initiative(&mut self, id: CombatantId) -> Result<(), EngineError> {
        self.run_combat(CombatCommand::JoinInitiative { combatant_id: id })
    }

    pub fn set_held_action(
        &mut self,
        id: CombatantId,
        action_name: impl Into<String>,
        trigger: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.run_combat(CombatCommand::SetHeldAction {
            combatant_id: id,
            action_name: action_name.into(),
            trigger_description: trigger.into(),
        })
    }

    pub fn use_held_action(&mut self, id: CombatantId) -> Result<(), EngineError> {
        self.run_combat(CombatCommand::UseHeldAction { combatant_id: id })
    }

    // ========================================================================
    // Targeting
    // ========================================================================

    fn known_action(
        &self,
        actor: CombatantId,
        name: &str,
    ) -> Result<Arc<ActionDetail>, EngineError> {
        let combatant = self
            .world
            .combatant(actor)
            .ok_or(EngineError::UnknownCombatant(actor))?;
        combatant
            .action(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAction {
                name: combatant.name.clone(),
                action: name.to_string(),
            })
    }

    /// Begin targeting with one of the actor's attacks.
    pub fn initiate_attack(
        &mut self,
        actor: CombatantId,
        action_name: &str,
    ) -> Result<(), EngineError> {
        let action = self.known_action(actor, action_name);
        let action = self.checked(action)?;
        self.initiate(TargetingMode::Attack, actor, action)
    }

    /// Begin targeting with one of the actor's spells.
    pub fn initiate_spell(
        &mut self,
        actor: CombatantId,
        spell_name: &str,
    ) -> Result<(), EngineError> {
        let action = self.known_action(actor, spell_name);
        let action = self.checked(action)?;
        self.initiate(TargetingMode::Spell, actor, action)
    }

    pub fn initiate(
        &mut self,
        mode: TargetingMode,
        actor: CombatantId,
        action: Arc<ActionDetail>,
    ) -> Result<(), EngineError> {
        let ctx = TargetContext {
            world: &self.world,
            who: &self.participant,
            config: &self.config,
        };
        let result = self
            .targeting
            .initiate(&ctx, mode, actor, action)
            .map_err(EngineError::from);
        let resolution = self.checked(result)?;
        self.commit(resolution);
        Ok(())
    }

    /// Resolve the active session. Returns whether the session finished
    /// (false while a charged spell still has charges to assign).
    pub fn resolve_target(&mut self, target: Target) -> Result<bool, EngineError> {
        let ctx = TargetContext {
            world: &self.world,
            who: &self.participant,
            config: &self.config,
        };
        let result = self
            .targeting
            .resolve(&ctx, target, self.global_advantage, self.roller.as_mut())
            .map_err(EngineError::from);
        let outcome = self.checked(result)?;
        Ok(self.settle(outcome))
    }

    fn settle(&mut self, outcome: TargetingOutcome) -> bool {
        if outcome.consumed_global {
            self.global_advantage = Advantage::Normal;
        }
        self.commit(outcome.resolution);
        outcome.finished
    }

    /// Cancel targeting; returns whether anything was active.
    pub fn cancel_targeting(&mut self) -> bool {
        match self.targeting.cancel() {
            Some(notice) => {
                self.notifier.notify(notice);
                true
            }
            None => false,
        }
    }

    pub fn roll_pending_save(&mut self, save_id: PendingSaveId) -> Result<(), EngineError> {
        self.settle_save(save_id, SaveResolution::Roll)
    }

    pub fn auto_fail_save(&mut self, save_id: PendingSaveId) -> Result<(), EngineError> {
        self.settle_save(save_id, SaveResolution::AutoFail)
    }

    fn settle_save(
        &mut self,
        save_id: PendingSaveId,
        how: SaveResolution,
    ) -> Result<(), EngineError> {
        let result = resolve_pending_save(
            &self.world,
            &self.participant,
            &self.config,
            save_id,
            how,
            self.global_advantage,
            self.roller.as_mut(),
        )
        .map_err(EngineError::from);
        let outcome = self.checked(result)?;
        self.settle(outcome);
        Ok(())
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Apply an update broadcast by another participant. Nothing is
    /// re-published. Targeting is cancelled when combat ends, when the turn
    /// moves away from the acting combatant, or when a combatant it
    /// references is deleted. Charges on a removed token are handed back.
    pub fn apply_remote(&mut self, update: &SyncUpdate) {
        match update {
            SyncUpdate::TokenPlaced { token }
                if self.world.combatant(token.combatant_id).is_none() =>
            {
                warn!(combatant = %token.combatant_id, "token placed for unknown combatant");
            }
            SyncUpdate::CombatantDeleted { id } => {
                if self.world.combatant(*id).is_none() {
                    warn!(combatant = %id, "deletion of unknown combatant");
                }
                self.cancel_targeting_where(|s| s.involves(*id));
            }
            SyncUpdate::TokenRemoved { id } => self.release_token(*id),
            SyncUpdate::CombatStateChanged {
                phase,
                current_turn,
                ..
            } => {
                let actor = self.targeting.actor();
                let turn_moved = *phase == CombatPhase::Active
                    && actor.is_some()
                    && *current_turn != actor
                    && self.world.combat.current_turn != *current_turn;
                if *phase == CombatPhase::None || turn_moved {
                    self.cancel_targeting_where(TargetingSession::is_active);
                }
            }
            _ => {}
        }
        debug!(kind = ?update.kind(), "applying remote update");
        apply_update(&mut self.world, update);
    }
}
