//! Attack and spell targeting.
//!
//! At most one session exists at a time: a [`TargetingSession`] is either
//! idle, attacking or casting, so the two modes can never be active together.
//! Resolving a target computes a [`Resolution`] (HP changes, effects,
//! pending saves, slot use) from the current table without touching it.

use crate::actions::{ActionDetail, DamageType, Range, SavingThrowSpec};
use crate::config::EngineConfig;
use crate::dice::{Advantage, DiceError, DiceExpression, DiceRoller, RollResult};
use crate::geometry::{AreaTemplate, Point};
use crate::stats;
use crate::sync::{CombatantEdits, Notice, Resolution, SyncUpdate};
use crate::world::{
    CombatantId, EffectId, Participant, PendingSaveId, PendingSpellSave, TableState,
    TemporaryEffect, Token,
};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetingMode {
    Attack,
    Spell,
}

impl fmt::Display for TargetingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetingMode::Attack => write!(f, "attack"),
            TargetingMode::Spell => write!(f, "spell"),
        }
    }
}

/// What a resolution is aimed at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    Token(CombatantId),
    Point(Point),
}

/// Error type for targeting.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TargetingError {
    #[error("No targeting in progress")]
    NoActiveSession,
    #[error("Unknown combatant: {0}")]
    UnknownCombatant(CombatantId),
    #[error("{0} has no token on the map")]
    NoToken(String),
    #[error("It is not {0}'s turn")]
    NotYourTurn(String),
    #[error("You do not control {0}")]
    NotController(String),
    #[error("{name} has no level {level} spell slots left")]
    NoSpellSlot { name: String, level: u8 },
    #[error("{0} cannot target its caster")]
    SelfTarget(String),
    #[error("Target is out of range ({distance_feet} ft away, range {range_feet} ft)")]
    OutOfRange { distance_feet: u32, range_feet: u32 },
    #[error("{0} must target a token")]
    TokenRequired(String),
    #[error("Unknown pending save")]
    UnknownPendingSave(PendingSaveId),
    #[error("{0}")]
    Dice(#[from] DiceError),
}

impl TargetingError {
    /// Caller sequencing errors rather than bad user input.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TargetingError::NoActiveSession | TargetingError::UnknownPendingSave(_)
        )
    }
}

/// Per-target charge counts for spells split across several targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeTracker {
    /// One slot per token on the map when the spell began, in token order.
    assigned: Vec<(CombatantId, u32)>,
    remaining: u32,
}

impl ChargeTracker {
    pub fn new(tokens: &[Token], total: u32) -> Self {
        Self {
            assigned: tokens.iter().map(|t| (t.combatant_id, 0)).collect(),
            remaining: total,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn charges_on(&self, id: CombatantId) -> u32 {
        self.assigned
            .iter()
            .find(|(c, _)| *c == id)
            .map_or(0, |(_, n)| *n)
    }

    /// Targets holding at least one charge.
    pub fn targeted(&self) -> impl Iterator<Item = (CombatantId, u32)> + '_ {
        self.assigned.iter().copied().filter(|(_, n)| *n > 0)
    }

    /// Take back every charge placed on `id`; returns how many.
    pub fn release(&mut self, id: CombatantId) -> u32 {
        let Some((_, n)) = self.assigned.iter_mut().find(|(c, _)| *c == id) else {
            return 0;
        };
        let released = std::mem::take(n);
        self.remaining += released;
        released
    }

    fn assign(&mut self, id: CombatantId) {
        match self.assigned.iter_mut().find(|(c, _)| *c == id) {
            Some((_, n)) => *n += 1,
            None => self.assigned.push((id, 1)),
        }
        self.remaining = self.remaining.saturating_sub(1);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttackSession {
    pub actor: CombatantId,
    pub action: Arc<ActionDetail>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpellSession {
    pub actor: CombatantId,
    pub action: Arc<ActionDetail>,
    pub charges: Option<ChargeTracker>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum TargetingSession {
    #[default]
    Idle,
    Attacking(AttackSession),
    Casting(SpellSession),
}

/// Read-only inputs to targeting.
#[derive(Debug, Clone, Copy)]
pub struct TargetContext<'a> {
    pub world: &'a TableState,
    pub who: &'a Participant,
    pub config: &'a EngineConfig,
}

/// Result of a resolve call.
#[derive(Debug, Clone, Default)]
pub struct TargetingOutcome {
    pub resolution: Resolution,
    /// The global advantage toggle was used by one of the rolls.
    pub consumed_global: bool,
    /// The session ended (always true except for an intermediate charge).
    pub finished: bool,
}

impl TargetingSession {
    pub fn is_active(&self) -> bool {
        !matches!(self, TargetingSession::Idle)
    }

    pub fn mode(&self) -> Option<TargetingMode> {
        match self {
            TargetingSession::Idle => None,
            TargetingSession::Attacking(_) => Some(TargetingMode::Attack),
            TargetingSession::Casting(_) => Some(TargetingMode::Spell),
        }
    }

    pub fn actor(&self) -> Option<CombatantId> {
        match self {
            TargetingSession::Idle => None,
            TargetingSession::Attacking(s) => Some(s.actor),
            TargetingSession::Casting(s) => Some(s.actor),
        }
    }

    pub fn action(&self) -> Option<&Arc<ActionDetail>> {
        match self {
            TargetingSession::Idle => None,
            TargetingSession::Attacking(s) => Some(&s.action),
            TargetingSession::Casting(s) => Some(&s.action),
        }
    }

    pub fn charges(&self) -> Option<&ChargeTracker> {
        match self {
            TargetingSession::Casting(s) => s.charges.as_ref(),
            _ => None,
        }
    }

    /// Whether the session is acting as, or has charged, this combatant.
    pub fn involves(&self, id: CombatantId) -> bool {
        self.actor() == Some(id) || self.charges().is_some_and(|c| c.charges_on(id) > 0)
    }

    /// Start targeting, replacing any session already in progress.
    pub fn initiate(
        &mut self,
        ctx: &TargetContext<'_>,
        mode: TargetingMode,
        actor: CombatantId,
        action: Arc<ActionDetail>,
    ) -> Result<Resolution, TargetingError> {
        let world = ctx.world;
        let combatant = world
            .combatant(actor)
            .ok_or(TargetingError::UnknownCombatant(actor))?;
        if !ctx.who.controls(actor) {
            return Err(TargetingError::NotController(combatant.name.clone()));
        }
        if world.token(actor).is_none() {
            return Err(TargetingError::NoToken(combatant.name.clone()));
        }
        if world.combat.is_active()
            && world.combat.current_turn != Some(actor)
            && !ctx.who.is_moderator
        {
            return Err(TargetingError::NotYourTurn(combatant.name.clone()));
        }
        if let Some(level) = action.slot_level() {
            if combatant.spell_slots.available(level) == 0 {
                return Err(TargetingError::NoSpellSlot {
                    name: combatant.name.clone(),
                    level,
                });
            }
        }

        let mut resolution = Resolution::new();
        if let Some(notice) = self.cancel() {
            resolution.push_notice(notice);
        }

        let prompt = match action.charge_count() {
            Some(total) if mode == TargetingMode::Spell => {
                format!(
                    "{} readies {}: choose targets for {total} charges.",
                    combatant.name, action.name
                )
            }
            _ if action.area_of_effect.is_some() => {
                format!("{} readies {}: choose a point.", combatant.name, action.name)
            }
            _ => format!("{} readies {}: choose a target.", combatant.name, action.name),
        };
        resolution.push_notice(Notice::info(prompt));
        debug!(actor = %combatant.name, action = %action.name, %mode, "targeting started");

        *self = match mode {
            TargetingMode::Attack => TargetingSession::Attacking(AttackSession { actor, action }),
            TargetingMode::Spell => {
                let charges = action
                    .charge_count()
                    .map(|total| ChargeTracker::new(&world.tokens, total));
                TargetingSession::Casting(SpellSession {
                    actor,
                    action,
                    charges,
                })
            }
        };
        Ok(resolution)
    }

    /// Resolve the active session against a target.
    ///
    /// Validation failures end the session, except for a charged spell,
    /// which stays active so another target can be picked.
    pub fn resolve<R: DiceRoller + ?Sized>(
        &mut self,
        ctx: &TargetContext<'_>,
        target: Target,
        global: Advantage,
        roller: &mut R,
    ) -> Result<TargetingOutcome, TargetingError> {
        match std::mem::take(self) {
            TargetingSession::Idle => Err(TargetingError::NoActiveSession),
            TargetingSession::Attacking(AttackSession { actor, action })
            | TargetingSession::Casting(SpellSession {
                actor,
                action,
                charges: None,
            }) => resolve_single(ctx, actor, &action, target, global, roller),
            TargetingSession::Casting(SpellSession {
                actor,
                action,
                charges: Some(mut tracker),
            }) => {
                let chosen = match token_target(ctx, actor, &action, target) {
                    Ok(id) => id,
                    Err(err) => {
                        *self = TargetingSession::Casting(SpellSession {
                            actor,
                            action,
                            charges: Some(tracker),
                        });
                        return Err(err);
                    }
                };
                tracker.assign(chosen);
                if tracker.remaining() > 0 {
                    let notice = Notice::info(format!(
                        "{} charge assigned to {} ({} left).",
                        action.name,
                        ctx.world.name_of(chosen),
                        tracker.remaining()
                    ));
                    *self = TargetingSession::Casting(SpellSession {
                        actor,
                        action,
                        charges: Some(tracker),
                    });
                    return Ok(TargetingOutcome {
                        resolution: Resolution::new().with_notice(notice),
                        consumed_global: false,
                        finished: false,
                    });
                }
                unleash(ctx, actor, &action, &tracker, global, roller)
            }
        }
    }

    /// A combatant's token left the map. Targeting by it is cancelled;
    /// charges placed on it return to the caster to assign again.
    pub fn release_token(&mut self, id: CombatantId) -> Option<Notice> {
        if self.actor() == Some(id) {
            return self.cancel();
        }
        let TargetingSession::Casting(SpellSession {
            action,
            charges: Some(tracker),
            ..
        }) = self
        else {
            return None;
        };
        let released = tracker.release(id);
        if released == 0 {
            return None;
        }
        debug!(target = %id, released, "charges released");
        let plural = if released == 1 { "" } else { "s" };
        Some(Notice::info(format!(
            "{released} {} charge{plural} returned ({} left).",
            action.name,
            tracker.remaining()
        )))
    }

    /// Return to idle. Yields the cancellation notice when something was
    /// active.
    pub fn cancel(&mut self) -> Option<Notice> {
        let action = self.action()?.name.clone();
        *self = TargetingSession::Idle;
        debug!(%action, "targeting cancelled");
        Some(Notice::info(format!("{action} targeting cancelled.")))
    }
}

// ============================================================================
// Validation
// ============================================================================

fn actor_position(ctx: &TargetContext<'_>, actor: CombatantId) -> Result<Point, TargetingError> {
    ctx.world
        .token(actor)
        .map(|t| t.position)
        .ok_or_else(|| TargetingError::NoToken(ctx.world.name_of(actor)))
}

fn check_range(
    config: &EngineConfig,
    from: Point,
    to: Point,
    range: Range,
) -> Result<(), TargetingError> {
    let Some(range_feet) = range.feet() else {
        return Ok(());
    };
    let distance = from.distance_to(to);
    let limit = config.feet_to_pixels(range_feet) + config.range_tolerance_cells * config.cell_size;
    if distance > limit {
        return Err(TargetingError::OutOfRange {
            distance_feet: config.pixels_to_feet(distance).round() as u32,
            range_feet,
        });
    }
    Ok(())
}

/// Validate a single-token target: presence, self-targeting and range.
fn token_target(
    ctx: &TargetContext<'_>,
    actor: CombatantId,
    action: &ActionDetail,
    target: Target,
) -> Result<CombatantId, TargetingError> {
    let Target::Token(id) = target else {
        return Err(TargetingError::TokenRequired(action.name.clone()));
    };
    if ctx.world.combatant(id).is_none() {
        return Err(TargetingError::UnknownCombatant(id));
    }
    let target_position = ctx
        .world
        .token(id)
        .map(|t| t.position)
        .ok_or_else(|| TargetingError::NoToken(ctx.world.name_of(id)))?;
    if id == actor && action.forbids_self_target() {
        return Err(TargetingError::SelfTarget(action.name.clone()));
    }

    let origin = actor_position(ctx, actor)?;
    let range = action.parsed_range();
    if range == Range::SelfOnly && id != actor {
        return Err(TargetingError::OutOfRange {
            distance_feet: ctx.config.pixels_to_feet(origin.distance_to(target_position)).round()
                as u32,
            range_feet: 0,
        });
    }
    check_range(ctx.config, origin, target_position, range)?;
    Ok(id)
}

/// Combatants caught in an area action aimed at `target`.
fn area_targets(
    ctx: &TargetContext<'_>,
    actor: CombatantId,
    action: &ActionDetail,
    target: Target,
) -> Result<Vec<CombatantId>, TargetingError> {
    let Some(area) = &action.area_of_effect else {
        return Ok(Vec::new());
    };
    let caster = actor_position(ctx, actor)?;
    let aim = match target {
        Target::Point(point) => point,
        Target::Token(id) => ctx
            .world
            .token(id)
            .map(|t| t.position)
            .ok_or_else(|| TargetingError::NoToken(ctx.world.name_of(id)))?,
    };

    let range = action.parsed_range();
    let template = ctx.config.area_template(area);
    let from_caster = range == Range::SelfOnly || !matches!(template, AreaTemplate::Radius { .. });
    let (origin, aim) = match template {
        AreaTemplate::Radius { .. } if from_caster => (caster, caster),
        AreaTemplate::Radius { .. } => {
            check_range(ctx.config, caster, aim, range)?;
            (aim, aim)
        }
        _ => (caster, aim),
    };

    let grid = ctx.config.grid();
    let cells = grid.affected_cells(&template, origin, aim);
    let mut caught = grid.characters_in_cells(&ctx.world.tokens, &cells);
    caught.retain(|id| ctx.world.combatant(*id).is_some() && !(from_caster && *id == actor));
    debug!(action = %action.name, cells = cells.len(), caught = caught.len(), "area resolved");
    Ok(caught)
}

// ============================================================================
// Resolution
// ============================================================================

fn resolve_single<R: DiceRoller + ?Sized>(
    ctx: &TargetContext<'_>,
    actor: CombatantId,
    action: &Arc<ActionDetail>,
    target: Target,
    global: Advantage,
    roller: &mut R,
) -> Result<TargetingOutcome, TargetingError> {
    let targets = if action.area_of_effect.is_some() {
        area_targets(ctx, actor, action, target)?
    } else {
        vec![token_target(ctx, actor, action, target)?]
    };

    let mut cast = Cast::new(ctx.world, ctx.config, actor, action, global, roller);
    cast.announce(&targets);
    for id in targets {
        cast.apply_to(id, 1)?;
    }
    cast.spend_slot();
    Ok(cast.finish())
}

fn unleash<R: DiceRoller + ?Sized>(
    ctx: &TargetContext<'_>,
    actor: CombatantId,
    action: &Arc<ActionDetail>,
    tracker: &ChargeTracker,
    global: Advantage,
    roller: &mut R,
) -> Result<TargetingOutcome, TargetingError> {
    let targets: Vec<_> = tracker.targeted().collect();
    let mut cast = Cast::new(ctx.world, ctx.config, actor, action, global, roller);
    cast.announce(&targets.iter().map(|(id, _)| *id).collect::<Vec<_>>());
    for (id, charges) in targets {
        debug!(target = %ctx.world.name_of(id), charges, "unleashing charges");
        cast.apply_to(id, charges)?;
    }
    cast.spend_slot();
    Ok(cast.finish())
}

/// How rolled damage is scaled before it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DamageScale {
    Times(u32),
    /// Half of the multiplied total, rounded down.
    Half(u32),
}

impl DamageScale {
    fn apply(self, amount: i32) -> i32 {
        match self {
            DamageScale::Times(n) => amount.saturating_mul(n as i32),
            DamageScale::Half(n) => amount.saturating_mul(n as i32) / 2,
        }
    }
}

/// Working state while one action lands on its targets.
pub(crate) struct Cast<'a, 'r, R: DiceRoller + ?Sized> {
    world: &'a TableState,
    config: &'a EngineConfig,
    actor: CombatantId,
    action: &'a Arc<ActionDetail>,
    edits: CombatantEdits<'a>,
    resolution: Resolution,
    global: Advantage,
    consumed_global: bool,
    roller: &'r mut R,
}

impl<'a, 'r, R: DiceRoller + ?Sized> Cast<'a, 'r, R> {
    pub(crate) fn new(
        world: &'a TableState,
        config: &'a EngineConfig,
        actor: CombatantId,
        action: &'a Arc<ActionDetail>,
        global: Advantage,
        roller: &'r mut R,
    ) -> Self {
        Self {
            world,
            config,
            actor,
            action,
            edits: CombatantEdits::new(world),
            resolution: Resolution::new(),
            global,
            consumed_global: false,
            roller,
        }
    }

    fn name(&self, id: CombatantId) -> String {
        self.edits
            .get(id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| self.world.name_of(id))
    }

    pub(crate) fn notice(&mut self, notice: Notice) {
        self.resolution.push_notice(notice);
    }

    pub(crate) fn update(&mut self, update: SyncUpdate) {
        self.resolution.push_update(update);
    }

    fn announce(&mut self, targets: &[CombatantId]) {
        let names: Vec<_> = targets.iter().map(|id| self.name(*id)).collect();
        let text = if names.is_empty() {
            format!("{} uses {}, but it catches no one.", self.name(self.actor), self.action.name)
        } else {
            format!(
                "{} uses {} on {}.",
                self.name(self.actor),
                self.action.name,
                names.join(", ")
            )
        };
        self.notice(Notice::message(text));
    }

    /// Roll a command. The global toggle is offered until one roll uses it.
    pub(crate) fn roll(
        &mut self,
        command: &str,
        offer_global: bool,
    ) -> Result<RollResult, DiceError> {
        let global = if offer_global && !self.consumed_global {
            self.global
        } else {
            Advantage::Normal
        };
        let result = DiceExpression::parse_with_limits(command, &self.config.dice_limits)?
            .roll(global, &mut *self.roller);
        self.consumed_global |= result.consumed_global;
        debug!(transcript = %result.transcript, "rolled");
        self.notice(Notice::roll(result.transcript.clone()));
        Ok(result)
    }

    /// Land the action on one target, `multiplier` times over.
    fn apply_to(&mut self, target: CombatantId, multiplier: u32) -> Result<(), DiceError> {
        if self.edits.get(target).is_none() || self.world.token(target).is_none() {
            warn!(%target, action = %self.action.name, "target left the map before resolution");
            return Ok(());
        }
        let action = Arc::clone(self.action);
        if let Some(settings) = action.attack_settings {
            let attacker = self.edits.get(self.actor);
            let (modifier, armor_class) = match (attacker, self.edits.get(target)) {
                (Some(attacker), Some(defender)) => (
                    stats::attack_modifier(attacker, &settings),
                    stats::effective_ac(defender),
                ),
                _ => return Ok(()),
            };
            let command = format!(
                "{} {} attack on {}",
                stats::with_modifier("1d20", modifier),
                action.name,
                self.name(target)
            );
            let attack = self.roll(&command, true)?;
            let critical = attack.is_critical();
            let hit = !attack.is_fumble() && (critical || attack.total >= armor_class);
            let verdict = match (hit, critical) {
                (true, true) => "Critical hit!",
                (true, false) => "Hit!",
                (false, _) if attack.is_fumble() => "Natural 1, miss.",
                (false, _) => "Miss.",
            };
            self.notice(Notice::message(format!(
                "{} vs AC {armor_class}: {verdict}",
                attack.total
            )));
            if hit {
                self.deal_damage(target, critical, DamageScale::Times(multiplier))?;
                self.attach_effect(target);
            }
        } else if let Some(spec) = &action.saving_throw {
            self.demand_save(target, spec, multiplier);
        } else {
            self.deal_damage(target, false, DamageScale::Times(multiplier))?;
            self.attach_effect(target);
        }
        Ok(())
    }

    /// Roll every damage entry and apply it to `target`.
    pub(crate) fn deal_damage(
        &mut self,
        target: CombatantId,
        critical: bool,
        scale: DamageScale,
    ) -> Result<(), DiceError> {
        let action = Arc::clone(self.action);
        for entry in &action.damage {
            let command = format!("{} {} damage", entry.dice, entry.damage_type);
            let mut expr = DiceExpression::parse_with_limits(&command, &self.config.dice_limits)?;
            if critical {
                expr = expr.with_doubled_dice();
            }
            let rolled = expr.roll(Advantage::Normal, &mut *self.roller);
            self.notice(Notice::roll(rolled.transcript.clone()));
            let amount = scale.apply(rolled.total.max(0));

            let Some(victim) = self.edits.get_mut(target) else {
                continue;
            };
            let text = if entry.damage_type == DamageType::Healing {
                let gained = victim.hit_points.heal(amount);
                format!(
                    "{} regains {gained} HP ({}/{}).",
                    victim.name, victim.hit_points.current, victim.hit_points.maximum
                )
            } else {
                let lost = victim.hit_points.take_damage(amount);
                let mut text = format!(
                    "{} takes {lost} {} damage ({}/{}).",
                    victim.name,
                    entry.damage_type,
                    victim.hit_points.current,
                    victim.hit_points.maximum
                );
                if victim.hit_points.is_down() {
                    text.push_str(&format!(" {} is down!", victim.name));
                }
                text
            };
            self.notice(Notice::message(text));
        }
        Ok(())
    }

    /// Attach the action's effect template, if any, to `target`.
    pub(crate) fn attach_effect(&mut self, target: CombatantId) {
        let Some(template) = self.action.applies_effect.clone() else {
            return;
        };
        let effect = TemporaryEffect {
            id: EffectId::new(),
            source_name: self.action.name.clone(),
            effect_type: template.effect_type,
            value: template.value,
            caster_id: self.actor,
            target_character_id: target,
            expires_at_start_of_casters_next_turn: template.expires_at_start_of_casters_next_turn,
            round_applied: self.world.combat.round,
        };
        if let Some(victim) = self.edits.get_mut(target) {
            let text = format!(
                "{} gains {} ({:+}).",
                victim.name, effect.source_name, effect.value
            );
            victim.effects.push(effect);
            self.notice(Notice::info(text));
        }
    }

    fn demand_save(&mut self, target: CombatantId, spec: &SavingThrowSpec, charges: u32) {
        let Some(caster) = self.edits.get(self.actor) else {
            return;
        };
        let save = PendingSpellSave {
            id: PendingSaveId::new(),
            caster_id: self.actor,
            spell_id: self.action.name.clone(),
            spell: Arc::clone(self.action),
            target_character_id: target,
            save_stat: spec.ability,
            save_dc: stats::save_dc(caster, spec),
            effect_on_save: spec.effect_on_save.clone(),
            effect_on_failure: spec.effect_on_failure.clone(),
            charges,
            timestamp: Utc::now(),
        };
        self.notice(Notice::info(format!(
            "{} must make a DC {} {} saving throw against {}.",
            self.name(target),
            save.save_dc,
            save.save_stat.name(),
            self.action.name
        )));
        self.update(SyncUpdate::PendingSaveAdded { save });
    }

    /// Deduct one slot of the action's level from the caster.
    fn spend_slot(&mut self) {
        let Some(level) = self.action.slot_level() else {
            return;
        };
        if let Some(caster) = self.edits.get_mut(self.actor) {
            if caster.spell_slots.use_slot(level) {
                let left = caster.spell_slots.available(level);
                let text = format!("{} spends a level {level} slot ({left} left).", caster.name);
                self.notice(Notice::info(text));
            } else {
                warn!(caster = %caster.name, level, "no slot left to spend");
            }
        }
    }

    /// Combatant edits first, then the other updates in the order produced.
    pub(crate) fn finish(self) -> TargetingOutcome {
        let mut updates = self.edits.into_updates();
        updates.extend(self.resolution.updates);
        TargetingOutcome {
            resolution: Resolution {
                updates,
                notices: self.resolution.notices,
            },
            consumed_global: self.consumed_global,
            finished: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionCategory, AreaOfEffect, AreaShape};
    use crate::sync::apply_updates;
    use crate::testing::{fixtures, ScriptedRoller};
    use crate::world::{Ability, Combatant};

    struct Table {
        world: TableState,
        who: Participant,
        config: EngineConfig,
    }

    impl Table {
        fn new() -> Self {
            Self {
                world: TableState::new(),
                who: Participant::moderator(),
                config: EngineConfig::default(),
            }
        }

        fn spawn(&mut self, combatant: Combatant, col: i32, row: i32) -> CombatantId {
            let id = combatant.id;
            let grid = self.config.grid();
            let position = grid.center(crate::geometry::Cell::new(col, row));
            self.world.combatants.insert(id, combatant);
            self.world.tokens.push(Token::new(id, position));
            id
        }

        fn ctx(&self) -> TargetContext<'_> {
            TargetContext {
                world: &self.world,
                who: &self.who,
                config: &self.config,
            }
        }

        fn hp(&self, id: CombatantId) -> i32 {
            self.world.combatant(id).unwrap().hit_points.current
        }
    }

    #[test]
    fn test_initiate_requires_token() {
        let mut table = Table::new();
        let fighter = fixtures::fighter();
        let id = fighter.id;
        table.world.combatants.insert(id, fighter);
        let mut session = TargetingSession::default();
        let err = session
            .initiate(&table.ctx(), TargetingMode::Attack, id, Arc::new(fixtures::longsword()))
            .unwrap_err();
        assert!(matches!(err, TargetingError::NoToken(_)));
        assert!(!session.is_active());
    }

    #[test]
    fn test_initiating_one_mode_cancels_the_other() {
        let mut table = Table::new();
        let wizard = table.spawn(fixtures::wizard(), 0, 0);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Attack, wizard, Arc::new(fixtures::longsword()))
            .unwrap();
        let resolution = session
            .initiate(&table.ctx(), TargetingMode::Spell, wizard, Arc::new(fixtures::fireball()))
            .unwrap();
        assert_eq!(session.mode(), Some(TargetingMode::Spell));
        assert!(resolution.notices[0].text.contains("cancelled"));
    }

    #[test]
    fn test_cancel_from_idle_is_noop() {
        let mut session = TargetingSession::Idle;
        assert!(session.cancel().is_none());
    }

    #[test]
    fn test_resolve_idle_is_invariant_violation() {
        let table = Table::new();
        let mut session = TargetingSession::Idle;
        let err = session
            .resolve(
                &table.ctx(),
                Target::Point(Point::default()),
                Advantage::Normal,
                &mut ScriptedRoller::default(),
            )
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_out_of_range_returns_to_idle() {
        let mut table = Table::new();
        let fighter = table.spawn(fixtures::fighter(), 0, 0);
        let goblin = table.spawn(fixtures::goblin(), 5, 0);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Attack, fighter, Arc::new(fixtures::longsword()))
            .unwrap();
        let err = session
            .resolve(
                &table.ctx(),
                Target::Token(goblin),
                Advantage::Normal,
                &mut ScriptedRoller::default(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            TargetingError::OutOfRange {
                distance_feet: 25,
                range_feet: 5
            }
        );
        assert!(!session.is_active());
    }

    #[test]
    fn test_self_target_rejected() {
        let mut table = Table::new();
        let wizard = table.spawn(fixtures::wizard(), 0, 0);
        let bolt = ActionDetail::new("Bolt", ActionCategory::Spell)
            .with_range("60 feet")
            .with_target_text("one creature other than you")
            .with_damage("1d10", DamageType::Fire);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Spell, wizard, Arc::new(bolt))
            .unwrap();
        let err = session
            .resolve(
                &table.ctx(),
                Target::Token(wizard),
                Advantage::Normal,
                &mut ScriptedRoller::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TargetingError::SelfTarget(_)));
    }

    #[test]
    fn test_attack_meets_ac_hits_and_damages() {
        let mut table = Table::new();
        let fighter = table.spawn(fixtures::fighter(), 0, 0);
        let goblin = table.spawn(fixtures::goblin().with_armor_class(15), 1, 0);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Attack, fighter, Arc::new(fixtures::longsword()))
            .unwrap();
        // Fighter attacks at +5: 10 + 5 = 15 vs AC 15, then 1d8+3 deals 4 + 3
        let outcome = session
            .resolve(
                &table.ctx(),
                Target::Token(goblin),
                Advantage::Normal,
                &mut ScriptedRoller::new([10, 4]),
            )
            .unwrap();
        assert!(outcome.finished);
        apply_updates(&mut table.world, &outcome.resolution.updates);
        assert_eq!(table.hp(goblin), 7 - 7);
    }

    #[test]
    fn test_natural_one_misses() {
        let mut table = Table::new();
        let fighter = table.spawn(fixtures::fighter(), 0, 0);
        let goblin = table.spawn(fixtures::goblin().with_armor_class(1), 1, 0);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Attack, fighter, Arc::new(fixtures::longsword()))
            .unwrap();
        let outcome = session
            .resolve(
                &table.ctx(),
                Target::Token(goblin),
                Advantage::Normal,
                &mut ScriptedRoller::new([1]),
            )
            .unwrap();
        apply_updates(&mut table.world, &outcome.resolution.updates);
        assert_eq!(table.hp(goblin), 7);
    }

    #[test]
    fn test_critical_doubles_dice_only() {
        let mut table = Table::new();
        let fighter = table.spawn(fixtures::fighter(), 0, 0);
        let ogre = table.spawn(
            Combatant::new("Ogre").with_hit_points(59).with_armor_class(11),
            1,
            0,
        );
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Attack, fighter, Arc::new(fixtures::longsword()))
            .unwrap();
        // 2d8+3 on a crit: 5 + 6 + 3
        let outcome = session
            .resolve(
                &table.ctx(),
                Target::Token(ogre),
                Advantage::Normal,
                &mut ScriptedRoller::new([20, 5, 6]),
            )
            .unwrap();
        apply_updates(&mut table.world, &outcome.resolution.updates);
        assert_eq!(table.hp(ogre), 59 - 14);
    }

    #[test]
    fn test_global_advantage_used_by_attack() {
        let mut table = Table::new();
        let fighter = table.spawn(fixtures::fighter(), 0, 0);
        let goblin = table.spawn(fixtures::goblin().with_armor_class(20), 1, 0);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Attack, fighter, Arc::new(fixtures::longsword()))
            .unwrap();
        let outcome = session
            .resolve(
                &table.ctx(),
                Target::Token(goblin),
                Advantage::Advantage,
                &mut ScriptedRoller::new([3, 15, 2]),
            )
            .unwrap();
        assert!(outcome.consumed_global);
        apply_updates(&mut table.world, &outcome.resolution.updates);
        // 15 + 5 = 20 hits AC 20 for 2 + 3
        assert_eq!(table.hp(goblin), 2);
    }

    #[test]
    fn test_save_spell_creates_pending_saves() {
        let mut table = Table::new();
        let wizard = table.spawn(fixtures::wizard(), 0, 0);
        let a = table.spawn(fixtures::goblin(), 6, 0);
        let b = table.spawn(fixtures::goblin(), 7, 1);
        let far = table.spawn(fixtures::goblin(), 20, 20);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Spell, wizard, Arc::new(fixtures::fireball()))
            .unwrap();
        let center = table.config.grid().center(crate::geometry::Cell::new(6, 0));
        let outcome = session
            .resolve(
                &table.ctx(),
                Target::Point(center),
                Advantage::Normal,
                &mut ScriptedRoller::default(),
            )
            .unwrap();
        apply_updates(&mut table.world, &outcome.resolution.updates);

        let targets: Vec<_> = table
            .world
            .pending_saves
            .iter()
            .map(|s| s.target_character_id)
            .collect();
        assert_eq!(targets, vec![a, b]);
        assert!(!targets.contains(&far));
        assert_eq!(table.world.pending_saves[0].save_stat, Ability::Dexterity);
        // Wizard: 8 + 2 + INT 3
        assert_eq!(table.world.pending_saves[0].save_dc, 13);
        assert_eq!(
            table.world.combatant(wizard).unwrap().spell_slots.available(3),
            0
        );
    }

    #[test]
    fn test_self_cone_excludes_caster() {
        let mut table = Table::new();
        let wizard = table.spawn(fixtures::wizard(), 0, 0);
        let goblin = table.spawn(fixtures::goblin(), 2, 0);
        let behind = table.spawn(fixtures::goblin(), 0, 3);
        let cone = ActionDetail::new("Frost Fan", ActionCategory::Spell)
            .with_range("Self (15-foot cone)")
            .with_area(AreaOfEffect::new(AreaShape::Cone, 15))
            .with_damage("1d6", DamageType::Cold);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Spell, wizard, Arc::new(cone))
            .unwrap();
        let aim = table.config.grid().center(crate::geometry::Cell::new(3, 0));
        let outcome = session
            .resolve(
                &table.ctx(),
                Target::Point(aim),
                Advantage::Normal,
                &mut ScriptedRoller::new([4]),
            )
            .unwrap();
        apply_updates(&mut table.world, &outcome.resolution.updates);
        assert_eq!(table.hp(goblin), 3);
        assert_eq!(table.hp(behind), 7);
        assert_eq!(table.hp(wizard), table.world.combatant(wizard).unwrap().hit_points.maximum);
    }

    #[test]
    fn test_charged_spell_stays_active_on_error() {
        let mut table = Table::new();
        let wizard = table.spawn(fixtures::wizard(), 0, 0);
        let goblin = table.spawn(fixtures::goblin(), 2, 0);
        let mut session = TargetingSession::default();
        session
            .initiate(
                &table.ctx(),
                TargetingMode::Spell,
                wizard,
                Arc::new(fixtures::magic_missile()),
            )
            .unwrap();
        assert_eq!(session.charges().unwrap().remaining(), 3);

        let err = session
            .resolve(
                &table.ctx(),
                Target::Point(Point::default()),
                Advantage::Normal,
                &mut ScriptedRoller::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TargetingError::TokenRequired(_)));
        assert!(session.is_active());

        let outcome = session
            .resolve(
                &table.ctx(),
                Target::Token(goblin),
                Advantage::Normal,
                &mut ScriptedRoller::default(),
            )
            .unwrap();
        assert!(!outcome.finished);
        assert!(session.involves(goblin));
        assert_eq!(session.charges().unwrap().remaining(), 2);
    }

    #[test]
    fn test_no_slot_refuses_initiate() {
        let mut table = Table::new();
        let wizard = table.spawn(fixtures::wizard().with_spell_slots(3, 0), 0, 0);
        let mut session = TargetingSession::default();
        let err = session
            .initiate(&table.ctx(), TargetingMode::Spell, wizard, Arc::new(fixtures::fireball()))
            .unwrap_err();
        assert_eq!(
            err,
            TargetingError::NoSpellSlot {
                name: "Mira".to_string(),
                level: 3
            }
        );
    }

    #[test]
    fn test_effect_attached_to_self() {
        let mut table = Table::new();
        let wizard = table.spawn(fixtures::wizard(), 0, 0);
        let mut session = TargetingSession::default();
        session
            .initiate(&table.ctx(), TargetingMode::Spell, wizard, Arc::new(fixtures::shield()))
            .unwrap();
        let outcome = session
            .resolve(
                &table.ctx(),
                Target::Token(wizard),
                Advantage::Normal,
                &mut ScriptedRoller::default(),
            )
            .unwrap();
        apply_updates(&mut table.world, &outcome.resolution.updates);
        let mira = table.world.combatant(wizard).unwrap();
        assert_eq!(stats::effective_ac(mira), mira.armor_class + 5);
        assert_eq!(mira.effects[0].caster_id, wizard);
    }
}
