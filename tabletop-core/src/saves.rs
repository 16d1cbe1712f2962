//! Resolving pending saving throws.
//!
//! A save spell leaves one [`PendingSpellSave`] per affected combatant. Each
//! is consumed here, either by rolling the save or by failing it outright.

use crate::config::EngineConfig;
use crate::dice::{Advantage, DiceRoller};
use crate::stats;
use crate::sync::{Notice, SyncUpdate};
use crate::targeting::{Cast, DamageScale, TargetingError, TargetingOutcome};
use crate::world::{Participant, PendingSaveId, TableState};
use tracing::debug;

/// How a pending save is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResolution {
    Roll,
    AutoFail,
}

pub fn resolve_pending_save<R: DiceRoller + ?Sized>(
    world: &TableState,
    who: &Participant,
    config: &EngineConfig,
    save_id: PendingSaveId,
    how: SaveResolution,
    global: Advantage,
    roller: &mut R,
) -> Result<TargetingOutcome, TargetingError> {
    let save = world
        .pending_save(save_id)
        .ok_or(TargetingError::UnknownPendingSave(save_id))?;
    let target = save.target_character_id;
    let combatant = world
        .combatant(target)
        .ok_or(TargetingError::UnknownCombatant(target))?;
    if !who.controls(target) {
        return Err(TargetingError::NotController(combatant.name.clone()));
    }

    let mut cast = Cast::new(world, config, save.caster_id, &save.spell, global, roller);
    let saved = match how {
        SaveResolution::AutoFail => {
            cast.notice(Notice::info(format!(
                "{} automatically fails the {} save against {}.",
                combatant.name,
                save.save_stat.name(),
                save.spell_id
            )));
            false
        }
        SaveResolution::Roll => {
            let modifier = stats::saving_throw_modifier(combatant, save.save_stat);
            let command = format!(
                "{} {} save vs {}",
                stats::with_modifier("1d20", modifier),
                save.save_stat.name(),
                save.spell_id
            );
            let roll = cast.roll(&command, true)?;
            let saved = roll.meets_dc(save.save_dc);
            cast.notice(Notice::message(format!(
                "{} {} (DC {}).",
                combatant.name,
                if saved { "saves" } else { "fails" },
                save.save_dc
            )));
            saved
        }
    };
    debug!(target = %combatant.name, spell = %save.spell_id, saved, "save resolved");

    if saved {
        if save.spell.saving_throw.as_ref().is_some_and(|s| s.half_on_save()) {
            cast.deal_damage(target, false, DamageScale::Half(save.charges))?;
        } else if !save.effect_on_save.is_empty() {
            cast.notice(Notice::info(save.effect_on_save.clone()));
        }
    } else {
        cast.deal_damage(target, false, DamageScale::Times(save.charges))?;
        cast.attach_effect(target);
        if !save.effect_on_failure.is_empty() {
            cast.notice(Notice::info(save.effect_on_failure.clone()));
        }
    }
    cast.update(SyncUpdate::PendingSaveRemoved { id: save_id });
    Ok(cast.finish())
}
