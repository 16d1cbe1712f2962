//! Effective stats derived from base values plus active effects.
//!
//! Nothing here is cached: effect lists change whenever a broadcast lands,
//! so every read recomputes.

use crate::actions::{AttackSettings, SavingThrowSpec};
use crate::world::{Ability, Combatant, EffectType};

/// Sum of every active effect of `effect_type` on the combatant.
pub fn effect_total(combatant: &Combatant, effect_type: EffectType) -> i32 {
    combatant
        .effects
        .iter()
        .filter(|e| e.effect_type == effect_type)
        .map(|e| e.value)
        .sum()
}

/// Base armor class plus every `ac_bonus` effect.
pub fn effective_ac(combatant: &Combatant) -> i32 {
    combatant.armor_class + effect_total(combatant, EffectType::AcBonus)
}

/// Ability modifier + proficiency (if applicable) + flat bonus.
pub fn attack_modifier(attacker: &Combatant, settings: &AttackSettings) -> i32 {
    let proficiency = if settings.proficient {
        attacker.proficiency_bonus
    } else {
        0
    };
    attacker.modifier(settings.ability) + proficiency + settings.bonus
}

pub fn saving_throw_modifier(combatant: &Combatant, ability: Ability) -> i32 {
    let proficiency = if combatant.save_proficiencies.contains(&ability) {
        combatant.proficiency_bonus
    } else {
        0
    };
    combatant.modifier(ability)
        + proficiency
        + effect_total(combatant, EffectType::SavingThrowBonus)
}

/// The DC override, or 8 + proficiency + the caster's casting modifier.
pub fn save_dc(caster: &Combatant, spec: &SavingThrowSpec) -> i32 {
    spec.dc.unwrap_or_else(|| {
        let ability = spec.dc_ability.unwrap_or(Ability::Wisdom);
        8 + caster.proficiency_bonus + caster.modifier(ability)
    })
}

pub fn initiative_modifier(combatant: &Combatant) -> i32 {
    combatant.modifier(Ability::Dexterity)
}

/// `base` followed by a signed modifier, e.g. `1d20+5`, `1d20-1`, `1d20`.
pub fn with_modifier(base: &str, modifier: i32) -> String {
    match modifier {
        0 => base.to_string(),
        m if m > 0 => format!("{base}+{m}"),
        m => format!("{base}-{}", m.unsigned_abs()),
    }
}
