//! Tabletop state types.
//!
//! Contains the combat-relevant slice of the character roster, map tokens,
//! temporary effects, held actions, pending saves, and the per-participant
//! replica (`TableState`) that every broadcast mutation is applied to.

use crate::actions::ActionDetail;
use crate::combat::CombatState;
use crate::geometry::Point;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for combatants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CombatantId(pub Uuid);

impl CombatantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CombatantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CombatantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for temporary effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectId(pub Uuid);

impl EffectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EffectId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for pending saving throws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingSaveId(pub Uuid);

impl PendingSaveId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PendingSaveId {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Ability Scores
// ============================================================================

/// The six ability scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ability {
    Strength,
    Dexterity,
    Constitution,
    Intelligence,
    Wisdom,
    Charisma,
}

impl Ability {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Ability::Strength => "STR",
            Ability::Dexterity => "DEX",
            Ability::Constitution => "CON",
            Ability::Intelligence => "INT",
            Ability::Wisdom => "WIS",
            Ability::Charisma => "CHA",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Ability::Strength => "Strength",
            Ability::Dexterity => "Dexterity",
            Ability::Constitution => "Constitution",
            Ability::Intelligence => "Intelligence",
            Ability::Wisdom => "Wisdom",
            Ability::Charisma => "Charisma",
        }
    }
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.abbreviation())
    }
}

impl FromStr for Ability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "str" | "strength" => Ok(Ability::Strength),
            "dex" | "dexterity" => Ok(Ability::Dexterity),
            "con" | "constitution" => Ok(Ability::Constitution),
            "int" | "intelligence" => Ok(Ability::Intelligence),
            "wis" | "wisdom" => Ok(Ability::Wisdom),
            "cha" | "charisma" => Ok(Ability::Charisma),
            other => Err(format!("Unknown ability: {other}")),
        }
    }
}

/// Ability scores container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityScores {
    pub strength: u8,
    pub dexterity: u8,
    pub constitution: u8,
    pub intelligence: u8,
    pub wisdom: u8,
    pub charisma: u8,
}

impl AbilityScores {
    pub fn new(str: u8, dex: u8, con: u8, int: u8, wis: u8, cha: u8) -> Self {
        Self {
            strength: str,
            dexterity: dex,
            constitution: con,
            intelligence: int,
            wisdom: wis,
            charisma: cha,
        }
    }

    pub fn get(&self, ability: Ability) -> u8 {
        match ability {
            Ability::Strength => self.strength,
            Ability::Dexterity => self.dexterity,
            Ability::Constitution => self.constitution,
            Ability::Intelligence => self.intelligence,
            Ability::Wisdom => self.wisdom,
            Ability::Charisma => self.charisma,
        }
    }

    pub fn modifier(&self, ability: Ability) -> i32 {
        // Floor division: 8-9 = -1, 10-11 = 0, 12-13 = +1
        (self.get(ability) as i32 - 10).div_euclid(2)
    }
}

impl Default for AbilityScores {
    fn default() -> Self {
        Self::new(10, 10, 10, 10, 10, 10)
    }
}

// ============================================================================
// Hit Points and Spell Slots
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitPoints {
    pub current: i32,
    pub maximum: i32,
}

impl HitPoints {
    pub fn new(maximum: i32) -> Self {
        Self {
            current: maximum,
            maximum,
        }
    }

    /// Apply damage, floored at 0. Returns HP actually lost.
    pub fn take_damage(&mut self, amount: i32) -> i32 {
        let old = self.current;
        self.current = (self.current - amount.max(0)).clamp(0, self.maximum);
        old - self.current
    }

    /// Heal, capped at maximum. Returns HP actually gained.
    pub fn heal(&mut self, amount: i32) -> i32 {
        let old = self.current;
        self.current = (self.current + amount.max(0)).clamp(0, self.maximum);
        self.current - old
    }

    pub fn is_down(&self) -> bool {
        self.current <= 0
    }
}

/// Spell slot tracking for levels 1 through 9.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellSlots {
    pub slots: [SlotInfo; 9],
}

impl SpellSlots {
    pub fn new() -> Self {
        Self {
            slots: [SlotInfo { total: 0, used: 0 }; 9],
        }
    }

    pub fn set_total(&mut self, level: u8, total: u8) {
        if (1..=9).contains(&level) {
            self.slots[level as usize - 1] = SlotInfo { total, used: 0 };
        }
    }

    pub fn available(&self, level: u8) -> u8 {
        if (1..=9).contains(&level) {
            self.slots[level as usize - 1].available()
        } else {
            0
        }
    }

    pub fn use_slot(&mut self, level: u8) -> bool {
        if (1..=9).contains(&level) {
            let slot = &mut self.slots[level as usize - 1];
            if slot.available() > 0 {
                slot.used += 1;
                return true;
            }
        }
        false
    }
}

impl Default for SpellSlots {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub total: u8,
    pub used: u8,
}

impl SlotInfo {
    pub fn available(&self) -> u8 {
        self.total.saturating_sub(self.used)
    }
}

// ============================================================================
// Temporary Effects
// ============================================================================

/// What a temporary effect modifies. Unknown types keep their tag so they
/// survive being re-broadcast, but nothing reads them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EffectType {
    AcBonus,
    SavingThrowBonus,
    Other(String),
}

impl EffectType {
    pub fn as_str(&self) -> &str {
        match self {
            EffectType::AcBonus => "ac_bonus",
            EffectType::SavingThrowBonus => "saving_throw_bonus",
            EffectType::Other(tag) => tag,
        }
    }
}

impl From<String> for EffectType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "ac_bonus" => EffectType::AcBonus,
            "saving_throw_bonus" => EffectType::SavingThrowBonus,
            _ => EffectType::Other(tag),
        }
    }
}

impl From<EffectType> for String {
    fn from(effect_type: EffectType) -> Self {
        match effect_type {
            EffectType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EffectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-limited modifier attached to a combatant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporaryEffect {
    pub id: EffectId,
    pub source_name: String,
    pub effect_type: EffectType,
    pub value: i32,
    /// Expiry is keyed to the caster's turn, not the target's.
    pub caster_id: CombatantId,
    pub target_character_id: CombatantId,
    pub expires_at_start_of_casters_next_turn: bool,
    pub round_applied: u32,
}

impl TemporaryEffect {
    /// Whether this effect ends when `actor` starts a turn in `round`.
    pub fn expires_for(&self, actor: CombatantId, round: u32) -> bool {
        self.expires_at_start_of_casters_next_turn
            && self.caster_id == actor
            && self.round_applied < round
    }
}

// ============================================================================
// Combatants and Tokens
// ============================================================================

/// The combat-relevant view of a character record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Combatant {
    pub id: CombatantId,
    pub name: String,
    pub ability_scores: AbilityScores,
    pub proficiency_bonus: i32,
    pub hit_points: HitPoints,
    pub armor_class: i32,
    /// Base walking speed in feet.
    pub speed: u32,
    pub remaining_movement: u32,
    pub effects: Vec<TemporaryEffect>,
    pub actions: Vec<Arc<ActionDetail>>,
    pub spell_slots: SpellSlots,
    pub save_proficiencies: Vec<Ability>,
}

impl Combatant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: CombatantId::new(),
            name: name.into(),
            ability_scores: AbilityScores::default(),
            proficiency_bonus: 2,
            hit_points: HitPoints::new(10),
            armor_class: 10,
            speed: 30,
            remaining_movement: 30,
            effects: Vec::new(),
            actions: Vec::new(),
            spell_slots: SpellSlots::new(),
            save_proficiencies: Vec::new(),
        }
    }

    pub fn with_ability_scores(mut self, scores: AbilityScores) -> Self {
        self.ability_scores = scores;
        self
    }

    pub fn with_proficiency_bonus(mut self, bonus: i32) -> Self {
        self.proficiency_bonus = bonus;
        self
    }

    pub fn with_hit_points(mut self, maximum: i32) -> Self {
        self.hit_points = HitPoints::new(maximum);
        self
    }

    pub fn with_armor_class(mut self, armor_class: i32) -> Self {
        self.armor_class = armor_class;
        self
    }

    pub fn with_speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self.remaining_movement = speed;
        self
    }

    pub fn with_action(mut self, action: ActionDetail) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    pub fn with_spell_slots(mut self, level: u8, total: u8) -> Self {
        self.spell_slots.set_total(level, total);
        self
    }

    pub fn with_save_proficiency(mut self, ability: Ability) -> Self {
        self.save_proficiencies.push(ability);
        self
    }

    pub fn modifier(&self, ability: Ability) -> i32 {
        self.ability_scores.modifier(ability)
    }

    /// Look up a known action by name (case-insensitive).
    pub fn action(&self, name: &str) -> Option<&Arc<ActionDetail>> {
        self.actions
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }
}

/// A map marker placing a combatant on the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub combatant_id: CombatantId,
    pub position: Point,
    pub radius: f64,
}

impl Token {
    pub fn new(combatant_id: CombatantId, position: Point) -> Self {
        Self {
            combatant_id,
            position,
            radius: 25.0,
        }
    }
}

// ============================================================================
// Held Actions and Pending Saves
// ============================================================================

/// An action readied for a stated trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldAction {
    pub character_id: CombatantId,
    pub action_name: String,
    pub trigger_description: String,
    pub round_held: u32,
}

/// A saving throw owed by a target of a resolved spell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSpellSave {
    pub id: PendingSaveId,
    pub caster_id: CombatantId,
    pub spell_id: String,
    pub spell: Arc<ActionDetail>,
    pub target_character_id: CombatantId,
    pub save_stat: Ability,
    pub save_dc: i32,
    pub effect_on_save: String,
    pub effect_on_failure: String,
    /// Charges the target received from a multi-charge spell; damage is
    /// scaled by this count.
    #[serde(default = "one_charge")]
    pub charges: u32,
    pub timestamp: DateTime<Utc>,
}

fn one_charge() -> u32 {
    1
}

// ============================================================================
// Participant
// ============================================================================

/// Who is driving this copy of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Participant {
    pub is_moderator: bool,
    /// The combatant this participant plays, if any.
    pub combatant_id: Option<CombatantId>,
}

impl Participant {
    pub fn moderator() -> Self {
        Self {
            is_moderator: true,
            combatant_id: None,
        }
    }

    pub fn player(combatant_id: CombatantId) -> Self {
        Self {
            is_moderator: false,
            combatant_id: Some(combatant_id),
        }
    }

    pub fn controls(&self, id: CombatantId) -> bool {
        self.is_moderator || self.combatant_id == Some(id)
    }
}

// ============================================================================
// Table State
// ============================================================================

/// One participant's replica of the shared table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableState {
    pub combatants: HashMap<CombatantId, Combatant>,
    /// In placement order.
    pub tokens: Vec<Token>,
    pub combat: CombatState,
    pub held_actions: HashMap<CombatantId, HeldAction>,
    pub pending_saves: Vec<PendingSpellSave>,
}

impl TableState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn combatant(&self, id: CombatantId) -> Option<&Combatant> {
        self.combatants.get(&id)
    }

    pub fn token(&self, id: CombatantId) -> Option<&Token> {
        self.tokens.iter().find(|t| t.combatant_id == id)
    }

    pub fn name_of(&self, id: CombatantId) -> String {
        self.combatant(id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn pending_save(&self, id: PendingSaveId) -> Option<&PendingSpellSave> {
        self.pending_saves.iter().find(|s| s.id == id)
    }
}
