//! Attack and spell definitions.
//!
//! An [`ActionDetail`] is immutable once defined and shared by `Arc` across
//! every combatant that knows it.

use crate::world::{Ability, EffectType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Action,
    BonusAction,
    Reaction,
    Spell,
    Legendary,
    Other,
}

/// How an attack roll is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackSettings {
    pub ability: Ability,
    pub proficient: bool,
    pub bonus: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaShape {
    Sphere,
    Cone,
    Cube,
    Cylinder,
    Line,
}

/// Area of effect. Sizes are in feet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaOfEffect {
    #[serde(rename = "type")]
    pub shape: AreaShape,
    pub size: u32,
    /// Secondary size: a line's width.
    pub size_y: Option<u32>,
    /// Total cone angle override in degrees.
    pub angle: Option<f64>,
}

impl AreaOfEffect {
    pub fn new(shape: AreaShape, size: u32) -> Self {
        Self {
            shape,
            size,
            size_y: None,
            angle: None,
        }
    }
}

/// Common D&D damage types, plus healing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageType {
    Slashing,
    Piercing,
    Bludgeoning,
    Fire,
    Cold,
    Lightning,
    Thunder,
    Acid,
    Poison,
    Necrotic,
    Radiant,
    Force,
    Psychic,
    Healing,
}

impl DamageType {
    pub fn name(&self) -> &'static str {
        match self {
            DamageType::Slashing => "slashing",
            DamageType::Piercing => "piercing",
            DamageType::Bludgeoning => "bludgeoning",
            DamageType::Fire => "fire",
            DamageType::Cold => "cold",
            DamageType::Lightning => "lightning",
            DamageType::Thunder => "thunder",
            DamageType::Acid => "acid",
            DamageType::Poison => "poison",
            DamageType::Necrotic => "necrotic",
            DamageType::Radiant => "radiant",
            DamageType::Force => "force",
            DamageType::Psychic => "psychic",
            DamageType::Healing => "healing",
        }
    }
}

impl fmt::Display for DamageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One damage roll of an action, e.g. `2d6` fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageEntry {
    pub dice: String,
    pub damage_type: DamageType,
}

/// A saving throw demanded by an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavingThrowSpec {
    pub ability: Ability,
    /// Fixed DC; otherwise 8 + proficiency + `dc_ability` modifier.
    pub dc: Option<i32>,
    pub dc_ability: Option<Ability>,
    pub effect_on_save: String,
    pub effect_on_failure: String,
}

impl SavingThrowSpec {
    pub fn new(ability: Ability) -> Self {
        Self {
            ability,
            dc: None,
            dc_ability: None,
            effect_on_save: String::new(),
            effect_on_failure: String::new(),
        }
    }

    pub fn half_on_save(&self) -> bool {
        self.effect_on_save.to_lowercase().contains("half")
    }
}

/// Temporary effect an action leaves on each affected target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectTemplate {
    pub effect_type: EffectType,
    pub value: i32,
    pub expires_at_start_of_casters_next_turn: bool,
}

/// Parsed form of an action's range text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    SelfOnly,
    Touch,
    Feet(u32),
    Unlimited,
}

impl Range {
    pub const TOUCH_FEET: u32 = 5;

    /// Parse range text: `self`, `Self (15-foot cone)`, `touch`, `60 feet`,
    /// `5 ft.`, `80/320 ft`, `sight`. Unrecognized text is unlimited.
    pub fn parse(text: &str) -> Range {
        let lower = text.trim().to_lowercase();
        if lower.starts_with("self") {
            return Range::SelfOnly;
        }
        if lower.starts_with("touch") {
            return Range::Touch;
        }
        let digits: String = lower
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        match digits.parse::<u32>() {
            Ok(feet) => Range::Feet(feet),
            Err(_) => {
                if !matches!(lower.as_str(), "sight" | "unlimited" | "special" | "") {
                    tracing::warn!(range = %text, "unrecognized range, treating as unlimited");
                }
                Range::Unlimited
            }
        }
    }

    /// Reach in feet; `None` for unlimited.
    pub fn feet(&self) -> Option<u32> {
        match self {
            Range::SelfOnly => Some(0),
            Range::Touch => Some(Self::TOUCH_FEET),
            Range::Feet(feet) => Some(*feet),
            Range::Unlimited => None,
        }
    }
}

impl FromStr for Range {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Range::parse(s))
    }
}

/// An attack or spell a combatant can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDetail {
    pub name: String,
    pub category: ActionCategory,
    pub attack_settings: Option<AttackSettings>,
    pub range: String,
    /// Free-text target description, e.g. "a creature other than you".
    pub target: Option<String>,
    pub area_of_effect: Option<AreaOfEffect>,
    pub damage: Vec<DamageEntry>,
    pub saving_throw: Option<SavingThrowSpec>,
    /// 0 for cantrips.
    pub spell_level: Option<u8>,
    /// Number of pieces (darts, rays) divided among targets.
    pub charges: Option<u32>,
    pub applies_effect: Option<EffectTemplate>,
}

impl ActionDetail {
    pub fn new(name: impl Into<String>, category: ActionCategory) -> Self {
        Self {
            name: name.into(),
            category,
            attack_settings: None,
            range: "5 ft".to_string(),
            target: None,
            area_of_effect: None,
            damage: Vec::new(),
            saving_throw: None,
            spell_level: None,
            charges: None,
            applies_effect: None,
        }
    }

    pub fn with_attack(mut self, ability: Ability, proficient: bool, bonus: i32) -> Self {
        self.attack_settings = Some(AttackSettings {
            ability,
            proficient,
            bonus,
        });
        self
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = range.into();
        self
    }

    pub fn with_target_text(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_area(mut self, area: AreaOfEffect) -> Self {
        self.area_of_effect = Some(area);
        self
    }

    pub fn with_damage(mut self, dice: impl Into<String>, damage_type: DamageType) -> Self {
        self.damage.push(DamageEntry {
            dice: dice.into(),
            damage_type,
        });
        self
    }

    pub fn with_save(mut self, save: SavingThrowSpec) -> Self {
        self.saving_throw = Some(save);
        self
    }

    pub fn with_spell_level(mut self, level: u8) -> Self {
        self.spell_level = Some(level);
        self
    }

    pub fn with_charges(mut self, charges: u32) -> Self {
        self.charges = Some(charges);
        self
    }

    pub fn with_effect(mut self, effect: EffectTemplate) -> Self {
        self.applies_effect = Some(effect);
        self
    }

    pub fn parsed_range(&self) -> Range {
        Range::parse(&self.range)
    }

    pub fn forbids_self_target(&self) -> bool {
        self.target.as_deref().is_some_and(|t| {
            let t = t.to_lowercase();
            t.contains("other than you") || t.contains("not yourself") || t.contains("not self")
        })
    }

    /// Slot level spent on resolution; cantrips and non-spells spend none.
    pub fn slot_level(&self) -> Option<u8> {
        self.spell_level.filter(|level| *level > 0)
    }

    pub fn charge_count(&self) -> Option<u32> {
        self.charges.filter(|c| *c > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_parse() {
        assert_eq!(Range::parse("Self"), Range::SelfOnly);
        assert_eq!(Range::parse("Self (15-foot cone)"), Range::SelfOnly);
        assert_eq!(Range::parse("Touch"), Range::Touch);
        assert_eq!(Range::parse("120 feet"), Range::Feet(120));
        assert_eq!(Range::parse("5 ft."), Range::Feet(5));
        assert_eq!(Range::parse("80/320 ft"), Range::Feet(80));
        assert_eq!(Range::parse("Sight"), Range::Unlimited);
        assert_eq!(Range::parse("across the plane"), Range::Unlimited);
        assert_eq!(Range::Touch.feet(), Some(5));
        assert_eq!(Range::Unlimited.feet(), None);
    }

    #[test]
    fn test_forbids_self_target() {
        let bolt = ActionDetail::new("Bolt", ActionCategory::Spell)
            .with_target_text("A creature other than you");
        assert!(bolt.forbids_self_target());
        let heal = ActionDetail::new("Heal", ActionCategory::Spell).with_target_text("A creature");
        assert!(!heal.forbids_self_target());
    }

    #[test]
    fn test_slot_level() {
        let cantrip = ActionDetail::new("Fire Bolt", ActionCategory::Spell).with_spell_level(0);
        assert_eq!(cantrip.slot_level(), None);
        let missile = ActionDetail::new("Magic Missile", ActionCategory::Spell).with_spell_level(1);
        assert_eq!(missile.slot_level(), Some(1));
    }

    #[test]
    fn test_area_json_shape() {
        let json = r#"{"type":"cone","size":15,"size_y":null,"angle":null}"#;
        let area: AreaOfEffect = serde_json::from_str(json).unwrap();
        assert_eq!(area.shape, AreaShape::Cone);
        assert_eq!(area.size, 15);
    }
}
