//! Testing utilities for the combat engine.
//!
//! This module provides tools for deterministic tests:
//! - `ScriptedRoller` replays fixed die results
//! - `RecordingNotifier` / `RecordingBroadcaster` capture engine output
//! - `fixtures` builds stock combatants and actions
//! - `TestHarness` wires them into a moderator's engine

use crate::actions::{
    ActionCategory, ActionDetail, AreaOfEffect, AreaShape, DamageType, EffectTemplate,
    SavingThrowSpec,
};
use crate::config::EngineConfig;
use crate::dice::DiceRoller;
use crate::engine::CombatEngine;
use crate::geometry::Cell;
use crate::sync::{Broadcaster, Notice, Notifier, SyncUpdate};
use crate::world::{Ability, Combatant, CombatantId, Participant};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A dice roller that returns scripted results in order.
///
/// Clones share one queue, so a test can keep a handle after giving the
/// roller to an engine and push more results later.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRoller {
    queue: Rc<RefCell<VecDeque<u32>>>,
}

impl ScriptedRoller {
    pub fn new(rolls: impl IntoIterator<Item = u32>) -> Self {
        Self {
            queue: Rc::new(RefCell::new(rolls.into_iter().collect())),
        }
    }

    /// Queue more results.
    pub fn push(&self, rolls: impl IntoIterator<Item = u32>) {
        self.queue.borrow_mut().extend(rolls);
    }

    pub fn remaining(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl DiceRoller for ScriptedRoller {
    /// Panics when the script runs out.
    fn roll_die(&mut self, sides: u32) -> u32 {
        match self.queue.borrow_mut().pop_front() {
            Some(value) => value.clamp(1, sides.max(1)),
            None => panic!("scripted roller ran out of results (rolling d{sides})"),
        }
    }
}

/// Captures every notice.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notices: Rc<RefCell<Vec<Notice>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.borrow().clone()
    }

    pub fn last(&self) -> Option<Notice> {
        self.notices.borrow().last().cloned()
    }

    /// Whether any notice mentions `text`.
    pub fn contains(&self, text: &str) -> bool {
        self.notices.borrow().iter().any(|n| n.text.contains(text))
    }

    pub fn clear(&self) {
        self.notices.borrow_mut().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&mut self, notice: Notice) {
        self.notices.borrow_mut().push(notice);
    }
}

/// Captures every published update.
#[derive(Debug, Clone, Default)]
pub struct RecordingBroadcaster {
    updates: Rc<RefCell<Vec<SyncUpdate>>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<SyncUpdate> {
        self.updates.borrow().clone()
    }

    pub fn clear(&self) {
        self.updates.borrow_mut().clear();
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn publish(&mut self, update: &SyncUpdate) {
        self.updates.borrow_mut().push(update.clone());
    }
}

pub type TestEngine = CombatEngine<RecordingNotifier, RecordingBroadcaster>;

/// Stock combatants and actions.
pub mod fixtures {
    use super::*;
    use crate::world::{AbilityScores, EffectType};

    pub fn longsword() -> ActionDetail {
        ActionDetail::new("Longsword", ActionCategory::Action)
            .with_attack(Ability::Strength, true, 0)
            .with_range("5 ft")
            .with_damage("1d8+3", DamageType::Slashing)
    }

    pub fn scimitar() -> ActionDetail {
        ActionDetail::new("Scimitar", ActionCategory::Action)
            .with_attack(Ability::Dexterity, true, 0)
            .with_range("5 ft")
            .with_damage("1d6+2", DamageType::Slashing)
    }

    pub fn magic_missile() -> ActionDetail {
        ActionDetail::new("Magic Missile", ActionCategory::Spell)
            .with_spell_level(1)
            .with_range("120 feet")
            .with_target_text("One or more creatures you can see")
            .with_charges(3)
            .with_damage("1d4+1", DamageType::Force)
    }

    pub fn burning_hands() -> ActionDetail {
        let mut save = SavingThrowSpec::new(Ability::Dexterity);
        save.dc_ability = Some(Ability::Intelligence);
        save.effect_on_save = "Half damage".to_string();
        ActionDetail::new("Burning Hands", ActionCategory::Spell)
            .with_spell_level(1)
            .with_range("Self (15-foot cone)")
            .with_area(AreaOfEffect::new(AreaShape::Cone, 15))
            .with_damage("3d6", DamageType::Fire)
            .with_save(save)
    }

    pub fn fireball() -> ActionDetail {
        let mut save = SavingThrowSpec::new(Ability::Dexterity);
        save.dc_ability = Some(Ability::Intelligence);
        save.effect_on_save = "Half damage".to_string();
        save.effect_on_failure = "Full damage".to_string();
        ActionDetail::new("Fireball", ActionCategory::Spell)
            .with_spell_level(3)
            .with_range("150 feet")
            .with_area(AreaOfEffect::new(AreaShape::Sphere, 20))
            .with_damage("8d6", DamageType::Fire)
            .with_save(save)
    }

    pub fn shield() -> ActionDetail {
        ActionDetail::new("Shield", ActionCategory::Reaction)
            .with_spell_level(1)
            .with_range("Self")
            .with_effect(EffectTemplate {
                effect_type: EffectType::AcBonus,
                value: 5,
                expires_at_start_of_casters_next_turn: true,
            })
    }

    pub fn sacred_flame() -> ActionDetail {
        let mut save = SavingThrowSpec::new(Ability::Dexterity);
        save.dc_ability = Some(Ability::Wisdom);
        save.effect_on_save = "No effect".to_string();
        ActionDetail::new("Sacred Flame", ActionCategory::Spell)
            .with_spell_level(0)
            .with_range("60 feet")
            .with_target_text("A creature you can see")
            .with_damage("1d8", DamageType::Radiant)
            .with_save(save)
    }

    pub fn cure_wounds() -> ActionDetail {
        ActionDetail::new("Cure Wounds", ActionCategory::Spell)
            .with_spell_level(1)
            .with_range("Touch")
            .with_damage("1d8+3", DamageType::Healing)
    }

    /// Level 3 fighter: +5 to hit with a longsword, AC 16.
    pub fn fighter() -> Combatant {
        Combatant::new("Ser Aldric")
            .with_ability_scores(AbilityScores::new(16, 12, 14, 10, 10, 10))
            .with_hit_points(28)
            .with_armor_class(16)
            .with_save_proficiency(Ability::Strength)
            .with_save_proficiency(Ability::Constitution)
            .with_action(longsword())
    }

    /// Level 5 wizard: save DC 13, one 3rd-level slot.
    pub fn wizard() -> Combatant {
        Combatant::new("Mira")
            .with_ability_scores(AbilityScores::new(8, 14, 12, 17, 12, 10))
            .with_hit_points(22)
            .with_armor_class(12)
            .with_spell_slots(1, 4)
            .with_spell_slots(3, 1)
            .with_save_proficiency(Ability::Intelligence)
            .with_save_proficiency(Ability::Wisdom)
            .with_action(magic_missile())
            .with_action(burning_hands())
            .with_action(fireball())
            .with_action(shield())
    }

    pub fn cleric() -> Combatant {
        Combatant::new("Brother Tam")
            .with_ability_scores(AbilityScores::new(12, 10, 14, 10, 16, 12))
            .with_hit_points(24)
            .with_armor_class(18)
            .with_spell_slots(1, 3)
            .with_action(sacred_flame())
            .with_action(cure_wounds())
    }

    /// 7 HP, AC 15, DEX 14.
    pub fn goblin() -> Combatant {
        Combatant::new("Goblin")
            .with_ability_scores(AbilityScores::new(8, 14, 10, 10, 8, 8))
            .with_hit_points(7)
            .with_armor_class(15)
            .with_action(scimitar())
    }
}

/// A moderator's engine with scripted dice and recording collaborators.
pub struct TestHarness {
    pub engine: TestEngine,
    pub dice: ScriptedRoller,
    pub notices: RecordingNotifier,
    pub published: RecordingBroadcaster,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let dice = ScriptedRoller::default();
        let notices = RecordingNotifier::new();
        let published = RecordingBroadcaster::new();
        let engine = CombatEngine::new(
            config,
            Participant::moderator(),
            notices.clone(),
            published.clone(),
        )
        .with_roller(dice.clone());
        Self {
            engine,
            dice,
            notices,
            published,
        }
    }

    /// Add a combatant and place its token at the centre of a cell.
    pub fn spawn(&mut self, combatant: Combatant, col: i32, row: i32) -> CombatantId {
        let id = self.engine.add_combatant(combatant);
        let position = self.cell_center(col, row);
        if let Err(e) = self.engine.place_token(id, position) {
            panic!("failed to place token: {e}");
        }
        id
    }

    pub fn cell_center(&self, col: i32, row: i32) -> crate::geometry::Point {
        self.engine.config().grid().center(Cell::new(col, row))
    }

    /// Queue die results.
    pub fn rolls(&mut self, rolls: impl IntoIterator<Item = u32>) -> &mut Self {
        self.dice.push(rolls);
        self
    }

    pub fn hp(&self, id: CombatantId) -> i32 {
        self.engine
            .combatant(id)
            .map(|c| c.hit_points.current)
            .unwrap_or_else(|| panic!("no combatant {id}"))
    }

    pub fn current_turn(&self) -> Option<CombatantId> {
        self.engine.world().combat.current_turn
    }

    pub fn round(&self) -> u32 {
        self.engine.world().combat.round
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// Assertion helpers

/// Assert a combatant's current HP.
pub fn assert_hp(harness: &TestHarness, id: CombatantId, current: i32) {
    let actual = harness.hp(id);
    assert_eq!(
        actual, current,
        "Expected {} HP {current}, got {actual}",
        harness.engine.world().name_of(id)
    );
}

/// Assert whose turn it is.
pub fn assert_turn(harness: &TestHarness, id: CombatantId) {
    assert_eq!(
        harness.current_turn(),
        Some(id),
        "Expected it to be {}'s turn",
        harness.engine.world().name_of(id)
    );
}
