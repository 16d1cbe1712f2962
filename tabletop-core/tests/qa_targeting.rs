//! QA tests for attack and spell targeting through the engine.
//!
//! These tests verify:
//! - Attack rolls against effective AC (ties hit)
//! - Multi-charge spells and their unleash
//! - Area spells, pending saves and save resolution
//! - Cancellation on turn end, combat end and deletion
//!
//! Run with: `cargo test -p tabletop-core --test qa_targeting`

use tabletop_core::actions::SavingThrowSpec;
use tabletop_core::engine::{EngineError, ErrorKind};
use tabletop_core::targeting::TargetingError;
use tabletop_core::testing::{assert_hp, fixtures, TestHarness};
use tabletop_core::{
    Ability, ActionCategory, ActionDetail, Advantage, CombatPhase, Combatant, DamageType,
    Participant, SyncUpdate, Target, TargetingMode,
};

fn goblin_with_hp(hp: i32) -> Combatant {
    fixtures::goblin().with_hit_points(hp)
}

// =============================================================================
// ATTACKS
// =============================================================================

#[test]
fn test_attack_equal_to_ac_hits() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    let goblin = h.spawn(fixtures::goblin(), 1, 0);
    assert_eq!(h.engine.effective_ac(goblin), Some(15));

    h.engine.initiate_attack(fighter, "Longsword").unwrap();
    assert_eq!(h.engine.targeting().mode(), Some(TargetingMode::Attack));
    // 10 + 5 = 15 vs AC 15; 1d8+3 = 4 + 3
    h.rolls([10, 4]);
    assert!(h.engine.resolve_target(Target::Token(goblin)).unwrap());
    assert_hp(&h, goblin, 0);
    assert!(!h.engine.targeting().is_active());
    assert!(h.notices.contains("15 vs AC 15: Hit!"));
    assert!(h.notices.contains("Goblin is down!"));
}

#[test]
fn test_attack_below_ac_misses() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    let goblin = h.spawn(fixtures::goblin(), 1, 0);
    h.engine.initiate_attack(fighter, "Longsword").unwrap();
    h.rolls([9]);
    h.engine.resolve_target(Target::Token(goblin)).unwrap();
    assert_hp(&h, goblin, 7);
    assert!(h.notices.contains("Miss."));
}

#[test]
fn test_shield_raises_ac_against_attack() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard(), 0, 0);
    let goblin = h.spawn(fixtures::goblin(), 1, 0);
    h.engine.initiate_spell(wizard, "Shield").unwrap();
    h.engine.resolve_target(Target::Token(wizard)).unwrap();
    assert_eq!(h.engine.effective_ac(wizard), Some(17));

    // Scimitar +4: 12 + 4 = 16 misses AC 17
    h.engine.initiate_attack(goblin, "Scimitar").unwrap();
    h.rolls([12]);
    h.engine.resolve_target(Target::Token(wizard)).unwrap();
    assert_hp(&h, wizard, 22);
}

#[test]
fn test_global_advantage_reset_after_attack() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    let goblin = h.spawn(goblin_with_hp(30), 1, 0);
    h.engine.set_global_advantage(Advantage::Advantage);
    h.engine.initiate_attack(fighter, "Longsword").unwrap();
    h.rolls([2, 14, 5]);
    h.engine.resolve_target(Target::Token(goblin)).unwrap();
    assert_hp(&h, goblin, 30 - 8);
    assert_eq!(h.engine.global_advantage(), Advantage::Normal);
}

#[test]
fn test_out_of_range_attack_is_rejected() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    let goblin = h.spawn(fixtures::goblin(), 4, 0);
    h.engine.initiate_attack(fighter, "Longsword").unwrap();
    let err = h.engine.resolve_target(Target::Token(goblin)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Targeting(TargetingError::OutOfRange { range_feet: 5, .. })
    ));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!h.engine.targeting().is_active());
    assert!(h.notices.contains("out of range"));
}

#[test]
fn test_unknown_action_is_rejected() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    let err = h.engine.initiate_attack(fighter, "Greataxe").unwrap_err();
    assert!(matches!(err, EngineError::UnknownAction { .. }));
}

// =============================================================================
// MULTI-CHARGE SPELLS
// =============================================================================

#[test]
fn test_three_charges_split_two_and_one() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard(), 0, 0);
    let a = h.spawn(goblin_with_hp(20), 2, 0);
    let b = h.spawn(goblin_with_hp(20), 3, 0);

    h.engine.initiate_spell(wizard, "Magic Missile").unwrap();
    assert!(!h.engine.resolve_target(Target::Token(a)).unwrap());
    assert!(!h.engine.resolve_target(Target::Token(a)).unwrap());
    let charges = h.engine.targeting().charges().unwrap();
    assert_eq!(charges.charges_on(a), 2);
    assert_eq!(charges.remaining(), 1);

    // A: (3 + 1) x 2, B: 2 + 1
    h.rolls([3, 2]);
    assert!(h.engine.resolve_target(Target::Token(b)).unwrap());
    assert_hp(&h, a, 20 - 8);
    assert_hp(&h, b, 20 - 3);
    assert_eq!(h.engine.combatant(wizard).unwrap().spell_slots.available(1), 3);

    let err = h.engine.resolve_target(Target::Token(b)).unwrap_err();
    assert_eq!(err, EngineError::Targeting(TargetingError::NoActiveSession));
    assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    assert_hp(&h, b, 17);
}

#[test]
fn test_charge_out_of_range_keeps_session() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard(), 0, 0);
    let far = h.spawn(fixtures::goblin(), 40, 0);
    let near = h.spawn(fixtures::goblin(), 2, 0);

    h.engine.initiate_spell(wizard, "Magic Missile").unwrap();
    assert!(h.engine.resolve_target(Target::Token(far)).is_err());
    assert!(h.engine.targeting().is_active());
    assert_eq!(h.engine.targeting().charges().unwrap().remaining(), 3);
    assert!(!h.engine.resolve_target(Target::Token(near)).unwrap());
}

#[test]
fn test_deleting_charged_target_cancels() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard(), 0, 0);
    let goblin = h.spawn(fixtures::goblin(), 2, 0);
    h.engine.initiate_spell(wizard, "Magic Missile").unwrap();
    h.engine.resolve_target(Target::Token(goblin)).unwrap();

    h.engine.delete_combatant(goblin).unwrap();
    assert!(!h.engine.targeting().is_active());
    assert!(h.notices.contains("Magic Missile targeting cancelled."));
    assert!(h.engine.world().token(goblin).is_none());
    // No slot was spent
    assert_eq!(h.engine.combatant(wizard).unwrap().spell_slots.available(1), 4);
}

#[test]
fn test_removing_charged_token_returns_its_charges() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard(), 0, 0);
    let a = h.spawn(goblin_with_hp(20), 2, 0);
    let b = h.spawn(goblin_with_hp(20), 3, 0);
    h.engine.initiate_spell(wizard, "Magic Missile").unwrap();
    h.engine.resolve_target(Target::Token(a)).unwrap();

    h.engine.remove_token(a).unwrap();
    let charges = h.engine.targeting().charges().unwrap();
    assert_eq!(charges.charges_on(a), 0);
    assert_eq!(charges.remaining(), 3);
    assert!(h.notices.contains("1 Magic Missile charge returned (3 left)."));

    // A is off the map and can no longer be picked
    assert!(h.engine.resolve_target(Target::Token(a)).is_err());
    assert!(h.engine.targeting().is_active());

    // All three land on B: (2 + 1) x 3
    assert!(!h.engine.resolve_target(Target::Token(b)).unwrap());
    assert!(!h.engine.resolve_target(Target::Token(b)).unwrap());
    h.rolls([2]);
    assert!(h.engine.resolve_target(Target::Token(b)).unwrap());
    assert_hp(&h, a, 20);
    assert_hp(&h, b, 20 - 9);
}

#[test]
fn test_inbound_token_removal_returns_charges() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard(), 0, 0);
    let a = h.spawn(goblin_with_hp(20), 2, 0);
    h.engine.initiate_spell(wizard, "Magic Missile").unwrap();
    h.engine.resolve_target(Target::Token(a)).unwrap();
    h.engine.resolve_target(Target::Token(a)).unwrap();

    h.engine.apply_remote(&SyncUpdate::TokenRemoved { id: a });
    let charges = h.engine.targeting().charges().unwrap();
    assert_eq!(charges.charges_on(a), 0);
    assert_eq!(charges.remaining(), 3);

    // Losing the caster's own token ends the session
    h.engine.apply_remote(&SyncUpdate::TokenRemoved { id: wizard });
    assert!(!h.engine.targeting().is_active());
    assert_hp(&h, a, 20);
}

/// Four 1d4 fire darts, DEX save for half, DC 13 from the wizard.
fn fire_darts() -> ActionDetail {
    let mut save = SavingThrowSpec::new(Ability::Dexterity);
    save.dc_ability = Some(Ability::Intelligence);
    save.effect_on_save = "Half damage".to_string();
    ActionDetail::new("Fire Darts", ActionCategory::Spell)
        .with_spell_level(1)
        .with_range("60 feet")
        .with_charges(4)
        .with_damage("1d4", DamageType::Fire)
        .with_save(save)
}

#[test]
fn test_charged_save_spell_scales_damage_by_charges() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard().with_action(fire_darts()), 0, 0);
    let a = h.spawn(Combatant::new("Ogre").with_hit_points(50), 2, 0);
    let b = h.spawn(Combatant::new("Ogre").with_hit_points(50), 3, 0);

    h.engine.initiate_spell(wizard, "Fire Darts").unwrap();
    for target in [a, a, b] {
        assert!(!h.engine.resolve_target(Target::Token(target)).unwrap());
    }
    assert!(h.engine.resolve_target(Target::Token(b)).unwrap());

    let saves = h.engine.world().pending_saves.clone();
    assert_eq!(saves.len(), 2);
    let save_for = |id| {
        saves
            .iter()
            .find(|s| s.target_character_id == id)
            .unwrap()
            .clone()
    };
    assert_eq!(save_for(a).charges, 2);
    assert_eq!(save_for(b).charges, 2);

    // A fails outright: 4 x 2
    h.rolls([4]);
    h.engine.auto_fail_save(save_for(a).id).unwrap();
    assert_hp(&h, a, 50 - 8);

    // B saves (15 vs DC 13): half of 3 x 2
    h.rolls([15, 3]);
    h.engine.roll_pending_save(save_for(b).id).unwrap();
    assert_hp(&h, b, 50 - 3);
    assert!(h.engine.world().pending_saves.is_empty());
}

// =============================================================================
// AREA SPELLS AND SAVES
// =============================================================================

#[test]
fn test_fireball_then_saves() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard(), 0, 0);
    let a = h.spawn(goblin_with_hp(40), 8, 0);
    let b = h.spawn(goblin_with_hp(40), 9, 1);

    h.engine.initiate_spell(wizard, "Fireball").unwrap();
    let center = h.cell_center(8, 0);
    h.engine.resolve_target(Target::Point(center)).unwrap();

    let saves = h.engine.world().pending_saves.clone();
    assert_eq!(saves.len(), 2);
    assert!(saves.iter().all(|s| s.save_dc == 13));
    let save_for = |id| {
        saves
            .iter()
            .find(|s| s.target_character_id == id)
            .map(|s| s.id)
            .unwrap()
    };

    // A saves (15 + 2) for half of 8 x 4
    h.rolls([15]);
    h.rolls([4; 8]);
    h.engine.roll_pending_save(save_for(a)).unwrap();
    assert_hp(&h, a, 40 - 16);

    // B fails outright for all of 8 x 4
    h.rolls([4; 8]);
    h.engine.auto_fail_save(save_for(b)).unwrap();
    assert_hp(&h, b, 40 - 32);

    assert!(h.engine.world().pending_saves.is_empty());
    assert!(h
        .published
        .updates()
        .iter()
        .any(|u| matches!(u, SyncUpdate::PendingSaveRemoved { .. })));
}

#[test]
fn test_burning_hands_excludes_caster() {
    let mut h = TestHarness::new();
    let wizard = h.spawn(fixtures::wizard(), 5, 5);
    let front = h.spawn(fixtures::goblin(), 6, 5);
    let _behind = h.spawn(fixtures::goblin(), 3, 5);

    h.engine.initiate_spell(wizard, "Burning Hands").unwrap();
    let aim = h.cell_center(8, 5);
    h.engine.resolve_target(Target::Point(aim)).unwrap();

    let targets: Vec<_> = h
        .engine
        .world()
        .pending_saves
        .iter()
        .map(|s| s.target_character_id)
        .collect();
    assert_eq!(targets, vec![front]);
}

#[test]
fn test_cantrip_spends_no_slot() {
    let mut h = TestHarness::new();
    let cleric = h.spawn(fixtures::cleric(), 0, 0);
    let goblin = h.spawn(fixtures::goblin(), 3, 0);
    h.engine.initiate_spell(cleric, "Sacred Flame").unwrap();
    h.engine.resolve_target(Target::Token(goblin)).unwrap();
    assert_eq!(h.engine.world().pending_saves.len(), 1);
    // Cleric: 8 + 2 + WIS 3
    assert_eq!(h.engine.world().pending_saves[0].save_dc, 13);
    assert_eq!(h.engine.combatant(cleric).unwrap().spell_slots.available(1), 3);
}

#[test]
fn test_healing_caps_at_maximum() {
    let mut h = TestHarness::new();
    let cleric = h.spawn(fixtures::cleric(), 0, 0);
    let fighter = h.spawn(fixtures::fighter(), 1, 0);
    let goblin = h.spawn(fixtures::goblin(), 2, 0);

    h.engine.initiate_attack(goblin, "Scimitar").unwrap();
    h.rolls([15, 3]);
    h.engine.resolve_target(Target::Token(fighter)).unwrap();
    assert_hp(&h, fighter, 28 - 5);

    h.engine.initiate_spell(cleric, "Cure Wounds").unwrap();
    h.rolls([8]);
    h.engine.resolve_target(Target::Token(fighter)).unwrap();
    assert_hp(&h, fighter, 28);
}

// =============================================================================
// INTERRUPTS AND AUTHORITY
// =============================================================================

#[test]
fn test_end_turn_cancels_targeting() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    let _goblin = h.spawn(fixtures::goblin(), 1, 0);
    h.rolls([20, 1]);
    h.engine.enter_pre_combat().unwrap();
    h.engine.start_active_combat().unwrap();

    h.engine.initiate_attack(fighter, "Longsword").unwrap();
    h.engine.end_turn().unwrap();
    assert!(!h.engine.targeting().is_active());
    assert!(h.notices.contains("Longsword targeting cancelled."));
}

#[test]
fn test_player_cannot_act_out_of_turn() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    let goblin = h.spawn(fixtures::goblin(), 1, 0);
    h.rolls([1, 20]);
    h.engine.enter_pre_combat().unwrap();
    h.engine.start_active_combat().unwrap();
    assert_eq!(h.engine.world().combat.current_turn, Some(goblin));

    h.engine.set_participant(Participant::player(fighter));
    let err = h.engine.initiate_attack(fighter, "Longsword").unwrap_err();
    assert!(matches!(err, EngineError::Targeting(TargetingError::NotYourTurn(_))));

    // The moderator may act for anyone at any time
    h.engine.set_participant(Participant::moderator());
    h.engine.initiate_attack(fighter, "Longsword").unwrap();
    assert!(h.engine.targeting().is_active());
}

#[test]
fn test_remote_turn_change_cancels_targeting() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    let goblin = h.spawn(fixtures::goblin(), 1, 0);
    h.rolls([20, 1]);
    h.engine.enter_pre_combat().unwrap();
    h.engine.start_active_combat().unwrap();
    h.engine.initiate_attack(fighter, "Longsword").unwrap();

    h.engine.apply_remote(&SyncUpdate::CombatStateChanged {
        phase: CombatPhase::Active,
        current_turn: Some(goblin),
        round: 1,
    });
    assert!(!h.engine.targeting().is_active());
}

#[test]
fn test_cancel_is_safe_when_idle() {
    let mut h = TestHarness::new();
    let fighter = h.spawn(fixtures::fighter(), 0, 0);
    assert!(!h.engine.cancel_targeting());
    h.engine.initiate_attack(fighter, "Longsword").unwrap();
    assert!(h.engine.cancel_targeting());
    assert!(!h.engine.cancel_targeting());
}
