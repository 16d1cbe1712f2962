//! Dice expression engine.
//!
//! A roll command is a leading dice expression followed by free text:
//! `1d20adv+5 Stealth check`, `2d6 + 1d4 - 1 fire damage`. Each term is
//! either `NdM` (optionally suffixed with `adv`/`dis`) or a flat integer.
//! The expression is the longest valid leading run of `+`/`-` joined terms;
//! everything after it is description.
//!
//! Advantage rolls the whole group twice and keeps the set with the higher
//! (or, for disadvantage, lower) sum.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for dice parsing and rolling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiceError {
    #[error("Invalid dice notation: {0}")]
    InvalidNotation(String),
    #[error("No dice expression found in '{0}'")]
    NoDice(String),
    #[error("Invalid die size: d{0}")]
    InvalidDieSize(u32),
    #[error("Too many terms in roll: {count} (limit {limit})")]
    TooManyTerms { count: usize, limit: usize },
    #[error("Too many dice in one group: {count} (limit {limit})")]
    TooManyDice { count: u64, limit: u32 },
    #[error("Too many sides on a die: d{sides} (limit d{limit})")]
    TooManySides { sides: u64, limit: u32 },
    #[error("Modifier {value} exceeds the limit of {limit}")]
    ModifierTooLarge { value: u64, limit: u32 },
}

impl DiceError {
    /// Whether this error comes from a numeric cap rather than bad syntax.
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            DiceError::TooManyTerms { .. }
                | DiceError::TooManyDice { .. }
                | DiceError::TooManySides { .. }
                | DiceError::ModifierTooLarge { .. }
        )
    }
}

/// Numeric caps applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiceLimits {
    pub max_terms: usize,
    pub max_dice: u32,
    pub max_sides: u32,
    pub max_modifier: u32,
}

impl Default for DiceLimits {
    fn default() -> Self {
        Self {
            max_terms: 20,
            max_dice: 100,
            max_sides: 1000,
            max_modifier: 10_000,
        }
    }
}

/// Advantage state for a dice group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Advantage {
    #[default]
    Normal,
    Advantage,
    Disadvantage,
}

impl Advantage {
    /// Combine two advantage states (advantage + disadvantage = normal).
    pub fn combine(self, other: Advantage) -> Advantage {
        match (self, other) {
            (Advantage::Normal, x) | (x, Advantage::Normal) => x,
            (Advantage::Advantage, Advantage::Disadvantage) => Advantage::Normal,
            (Advantage::Disadvantage, Advantage::Advantage) => Advantage::Normal,
            (Advantage::Advantage, Advantage::Advantage) => Advantage::Advantage,
            (Advantage::Disadvantage, Advantage::Disadvantage) => Advantage::Disadvantage,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Advantage::Normal => "",
            Advantage::Advantage => " adv",
            Advantage::Disadvantage => " dis",
        }
    }
}

// ============================================================================
// Randomness
// ============================================================================

/// Source of individual die results.
///
/// Everything that rolls takes one of these so tests can script outcomes.
pub trait DiceRoller {
    /// Roll a single die, returning a value in `1..=sides`.
    fn roll_die(&mut self, sides: u32) -> u32;
}

/// A [`DiceRoller`] backed by any `rand` RNG.
#[derive(Debug, Clone)]
pub struct RngRoller<R = StdRng> {
    rng: R,
}

impl<R: Rng> RngRoller<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RngRoller<StdRng> {
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    /// Reproducible sequence for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl Default for RngRoller<StdRng> {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl<R: Rng> DiceRoller for RngRoller<R> {
    fn roll_die(&mut self, sides: u32) -> u32 {
        self.rng.gen_range(1..=sides.max(1))
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sign {
    Plus,
    Minus,
}

impl Sign {
    pub fn apply(self, value: i32) -> i32 {
        match self {
            Sign::Plus => value,
            Sign::Minus => -value,
        }
    }
}

/// A group of identical dice, e.g. `2d6` or `-1d4` or `1d20dis`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceTerm {
    pub sign: Sign,
    pub count: u32,
    pub sides: u32,
    /// Explicit per-term suffix; `None` leaves room for the global toggle.
    pub advantage: Option<Advantage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    Dice(DiceTerm),
    /// Signed flat modifier.
    Modifier(i32),
}

/// A parsed roll command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceExpression {
    pub terms: Vec<Term>,
    /// The text matched as the expression.
    pub notation: String,
    /// Whatever followed the expression.
    pub description: String,
}

impl DiceExpression {
    /// Parse a roll command using the default limits.
    pub fn parse(command: &str) -> Result<Self, DiceError> {
        Self::parse_with_limits(command, &DiceLimits::default())
    }

    pub fn parse_with_limits(command: &str, limits: &DiceLimits) -> Result<Self, DiceError> {
        let mut scanner = Scanner::new(command, limits);
        scanner.skip_ws();
        let start = scanner.pos;

        let first_sign = match scanner.peek() {
            Some(b'+') => {
                scanner.pos += 1;
                Sign::Plus
            }
            Some(b'-') => {
                scanner.pos += 1;
                Sign::Minus
            }
            _ => Sign::Plus,
        };
        scanner.skip_ws();

        let mut terms = Vec::new();
        match scanner.term(first_sign)? {
            Some(term) => terms.push(term),
            None => return Err(DiceError::NoDice(command.trim().to_string())),
        }

        loop {
            let save = scanner.pos;
            scanner.skip_ws();
            let sign = match scanner.peek() {
                Some(b'+') => Sign::Plus,
                Some(b'-') => Sign::Minus,
                _ => {
                    scanner.pos = save;
                    break;
                }
            };
            scanner.pos += 1;
            scanner.skip_ws();
            match scanner.term(sign)? {
                Some(term) => {
                    terms.push(term);
                    if terms.len() > limits.max_terms {
                        return Err(DiceError::TooManyTerms {
                            count: terms.len(),
                            limit: limits.max_terms,
                        });
                    }
                }
                None => {
                    scanner.pos = save;
                    break;
                }
            }
        }

        Ok(DiceExpression {
            terms,
            notation: command[start..scanner.pos].trim().to_string(),
            description: command[scanner.pos..].trim().to_string(),
        })
    }

    /// Same expression with every dice group's count doubled (critical hits).
    /// Flat modifiers are untouched.
    pub fn with_doubled_dice(&self) -> Self {
        let terms = self
            .terms
            .iter()
            .map(|term| match term {
                Term::Dice(d) => Term::Dice(DiceTerm {
                    count: d.count.saturating_mul(2),
                    ..d.clone()
                }),
                Term::Modifier(m) => Term::Modifier(*m),
            })
            .collect();
        Self {
            terms,
            notation: self.notation.clone(),
            description: self.description.clone(),
        }
    }

    /// Index of the term a global advantage toggle would attach to.
    fn global_target(&self) -> Option<usize> {
        self.terms.iter().position(|t| {
            matches!(t, Term::Dice(d) if d.sides == 20 && d.advantage.is_none())
        })
    }

    /// Roll the expression. `global` applies to the first d20 group that has
    /// no explicit suffix; the result reports whether it was used.
    pub fn roll<R: DiceRoller + ?Sized>(&self, global: Advantage, roller: &mut R) -> RollResult {
        let global_index = if global == Advantage::Normal {
            None
        } else {
            self.global_target()
        };

        let mut components = Vec::with_capacity(self.terms.len());
        for (index, term) in self.terms.iter().enumerate() {
            match term {
                Term::Modifier(value) => components.push(RollComponent::Modifier(*value)),
                Term::Dice(dice) => {
                    let advantage = match dice.advantage {
                        Some(explicit) => explicit,
                        None if global_index == Some(index) => global,
                        None => Advantage::Normal,
                    };
                    components.push(RollComponent::Dice(roll_group(dice, advantage, roller)));
                }
            }
        }

        let total = components.iter().map(RollComponent::value).sum();
        let transcript = transcript(&self.description, &components, total);

        RollResult {
            notation: self.notation.clone(),
            description: self.description.clone(),
            components,
            total,
            transcript,
            consumed_global: global_index.is_some(),
        }
    }
}

fn roll_group<R: DiceRoller + ?Sized>(
    dice: &DiceTerm,
    advantage: Advantage,
    roller: &mut R,
) -> DiceRoll {
    let mut roll_set = || -> Vec<u32> {
        (0..dice.count)
            .map(|_| roller.roll_die(dice.sides).clamp(1, dice.sides))
            .collect()
    };

    let first = roll_set();
    let (kept, alternate) = match advantage {
        Advantage::Normal => (first, None),
        Advantage::Advantage | Advantage::Disadvantage => {
            let second = roll_set();
            let first_sum: u32 = first.iter().sum();
            let second_sum: u32 = second.iter().sum();
            let take_second = match advantage {
                Advantage::Advantage => second_sum > first_sum,
                _ => second_sum < first_sum,
            };
            if take_second {
                (second, Some(first))
            } else {
                (first, Some(second))
            }
        }
    };

    let sum: u32 = kept.iter().sum();
    DiceRoll {
        sign: dice.sign,
        count: dice.count,
        sides: dice.sides,
        advantage,
        subtotal: dice.sign.apply(sum as i32),
        kept,
        alternate,
    }
}

fn transcript(description: &str, components: &[RollComponent], total: i32) -> String {
    let mut out = String::new();
    if !description.is_empty() {
        out.push_str(description);
        out.push_str(": ");
    }

    for (i, component) in components.iter().enumerate() {
        let negative = match component {
            RollComponent::Dice(d) => d.sign == Sign::Minus,
            RollComponent::Modifier(m) => *m < 0,
        };
        match (i, negative) {
            (0, true) => out.push('-'),
            (0, false) => {}
            (_, true) => out.push_str(" - "),
            (_, false) => out.push_str(" + "),
        }
        match component {
            RollComponent::Dice(d) => {
                out.push_str(&format!(
                    "{}d{}{} {}",
                    d.count,
                    d.sides,
                    d.advantage.suffix(),
                    list(&d.kept)
                ));
                if let Some(other) = &d.alternate {
                    out.push_str(&format!(" (other {})", list(other)));
                }
            }
            RollComponent::Modifier(m) => out.push_str(&m.unsigned_abs().to_string()),
        }
    }

    out.push_str(&format!(" = {total}"));
    out
}

fn list(rolls: &[u32]) -> String {
    format!(
        "[{}]",
        rolls
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}

impl FromStr for DiceExpression {
    type Err = DiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiceExpression::parse(s)
    }
}

impl fmt::Display for DiceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.notation)
    }
}

// ============================================================================
// Parsing
// ============================================================================

struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    limits: &'a DiceLimits,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str, limits: &'a DiceLimits) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            limits,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    /// Consume a run of digits, saturating on overflow.
    fn number(&mut self) -> Option<u64> {
        let start = self.pos;
        let mut value: u64 = 0;
        while let Some(b) = self.peek().filter(u8::is_ascii_digit) {
            value = value.saturating_mul(10).saturating_add(u64::from(b - b'0'));
            self.pos += 1;
        }
        (self.pos > start).then_some(value)
    }

    fn term(&mut self, sign: Sign) -> Result<Option<Term>, DiceError> {
        let start = self.pos;
        let count = self.number();

        let is_dice = matches!(self.peek(), Some(b'd') | Some(b'D'))
            && self.peek_at(1).is_some_and(|b| b.is_ascii_digit());

        if !is_dice {
            return match count {
                Some(value) => {
                    if value > u64::from(self.limits.max_modifier) {
                        return Err(DiceError::ModifierTooLarge {
                            value,
                            limit: self.limits.max_modifier,
                        });
                    }
                    Ok(Some(Term::Modifier(sign.apply(value as i32))))
                }
                None => {
                    self.pos = start;
                    Ok(None)
                }
            };
        }

        self.pos += 1;
        let sides = self.number().unwrap_or(0);
        let count = count.unwrap_or(1);

        if count == 0 {
            return Err(DiceError::InvalidNotation(
                self.src[start..self.pos].to_string(),
            ));
        }
        if count > u64::from(self.limits.max_dice) {
            return Err(DiceError::TooManyDice {
                count,
                limit: self.limits.max_dice,
            });
        }
        if sides == 0 {
            return Err(DiceError::InvalidDieSize(0));
        }
        if sides > u64::from(self.limits.max_sides) {
            return Err(DiceError::TooManySides {
                sides,
                limit: self.limits.max_sides,
            });
        }

        let advantage = self.suffix();
        Ok(Some(Term::Dice(DiceTerm {
            sign,
            count: count as u32,
            sides: sides as u32,
            advantage,
        })))
    }

    /// `adv` / `advantage` / `dis` / `disadvantage`, optionally after spaces.
    fn suffix(&mut self) -> Option<Advantage> {
        let save = self.pos;
        self.skip_ws();
        let word_start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        let word = self.src[word_start..self.pos].to_ascii_lowercase();
        let advantage = match word.as_str() {
            "adv" | "advantage" => Some(Advantage::Advantage),
            "dis" | "disadv" | "disadvantage" => Some(Advantage::Disadvantage),
            _ => None,
        };
        if advantage.is_none() {
            self.pos = save;
        }
        advantage
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of one dice group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub sign: Sign,
    pub count: u32,
    pub sides: u32,
    pub advantage: Advantage,
    /// The set that counts toward the total.
    pub kept: Vec<u32>,
    /// The discarded set when rolled with advantage or disadvantage.
    pub alternate: Option<Vec<u32>>,
    pub subtotal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollComponent {
    Dice(DiceRoll),
    Modifier(i32),
}

impl RollComponent {
    pub fn value(&self) -> i32 {
        match self {
            RollComponent::Dice(d) => d.subtotal,
            RollComponent::Modifier(m) => *m,
        }
    }
}

/// Complete result of a dice roll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollResult {
    pub notation: String,
    pub description: String,
    pub components: Vec<RollComponent>,
    pub total: i32,
    pub transcript: String,
    /// True when the caller's global advantage toggle was applied.
    pub consumed_global: bool,
}

impl RollResult {
    /// The kept face of the first single-d20 group, if any.
    pub fn natural_d20(&self) -> Option<u32> {
        self.components.iter().find_map(|c| match c {
            RollComponent::Dice(d) if d.sides == 20 && d.count == 1 => d.kept.first().copied(),
            _ => None,
        })
    }

    pub fn is_critical(&self) -> bool {
        self.natural_d20() == Some(20)
    }

    pub fn is_fumble(&self) -> bool {
        self.natural_d20() == Some(1)
    }

    /// Check if the roll meets or exceeds a DC.
    pub fn meets_dc(&self, dc: i32) -> bool {
        self.total >= dc
    }
}

impl fmt::Display for RollResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.transcript)
    }
}

/// Parse and roll a command in one step.
pub fn evaluate<R: DiceRoller + ?Sized>(
    command: &str,
    global: Advantage,
    roller: &mut R,
) -> Result<RollResult, DiceError> {
    evaluate_with_limits(command, global, &DiceLimits::default(), roller)
}

pub fn evaluate_with_limits<R: DiceRoller + ?Sized>(
    command: &str,
    global: Advantage,
    limits: &DiceLimits,
    roller: &mut R,
) -> Result<RollResult, DiceError> {
    let expr = DiceExpression::parse_with_limits(command, limits)?;
    Ok(expr.roll(global, roller))
}

/// Convenience function to roll a command with the thread RNG.
pub fn roll(command: &str) -> Result<RollResult, DiceError> {
    evaluate(command, Advantage::Normal, &mut RngRoller::new(rand::thread_rng()))
}
