//! Default literals for value slots left empty in the editor.
//!
//! Every value slot of every known block kind has exactly one row here. The
//! compiler consults nothing else when it substitutes a missing input.

use crate::blocks::{BlockKind, Literal};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotDefault {
    Number(f64),
    Text(&'static str),
    Bool(bool),
}

impl SlotDefault {
    pub fn literal(self) -> Literal {
        match self {
            SlotDefault::Number(n) => Literal::Number(n),
            SlotDefault::Text(s) => Literal::text(s),
            SlotDefault::Bool(b) => Literal::Bool(b),
        }
    }
}

use BlockKind as K;
use SlotDefault::{Bool, Number, Text};

/// Seconds a broadcast-and-wait holds its caller when nothing says otherwise.
pub const BROADCAST_AND_WAIT_SECS: f64 = 1.0;

pub const SLOT_DEFAULTS: &[(BlockKind, &str, SlotDefault)] = &[
    (K::MoveSteps, "STEPS", Number(0.0)),
    (K::TurnRight, "DEGREES", Number(0.0)),
    (K::TurnLeft, "DEGREES", Number(0.0)),
    (K::GoToXY, "X", Number(0.0)),
    (K::GoToXY, "Y", Number(0.0)),
    (K::GlideSecsToXY, "SECS", Number(0.0)),
    (K::GlideSecsToXY, "X", Number(0.0)),
    (K::GlideSecsToXY, "Y", Number(0.0)),
    (K::ChangeXBy, "DX", Number(0.0)),
    (K::SetX, "X", Number(0.0)),
    (K::ChangeYBy, "DY", Number(0.0)),
    (K::SetY, "Y", Number(0.0)),
    // direction 90 faces right; a missing direction keeps the default heading
    (K::PointInDirection, "DIRECTION", Number(90.0)),
    (K::SayForSecs, "MESSAGE", Text("")),
    (K::SayForSecs, "SECS", Number(0.0)),
    (K::Say, "MESSAGE", Text("")),
    (K::ThinkForSecs, "MESSAGE", Text("")),
    (K::ThinkForSecs, "SECS", Number(0.0)),
    (K::Think, "MESSAGE", Text("")),
    (K::SwitchCostumeTo, "COSTUME", Text("")),
    (K::SwitchBackdropTo, "BACKDROP", Text("")),
    (K::ChangeSizeBy, "CHANGE", Number(0.0)),
    (K::SetSizeTo, "SIZE", Number(100.0)),
    (K::PlaySound, "SOUND_MENU", Text("")),
    (K::PlaySoundUntilDone, "SOUND_MENU", Text("")),
    (K::Broadcast, "BROADCAST_INPUT", Text("")),
    (K::BroadcastAndWait, "BROADCAST_INPUT", Text("")),
    (K::BroadcastAndWait, "SECS", Number(BROADCAST_AND_WAIT_SECS)),
    (K::Wait, "DURATION", Number(0.0)),
    (K::Repeat, "TIMES", Number(0.0)),
    (K::If, "CONDITION", Bool(false)),
    (K::IfElse, "CONDITION", Bool(false)),
    (K::WaitUntil, "CONDITION", Bool(false)),
    (K::RepeatUntil, "CONDITION", Bool(false)),
    (K::TouchingObject, "TOUCHINGOBJECTMENU", Text("")),
    (K::DistanceTo, "DISTANCETOMENU", Text("")),
    (K::KeyPressed, "KEY_OPTION", Text("")),
    (K::Add, "NUM1", Number(0.0)),
    (K::Add, "NUM2", Number(0.0)),
    (K::Subtract, "NUM1", Number(0.0)),
    (K::Subtract, "NUM2", Number(0.0)),
    (K::Multiply, "NUM1", Number(0.0)),
    (K::Multiply, "NUM2", Number(0.0)),
    (K::Divide, "NUM1", Number(0.0)),
    (K::Divide, "NUM2", Number(0.0)),
    (K::Random, "FROM", Number(0.0)),
    (K::Random, "TO", Number(0.0)),
    (K::Gt, "OPERAND1", Text("")),
    (K::Gt, "OPERAND2", Text("")),
    (K::Lt, "OPERAND1", Text("")),
    (K::Lt, "OPERAND2", Text("")),
    (K::Equals, "OPERAND1", Text("")),
    (K::Equals, "OPERAND2", Text("")),
    (K::And, "OPERAND1", Bool(false)),
    (K::And, "OPERAND2", Bool(false)),
    (K::Or, "OPERAND1", Bool(false)),
    (K::Or, "OPERAND2", Bool(false)),
    (K::Not, "OPERAND", Bool(false)),
    (K::Join, "STRING1", Text("")),
    (K::Join, "STRING2", Text("")),
    (K::LetterOf, "LETTER", Number(0.0)),
    (K::LetterOf, "STRING", Text("")),
    (K::Length, "STRING", Text("")),
    (K::Contains, "STRING1", Text("")),
    (K::Contains, "STRING2", Text("")),
    (K::Mod, "NUM1", Number(0.0)),
    (K::Mod, "NUM2", Number(0.0)),
    (K::Round, "NUM", Number(0.0)),
    (K::MathOp, "NUM", Number(0.0)),
    (K::SetVariableTo, "VALUE", Number(0.0)),
    (K::ChangeVariableBy, "VALUE", Number(0.0)),
];

pub fn lookup(kind: BlockKind, slot: &str) -> Option<SlotDefault> {
    SLOT_DEFAULTS
        .iter()
        .find(|(k, s, _)| *k == kind && *s == slot)
        .map(|(_, _, d)| *d)
}

/// The literal substituted for an empty `slot` of `kind`. Slots missing from
/// the table fall back to numeric zero; the compiler reports those.
pub fn default_for(kind: BlockKind, slot: &str) -> Literal {
    lookup(kind, slot)
        .map(SlotDefault::literal)
        .unwrap_or(Literal::Number(0.0))
}

pub fn value_slots(kind: BlockKind) -> impl Iterator<Item = &'static str> {
    SLOT_DEFAULTS
        .iter()
        .filter(move |(k, _, _)| *k == kind)
        .map(|(_, s, _)| *s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_has_no_duplicate_rows() {
        let mut seen = HashSet::new();
        for (kind, slot, _) in SLOT_DEFAULTS {
            assert!(seen.insert((*kind, *slot)), "duplicate row {:?}.{}", kind, slot);
        }
    }

    #[test]
    fn conditions_default_to_false() {
        for kind in [K::If, K::IfElse, K::WaitUntil, K::RepeatUntil] {
            assert_eq!(default_for(kind, "CONDITION"), Literal::Bool(false));
        }
    }

    #[test]
    fn numeric_and_text_defaults() {
        assert_eq!(default_for(K::MoveSteps, "STEPS"), Literal::Number(0.0));
        assert_eq!(default_for(K::Say, "MESSAGE"), Literal::text(""));
        assert_eq!(
            default_for(K::BroadcastAndWait, "SECS"),
            Literal::Number(BROADCAST_AND_WAIT_SECS)
        );
    }
}
