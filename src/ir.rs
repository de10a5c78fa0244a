//! Compiled program representation.
//!
//! `Stmt` and `Expr` form a closed IR: the compiler produces it with one
//! exhaustive match over block kinds and the interpreter consumes it with one
//! exhaustive match over these variants. `Expr` evaluation never suspends.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Stmt {
    MoveTo { x: Expr, y: Expr },
    MoveBy { dx: Expr, dy: Expr },
    MoveSteps { steps: Expr },
    Glide { secs: Expr, x: Expr, y: Expr },
    Rotate { degrees: Expr },
    PointInDirection { direction: Expr },
    BounceOnEdge,
    SetSize { percent: Expr },
    ChangeSize { percent: Expr },
    Show,
    Hide,
    Wait { secs: Expr },
    WaitUntil { condition: Expr, sync_mouse: bool },
    RepeatN { times: Expr, body: Vec<Stmt> },
    RepeatUntil { condition: Expr, body: Vec<Stmt> },
    Forever { body: Vec<Stmt> },
    If { condition: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt> },
    Broadcast { message: Expr },
    BroadcastAndWait { message: Expr, secs: Expr },
    SetVar { name: String, value: Expr },
    ChangeVar { name: String, delta: Expr },
    ShowVariable { name: String },
    HideVariable { name: String },
    Speech { kind: SpeechKind, text: Expr, secs: Option<Expr> },
    SwitchCostume { costume: Expr },
    NextCostume,
    SwitchBackground { backdrop: Expr },
    NextBackground,
    PlaySound { sound: Expr, until_done: bool },
    StopAllSounds,
    ResetTimer,
    Stop { scope: StopScope },
    /// Pulls the mouse position from the host before a statement reads it.
    SyncMouse,
    /// Cooperative yield point. Only the compiler emits this.
    Yield,
}

impl Stmt {
    /// Whether executing this statement may suspend the task. Control
    /// statements count as suspending because their bodies end in `Yield`.
    pub fn suspends(&self) -> bool {
        match self {
            Stmt::Glide { .. }
            | Stmt::Wait { .. }
            | Stmt::WaitUntil { .. }
            | Stmt::RepeatN { .. }
            | Stmt::RepeatUntil { .. }
            | Stmt::Forever { .. }
            | Stmt::If { .. }
            | Stmt::BroadcastAndWait { .. }
            | Stmt::SyncMouse
            | Stmt::Yield => true,
            Stmt::Speech { secs, .. } => secs.is_some(),
            Stmt::PlaySound { until_done, .. } => *until_done,
            Stmt::MoveTo { .. }
            | Stmt::MoveBy { .. }
            | Stmt::MoveSteps { .. }
            | Stmt::Rotate { .. }
            | Stmt::PointInDirection { .. }
            | Stmt::BounceOnEdge
            | Stmt::SetSize { .. }
            | Stmt::ChangeSize { .. }
            | Stmt::Show
            | Stmt::Hide
            | Stmt::Broadcast { .. }
            | Stmt::SetVar { .. }
            | Stmt::ChangeVar { .. }
            | Stmt::ShowVariable { .. }
            | Stmt::HideVariable { .. }
            | Stmt::SwitchCostume { .. }
            | Stmt::NextCostume
            | Stmt::SwitchBackground { .. }
            | Stmt::NextBackground
            | Stmt::StopAllSounds
            | Stmt::ResetTimer
            | Stmt::Stop { .. } => false,
        }
    }

    /// Whether the statement's own expressions (not nested bodies) read the
    /// mouse position.
    pub fn reads_mouse(&self) -> bool {
        self.own_exprs().iter().any(|e| e.reads_mouse())
    }

    fn own_exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::MoveTo { x, y } => vec![x, y],
            Stmt::MoveBy { dx, dy } => vec![dx, dy],
            Stmt::Glide { secs, x, y } => vec![secs, x, y],
            Stmt::MoveSteps { steps: e }
            | Stmt::Rotate { degrees: e }
            | Stmt::PointInDirection { direction: e }
            | Stmt::SetSize { percent: e }
            | Stmt::ChangeSize { percent: e }
            | Stmt::Wait { secs: e }
            | Stmt::RepeatN { times: e, .. }
            | Stmt::RepeatUntil { condition: e, .. }
            | Stmt::WaitUntil { condition: e, .. }
            | Stmt::If { condition: e, .. }
            | Stmt::Broadcast { message: e }
            | Stmt::SetVar { value: e, .. }
            | Stmt::ChangeVar { delta: e, .. }
            | Stmt::SwitchCostume { costume: e }
            | Stmt::SwitchBackground { backdrop: e }
            | Stmt::PlaySound { sound: e, .. } => vec![e],
            Stmt::BroadcastAndWait { message, secs } => vec![message, secs],
            Stmt::Speech { text, secs, .. } => {
                let mut out = vec![text];
                if let Some(secs) = secs {
                    out.push(secs);
                }
                out
            }
            Stmt::BounceOnEdge
            | Stmt::Show
            | Stmt::Hide
            | Stmt::Forever { .. }
            | Stmt::ShowVariable { .. }
            | Stmt::HideVariable { .. }
            | Stmt::NextCostume
            | Stmt::NextBackground
            | Stmt::StopAllSounds
            | Stmt::ResetTimer
            | Stmt::Stop { .. }
            | Stmt::SyncMouse
            | Stmt::Yield => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechKind {
    Say,
    Think,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopScope {
    All,
    ThisScript,
    ThisSprite,
    OtherScriptsInSprite,
}

impl StopScope {
    pub fn from_option(option: &str) -> Self {
        match option.trim().to_lowercase().as_str() {
            "this script" => StopScope::ThisScript,
            "this sprite" => StopScope::ThisSprite,
            "other scripts in sprite" | "other scripts in stage" => {
                StopScope::OtherScriptsInSprite
            }
            _ => StopScope::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr")]
pub enum Expr {
    Literal { value: Value },
    Var { name: String },
    Arith { op: ArithOp, left: Box<Expr>, right: Box<Expr> },
    Compare { op: CompareOp, left: Box<Expr>, right: Box<Expr> },
    And { left: Box<Expr>, right: Box<Expr> },
    Or { left: Box<Expr>, right: Box<Expr> },
    Not { operand: Box<Expr> },
    Join { left: Box<Expr>, right: Box<Expr> },
    LetterOf { index: Box<Expr>, text: Box<Expr> },
    LengthOf { text: Box<Expr> },
    Contains { text: Box<Expr>, needle: Box<Expr> },
    Round { value: Box<Expr> },
    Math { func: MathFunc, value: Box<Expr> },
    Random { from: Box<Expr>, to: Box<Expr> },
    Sense { query: Query },
    KeyPressed { key: Box<Expr> },
    Touching { target: Box<Expr> },
    DistanceTo { target: Box<Expr> },
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn var(name: &str) -> Self {
        Expr::Var {
            name: name.to_string(),
        }
    }

    pub fn sense(query: Query) -> Self {
        Expr::Sense { query }
    }

    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Self {
        Expr::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn reads_mouse(&self) -> bool {
        match self {
            Expr::Sense {
                query: Query::MouseX | Query::MouseY,
            } => true,
            Expr::Touching { target } | Expr::DistanceTo { target } => {
                matches!(
                    target.as_ref(),
                    Expr::Literal { value } if value.as_text() == MOUSE_TARGET
                ) || target.reads_mouse()
            }
            Expr::Literal { .. } | Expr::Var { .. } | Expr::Sense { .. } => false,
            Expr::Not { operand: a }
            | Expr::LengthOf { text: a }
            | Expr::Round { value: a }
            | Expr::Math { value: a, .. }
            | Expr::KeyPressed { key: a } => a.reads_mouse(),
            Expr::Arith { left, right, .. }
            | Expr::Compare { left, right, .. }
            | Expr::And { left, right }
            | Expr::Or { left, right }
            | Expr::Join { left, right }
            | Expr::LetterOf {
                index: left,
                text: right,
            }
            | Expr::Contains {
                text: left,
                needle: right,
            }
            | Expr::Random {
                from: left,
                to: right,
            } => left.reads_mouse() || right.reads_mouse(),
        }
    }
}

pub const MOUSE_TARGET: &str = "_mouse_";
pub const EDGE_TARGET: &str = "_edge_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Gt,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathFunc {
    Abs,
    Floor,
    Ceiling,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Ln,
    Log,
    Exp,
    Pow10,
}

impl MathFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        let func = match name.trim().to_lowercase().as_str() {
            "abs" => MathFunc::Abs,
            "floor" => MathFunc::Floor,
            "ceiling" => MathFunc::Ceiling,
            "sqrt" => MathFunc::Sqrt,
            "sin" => MathFunc::Sin,
            "cos" => MathFunc::Cos,
            "tan" => MathFunc::Tan,
            "asin" => MathFunc::Asin,
            "acos" => MathFunc::Acos,
            "atan" => MathFunc::Atan,
            "ln" => MathFunc::Ln,
            "log" => MathFunc::Log,
            "e ^" => MathFunc::Exp,
            "10 ^" => MathFunc::Pow10,
            _ => return None,
        };
        Some(func)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    XPosition,
    YPosition,
    Direction,
    Size,
    CostumeNumber,
    CostumeName,
    BackdropNumber,
    BackdropName,
    Timer,
    MouseX,
    MouseY,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    /// Id of the hat block this script was compiled from.
    pub hat: String,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityProgram {
    pub on_start: Option<Script>,
    pub on_key: BTreeMap<String, Vec<Script>>,
    pub on_click: Vec<Script>,
    pub on_message: BTreeMap<String, Vec<Script>>,
}

impl EntityProgram {
    pub fn script_count(&self) -> usize {
        usize::from(self.on_start.is_some())
            + self.on_key.values().map(Vec::len).sum::<usize>()
            + self.on_click.len()
            + self.on_message.values().map(Vec::len).sum::<usize>()
    }
}

/// Compiled scripts for every entity, indexed like the project's entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub entities: Vec<EntityProgram>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspension_tags() {
        assert!(Stmt::Yield.suspends());
        assert!(Stmt::Wait {
            secs: Expr::literal(1.0)
        }
        .suspends());
        assert!(!Stmt::Speech {
            kind: SpeechKind::Say,
            text: Expr::literal("hi"),
            secs: None
        }
        .suspends());
        assert!(!Stmt::MoveBy {
            dx: Expr::literal(1.0),
            dy: Expr::literal(0.0)
        }
        .suspends());
    }

    #[test]
    fn mouse_reads_are_found_in_nested_expressions() {
        let expr = Expr::arith(
            ArithOp::Add,
            Expr::literal(1.0),
            Expr::sense(Query::MouseX),
        );
        let stmt = Stmt::MoveTo {
            x: expr,
            y: Expr::literal(0.0),
        };
        assert!(stmt.reads_mouse());
        let touching = Expr::Touching {
            target: Box::new(Expr::literal(MOUSE_TARGET)),
        };
        assert!(touching.reads_mouse());
        assert!(!Stmt::Forever { body: vec![] }.reads_mouse());
    }

    #[test]
    fn operator_expressions_survive_json() {
        let stmt = Stmt::If {
            condition: Expr::Compare {
                op: CompareOp::Lt,
                left: Box::new(Expr::var("score")),
                right: Box::new(Expr::literal(10.0)),
            },
            then_body: vec![Stmt::SetVar {
                name: "score".into(),
                value: Expr::arith(ArithOp::Mul, Expr::var("score"), Expr::literal(2.0)),
            }],
            else_body: vec![],
        };
        let json = serde_json::to_value(&stmt).unwrap();
        assert_eq!(json["op"], "If");
        assert_eq!(json["condition"]["expr"], "Compare");
        assert_eq!(json["then_body"][0]["value"]["expr"], "Arith");
        let back: Stmt = serde_json::from_value(json).unwrap();
        assert_eq!(back, stmt);
    }

    #[test]
    fn stop_options_parse() {
        assert_eq!(StopScope::from_option("this script"), StopScope::ThisScript);
        assert_eq!(
            StopScope::from_option("other scripts in sprite"),
            StopScope::OtherScriptsInSprite
        );
        assert_eq!(StopScope::from_option("all"), StopScope::All);
    }
}
