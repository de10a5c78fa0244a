//! Block tree to IR.
//!
//! Compilation is total: malformed trees (cycles, dangling ids, unknown
//! opcodes) produce warnings and no-ops, never errors. Empty value slots are
//! filled from `defaults`.

use crate::blocks::{BlockKind, BlockNode, BlockTree, Literal};
use crate::bus::normalize_key;
use crate::defaults;
use crate::ir::{
    ArithOp, CompareOp, EntityProgram, Expr, MathFunc, Program, Query, Script, SpeechKind, Stmt,
    StopScope,
};
use crate::project::ProjectDoc;
use crate::value::Value;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileWarning {
    pub entity: String,
    pub block: Option<String>,
    pub message: String,
}

impl Display for CompileWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.block {
            Some(block) => write!(f, "{} (block {}): {}", self.entity, block, self.message),
            None => write!(f, "{}: {}", self.entity, self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub warnings: Vec<CompileWarning>,
}

pub fn compile(project: &ProjectDoc) -> Program {
    compile_with_report(project).0
}

pub fn compile_with_report(project: &ProjectDoc) -> (Program, CompileReport) {
    let mut report = CompileReport::default();
    let mut program = Program::default();
    for entity in &project.entities {
        let (compiled, warnings) = compile_entity(&entity.name, &entity.blocks);
        program.entities.push(compiled);
        report.warnings.extend(warnings);
    }
    for warning in &report.warnings {
        tracing::warn!("{}", warning);
    }
    (program, report)
}

pub fn compile_tree(tree: &BlockTree) -> EntityProgram {
    compile_entity("", tree).0
}

pub fn compile_entity(name: &str, tree: &BlockTree) -> (EntityProgram, Vec<CompileWarning>) {
    let mut compiler = TreeCompiler {
        tree,
        entity: name,
        warnings: Vec::new(),
    };
    let program = compiler.entity_program();
    (program, compiler.warnings)
}

struct TreeCompiler<'a> {
    tree: &'a BlockTree,
    entity: &'a str,
    warnings: Vec<CompileWarning>,
}

impl<'a> TreeCompiler<'a> {
    fn warn(&mut self, block: &str, message: impl Into<String>) {
        self.warnings.push(CompileWarning {
            entity: self.entity.to_string(),
            block: Some(block.to_string()),
            message: message.into(),
        });
    }

    fn entity_program(&mut self) -> EntityProgram {
        let tree = self.tree;
        let mut program = EntityProgram::default();
        for hat in tree.hats() {
            let mut visited = HashSet::new();
            visited.insert(hat.id.clone());
            let body = self.chain(hat.next.as_deref(), &mut visited);
            let script = Script {
                hat: hat.id.clone(),
                body,
            };
            match hat.kind {
                BlockKind::WhenFlagClicked => {
                    if program.on_start.is_none() {
                        program.on_start = Some(script);
                    } else {
                        self.warn(&hat.id, "additional start script ignored");
                    }
                }
                BlockKind::WhenKeyPressed => {
                    let key = match hat.field_text("KEY_OPTION") {
                        Some(key) => normalize_key(&key),
                        None => {
                            self.warn(&hat.id, "key hat without a key, using space");
                            "space".to_string()
                        }
                    };
                    program.on_key.entry(key).or_default().push(script);
                }
                BlockKind::WhenThisSpriteClicked | BlockKind::WhenStageClicked => {
                    program.on_click.push(script);
                }
                BlockKind::WhenBroadcastReceived => match hat.field_text("BROADCAST_OPTION") {
                    Some(name) => program.on_message.entry(name).or_default().push(script),
                    None => self.warn(&hat.id, "message hat without a message name"),
                },
                other => self.warn(&hat.id, format!("{:?} is not a trigger", other)),
            }
        }
        program
    }

    /// Follows a `next` chain. `visited` spans the whole script so shared or
    /// cyclic links terminate.
    fn chain(&mut self, start: Option<&str>, visited: &mut HashSet<String>) -> Vec<Stmt> {
        let tree = self.tree;
        let mut body = Vec::new();
        let mut cursor = start.map(str::to_string);
        while let Some(id) = cursor {
            if !visited.insert(id.clone()) {
                self.warn(&id, "block chain loops back on itself; cut here");
                break;
            }
            let Some(node) = tree.get(&id) else {
                self.warn(&id, "chain points at a missing block");
                break;
            };
            self.statement(node, visited, &mut body);
            cursor = node.next.clone();
        }
        body
    }

    fn substack(&mut self, node: &BlockNode, slot: &str, visited: &mut HashSet<String>) -> Vec<Stmt> {
        self.chain(node.statement_slot(slot), visited)
    }

    /// Loop bodies always end in a yield point.
    fn loop_body(&mut self, node: &BlockNode, slot: &str, visited: &mut HashSet<String>) -> Vec<Stmt> {
        let mut body = self.substack(node, slot, visited);
        body.push(Stmt::Yield);
        body
    }

    fn variable_name(&mut self, node: &BlockNode) -> Option<String> {
        let name = node.field_text("VARIABLE");
        if name.is_none() {
            self.warn(&node.id, "variable block without a variable");
        }
        name
    }

    fn statement(&mut self, node: &BlockNode, visited: &mut HashSet<String>, out: &mut Vec<Stmt>) {
        use BlockKind as K;
        let stmt = match node.kind {
            K::MoveSteps => Some(Stmt::MoveSteps {
                steps: self.input(node, "STEPS", visited),
            }),
            K::TurnRight => Some(Stmt::Rotate {
                degrees: self.input(node, "DEGREES", visited),
            }),
            K::TurnLeft => Some(Stmt::Rotate {
                degrees: Expr::arith(
                    ArithOp::Sub,
                    Expr::literal(0.0),
                    self.input(node, "DEGREES", visited),
                ),
            }),
            K::GoToXY => Some(Stmt::MoveTo {
                x: self.input(node, "X", visited),
                y: self.input(node, "Y", visited),
            }),
            K::GlideSecsToXY => Some(Stmt::Glide {
                secs: self.input(node, "SECS", visited),
                x: self.input(node, "X", visited),
                y: self.input(node, "Y", visited),
            }),
            K::ChangeXBy => Some(Stmt::MoveBy {
                dx: self.input(node, "DX", visited),
                dy: Expr::literal(0.0),
            }),
            K::SetX => Some(Stmt::MoveTo {
                x: self.input(node, "X", visited),
                y: Expr::sense(Query::YPosition),
            }),
            K::ChangeYBy => Some(Stmt::MoveBy {
                dx: Expr::literal(0.0),
                dy: self.input(node, "DY", visited),
            }),
            K::SetY => Some(Stmt::MoveTo {
                x: Expr::sense(Query::XPosition),
                y: self.input(node, "Y", visited),
            }),
            K::PointInDirection => Some(Stmt::PointInDirection {
                direction: self.input(node, "DIRECTION", visited),
            }),
            K::IfOnEdgeBounce => Some(Stmt::BounceOnEdge),
            K::SayForSecs | K::ThinkForSecs | K::Say | K::Think => {
                let kind = if matches!(node.kind, K::SayForSecs | K::Say) {
                    SpeechKind::Say
                } else {
                    SpeechKind::Think
                };
                let text = self.input(node, "MESSAGE", visited);
                let secs = matches!(node.kind, K::SayForSecs | K::ThinkForSecs)
                    .then(|| self.input(node, "SECS", visited));
                Some(Stmt::Speech { kind, text, secs })
            }
            K::SwitchCostumeTo => Some(Stmt::SwitchCostume {
                costume: self.input(node, "COSTUME", visited),
            }),
            K::NextCostume => Some(Stmt::NextCostume),
            K::SwitchBackdropTo => Some(Stmt::SwitchBackground {
                backdrop: self.input(node, "BACKDROP", visited),
            }),
            K::NextBackdrop => Some(Stmt::NextBackground),
            K::ChangeSizeBy => Some(Stmt::ChangeSize {
                percent: self.input(node, "CHANGE", visited),
            }),
            K::SetSizeTo => Some(Stmt::SetSize {
                percent: self.input(node, "SIZE", visited),
            }),
            K::Show => Some(Stmt::Show),
            K::Hide => Some(Stmt::Hide),
            K::PlaySound | K::PlaySoundUntilDone => Some(Stmt::PlaySound {
                sound: self.input(node, "SOUND_MENU", visited),
                until_done: node.kind == K::PlaySoundUntilDone,
            }),
            K::StopAllSounds => Some(Stmt::StopAllSounds),
            K::Broadcast => Some(Stmt::Broadcast {
                message: self.input(node, "BROADCAST_INPUT", visited),
            }),
            K::BroadcastAndWait => Some(Stmt::BroadcastAndWait {
                message: self.input(node, "BROADCAST_INPUT", visited),
                secs: self.input(node, "SECS", visited),
            }),
            K::Wait => Some(Stmt::Wait {
                secs: self.input(node, "DURATION", visited),
            }),
            K::Repeat => Some(Stmt::RepeatN {
                times: self.input(node, "TIMES", visited),
                body: self.loop_body(node, "SUBSTACK", visited),
            }),
            K::Forever => Some(Stmt::Forever {
                body: self.loop_body(node, "SUBSTACK", visited),
            }),
            K::If | K::IfElse => {
                let condition = self.input(node, "CONDITION", visited);
                let then_body = self.loop_body(node, "SUBSTACK", visited);
                let else_body = if node.kind == K::IfElse {
                    self.loop_body(node, "SUBSTACK2", visited)
                } else {
                    vec![Stmt::Yield]
                };
                Some(Stmt::If {
                    condition,
                    then_body,
                    else_body,
                })
            }
            K::WaitUntil => {
                let condition = self.input(node, "CONDITION", visited);
                let sync_mouse = condition.reads_mouse();
                // re-syncs on every poll itself, no leading SyncMouse
                out.push(Stmt::WaitUntil {
                    condition,
                    sync_mouse,
                });
                None
            }
            K::RepeatUntil => {
                let condition = self.input(node, "CONDITION", visited);
                let mut body = self.substack(node, "SUBSTACK", visited);
                if condition.reads_mouse() {
                    body.push(Stmt::SyncMouse);
                }
                body.push(Stmt::Yield);
                Some(Stmt::RepeatUntil { condition, body })
            }
            K::Stop => {
                let scope = node
                    .field_text("STOP_OPTION")
                    .map(|o| StopScope::from_option(&o))
                    .unwrap_or(StopScope::All);
                Some(Stmt::Stop { scope })
            }
            K::ResetTimer => Some(Stmt::ResetTimer),
            K::SetVariableTo => self.variable_name(node).map(|name| Stmt::SetVar {
                value: self.input(node, "VALUE", visited),
                name,
            }),
            K::ChangeVariableBy => self.variable_name(node).map(|name| Stmt::ChangeVar {
                delta: self.input(node, "VALUE", visited),
                name,
            }),
            K::ShowVariable => self
                .variable_name(node)
                .map(|name| Stmt::ShowVariable { name }),
            K::HideVariable => self
                .variable_name(node)
                .map(|name| Stmt::HideVariable { name }),
            K::WhenFlagClicked
            | K::WhenKeyPressed
            | K::WhenThisSpriteClicked
            | K::WhenStageClicked
            | K::WhenBroadcastReceived => {
                self.warn(&node.id, "hat block inside a script ignored");
                None
            }
            K::XPosition
            | K::YPosition
            | K::Direction
            | K::CostumeNumberName
            | K::BackdropNumberName
            | K::Size
            | K::TouchingObject
            | K::DistanceTo
            | K::KeyPressed
            | K::MouseX
            | K::MouseY
            | K::Timer
            | K::Add
            | K::Subtract
            | K::Multiply
            | K::Divide
            | K::Random
            | K::Gt
            | K::Lt
            | K::Equals
            | K::And
            | K::Or
            | K::Not
            | K::Join
            | K::LetterOf
            | K::Length
            | K::Contains
            | K::Mod
            | K::Round
            | K::MathOp
            | K::Variable
            | K::MathNumber
            | K::Text
            | K::Menu => {
                self.warn(&node.id, "reporter used as a statement ignored");
                None
            }
            K::Unknown => {
                self.warn(
                    &node.id,
                    format!("unsupported opcode '{}' skipped", node.opcode),
                );
                None
            }
        };
        if let Some(stmt) = stmt {
            if stmt.reads_mouse() {
                out.push(Stmt::SyncMouse);
            }
            out.push(stmt);
        }
    }

    fn default_literal(&mut self, node: &BlockNode, slot: &str) -> Expr {
        if defaults::lookup(node.kind, slot).is_none() {
            self.warn(
                &node.id,
                format!("no default for slot {} of {}", slot, node.opcode),
            );
        }
        literal(&defaults::default_for(node.kind, slot))
    }

    /// Compiles the reporter in `slot`, or its default when the slot is empty.
    fn input(&mut self, node: &BlockNode, slot: &str, visited: &mut HashSet<String>) -> Expr {
        let Some(child_id) = node.value_slot(slot) else {
            return self.default_literal(node, slot);
        };
        if !visited.insert(child_id.to_string()) {
            self.warn(child_id, "reporter refers back to itself; default used");
            return self.default_literal(node, slot);
        }
        let tree = self.tree;
        let Some(child) = tree.get(child_id) else {
            self.warn(child_id, "input points at a missing block; default used");
            return self.default_literal(node, slot);
        };
        match self.reporter(child, visited) {
            Some(expr) => expr,
            None => self.default_literal(node, slot),
        }
    }

    fn pair(
        &mut self,
        node: &BlockNode,
        first: &str,
        second: &str,
        visited: &mut HashSet<String>,
    ) -> (Expr, Expr) {
        (self.input(node, first, visited), self.input(node, second, visited))
    }

    fn reporter(&mut self, node: &BlockNode, visited: &mut HashSet<String>) -> Option<Expr> {
        use BlockKind as K;
        let expr = match node.kind {
            K::MathNumber => field_literal(node, "NUM"),
            K::Text => field_literal(node, "TEXT"),
            K::Menu => Expr::Literal {
                value: node
                    .fields
                    .values()
                    .next()
                    .map(Value::from)
                    .unwrap_or_else(|| Value::from("")),
            },
            K::Variable => Expr::Var {
                name: self.variable_name(node)?,
            },
            K::XPosition => Expr::sense(Query::XPosition),
            K::YPosition => Expr::sense(Query::YPosition),
            K::Direction => Expr::sense(Query::Direction),
            K::Size => Expr::sense(Query::Size),
            K::Timer => Expr::sense(Query::Timer),
            K::MouseX => Expr::sense(Query::MouseX),
            K::MouseY => Expr::sense(Query::MouseY),
            K::CostumeNumberName => match node.field_text("NUMBER_NAME").as_deref() {
                Some("name") => Expr::sense(Query::CostumeName),
                _ => Expr::sense(Query::CostumeNumber),
            },
            K::BackdropNumberName => match node.field_text("NUMBER_NAME").as_deref() {
                Some("name") => Expr::sense(Query::BackdropName),
                _ => Expr::sense(Query::BackdropNumber),
            },
            K::TouchingObject => Expr::Touching {
                target: Box::new(self.input(node, "TOUCHINGOBJECTMENU", visited)),
            },
            K::DistanceTo => Expr::DistanceTo {
                target: Box::new(self.input(node, "DISTANCETOMENU", visited)),
            },
            K::KeyPressed => Expr::KeyPressed {
                key: Box::new(self.input(node, "KEY_OPTION", visited)),
            },
            K::Add | K::Subtract | K::Multiply | K::Divide | K::Mod => {
                let op = match node.kind {
                    K::Add => ArithOp::Add,
                    K::Subtract => ArithOp::Sub,
                    K::Multiply => ArithOp::Mul,
                    K::Divide => ArithOp::Div,
                    _ => ArithOp::Mod,
                };
                let (a, b) = self.pair(node, "NUM1", "NUM2", visited);
                Expr::arith(op, a, b)
            }
            K::Random => {
                let (from, to) = self.pair(node, "FROM", "TO", visited);
                Expr::Random {
                    from: Box::new(from),
                    to: Box::new(to),
                }
            }
            K::Gt | K::Lt | K::Equals => {
                let op = match node.kind {
                    K::Gt => CompareOp::Gt,
                    K::Lt => CompareOp::Lt,
                    _ => CompareOp::Eq,
                };
                let (left, right) = self.pair(node, "OPERAND1", "OPERAND2", visited);
                Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            K::And | K::Or => {
                let (left, right) = self.pair(node, "OPERAND1", "OPERAND2", visited);
                let (left, right) = (Box::new(left), Box::new(right));
                if node.kind == K::And {
                    Expr::And { left, right }
                } else {
                    Expr::Or { left, right }
                }
            }
            K::Not => Expr::Not {
                operand: Box::new(self.input(node, "OPERAND", visited)),
            },
            K::Join => {
                let (left, right) = self.pair(node, "STRING1", "STRING2", visited);
                Expr::Join {
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            K::LetterOf => {
                let (index, text) = self.pair(node, "LETTER", "STRING", visited);
                Expr::LetterOf {
                    index: Box::new(index),
                    text: Box::new(text),
                }
            }
            K::Length => Expr::LengthOf {
                text: Box::new(self.input(node, "STRING", visited)),
            },
            K::Contains => {
                let (text, needle) = self.pair(node, "STRING1", "STRING2", visited);
                Expr::Contains {
                    text: Box::new(text),
                    needle: Box::new(needle),
                }
            }
            K::Round => Expr::Round {
                value: Box::new(self.input(node, "NUM", visited)),
            },
            K::MathOp => {
                let value = self.input(node, "NUM", visited);
                let operator = node.field_text("OPERATOR").unwrap_or_default();
                match MathFunc::from_name(&operator) {
                    Some(func) => Expr::Math {
                        func,
                        value: Box::new(value),
                    },
                    None => {
                        self.warn(
                            &node.id,
                            format!("unknown math function '{}', value passed through", operator),
                        );
                        value
                    }
                }
            }
            K::Unknown => {
                self.warn(
                    &node.id,
                    format!("unsupported reporter '{}'; default used", node.opcode),
                );
                return None;
            }
            _ => {
                self.warn(&node.id, "statement block used as a value; default used");
                return None;
            }
        };
        Some(expr)
    }
}

fn literal(lit: &Literal) -> Expr {
    Expr::Literal {
        value: Value::from(lit),
    }
}

fn field_literal(node: &BlockNode, field: &str) -> Expr {
    match node.fields.get(field) {
        Some(lit) => literal(lit),
        None => Expr::literal(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::TreeBuilder;
    use crate::project::EntityDoc;

    fn flag_script(b: &mut TreeBuilder, body: &[String]) -> String {
        let hat = b.hat("event_whenflagclicked");
        if let Some(first) = b.chain(body) {
            b.next(&hat, &first);
        }
        hat
    }

    fn start_body(tree: &BlockTree) -> Vec<Stmt> {
        compile_tree(tree).on_start.expect("start script").body
    }

    #[test]
    fn empty_value_slots_get_table_defaults() {
        let mut b = TreeBuilder::new();
        let mv = b.block("motion_movesteps");
        let point = b.block("motion_pointindirection");
        let bw = b.block("event_broadcastandwait");
        let cond = b.block("control_if");
        flag_script(&mut b, &[mv, point, bw, cond]);
        let body = start_body(&b.build());
        assert_eq!(
            body[0],
            Stmt::MoveSteps {
                steps: Expr::literal(0.0)
            }
        );
        assert_eq!(
            body[1],
            Stmt::PointInDirection {
                direction: Expr::literal(90.0)
            }
        );
        assert_eq!(
            body[2],
            Stmt::BroadcastAndWait {
                message: Expr::literal(""),
                secs: Expr::literal(defaults::BROADCAST_AND_WAIT_SECS)
            }
        );
        assert_eq!(
            body[3],
            Stmt::If {
                condition: Expr::literal(false),
                then_body: vec![Stmt::Yield],
                else_body: vec![Stmt::Yield]
            }
        );
    }

    #[test]
    fn every_value_slot_resolves_without_warnings() {
        let missing = |warnings: &[CompileWarning]| {
            warnings
                .iter()
                .filter(|w| w.message.starts_with("no default"))
                .map(|w| w.message.clone())
                .collect::<Vec<_>>()
        };
        for kind in BlockKind::all() {
            // as a statement in a script
            let mut b = TreeBuilder::new();
            let hat = b.hat("event_whenflagclicked");
            let id = b.block(kind.opcode());
            b.next(&hat, &id);
            let (_, warnings) = compile_entity("Cat", &b.build());
            assert_eq!(missing(&warnings), Vec::<String>::new(), "{:?} as a statement", kind);

            // as the value of a variable assignment
            let mut b = TreeBuilder::new();
            let hat = b.hat("event_whenflagclicked");
            let set = b.block("data_setvariableto");
            b.field(&set, "VARIABLE", Literal::text("score"));
            let id = b.block(kind.opcode());
            b.input(&set, "VALUE", &id);
            b.next(&hat, &set);
            let (_, warnings) = compile_entity("Cat", &b.build());
            assert_eq!(missing(&warnings), Vec::<String>::new(), "{:?} as a reporter", kind);
        }
    }

    #[test]
    fn loop_bodies_end_with_a_yield() {
        let mut b = TreeBuilder::new();
        let repeat = b.block("control_repeat");
        let times = b.number(3.0);
        b.input(&repeat, "TIMES", &times);
        let show = b.block("looks_show");
        b.substack(&repeat, "SUBSTACK", &show);
        let forever = b.block("control_forever");
        flag_script(&mut b, &[repeat, forever]);
        let body = start_body(&b.build());
        assert_eq!(
            body[0],
            Stmt::RepeatN {
                times: Expr::literal(3.0),
                body: vec![Stmt::Show, Stmt::Yield]
            }
        );
        assert_eq!(
            body[1],
            Stmt::Forever {
                body: vec![Stmt::Yield]
            }
        );
    }

    #[test]
    fn motion_shorthands_are_lowered() {
        let mut b = TreeBuilder::new();
        let setx = b.block("motion_setx");
        let five = b.number(5.0);
        b.input(&setx, "X", &five);
        let left = b.block("motion_turnleft");
        let fifteen = b.number(15.0);
        b.input(&left, "DEGREES", &fifteen);
        let changey = b.block("motion_changeyby");
        flag_script(&mut b, &[setx, left, changey]);
        let body = start_body(&b.build());
        assert_eq!(
            body[0],
            Stmt::MoveTo {
                x: Expr::literal(5.0),
                y: Expr::sense(Query::YPosition)
            }
        );
        assert_eq!(
            body[1],
            Stmt::Rotate {
                degrees: Expr::arith(ArithOp::Sub, Expr::literal(0.0), Expr::literal(15.0))
            }
        );
        assert_eq!(
            body[2],
            Stmt::MoveBy {
                dx: Expr::literal(0.0),
                dy: Expr::literal(0.0)
            }
        );
    }

    #[test]
    fn mouse_reads_are_synced_first() {
        let mut b = TreeBuilder::new();
        let goto = b.block("motion_gotoxy");
        let mx = b.block("sensing_mousex");
        b.input(&goto, "X", &mx);
        let until = b.block("control_wait_until");
        let touching = b.block("sensing_touchingobject");
        let menu = b.block("sensing_touchingobjectmenu");
        b.field(&menu, "TOUCHINGOBJECTMENU", Literal::text("_mouse_"));
        b.input(&touching, "TOUCHINGOBJECTMENU", &menu);
        b.input(&until, "CONDITION", &touching);
        flag_script(&mut b, &[goto, until]);
        let body = start_body(&b.build());
        assert_eq!(body[0], Stmt::SyncMouse);
        assert!(matches!(body[1], Stmt::MoveTo { .. }));
        assert!(matches!(
            body[2],
            Stmt::WaitUntil {
                sync_mouse: true,
                ..
            }
        ));
        assert_eq!(body.len(), 3);
    }

    #[test]
    fn cycles_terminate_with_a_warning() {
        let mut b = TreeBuilder::new();
        let a = b.block("looks_show");
        let c = b.block("looks_hide");
        let say = b.block("looks_say");
        b.chain(&[a.clone(), c, say.clone()]);
        b.next(&say, &a);
        let add = b.block("operator_add");
        b.input(&add, "NUM1", &add);
        b.input(&say, "MESSAGE", &add);
        let hat = b.hat("event_whenflagclicked");
        b.next(&hat, &a);
        let (program, warnings) = compile_entity("Cat", &b.build());
        let body = program.on_start.unwrap().body;
        assert_eq!(body[0], Stmt::Show);
        assert_eq!(body[1], Stmt::Hide);
        assert_eq!(
            body[2],
            Stmt::Speech {
                kind: SpeechKind::Say,
                text: Expr::arith(ArithOp::Add, Expr::literal(0.0), Expr::literal(0.0)),
                secs: None
            }
        );
        assert_eq!(body.len(), 3);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn triggers_are_partitioned() {
        let mut b = TreeBuilder::new();
        let key = b.hat("event_whenkeypressed");
        b.field(&key, "KEY_OPTION", Literal::text("space"));
        let msg = b.hat("event_whenbroadcastreceived");
        b.field(&msg, "BROADCAST_OPTION", Literal::text("Go"));
        b.hat("event_whenthisspriteclicked");
        b.hat("event_whenflagclicked");
        b.hat("event_whenflagclicked");
        let (program, warnings) = compile_entity("Cat", &b.build());
        assert!(program.on_start.is_some());
        assert_eq!(program.on_key["space"].len(), 1);
        assert_eq!(program.on_message["Go"].len(), 1);
        assert_eq!(program.on_click.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert_eq!(program.script_count(), 4);
    }

    #[test]
    fn unknown_opcodes_are_skipped() {
        let mut b = TreeBuilder::new();
        let pen = b.block("pen_penDown");
        let show = b.block("looks_show");
        flag_script(&mut b, &[pen, show]);
        let (program, warnings) = compile_entity("Cat", &b.build());
        assert_eq!(program.on_start.unwrap().body, vec![Stmt::Show]);
        assert!(warnings[0].message.contains("pen_penDown"));
    }

    #[test]
    fn compilation_is_deterministic() {
        let mut b = TreeBuilder::new();
        for name in ["a", "b", "c"] {
            let hat = b.hat("event_whenbroadcastreceived");
            b.field(&hat, "BROADCAST_OPTION", Literal::text(name));
            let show = b.block("looks_show");
            b.next(&hat, &show);
        }
        let mut doc = EntityDoc::sprite("Cat");
        doc.blocks = b.build();
        let project = ProjectDoc {
            entities: vec![doc],
        };
        let first = serde_json::to_string(&compile(&project)).unwrap();
        let second = serde_json::to_string(&compile(&project)).unwrap();
        assert_eq!(first, second);
    }
}
