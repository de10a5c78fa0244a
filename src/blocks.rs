use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub type BlockId = String;

/// A literal carried by a block field or a literal shadow block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Literal {
    pub fn text(s: impl Into<String>) -> Self {
        Literal::Text(s.into())
    }

    pub fn as_text(&self) -> String {
        match self {
            Literal::Number(n) => crate::value::format_number(*n),
            Literal::Bool(b) => b.to_string(),
            Literal::Text(s) => s.clone(),
        }
    }
}

/// Every block opcode the compiler understands. Anything else loads as
/// `Unknown` and keeps its raw opcode on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockKind {
    // hats
    WhenFlagClicked,
    WhenKeyPressed,
    WhenThisSpriteClicked,
    WhenStageClicked,
    WhenBroadcastReceived,
    // motion
    MoveSteps,
    TurnRight,
    TurnLeft,
    GoToXY,
    GlideSecsToXY,
    ChangeXBy,
    SetX,
    ChangeYBy,
    SetY,
    PointInDirection,
    IfOnEdgeBounce,
    XPosition,
    YPosition,
    Direction,
    // looks
    SayForSecs,
    Say,
    ThinkForSecs,
    Think,
    SwitchCostumeTo,
    NextCostume,
    SwitchBackdropTo,
    NextBackdrop,
    ChangeSizeBy,
    SetSizeTo,
    Show,
    Hide,
    CostumeNumberName,
    BackdropNumberName,
    Size,
    // sound
    PlaySound,
    PlaySoundUntilDone,
    StopAllSounds,
    // events
    Broadcast,
    BroadcastAndWait,
    // control
    Wait,
    Repeat,
    Forever,
    If,
    IfElse,
    WaitUntil,
    RepeatUntil,
    Stop,
    // sensing
    TouchingObject,
    DistanceTo,
    KeyPressed,
    MouseX,
    MouseY,
    Timer,
    ResetTimer,
    // operators
    Add,
    Subtract,
    Multiply,
    Divide,
    Random,
    Gt,
    Lt,
    Equals,
    And,
    Or,
    Not,
    Join,
    LetterOf,
    Length,
    Contains,
    Mod,
    Round,
    MathOp,
    // data
    Variable,
    SetVariableTo,
    ChangeVariableBy,
    ShowVariable,
    HideVariable,
    // shadows
    MathNumber,
    Text,
    Menu,
    Unknown,
}

const OPCODES: &[(&str, BlockKind)] = &[
    ("event_whenflagclicked", BlockKind::WhenFlagClicked),
    ("event_whenkeypressed", BlockKind::WhenKeyPressed),
    ("event_whenthisspriteclicked", BlockKind::WhenThisSpriteClicked),
    ("event_whenstageclicked", BlockKind::WhenStageClicked),
    ("event_whenbroadcastreceived", BlockKind::WhenBroadcastReceived),
    ("motion_movesteps", BlockKind::MoveSteps),
    ("motion_turnright", BlockKind::TurnRight),
    ("motion_turnleft", BlockKind::TurnLeft),
    ("motion_gotoxy", BlockKind::GoToXY),
    ("motion_glidesecstoxy", BlockKind::GlideSecsToXY),
    ("motion_changexby", BlockKind::ChangeXBy),
    ("motion_setx", BlockKind::SetX),
    ("motion_changeyby", BlockKind::ChangeYBy),
    ("motion_sety", BlockKind::SetY),
    ("motion_pointindirection", BlockKind::PointInDirection),
    ("motion_ifonedgebounce", BlockKind::IfOnEdgeBounce),
    ("motion_xposition", BlockKind::XPosition),
    ("motion_yposition", BlockKind::YPosition),
    ("motion_direction", BlockKind::Direction),
    ("looks_sayforsecs", BlockKind::SayForSecs),
    ("looks_say", BlockKind::Say),
    ("looks_thinkforsecs", BlockKind::ThinkForSecs),
    ("looks_think", BlockKind::Think),
    ("looks_switchcostumeto", BlockKind::SwitchCostumeTo),
    ("looks_nextcostume", BlockKind::NextCostume),
    ("looks_switchbackdropto", BlockKind::SwitchBackdropTo),
    ("looks_nextbackdrop", BlockKind::NextBackdrop),
    ("looks_changesizeby", BlockKind::ChangeSizeBy),
    ("looks_setsizeto", BlockKind::SetSizeTo),
    ("looks_show", BlockKind::Show),
    ("looks_hide", BlockKind::Hide),
    ("looks_costumenumbername", BlockKind::CostumeNumberName),
    ("looks_backdropnumbername", BlockKind::BackdropNumberName),
    ("looks_size", BlockKind::Size),
    ("sound_play", BlockKind::PlaySound),
    ("sound_playuntildone", BlockKind::PlaySoundUntilDone),
    ("sound_stopallsounds", BlockKind::StopAllSounds),
    ("event_broadcast", BlockKind::Broadcast),
    ("event_broadcastandwait", BlockKind::BroadcastAndWait),
    ("control_wait", BlockKind::Wait),
    ("control_repeat", BlockKind::Repeat),
    ("control_forever", BlockKind::Forever),
    ("control_if", BlockKind::If),
    ("control_if_else", BlockKind::IfElse),
    ("control_wait_until", BlockKind::WaitUntil),
    ("control_repeat_until", BlockKind::RepeatUntil),
    ("control_stop", BlockKind::Stop),
    ("sensing_touchingobject", BlockKind::TouchingObject),
    ("sensing_distanceto", BlockKind::DistanceTo),
    ("sensing_keypressed", BlockKind::KeyPressed),
    ("sensing_mousex", BlockKind::MouseX),
    ("sensing_mousey", BlockKind::MouseY),
    ("sensing_timer", BlockKind::Timer),
    ("sensing_resettimer", BlockKind::ResetTimer),
    ("operator_add", BlockKind::Add),
    ("operator_subtract", BlockKind::Subtract),
    ("operator_multiply", BlockKind::Multiply),
    ("operator_divide", BlockKind::Divide),
    ("operator_random", BlockKind::Random),
    ("operator_gt", BlockKind::Gt),
    ("operator_lt", BlockKind::Lt),
    ("operator_equals", BlockKind::Equals),
    ("operator_and", BlockKind::And),
    ("operator_or", BlockKind::Or),
    ("operator_not", BlockKind::Not),
    ("operator_join", BlockKind::Join),
    ("operator_letter_of", BlockKind::LetterOf),
    ("operator_length", BlockKind::Length),
    ("operator_contains", BlockKind::Contains),
    ("operator_mod", BlockKind::Mod),
    ("operator_round", BlockKind::Round),
    ("operator_mathop", BlockKind::MathOp),
    ("data_variable", BlockKind::Variable),
    ("data_setvariableto", BlockKind::SetVariableTo),
    ("data_changevariableby", BlockKind::ChangeVariableBy),
    ("data_showvariable", BlockKind::ShowVariable),
    ("data_hidevariable", BlockKind::HideVariable),
    ("math_number", BlockKind::MathNumber),
    ("math_positive_number", BlockKind::MathNumber),
    ("math_whole_number", BlockKind::MathNumber),
    ("math_integer", BlockKind::MathNumber),
    ("math_angle", BlockKind::MathNumber),
    ("text", BlockKind::Text),
    ("looks_costume", BlockKind::Menu),
    ("looks_backdrops", BlockKind::Menu),
    ("sound_sounds_menu", BlockKind::Menu),
    ("event_broadcast_menu", BlockKind::Menu),
    ("sensing_touchingobjectmenu", BlockKind::Menu),
    ("sensing_distancetomenu", BlockKind::Menu),
    ("sensing_keyoptions", BlockKind::Menu),
];

impl BlockKind {
    pub fn from_opcode(opcode: &str) -> Self {
        OPCODES
            .iter()
            .find(|(op, _)| *op == opcode)
            .map(|(_, kind)| *kind)
            .unwrap_or(BlockKind::Unknown)
    }

    /// Canonical opcode for a kind. Shadow kinds shared by several opcodes
    /// report the first one.
    pub fn opcode(self) -> &'static str {
        OPCODES
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(op, _)| *op)
            .unwrap_or("unknown")
    }

    pub fn is_hat(self) -> bool {
        matches!(
            self,
            BlockKind::WhenFlagClicked
                | BlockKind::WhenKeyPressed
                | BlockKind::WhenThisSpriteClicked
                | BlockKind::WhenStageClicked
                | BlockKind::WhenBroadcastReceived
        )
    }

    pub fn all() -> impl Iterator<Item = BlockKind> {
        let mut kinds = OPCODES.iter().map(|(_, kind)| *kind).collect::<Vec<_>>();
        kinds.dedup();
        kinds.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockNode {
    pub id: BlockId,
    pub opcode: String,
    pub kind: BlockKind,
    #[serde(default)]
    pub fields: BTreeMap<String, Literal>,
    #[serde(default)]
    pub value_slots: BTreeMap<String, Option<BlockId>>,
    #[serde(default)]
    pub statement_slots: BTreeMap<String, Option<BlockId>>,
    #[serde(default)]
    pub next: Option<BlockId>,
    #[serde(default)]
    pub top_level: bool,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

impl BlockNode {
    pub fn new(id: impl Into<String>, opcode: &str) -> Self {
        Self {
            id: id.into(),
            opcode: opcode.to_string(),
            kind: BlockKind::from_opcode(opcode),
            fields: BTreeMap::new(),
            value_slots: BTreeMap::new(),
            statement_slots: BTreeMap::new(),
            next: None,
            top_level: false,
            x: 0.0,
            y: 0.0,
        }
    }

    pub fn field_text(&self, name: &str) -> Option<String> {
        self.fields.get(name).map(Literal::as_text)
    }

    pub fn value_slot(&self, name: &str) -> Option<&str> {
        self.value_slots.get(name).and_then(|id| id.as_deref())
    }

    pub fn statement_slot(&self, name: &str) -> Option<&str> {
        self.statement_slots.get(name).and_then(|id| id.as_deref())
    }
}

/// One entity's blocks as an id-keyed arena. Links are ids, so malformed
/// input can contain cycles and consumers must guard against them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockTree {
    pub blocks: HashMap<BlockId, BlockNode>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: BlockNode) {
        self.blocks.insert(node.id.clone(), node);
    }

    pub fn get(&self, id: &str) -> Option<&BlockNode> {
        self.blocks.get(id)
    }

    /// Top-level hat blocks in canvas order (top to bottom, then left to
    /// right, then id) so that compilation is deterministic.
    pub fn hats(&self) -> Vec<&BlockNode> {
        let mut hats = self
            .blocks
            .values()
            .filter(|b| b.top_level && b.kind.is_hat())
            .collect::<Vec<_>>();
        hats.sort_by(|a, b| {
            a.y.total_cmp(&b.y)
                .then(a.x.total_cmp(&b.x))
                .then_with(|| a.id.cmp(&b.id))
        });
        hats
    }
}

/// Fluent helper for assembling trees by hand (hosts and tests).
#[derive(Debug, Default)]
pub struct TreeBuilder {
    tree: BlockTree,
    counter: usize,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> BlockId {
        self.counter += 1;
        format!("b{}", self.counter)
    }

    pub fn block(&mut self, opcode: &str) -> BlockId {
        let id = self.next_id();
        self.tree.insert(BlockNode::new(id.clone(), opcode));
        id
    }

    pub fn hat(&mut self, opcode: &str) -> BlockId {
        let id = self.block(opcode);
        if let Some(node) = self.tree.blocks.get_mut(&id) {
            node.top_level = true;
            node.y = self.counter as f64;
        }
        id
    }

    pub fn number(&mut self, value: f64) -> BlockId {
        let id = self.block("math_number");
        self.field(&id, "NUM", Literal::Number(value));
        id
    }

    pub fn text(&mut self, value: &str) -> BlockId {
        let id = self.block("text");
        self.field(&id, "TEXT", Literal::text(value));
        id
    }

    pub fn field(&mut self, id: &str, name: &str, value: Literal) -> &mut Self {
        if let Some(node) = self.tree.blocks.get_mut(id) {
            node.fields.insert(name.to_string(), value);
        }
        self
    }

    pub fn input(&mut self, id: &str, slot: &str, child: &str) -> &mut Self {
        if let Some(node) = self.tree.blocks.get_mut(id) {
            node.value_slots
                .insert(slot.to_string(), Some(child.to_string()));
        }
        self
    }

    pub fn substack(&mut self, id: &str, slot: &str, child: &str) -> &mut Self {
        if let Some(node) = self.tree.blocks.get_mut(id) {
            node.statement_slots
                .insert(slot.to_string(), Some(child.to_string()));
        }
        self
    }

    pub fn next(&mut self, id: &str, next: &str) -> &mut Self {
        if let Some(node) = self.tree.blocks.get_mut(id) {
            node.next = Some(next.to_string());
        }
        self
    }

    /// Links `ids` into one `next` chain, returning the first id.
    pub fn chain(&mut self, ids: &[BlockId]) -> Option<BlockId> {
        for pair in ids.windows(2) {
            self.next(&pair[0], &pair[1]);
        }
        ids.first().cloned()
    }

    pub fn build(self) -> BlockTree {
        self.tree
    }
}
