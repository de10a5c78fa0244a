//! Mutable runtime state: entities, globals, the message bus and the event
//! sink. Exactly one `RuntimeWorld` exists per runtime thread.

use crate::bridge::{EntityPatch, EventSink, HostEvent};
use crate::bus::MessageBus;
use crate::error::PrimitiveError;
use crate::options::RuntimeOptions;
use crate::project::{CostumeDoc, EntityDoc, EntityKind, ProjectDoc, SoundDoc, VariableDoc};
use crate::stage::{stage_to_canvas, CanvasPoint, HalfSize, StagePoint};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub usize);

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Costume {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub width: f64,
    pub height: f64,
    pub rotation_center: (f64, f64),
}

impl From<&CostumeDoc> for Costume {
    fn from(doc: &CostumeDoc) -> Self {
        Self {
            id: doc.asset_id.clone(),
            name: doc.name.clone(),
            image_ref: doc.md5ext.clone(),
            width: doc.width,
            height: doc.height,
            rotation_center: (doc.rotation_center_x, doc.rotation_center_y),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sound {
    pub id: String,
    pub name: String,
    pub duration_secs: f64,
}

impl From<&SoundDoc> for Sound {
    fn from(doc: &SoundDoc) -> Self {
        Self {
            id: doc.asset_id.clone(),
            name: doc.name.clone(),
            duration_secs: doc.duration_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub value: Value,
    pub visible: bool,
    pub display_position: Option<(f64, f64)>,
}

impl From<&VariableDoc> for Variable {
    fn from(doc: &VariableDoc) -> Self {
        Self {
            value: doc.value.clone(),
            visible: doc.visible,
            display_position: doc.display_position,
        }
    }
}

/// What a host hands over for one entity at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    pub kind: EntityKind,
    pub x: f64,
    pub y: f64,
    pub direction: f64,
    /// Percent, 100 is natural size.
    pub size: f64,
    pub visible: bool,
    pub current_costume: usize,
    pub costumes: Vec<Costume>,
    pub sounds: Vec<Sound>,
    pub variables: BTreeMap<String, Variable>,
}

impl From<&EntityDoc> for EntitySpec {
    fn from(doc: &EntityDoc) -> Self {
        Self {
            name: doc.name.clone(),
            kind: doc.kind,
            x: doc.x,
            y: doc.y,
            direction: doc.direction,
            size: doc.size,
            visible: doc.visible,
            current_costume: doc.current_costume,
            costumes: doc.costumes.iter().map(Costume::from).collect(),
            sounds: doc.sounds.iter().map(Sound::from).collect(),
            variables: doc
                .variables
                .iter()
                .map(|v| (v.name.clone(), Variable::from(v)))
                .collect(),
        }
    }
}

pub fn entity_specs(project: &ProjectDoc) -> Vec<EntitySpec> {
    project.entities.iter().map(EntitySpec::from).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    /// Stage coordinates are authoritative; canvas positions are derived.
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
    /// 1.0 is 100%.
    pub scale: f64,
    pub visible: bool,
    pub costumes: Vec<Costume>,
    pub current_costume: usize,
    pub sounds: Vec<Sound>,
    pub variables: BTreeMap<String, Variable>,
    /// Bumped on every speech change so a timed bubble only clears itself.
    pub speech_seq: u64,
}

impl Entity {
    fn from_spec(id: EntityId, spec: EntitySpec) -> Self {
        let current_costume = if spec.costumes.is_empty() {
            0
        } else {
            spec.current_costume.min(spec.costumes.len() - 1)
        };
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            x: spec.x,
            y: spec.y,
            rotation: spec.direction,
            scale: (spec.size / 100.0).max(0.0),
            visible: spec.visible,
            costumes: spec.costumes,
            current_costume,
            sounds: spec.sounds,
            variables: spec.variables,
            speech_seq: 0,
        }
    }

    pub fn position(&self) -> StagePoint {
        StagePoint {
            x: self.x,
            y: self.y,
        }
    }

    pub fn canvas(&self) -> CanvasPoint {
        stage_to_canvas(self.position())
    }

    pub fn costume(&self) -> Option<&Costume> {
        self.costumes.get(self.current_costume)
    }

    /// Half extents of the current costume at the current scale.
    pub fn half_size(&self) -> HalfSize {
        match self.costume() {
            Some(c) => HalfSize {
                w: (c.width * self.scale / 2.0).max(0.0),
                h: (c.height * self.scale / 2.0).max(0.0),
            },
            None => HalfSize { w: 0.0, h: 0.0 },
        }
    }

    pub fn is_background(&self) -> bool {
        self.kind == EntityKind::Background
    }

    pub fn full_patch(&self) -> EntityPatch {
        let canvas = self.canvas();
        EntityPatch {
            x: Some(self.x),
            y: Some(self.y),
            canvas_x: Some(canvas.x),
            canvas_y: Some(canvas.y),
            rotation: Some(self.rotation),
            scale: Some(self.scale),
            visible: Some(self.visible),
            costume: Some(self.current_costume),
        }
    }
}

#[derive(Debug)]
pub struct GlobalStore {
    pub variables: BTreeMap<String, Variable>,
    pub pressed_keys: HashSet<String>,
    /// Last known good mouse position, stage coordinates.
    pub mouse: StagePoint,
    pub timer_start: Instant,
}

impl GlobalStore {
    fn new() -> Self {
        Self {
            variables: BTreeMap::new(),
            pressed_keys: HashSet::new(),
            mouse: StagePoint { x: 0.0, y: 0.0 },
            timer_start: Instant::now(),
        }
    }
}

/// SplitMix64; small, seedable and identical on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub const fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Inclusive integer range; `low <= high` is assumed.
    pub fn int_range(&mut self, low: i64, high: i64) -> i64 {
        let span = (high - low) as u64 + 1;
        low + (self.next_u64() % span) as i64
    }
}

pub struct RuntimeWorld {
    pub entities: Vec<Entity>,
    pub globals: GlobalStore,
    pub bus: MessageBus,
    pub options: RuntimeOptions,
    pub rng: SplitMix64,
    events: EventSink,
    running: bool,
    reported: HashSet<(EntityId, String)>,
    epoch: Instant,
    mouse_waiters: Vec<oneshot::Sender<StagePoint>>,
}

impl RuntimeWorld {
    pub fn new(options: RuntimeOptions, events: EventSink) -> Self {
        Self {
            entities: Vec::new(),
            globals: GlobalStore::new(),
            bus: MessageBus::new(options.history_capacity),
            rng: SplitMix64::new(options.seed),
            options,
            events,
            running: false,
            reported: HashSet::new(),
            epoch: Instant::now(),
            mouse_waiters: Vec::new(),
        }
    }

    /// Rebuilds entities and globals. Background variables become globals.
    pub fn load(&mut self, specs: Vec<EntitySpec>) {
        self.running = false;
        self.globals = GlobalStore::new();
        self.bus = MessageBus::new(self.options.history_capacity);
        self.reported.clear();
        self.entities = specs
            .into_iter()
            .enumerate()
            .map(|(i, mut spec)| {
                if spec.kind == EntityKind::Background {
                    self.globals.variables.append(&mut spec.variables);
                }
                Entity::from_spec(EntityId(i), spec)
            })
            .collect();
    }

    /// Per-run reset: timer, failure reports, running flag.
    pub fn begin_run(&mut self) {
        self.running = true;
        self.reported.clear();
        self.globals.timer_start = Instant::now();
    }

    pub fn halt(&mut self) {
        self.running = false;
        self.mouse_waiters.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn entity(&self, id: EntityId) -> Result<&Entity, PrimitiveError> {
        self.entities
            .get(id.0)
            .ok_or(PrimitiveError::UnknownEntity(id))
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity, PrimitiveError> {
        self.entities
            .get_mut(id.0)
            .ok_or(PrimitiveError::UnknownEntity(id))
    }

    pub fn find_entity(&self, name: &str) -> Option<EntityId> {
        self.entities
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.id)
    }

    pub fn background(&self) -> Option<EntityId> {
        self.entities.iter().find(|e| e.is_background()).map(|e| e.id)
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id).collect()
    }

    /// Milliseconds since the world was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn timer_secs(&self) -> f64 {
        self.globals.timer_start.elapsed().as_secs_f64()
    }

    /// Sends an event produced by running code. Dropped while stopped so
    /// that nothing observable happens after a stop.
    pub fn notify(&self, event: HostEvent) {
        if self.running {
            self.events.send(event);
        }
    }

    pub fn emit(&self, event: HostEvent) {
        self.events.send(event);
    }

    pub fn notify_patch(&self, entity: EntityId, patch: EntityPatch) {
        self.notify(HostEvent::EntityStateChanged { entity, patch });
    }

    /// Reports `err` for `entity` unless the same message was already
    /// reported this run. Returns whether an event went out.
    pub fn report_failure(&mut self, entity: EntityId, err: &PrimitiveError) -> bool {
        let message = err.to_string();
        if !self.reported.insert((entity, message.clone())) {
            return false;
        }
        self.emit(HostEvent::RuntimeError {
            entity: Some(entity),
            message,
        });
        true
    }

    /// Entity-local variable, else global.
    pub fn variable(&self, entity: EntityId, name: &str) -> Option<&Variable> {
        self.entities
            .get(entity.0)
            .and_then(|e| e.variables.get(name))
            .or_else(|| self.globals.variables.get(name))
    }

    /// Entity-local variable, else global; unknown names become globals.
    pub fn variable_mut(&mut self, entity: EntityId, name: &str) -> &mut Variable {
        let local = self
            .entities
            .get(entity.0)
            .map(|e| e.variables.contains_key(name))
            .unwrap_or(false);
        if local {
            if let Some(var) = self
                .entities
                .get_mut(entity.0)
                .and_then(|e| e.variables.get_mut(name))
            {
                return var;
            }
        }
        self.globals
            .variables
            .entry(name.to_string())
            .or_insert_with(|| Variable {
                value: Value::default(),
                visible: false,
                display_position: None,
            })
    }

    pub fn add_mouse_waiter(&mut self, waiter: oneshot::Sender<StagePoint>) {
        self.mouse_waiters.retain(|w| !w.is_closed());
        self.mouse_waiters.push(waiter);
    }

    pub fn resolve_mouse(&mut self, point: StagePoint) {
        self.globals.mouse = point;
        for waiter in self.mouse_waiters.drain(..) {
            let _ = waiter.send(point);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::event_channel;

    fn spec(name: &str, kind: EntityKind) -> EntitySpec {
        let mut doc = match kind {
            EntityKind::Sprite => EntityDoc::sprite(name),
            EntityKind::Background => EntityDoc::background(name),
        };
        doc.costumes.push(CostumeDoc {
            name: "c1".into(),
            asset_id: "a".into(),
            md5ext: "a.svg".into(),
            width: 40.0,
            height: 20.0,
            rotation_center_x: 20.0,
            rotation_center_y: 10.0,
        });
        doc.variables.push(VariableDoc {
            name: format!("{}-var", name),
            value: Value::from(1.0),
            visible: false,
            display_position: None,
        });
        EntitySpec::from(&doc)
    }

    #[tokio::test]
    async fn background_variables_become_globals() {
        let (sink, _rx) = event_channel();
        let mut world = RuntimeWorld::new(RuntimeOptions::default(), sink);
        world.load(vec![
            spec("Stage", EntityKind::Background),
            spec("Cat", EntityKind::Sprite),
        ]);
        assert!(world.globals.variables.contains_key("Stage-var"));
        assert!(world.variable(EntityId(1), "Stage-var").is_some());
        assert!(world.variable(EntityId(1), "Cat-var").is_some());
        assert!(world.variable(EntityId(0), "Cat-var").is_none());
        world.variable_mut(EntityId(1), "fresh").value = Value::from(3.0);
        assert!(world.globals.variables.contains_key("fresh"));
    }

    #[tokio::test]
    async fn half_size_follows_scale() {
        let (sink, _rx) = event_channel();
        let mut world = RuntimeWorld::new(RuntimeOptions::default(), sink);
        world.load(vec![spec("Cat", EntityKind::Sprite)]);
        world.entities[0].scale = 2.0;
        assert_eq!(world.entities[0].half_size(), HalfSize { w: 40.0, h: 20.0 });
    }

    #[tokio::test]
    async fn failures_are_reported_once_per_run() {
        let (sink, mut rx) = event_channel();
        let mut world = RuntimeWorld::new(RuntimeOptions::default(), sink);
        world.load(vec![spec("Cat", EntityKind::Sprite)]);
        world.begin_run();
        let err = PrimitiveError::UnknownSound("meow".into());
        assert!(world.report_failure(EntityId(0), &err));
        assert!(!world.report_failure(EntityId(0), &err));
        world.begin_run();
        assert!(world.report_failure(EntityId(0), &err));
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, HostEvent::RuntimeError { .. }));
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn events_are_suppressed_while_stopped() {
        let (sink, mut rx) = event_channel();
        let mut world = RuntimeWorld::new(RuntimeOptions::default(), sink);
        world.load(vec![spec("Cat", EntityKind::Sprite)]);
        world.notify(HostEvent::SoundsStopped);
        assert!(rx.try_recv().is_err());
        world.begin_run();
        world.notify(HostEvent::SoundsStopped);
        assert_eq!(rx.try_recv().ok(), Some(HostEvent::SoundsStopped));
    }

    #[test]
    fn rng_is_deterministic_and_in_range() {
        let mut a = SplitMix64::new(7);
        let mut b = SplitMix64::new(7);
        for _ in 0..100 {
            let n = a.int_range(1, 6);
            assert_eq!(n, b.int_range(1, 6));
            assert!((1..=6).contains(&n));
            let f = a.next_f64();
            b.next_f64();
            assert!((0.0..1.0).contains(&f));
        }
    }
}
