//! Cooperative scheduler: one `spawn_local` task per triggered script.
//!
//! Cancellation is a token tree. The run token is cancelled by a global stop;
//! every entity owns a child of it and every task a child of its entity's
//! token, so stopping a sprite or a single task is just cancelling a subtree.
//! Must be driven from inside a `tokio::task::LocalSet`.

use crate::bridge::{EventSink, HostCommand, HostEvent};
use crate::bus::{normalize_key, MessageRecord};
use crate::error::Interrupt;
use crate::interpreter::TaskContext;
use crate::ir::{EntityProgram, Program, Script};
use crate::options::RuntimeOptions;
use crate::stage::StagePoint;
use crate::world::{EntityId, EntitySpec, RuntimeWorld};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Ready,
    Running,
    Suspended,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub entity: EntityId,
    pub hat: String,
    pub state: TaskState,
}

/// Counters over the runtime's lifetime. Failed tasks count as completed too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub spawned: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

struct TaskEntry {
    entity: EntityId,
    hat: String,
    state: TaskState,
    token: CancellationToken,
}

pub(crate) struct Shared {
    pub(crate) world: RefCell<RuntimeWorld>,
    programs: RefCell<Vec<EntityProgram>>,
    run_token: RefCell<CancellationToken>,
    entity_tokens: RefCell<HashMap<EntityId, CancellationToken>>,
    tasks: RefCell<BTreeMap<TaskId, TaskEntry>>,
    stats: Cell<TaskStats>,
    next_task: Cell<TaskId>,
}

impl Shared {
    fn bump(&self, f: impl FnOnce(&mut TaskStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    pub(crate) fn set_task_state(&self, task: TaskId, state: TaskState) {
        if let Some(entry) = self.tasks.borrow_mut().get_mut(&task) {
            entry.state = state;
        }
    }

    /// Spawns `script` for `entity` unless that entity is currently stopped.
    pub(crate) fn spawn_script(self: &Rc<Self>, entity: EntityId, script: Rc<Script>) -> Option<TaskId> {
        let parent = self.entity_tokens.borrow().get(&entity).cloned()?;
        if parent.is_cancelled() {
            return None;
        }
        let token = parent.child_token();
        let id = self.next_task.get();
        self.next_task.set(id + 1);
        self.tasks.borrow_mut().insert(
            id,
            TaskEntry {
                entity,
                hat: script.hat.clone(),
                state: TaskState::Ready,
                token: token.clone(),
            },
        );
        self.bump(|s| s.spawned += 1);
        tracing::debug!(task = id, entity = %entity, hat = %script.hat, "spawned task");
        let step_warning = self.world.borrow().options.step_warning;
        let ctx = TaskContext::new(Rc::clone(self), entity, id, token, step_warning);
        tokio::task::spawn_local(ctx.run(script));
        Some(id)
    }

    pub(crate) fn finish_task(&self, task: TaskId, entity: EntityId, outcome: Result<(), Interrupt>) {
        self.tasks.borrow_mut().remove(&task);
        match outcome {
            Ok(()) | Err(Interrupt::StopScript) => {
                self.bump(|s| s.completed += 1);
                tracing::debug!(task, "task completed");
            }
            Err(Interrupt::Cancelled) => {
                self.bump(|s| s.cancelled += 1);
                tracing::debug!(task, "task cancelled");
            }
            Err(Interrupt::Failed(err)) => {
                self.bump(|s| {
                    s.completed += 1;
                    s.failed += 1;
                });
                tracing::warn!(task, entity = %entity, "task failed: {}", err);
                let mut world = self.world.borrow_mut();
                if world.is_running() {
                    world.report_failure(entity, &err);
                }
            }
        }
    }

    /// Cancels the current run. Returns whether a run was active.
    fn halt_run(&self) -> bool {
        let was_running = {
            let mut world = self.world.borrow_mut();
            let was = world.is_running();
            world.halt();
            was
        };
        self.run_token.borrow().cancel();
        was_running
    }

    pub(crate) fn stop_all(&self) {
        let was_running = self.halt_run();
        tracing::info!(was_running, "execution stopped");
        self.world.borrow().emit(HostEvent::ExecutionStopped);
    }

    /// Cancels every task of `entity` and gives it a fresh token so later
    /// triggers still run.
    pub(crate) fn stop_entity(&self, entity: EntityId) {
        let run = self.run_token.borrow().clone();
        let mut tokens = self.entity_tokens.borrow_mut();
        if let Some(old) = tokens.insert(entity, run.child_token()) {
            old.cancel();
        }
        tracing::debug!(entity = %entity, "stopped every script of entity");
    }

    pub(crate) fn stop_other_scripts(&self, entity: EntityId, except: TaskId) {
        for (id, entry) in self.tasks.borrow().iter() {
            if entry.entity == entity && *id != except {
                entry.token.cancel();
            }
        }
    }

    /// Starts one task per listener and records the broadcast. Does not wait
    /// for the listeners.
    pub(crate) fn broadcast(self: &Rc<Self>, name: &str, sender: EntityId) -> usize {
        let listeners = {
            let mut world = self.world.borrow_mut();
            if !world.is_running() {
                return 0;
            }
            let listeners = world.bus.message_listeners(name);
            let timestamp_ms = world.now_ms();
            world.bus.record(MessageRecord {
                name: name.to_string(),
                sender,
                timestamp_ms,
                received_by: listeners.iter().map(|l| l.entity).collect(),
            });
            world.notify(HostEvent::MessageBroadcastObserved {
                name: name.to_string(),
                sender,
                timestamp_ms,
            });
            listeners
        };
        tracing::debug!(message = name, listeners = listeners.len(), "broadcast");
        for listener in &listeners {
            self.spawn_script(listener.entity, Rc::clone(&listener.script));
        }
        listeners.len()
    }
}

/// The runtime half of the host bridge. Cheap to clone; all clones share one
/// world.
#[derive(Clone)]
pub struct Runtime {
    shared: Rc<Shared>,
}

impl Runtime {
    pub fn new(options: RuntimeOptions, events: EventSink) -> Self {
        let run_token = CancellationToken::new();
        run_token.cancel();
        Self {
            shared: Rc::new(Shared {
                world: RefCell::new(RuntimeWorld::new(options, events)),
                programs: RefCell::new(Vec::new()),
                run_token: RefCell::new(run_token),
                entity_tokens: RefCell::new(HashMap::new()),
                tasks: RefCell::new(BTreeMap::new()),
                stats: Cell::new(TaskStats::default()),
                next_task: Cell::new(1),
            }),
        }
    }

    /// Applies commands in arrival order until `Shutdown` or until the host
    /// drops its sender.
    pub async fn serve(&self, mut commands: mpsc::UnboundedReceiver<HostCommand>) {
        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        self.shared.halt_run();
        for record in self.history() {
            tracing::info!(
                message = %record.name,
                sender = %record.sender,
                at_ms = record.timestamp_ms,
                receivers = record.received_by.len(),
                "broadcast history"
            );
        }
    }

    /// Returns false once the runtime should shut down.
    pub fn handle(&self, command: HostCommand) -> bool {
        match command {
            HostCommand::LoadProgram { entities, program } => self.load(entities, program),
            HostCommand::Start => self.start(),
            HostCommand::Stop => self.stop(),
            HostCommand::KeyDown { key } => self.key_down(&key),
            HostCommand::KeyUp { key } => self.key_up(&key),
            HostCommand::ClickEntity { entity } => self.click(entity),
            HostCommand::MousePositionResponse { x, y } => self.mouse_position(x, y),
            HostCommand::UpdateEntityCode { entity, program } => {
                self.update_entity_code(entity, program)
            }
            HostCommand::Shutdown => return false,
        }
        true
    }

    pub fn load(&self, entities: Vec<EntitySpec>, program: Program) {
        self.shared.halt_run();
        let count = entities.len();
        let mut programs = program.entities;
        if programs.len() != count {
            tracing::warn!(
                entities = count,
                programs = programs.len(),
                "program does not match entity count"
            );
        }
        programs.resize_with(count, EntityProgram::default);
        self.shared.world.borrow_mut().load(entities);
        *self.shared.programs.borrow_mut() = programs;
        self.shared.entity_tokens.borrow_mut().clear();
        tracing::info!(entities = count, "program loaded");
    }

    /// Begins a fresh run: resets per-run state, rebuilds registrations and
    /// spawns every start script.
    pub fn start(&self) {
        self.shared.halt_run();
        let run = CancellationToken::new();
        *self.shared.run_token.borrow_mut() = run.clone();
        let programs = self.shared.programs.borrow().clone();
        let ids = {
            let mut world = self.shared.world.borrow_mut();
            world.begin_run();
            world.bus.clear_listeners();
            let ids = world.entity_ids();
            for (id, program) in ids.iter().zip(&programs) {
                world.bus.register_entity(*id, program);
            }
            ids
        };
        {
            let mut tokens = self.shared.entity_tokens.borrow_mut();
            tokens.clear();
            for id in &ids {
                tokens.insert(*id, run.child_token());
            }
        }
        let mut started = 0;
        for (id, program) in ids.iter().zip(&programs) {
            if let Some(script) = &program.on_start {
                if self
                    .shared
                    .spawn_script(*id, Rc::new(script.clone()))
                    .is_some()
                {
                    started += 1;
                }
            }
        }
        tracing::info!(start_scripts = started, "run started");
    }

    pub fn stop(&self) {
        self.shared.stop_all();
    }

    pub fn key_down(&self, key: &str) {
        let key = normalize_key(key);
        let listeners = {
            let mut world = self.shared.world.borrow_mut();
            world.globals.pressed_keys.insert(key.clone());
            if !world.is_running() {
                return;
            }
            world.bus.key_listeners(&key)
        };
        for listener in listeners {
            self.shared.spawn_script(listener.entity, listener.script);
        }
    }

    pub fn key_up(&self, key: &str) {
        let key = normalize_key(key);
        self.shared.world.borrow_mut().globals.pressed_keys.remove(&key);
    }

    pub fn click(&self, entity: EntityId) {
        let listeners = {
            let world = self.shared.world.borrow();
            if !world.is_running() {
                return;
            }
            world.bus.click_listeners(entity)
        };
        for listener in listeners {
            self.shared.spawn_script(listener.entity, listener.script);
        }
    }

    pub fn mouse_position(&self, x: f64, y: f64) {
        self.shared
            .world
            .borrow_mut()
            .resolve_mouse(StagePoint { x, y });
    }

    /// Swaps one entity's scripts. Running tasks keep their old code; new
    /// triggers use the new registrations.
    pub fn update_entity_code(&self, entity: EntityId, program: EntityProgram) {
        {
            let mut programs = self.shared.programs.borrow_mut();
            match programs.get_mut(entity.0) {
                Some(slot) => *slot = program.clone(),
                None => {
                    tracing::warn!(entity = %entity, "code update for unknown entity ignored");
                    return;
                }
            }
        }
        let mut world = self.shared.world.borrow_mut();
        if world.is_running() {
            world.bus.register_entity(entity, &program);
        }
        tracing::debug!(entity = %entity, scripts = program.script_count(), "entity code updated");
    }

    pub fn broadcast(&self, name: &str, sender: EntityId) -> usize {
        self.shared.broadcast(name, sender)
    }

    pub fn is_running(&self) -> bool {
        self.shared.world.borrow().is_running()
    }

    /// Live tasks in spawn order.
    pub fn task_states(&self) -> Vec<TaskInfo> {
        self.shared
            .tasks
            .borrow()
            .iter()
            .map(|(id, entry)| TaskInfo {
                id: *id,
                entity: entry.entity,
                hat: entry.hat.clone(),
                state: entry.state,
            })
            .collect()
    }

    pub fn stats(&self) -> TaskStats {
        self.shared.stats.get()
    }

    pub fn history(&self) -> Vec<MessageRecord> {
        self.shared.world.borrow().bus.history().cloned().collect()
    }

    /// Read access for hosts embedding the runtime directly and for tests.
    pub fn with_world<R>(&self, f: impl FnOnce(&RuntimeWorld) -> R) -> R {
        f(&self.shared.world.borrow())
    }
}
