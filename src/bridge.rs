//! Host bridge: the only channel between a host and the runtime.
//!
//! Commands flow in and events flow out over ordered unbounded queues. The
//! runtime lives on its own OS thread with a single-threaded tokio runtime and
//! a `LocalSet`, so every script task stays on that thread.

use crate::bus::MessageRecord;
use crate::ir::{EntityProgram, Program, SpeechKind};
use crate::options::RuntimeOptions;
use crate::scheduler::Runtime;
use crate::value::Value;
use crate::world::{EntityId, EntitySpec};
use serde::{Deserialize, Serialize};
use std::thread;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    LoadProgram {
        entities: Vec<EntitySpec>,
        program: Program,
    },
    Start,
    Stop,
    KeyDown {
        key: String,
    },
    KeyUp {
        key: String,
    },
    ClickEntity {
        entity: EntityId,
    },
    /// Stage coordinates.
    MousePositionResponse {
        x: f64,
        y: f64,
    },
    UpdateEntityCode {
        entity: EntityId,
        program: EntityProgram,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    EntityStateChanged {
        entity: EntityId,
        patch: EntityPatch,
    },
    RuntimeError {
        entity: Option<EntityId>,
        message: String,
    },
    ExecutionStopped,
    SwitchBackground {
        background: EntityId,
        costume: String,
    },
    SpeechBubble {
        entity: EntityId,
        text: String,
        kind: SpeechKind,
        duration_ms: Option<u64>,
    },
    VariableVisibilityChanged {
        name: String,
        visible: bool,
        value: Value,
    },
    MessageBroadcastObserved {
        name: String,
        sender: EntityId,
        timestamp_ms: u64,
    },
    MousePositionRequest {
        entity: EntityId,
    },
    SoundStarted {
        entity: EntityId,
        sound: String,
    },
    SoundsStopped,
}

/// Changed entity fields. Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub costume: Option<usize>,
}

/// Outbound half of the event queue. Sending never blocks; a host that hung
/// up simply stops receiving.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl EventSink {
    pub fn send(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("host event dropped, receiver closed");
        }
    }
}

pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<HostEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to start runtime thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("runtime is no longer accepting commands")]
    Closed,
    #[error("runtime thread panicked")]
    Panicked,
}

/// Owns the runtime thread. Dropping the handle without `shutdown` closes the
/// command queue, which also ends the thread.
pub struct RuntimeHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
    thread: Option<thread::JoinHandle<Vec<MessageRecord>>>,
}

impl RuntimeHandle {
    pub fn spawn(
        options: RuntimeOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HostEvent>), BridgeError> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (sink, events) = event_channel();
        let thread = thread::Builder::new()
            .name("sbstage-runtime".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        tracing::error!("could not build runtime: {}", err);
                        return Vec::new();
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let runtime = Runtime::new(options, sink);
                    runtime.serve(command_rx).await;
                    runtime.history()
                })
            })?;
        Ok((
            Self {
                commands,
                thread: Some(thread),
            },
            events,
        ))
    }

    pub fn send(&self, command: HostCommand) -> Result<(), BridgeError> {
        self.commands.send(command).map_err(|_| BridgeError::Closed)
    }

    /// Stops everything, joins the thread and returns the broadcast history.
    pub fn shutdown(mut self) -> Result<Vec<MessageRecord>, BridgeError> {
        let _ = self.commands.send(HostCommand::Shutdown);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| BridgeError::Panicked),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.commands.send(HostCommand::Shutdown);
        }
    }
}
