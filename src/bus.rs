//! Listener registry and broadcast history.

use crate::ir::{EntityProgram, Script};
use crate::world::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Key listeners registered under this id fire for every key.
pub const ANY_KEY: &str = "any";

#[derive(Debug, Clone)]
pub struct Listener {
    pub entity: EntityId,
    pub script: Rc<Script>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub name: String,
    pub sender: EntityId,
    pub timestamp_ms: u64,
    pub received_by: Vec<EntityId>,
}

/// Owned by the world. Listener lists keep registration order; message names
/// and key ids are stored normalized.
#[derive(Debug)]
pub struct MessageBus {
    messages: HashMap<String, Vec<Listener>>,
    keys: HashMap<String, Vec<Listener>>,
    clicks: HashMap<EntityId, Vec<Listener>>,
    history: VecDeque<MessageRecord>,
    capacity: usize,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: HashMap::new(),
            keys: HashMap::new(),
            clicks: HashMap::new(),
            history: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Replaces every registration of `entity` with the triggers of
    /// `program`. Start scripts are not registered here.
    pub fn register_entity(&mut self, entity: EntityId, program: &EntityProgram) {
        self.clear_entity(entity);
        for (key, scripts) in &program.on_key {
            let slot = self.keys.entry(normalize_key(key)).or_default();
            slot.extend(scripts.iter().map(|s| Listener {
                entity,
                script: Rc::new(s.clone()),
            }));
        }
        if !program.on_click.is_empty() {
            self.clicks.insert(
                entity,
                program
                    .on_click
                    .iter()
                    .map(|s| Listener {
                        entity,
                        script: Rc::new(s.clone()),
                    })
                    .collect(),
            );
        }
        for (name, scripts) in &program.on_message {
            let slot = self.messages.entry(normalize_message(name)).or_default();
            slot.extend(scripts.iter().map(|s| Listener {
                entity,
                script: Rc::new(s.clone()),
            }));
        }
    }

    pub fn clear_entity(&mut self, entity: EntityId) {
        self.clicks.remove(&entity);
        for listeners in self.messages.values_mut().chain(self.keys.values_mut()) {
            listeners.retain(|l| l.entity != entity);
        }
        self.messages.retain(|_, l| !l.is_empty());
        self.keys.retain(|_, l| !l.is_empty());
    }

    pub fn clear_listeners(&mut self) {
        self.messages.clear();
        self.keys.clear();
        self.clicks.clear();
    }

    pub fn message_listeners(&self, name: &str) -> Vec<Listener> {
        self.messages
            .get(&normalize_message(name))
            .cloned()
            .unwrap_or_default()
    }

    /// Listeners for `key` followed by every `any` listener.
    pub fn key_listeners(&self, key: &str) -> Vec<Listener> {
        let key = normalize_key(key);
        let mut out = self.keys.get(&key).cloned().unwrap_or_default();
        if key != ANY_KEY {
            if let Some(any) = self.keys.get(ANY_KEY) {
                out.extend(any.iter().cloned());
            }
        }
        out
    }

    pub fn click_listeners(&self, entity: EntityId) -> Vec<Listener> {
        self.clicks.get(&entity).cloned().unwrap_or_default()
    }

    pub fn record(&mut self, record: MessageRecord) {
        if self.capacity == 0 {
            return;
        }
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn history(&self) -> impl Iterator<Item = &MessageRecord> {
        self.history.iter()
    }
}

pub fn normalize_message(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Maps host key names (`" "`, `ArrowUp`, `KeyA`) onto block key ids.
pub fn normalize_key(key: &str) -> String {
    if key == " " {
        return "space".to_string();
    }
    let lowered = key.trim().to_lowercase();
    match lowered.as_str() {
        "arrowup" | "up" => "up arrow".to_string(),
        "arrowdown" | "down" => "down arrow".to_string(),
        "arrowleft" | "left" => "left arrow".to_string(),
        "arrowright" | "right" => "right arrow".to_string(),
        "spacebar" => "space".to_string(),
        "return" => "enter".to_string(),
        other => match other.strip_prefix("key").or_else(|| other.strip_prefix("digit")) {
            Some(rest) if rest.chars().count() == 1 => rest.to_string(),
            _ => other.to_string(),
        },
    }
}
