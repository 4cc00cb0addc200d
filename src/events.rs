// src/events.rs

//! Process-local event bus
//!
//! Decouples the core engine from reporting concerns. Core operations emit
//! named events with JSON payloads; the CLI reporter and the project log
//! writer subscribe. Within one event class emit order is preserved;
//! nothing is guaranteed across classes.

use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// A single emitted event
#[derive(Debug, Clone)]
pub struct Event {
    /// Namespaced name, e.g. "change:start", "lock:acquired"
    pub name: String,
    /// Severity used by the log writer
    pub level: Level,
    /// Human-readable one-liner
    pub message: String,
    /// Structured payload, if any
    pub data: Option<Value>,
    /// ISO-8601 emission time
    pub time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

type Subscriber = Box<dyn Fn(&Event) + Send>;

/// Shared pub-sub bus. Cloning shares the subscriber list.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber. Callbacks run synchronously on the emitting
    /// task; subscribers must not block.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Event) + Send + 'static,
    {
        self.subscribers.lock().unwrap().push(Box::new(f));
    }

    /// Emit an event to all subscribers. A poisoned subscriber list is
    /// treated as having no subscribers rather than propagating the panic.
    pub fn emit(&self, name: &str, level: Level, message: impl Into<String>, data: Option<Value>) {
        let event = Event {
            name: name.to_string(),
            level,
            message: message.into(),
            data,
            time: Utc::now().to_rfc3339(),
        };
        if let Ok(subs) = self.subscribers.lock() {
            for sub in subs.iter() {
                sub(&event);
            }
        }
    }

    pub fn info(&self, name: &str, message: impl Into<String>, data: Option<Value>) {
        self.emit(name, Level::Info, message, data);
    }

    pub fn warn(&self, name: &str, message: impl Into<String>, data: Option<Value>) {
        self.emit(name, Level::Warn, message, data);
    }

    pub fn error(&self, name: &str, message: impl Into<String>, data: Option<Value>) {
        self.emit(name, Level::Error, message, data);
    }

    pub fn debug(&self, name: &str, message: impl Into<String>, data: Option<Value>) {
        self.emit(name, Level::Debug, message, data);
    }
}
