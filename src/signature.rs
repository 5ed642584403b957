//! Task signatures
//!
//! A [`Signature`] is the serializable envelope describing one task
//! invocation: which handler to run, with which typed arguments, where to
//! route it, and what to do afterwards (success/error callbacks, chord
//! callback). Signatures are what producers publish and workers consume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::args::TypedValue;

/// Serializable description of one task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Globally unique task identifier; assigned at publish time if empty
    #[serde(rename = "UUID")]
    pub uuid: String,
    /// Registered handler name
    #[serde(rename = "Name")]
    pub name: String,
    /// Broker routing key; defaults to the configured binding
    #[serde(rename = "RoutingKey", default)]
    pub routing_key: String,
    /// Earliest moment the task may be dispatched
    #[serde(rename = "ETA", default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    /// Group this signature belongs to, if any
    #[serde(rename = "GroupUUID", default, skip_serializing_if = "Option::is_none")]
    pub group_uuid: Option<String>,
    /// Number of tasks in the group, if any
    #[serde(rename = "GroupTaskCount", default, skip_serializing_if = "Option::is_none")]
    pub group_task_count: Option<usize>,
    /// Ordered, typed arguments
    #[serde(rename = "Args", default)]
    pub args: Vec<TypedValue>,
    /// Opaque headers propagated as transport headers
    #[serde(rename = "Headers", default)]
    pub headers: HashMap<String, String>,
    /// Signatures published after this one succeeds
    #[serde(rename = "OnSuccess", default)]
    pub on_success: Vec<Signature>,
    /// Signatures published after this one fails
    #[serde(rename = "OnError", default)]
    pub on_error: Vec<Signature>,
    /// Callback published once every group member has succeeded
    #[serde(rename = "ChordCallback", default, skip_serializing_if = "Option::is_none")]
    pub chord_callback: Option<Box<Signature>>,
    /// When true, predecessor results are not prepended to this
    /// signature's args
    #[serde(rename = "Immutable", default)]
    pub immutable: bool,
}

impl Signature {
    /// Create a new signature for a registered handler
    pub fn new(name: &str, args: Vec<TypedValue>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            routing_key: String::new(),
            eta: None,
            group_uuid: None,
            group_task_count: None,
            args,
            headers: HashMap::new(),
            on_success: Vec::new(),
            on_error: Vec::new(),
            chord_callback: None,
            immutable: false,
        }
    }

    /// Set the routing key
    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = routing_key.to_string();
        self
    }

    /// Delay dispatch until the given moment
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Attach a transport header
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a callback to publish after success
    pub fn with_on_success(mut self, callback: Signature) -> Self {
        self.on_success.push(callback);
        self
    }

    /// Add a callback to publish after failure
    pub fn with_on_error(mut self, callback: Signature) -> Self {
        self.on_error.push(callback);
        self
    }

    /// Keep this signature's args untouched by predecessor results
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// Assign a fresh UUID if none is set yet.
    ///
    /// Called on the publish path; a UUID is immutable once published.
    pub fn ensure_uuid(&mut self) {
        if self.uuid.is_empty() {
            self.uuid = Uuid::new_v4().to_string();
        }
    }
}
