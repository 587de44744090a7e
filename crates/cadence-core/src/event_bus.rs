use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use cadence_types::{
    Actor, EventEnvelope, EventType, RedactionLevel, WorkflowState, EVENT_VERSION,
};

use crate::redaction::RedactionPolicy;

pub type EventHandler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Advisory listener ceiling; exceeding it warns but never errors.
const DEFAULT_MAX_LISTENERS: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub actor: Option<Actor>,
    pub correlation_id: Option<String>,
    pub redaction_level: Option<RedactionLevel>,
}

impl EmitOptions {
    pub fn actor(actor: Actor) -> Self {
        Self {
            actor: Some(actor),
            ..Self::default()
        }
    }

    pub fn correlated(actor: Actor, correlation_id: impl Into<String>) -> Self {
        Self {
            actor: Some(actor),
            correlation_id: Some(correlation_id.into()),
            redaction_level: None,
        }
    }
}

struct Registration {
    id: u64,
    handler: EventHandler,
    once: bool,
}

struct BusInner {
    run_id: String,
    state: WorkflowState,
    closed: bool,
    next_id: u64,
    subscribers: HashMap<EventType, Vec<Registration>>,
    wildcard: Vec<Registration>,
    log: Vec<EventEnvelope>,
    last_timestamp: chrono::DateTime<Utc>,
    sink: Option<mpsc::UnboundedSender<EventEnvelope>>,
    max_listeners: usize,
}

/// In-process, one-to-many event publisher. Single logical producer per
/// run; subscribers observe envelopes in the order `emit` returned.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

/// Handle returned by `on`/`on_all`; dropping it does nothing, calling
/// `unsubscribe` removes the registration.
pub struct Subscription {
    bus: EventBus,
    event_type: Option<EventType>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Ok(mut inner) = self.bus.inner.lock() else {
            return;
        };
        match self.event_type {
            Some(event_type) => {
                if let Some(list) = inner.subscribers.get_mut(&event_type) {
                    list.retain(|r| r.id != self.id);
                }
            }
            None => inner.wildcard.retain(|r| r.id != self.id),
        }
    }
}

impl EventBus {
    pub fn new(run_id: impl Into<String>, initial_state: WorkflowState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                run_id: run_id.into(),
                state: initial_state,
                closed: false,
                next_id: 0,
                subscribers: HashMap::new(),
                wildcard: Vec::new(),
                log: Vec::new(),
                last_timestamp: Utc::now() - Duration::milliseconds(1),
                sink: None,
                max_listeners: DEFAULT_MAX_LISTENERS,
            })),
        }
    }

    /// Attach the write-through persistence channel. The bus never depends
    /// on the sink's readiness; a dropped receiver is ignored.
    pub fn attach_sink(&self, sink: mpsc::UnboundedSender<EventEnvelope>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.sink = Some(sink);
        }
    }

    pub fn set_state(&self, state: WorkflowState) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = state;
        }
    }

    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
            inner.sink = None;
        }
    }

    pub fn emit(
        &self,
        event_type: EventType,
        payload: Value,
        options: EmitOptions,
    ) -> anyhow::Result<EventEnvelope> {
        let policy = RedactionPolicy::standard();
        let (envelope, handlers) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| anyhow::anyhow!("event bus lock poisoned"))?;
            if inner.closed {
                anyhow::bail!("event bus is closed");
            }

            let found_sensitive = policy.contains_sensitive(&payload);
            let level = if found_sensitive {
                // Auto-escalation overrides an explicitly weaker request.
                RedactionLevel::Strict
            } else {
                options.redaction_level.unwrap_or(RedactionLevel::None)
            };
            let sanitized = policy.sanitize(&payload, level);

            // Timestamps are monotonic within a run by insertion order.
            let mut now = Utc::now();
            if now <= inner.last_timestamp {
                now = inner.last_timestamp + Duration::milliseconds(1);
            }
            inner.last_timestamp = now;

            let event_id = Uuid::new_v4().to_string();
            let envelope = EventEnvelope {
                event_version: EVENT_VERSION.to_string(),
                run_id: inner.run_id.clone(),
                event_id: event_id.clone(),
                timestamp: now,
                state: inner.state,
                actor: options.actor.unwrap_or(Actor::System),
                event_type,
                correlation_id: options.correlation_id.unwrap_or(event_id),
                payload: sanitized,
                redaction_level: level,
            };
            inner.log.push(envelope.clone());
            if let Some(sink) = &inner.sink {
                let _ = sink.send(envelope.clone());
            }

            let mut handlers: Vec<EventHandler> = Vec::new();
            if let Some(list) = inner.subscribers.get_mut(&event_type) {
                for reg in list.iter() {
                    handlers.push(reg.handler.clone());
                }
                list.retain(|r| !r.once);
            }
            for reg in &inner.wildcard {
                handlers.push(reg.handler.clone());
            }
            (envelope, handlers)
        };

        // Dispatch outside the lock so handlers may emit follow-up events.
        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&envelope)));
            if result.is_err() {
                tracing::warn!(
                    event_type = %envelope.event_type,
                    "event subscriber panicked; continuing dispatch"
                );
            }
        }
        Ok(envelope)
    }

    pub fn on(&self, event_type: EventType, handler: EventHandler) -> Subscription {
        self.register(Some(event_type), handler, false)
    }

    pub fn once(&self, event_type: EventType, handler: EventHandler) -> Subscription {
        self.register(Some(event_type), handler, true)
    }

    pub fn on_all(&self, handler: EventHandler) -> Subscription {
        self.register(None, handler, false)
    }

    fn register(
        &self,
        event_type: Option<EventType>,
        handler: EventHandler,
        once: bool,
    ) -> Subscription {
        let mut inner = self.inner.lock().expect("event bus lock");
        inner.next_id += 1;
        let id = inner.next_id;
        let max_listeners = inner.max_listeners;
        let registration = Registration { id, handler, once };
        let count = match event_type {
            Some(event_type) => {
                let list = inner.subscribers.entry(event_type).or_default();
                list.push(registration);
                list.len()
            }
            None => {
                inner.wildcard.push(registration);
                inner.wildcard.len()
            }
        };
        if count > max_listeners {
            tracing::warn!(
                listeners = count,
                limit = max_listeners,
                "listener count exceeds advisory maximum"
            );
        }
        Subscription {
            bus: self.clone(),
            event_type,
            id,
        }
    }

    pub fn log(&self) -> Vec<EventEnvelope> {
        self.inner.lock().map(|i| i.log.clone()).unwrap_or_default()
    }

    pub fn events_of_type(&self, event_type: EventType) -> Vec<EventEnvelope> {
        self.inner
            .lock()
            .map(|i| {
                i.log
                    .iter()
                    .filter(|e| e.event_type == event_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Accept JSON and return an envelope only if the version matches and all
/// structural fields are present with the right primitive types.
pub fn parse_envelope(raw: &str) -> anyhow::Result<EventEnvelope> {
    let value: Value = serde_json::from_str(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("envelope must be a JSON object"))?;

    let version = obj
        .get("eventVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing eventVersion"))?;
    if version != EVENT_VERSION {
        anyhow::bail!("unsupported event version `{version}`");
    }
    for field in [
        "runId",
        "eventId",
        "timestamp",
        "state",
        "actor",
        "type",
    ] {
        let present = obj
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !present {
            anyhow::bail!("envelope field `{field}` is missing or empty");
        }
    }
    Ok(serde_json::from_value(value)?)
}
