//! Per-invocation profiling of delegated graphs.
//!
//! The [`Profiler`] brackets one backend invocation. When the caller supplies
//! an [`EventTracer`] through the [`ExecutionContext`], the profiler forwards
//! one [`DelegateEvent`] per backend operator plus one for the whole
//! invocation. Profiling never decides whether an invocation succeeds: the
//! executor logs profiler errors and carries on.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::backend::{NativeRuntime, NativeStatus};
use crate::{DelegateError, Result};

/// Name of the event covering a whole invocation.
pub const INVOKE_EVENT: &str = "delegate_invoke";

/// A timing record emitted to an [`EventTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateEvent {
    /// Operator name, or [`INVOKE_EVENT`].
    pub name: String,
    pub method: Option<String>,
    pub duration: Duration,
}

/// Sink for delegate profiling events.
pub trait EventTracer: Send + Sync {
    fn log_delegate_event(&self, event: DelegateEvent) -> Result<()>;
}

/// Tracer that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<DelegateEvent>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventTracer for RecordingTracer {
    fn log_delegate_event(&self, event: DelegateEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Per-call context handed to `invoke`.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub event_tracer: Option<Arc<dyn EventTracer>>,
    pub method_name: Option<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn EventTracer>) -> Self {
        self.event_tracer = Some(tracer);
        self
    }

    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.method_name = Some(name.into());
        self
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("event_tracer", &self.event_tracer.is_some())
            .field("method_name", &self.method_name)
            .finish()
    }
}

enum State {
    Disabled,
    Ready,
    Running {
        started: Instant,
        tracer: Option<Arc<dyn EventTracer>>,
        method: Option<String>,
    },
}

/// Brackets backend invocations and reports their timings.
pub struct Profiler {
    state: State,
}

impl Profiler {
    pub fn disabled() -> Self {
        Self { state: State::Disabled }
    }

    /// Ask the runtime to collect operator timings.
    ///
    /// A runtime without profiling support leaves the profiler disabled.
    pub fn initialize(runtime: &mut dyn NativeRuntime, enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }
        match runtime.enable_profiling() {
            Ok(()) => Self { state: State::Ready },
            Err(status) => {
                warn!(%status, "backend cannot profile; profiling disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, State::Disabled)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    pub fn start(&mut self, ctx: &ExecutionContext) -> Result<()> {
        match self.state {
            State::Disabled => Ok(()),
            State::Running { .. } => Err(DelegateError::internal("profiler already running")),
            State::Ready => {
                self.state = State::Running {
                    started: Instant::now(),
                    tracer: ctx.event_tracer.clone(),
                    method: ctx.method_name.clone(),
                };
                Ok(())
            }
        }
    }

    /// Stop timing and emit events. Every event is attempted; the first
    /// tracer error is returned.
    pub fn end(&mut self, runtime: &dyn NativeRuntime) -> Result<()> {
        let (started, tracer, method) = match std::mem::replace(&mut self.state, State::Ready) {
            State::Disabled => {
                self.state = State::Disabled;
                return Ok(());
            }
            State::Ready => {
                return Err(DelegateError::native("profiler not running", NativeStatus::InvalidState))
            }
            State::Running { started, tracer, method } => (started, tracer, method),
        };
        let total = started.elapsed();
        let Some(tracer) = tracer else {
            return Ok(());
        };

        let mut first_err = None;
        let events = runtime
            .operator_timings()
            .into_iter()
            .map(|t| (t.name, t.duration))
            .chain(std::iter::once((INVOKE_EVENT.to_string(), total)));
        for (name, duration) in events {
            let event = DelegateEvent { name, method: method.clone(), duration };
            if let Err(e) = tracer.log_delegate_event(event) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Disabled => "disabled",
            State::Ready => "ready",
            State::Running { .. } => "running",
        };
        f.debug_struct("Profiler").field("state", &state).finish()
    }
}
