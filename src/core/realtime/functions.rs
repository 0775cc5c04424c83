//! Function-call dispatcher.
//!
//! Registers local capabilities with the remote session and answers the
//! function calls the model emits inside `response.done` events.
//!
//! State is `Idle` (no pending call) or `Processing` (exactly one
//! [`PendingFunctionCall`] bound). Only the first function-call item of a
//! response is handled; a call observed while another is processing is
//! dropped, never run concurrently.
//!
//! Result delivery is asymmetric:
//! - handler succeeded: `function_call_output` with the result, then `response.create`
//! - handler missing, failed or panicked: `function_call_output` with
//!   `{"error": "Function execution failed"}` and no `response.create`

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::base::RealtimeResult;
use super::bus::{EventBus, SubscriptionId};
use super::messages::{ServerEvent, ServerEventKind, SessionUpdate, ToolDefinition};

/// Payload sent back when a call cannot be answered.
pub const FUNCTION_EXECUTION_FAILED: &str = "Function execution failed";

/// Errors produced while executing a function call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FunctionError {
    #[error("No handler registered for function '{0}'")]
    NotFound(String),

    #[error("Function execution failed: {0}")]
    Execution(String),

    #[error("Function handler panicked")]
    Panicked,
}

pub type FunctionResult = Result<Value, FunctionError>;

/// Async function handler. Receives the decoded JSON arguments.
pub type FunctionHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = FunctionResult> + Send>> + Send + Sync>;

/// The single in-flight function call.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

struct Attachment {
    bus: EventBus,
    subscription: SubscriptionId,
    /// Tool set last pushed with `session.update`
    sent_tools: Option<Arc<Vec<ToolDefinition>>>,
}

struct DispatcherInner {
    handlers: RwLock<HashMap<String, FunctionHandler>>,
    tools: RwLock<Arc<Vec<ToolDefinition>>>,
    pending: Mutex<Option<PendingFunctionCall>>,
    attachment: Mutex<Option<Attachment>>,
}

/// Cheaply cloneable; clones share handlers, tools and the pending slot.
#[derive(Clone)]
pub struct FunctionCallDispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for FunctionCallDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FunctionCallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionCallDispatcher")
            .field("tools", &self.inner.tools.read().len())
            .field("handlers", &self.inner.handlers.read().len())
            .field("pending", &*self.inner.pending.lock())
            .finish()
    }
}

impl FunctionCallDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                handlers: RwLock::new(HashMap::new()),
                tools: RwLock::new(Arc::new(Vec::new())),
                pending: Mutex::new(None),
                attachment: Mutex::new(None),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register `handler` under `name`; calls are matched by exact name.
    pub fn register(&self, name: impl Into<String>, handler: FunctionHandler) {
        self.inner.handlers.write().insert(name.into(), handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        let handler: FunctionHandler = Arc::new(
            move |args| -> Pin<Box<dyn Future<Output = FunctionResult> + Send>> {
                Box::pin(f(args))
            },
        );
        self.register(name, handler);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.inner.handlers.read().contains_key(name)
    }

    /// Replace the tool definitions advertised to the session.
    ///
    /// The set is pushed whenever the `Arc` differs from the one last sent;
    /// no diffing is done on the contents.
    pub fn set_tools(&self, tools: Arc<Vec<ToolDefinition>>) -> RealtimeResult<()> {
        *self.inner.tools.write() = tools;
        self.sync_tools()
    }

    pub fn tools(&self) -> Arc<Vec<ToolDefinition>> {
        self.inner.tools.read().clone()
    }

    fn sync_tools(&self) -> RealtimeResult<()> {
        let tools = self.tools();
        let mut attachment = self.inner.attachment.lock();
        let Some(attachment) = attachment.as_mut() else {
            return Ok(());
        };
        if tools.is_empty() {
            return Ok(());
        }
        if let Some(sent) = &attachment.sent_tools
            && Arc::ptr_eq(sent, &tools)
        {
            return Ok(());
        }

        attachment
            .bus
            .update_session(SessionUpdate::tools(tools.as_ref().clone()))?;
        info!(count = tools.len(), "Registered tools with session");
        attachment.sent_tools = Some(tools);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bus wiring
    // -------------------------------------------------------------------------

    /// Subscribe to `response.done` on `bus` and push the current tools.
    ///
    /// Replaces any previous attachment.
    pub fn attach(&self, bus: &EventBus) -> RealtimeResult<()> {
        self.detach();

        let weak: Weak<DispatcherInner> = Arc::downgrade(&self.inner);
        let subscription = bus.on(ServerEventKind::ResponseDone, move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let dispatcher = FunctionCallDispatcher { inner };
            let bus = dispatcher
                .inner
                .attachment
                .lock()
                .as_ref()
                .map(|attachment| attachment.bus.clone());
            if let Some(bus) = bus {
                dispatcher.handle_response_done(&bus, event);
            }
        });

        *self.inner.attachment.lock() = Some(Attachment {
            bus: bus.clone(),
            subscription,
            sent_tools: None,
        });

        self.sync_tools()
    }

    /// Unsubscribe from the current bus and forget any pending call.
    pub fn detach(&self) {
        if let Some(attachment) = self.inner.attachment.lock().take() {
            attachment.bus.off(attachment.subscription);
        }
        self.inner.pending.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.inner.attachment.lock().is_some()
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    pub fn is_processing(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    pub fn pending(&self) -> Option<PendingFunctionCall> {
        self.inner.pending.lock().clone()
    }

    /// React to a completed response.
    ///
    /// Returns the handle of the spawned execution task when a call was
    /// accepted. Must run inside a Tokio runtime.
    pub fn handle_response_done(
        &self,
        bus: &EventBus,
        event: &ServerEvent,
    ) -> Option<JoinHandle<()>> {
        let ServerEvent::ResponseDone { response } = event else {
            return None;
        };
        let item = response.first_function_call()?;

        let (Some(call_id), Some(name)) = (item.call_id.clone(), item.name.clone()) else {
            debug!(response_id = %response.id, "Function call item without call_id or name");
            return None;
        };

        let raw_arguments = item.arguments.as_deref().unwrap_or("{}");
        let arguments: Value = match serde_json::from_str(raw_arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                debug!(%call_id, %name, error = %e, "Dropping function call with malformed arguments");
                return None;
            }
        };

        let call = PendingFunctionCall {
            call_id,
            name,
            arguments,
        };

        {
            let mut pending = self.inner.pending.lock();
            if let Some(current) = pending.as_ref() {
                warn!(
                    call_id = %call.call_id,
                    pending_call_id = %current.call_id,
                    "Function call already in progress, ignoring new call"
                );
                return None;
            }
            *pending = Some(call.clone());
        }

        let handler = self.inner.handlers.read().get(&call.name).cloned();
        let dispatcher = self.clone();
        let bus = bus.clone();

        Some(tokio::spawn(async move {
            dispatcher.execute(&bus, call, handler).await;
        }))
    }

    async fn execute(
        &self,
        bus: &EventBus,
        call: PendingFunctionCall,
        handler: Option<FunctionHandler>,
    ) {
        debug!(call_id = %call.call_id, name = %call.name, "Executing function call");

        let result = match handler {
            Some(handler) => {
                let arguments = call.arguments.clone();
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler(arguments))) {
                    Ok(future) => AssertUnwindSafe(future)
                        .catch_unwind()
                        .await
                        .unwrap_or(Err(FunctionError::Panicked)),
                    Err(_) => Err(FunctionError::Panicked),
                }
            }
            None => Err(FunctionError::NotFound(call.name.clone())),
        };

        let delivery = match result {
            Ok(value) => bus
                .send_function_call_output(&call.call_id, &value)
                .and_then(|()| bus.create_response()),
            Err(err) => {
                warn!(call_id = %call.call_id, name = %call.name, error = %err, "Function call failed");
                bus.send_function_call_output(
                    &call.call_id,
                    &json!({ "error": FUNCTION_EXECUTION_FAILED }),
                )
            }
        };

        if let Err(e) = delivery {
            debug!(call_id = %call.call_id, error = %e, "Could not deliver function call result");
        }

        let mut pending = self.inner.pending.lock();
        if pending.as_ref().is_some_and(|p| p.call_id == call.call_id) {
            *pending = None;
        }
    }
}
