//! Method registry and request dispatch.
//!
//! A [`Dispatcher`] maps method names to async handlers. Registration happens
//! up front through `&mut self`; once the dispatcher is shared (usually in
//! an `Arc` owned by the server) it is only read, so concurrent dispatches
//! never contend on dispatcher state.
//!
//! Every request produces exactly one outcome:
//! - a [`Response`](protocol::Response) with the handler's result,
//! - an [`ErrorResponse`] with a stable [`ErrorCode`], or
//! - nothing, for notifications. Failed notifications are reported through
//!   the [`NotificationErrorHook`] instead.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use protocol::{ErrorCode, ErrorResponse, Kwargs, Message, Request, Value};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

type Handler = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

/// Callback invoked when a notification fails.
pub type NotificationErrorHook = Arc<dyn Fn(&NotificationFailure) + Send + Sync>;

/// Errors raised while building a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A method with this name is already registered.
    #[error("method already registered: {0}")]
    DuplicateMethod(String),

    /// Method names must be non-empty.
    #[error("invalid method name: {0:?}")]
    InvalidName(String),
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Domain-level failure, surfaced to the caller as `ApplicationError`.
    #[error("{message}")]
    Application {
        /// Description for the caller.
        message: String,
        /// Optional structured detail.
        data: Option<Value>,
    },

    /// The arguments were unusable, surfaced as `InvalidParams`.
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl HandlerError {
    /// Application failure with a message only.
    pub fn application(message: impl Into<String>) -> Self {
        HandlerError::Application {
            message: message.into(),
            data: None,
        }
    }

    /// Application failure with structured detail.
    pub fn application_with_data(message: impl Into<String>, data: Value) -> Self {
        HandlerError::Application {
            message: message.into(),
            data: Some(data),
        }
    }
}

/// A failed notification, as seen by the [`NotificationErrorHook`].
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationFailure {
    /// Method the notification targeted.
    pub method: String,
    /// Error kind.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

// ============================================================================
// Parameter contract
// ============================================================================

/// Declared call contract of a method.
///
/// Parameters are named so they can be bound by position or by keyword.
/// Arity and names are checked before the handler runs; a mismatch never
/// reaches handler code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSpec {
    required: Vec<String>,
    optional: Vec<String>,
    variadic: bool,
    extra_kwargs: bool,
}

impl ParamSpec {
    /// A method taking no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// A method accepting any arguments.
    pub fn any() -> Self {
        Self {
            variadic: true,
            extra_kwargs: true,
            ..Self::default()
        }
    }

    /// Append a required parameter.
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    /// Append an optional parameter. Optional parameters follow required ones.
    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.optional.push(name.into());
        self
    }

    /// Accept extra positional arguments after the named ones.
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Accept keyword arguments that match no named parameter.
    pub fn extra_kwargs(mut self) -> Self {
        self.extra_kwargs = true;
        self
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names().position(|n| n == name)
    }

    /// Check whether `request`'s arguments bind to this contract.
    pub fn check(&self, request: &Request) -> Result<(), String> {
        let named = self.required.len() + self.optional.len();
        if !self.variadic && request.args.len() > named {
            return Err(format!(
                "expected at most {} positional arguments, got {}",
                named,
                request.args.len()
            ));
        }

        for key in request.kwargs.keys() {
            match self.position(key) {
                Some(index) if index < request.args.len() => {
                    return Err(format!("got multiple values for argument '{}'", key));
                }
                Some(_) => {}
                None if self.extra_kwargs => {}
                None => return Err(format!("unexpected keyword argument '{}'", key)),
            }
        }

        for (index, name) in self.required.iter().enumerate() {
            if index >= request.args.len() && !request.kwargs.contains_key(name) {
                return Err(format!("missing required argument '{}'", name));
            }
        }
        Ok(())
    }
}

/// Arguments handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    method: String,
    args: Vec<Value>,
    kwargs: Kwargs,
}

impl Params {
    /// Bundle arguments for `method`.
    pub fn new(method: impl Into<String>, args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs,
        }
    }

    /// Name the method was invoked under.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Positional arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Keyword arguments.
    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    /// Positional arguments from `index` on (the variadic tail).
    pub fn rest(&self, index: usize) -> &[Value] {
        self.args.get(index..).unwrap_or(&[])
    }

    fn raw(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    /// Bind parameter `name` at position `index` and deserialize it.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, HandlerError> {
        let value = self
            .raw(index, name)
            .ok_or_else(|| HandlerError::InvalidParams(format!("missing argument '{}'", name)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| HandlerError::InvalidParams(format!("argument '{}': {}", name, e)))
    }

    /// Like [`Params::get`], but an absent argument is `None`.
    pub fn opt<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, HandlerError> {
        match self.raw(index, name) {
            None => Ok(None),
            Some(_) => self.get(index, name).map(Some),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MethodKind {
    Call,
    NotificationOnly,
}

#[derive(Clone)]
struct MethodEntry {
    spec: ParamSpec,
    kind: MethodKind,
    handler: Handler,
}

/// Method registry and request router.
#[derive(Clone, Default)]
pub struct Dispatcher {
    methods: HashMap<String, MethodEntry>,
    notification_hook: Option<NotificationErrorHook>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.method_names())
            .field("notification_hook", &self.notification_hook.is_some())
            .finish()
    }
}

fn box_handler<F, Fut>(handler: F) -> Handler
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(handler(params)) as HandlerFuture)
}

impl Dispatcher {
    /// An empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method.
    ///
    /// Fails with [`RegistryError::DuplicateMethod`] if `name` is taken.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        spec: ParamSpec,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.insert(name.into(), spec, MethodKind::Call, box_handler(handler))
    }

    /// Register a method that may only be invoked as a notification.
    ///
    /// Calling it with an id yields `InvalidRequest` without running it.
    pub fn register_notification<F, Fut>(
        &mut self,
        name: impl Into<String>,
        spec: ParamSpec,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped = move |params: Params| {
            let handler = handler.clone();
            async move { handler(params).await.map(|()| Value::Null) }
        };
        self.insert(
            name.into(),
            spec,
            MethodKind::NotificationOnly,
            box_handler(wrapped),
        )
    }

    /// Register a method, replacing any existing one of the same name.
    ///
    /// Returns `true` if a method was replaced.
    pub fn register_override<F, Fut>(
        &mut self,
        name: impl Into<String>,
        spec: ParamSpec,
        handler: F,
    ) -> Result<bool, RegistryError>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let replaced = self.unregister(&name);
        self.insert(name, spec, MethodKind::Call, box_handler(handler))?;
        Ok(replaced)
    }

    fn insert(
        &mut self,
        name: String,
        spec: ParamSpec,
        kind: MethodKind,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::InvalidName(name));
        }
        if self.methods.contains_key(&name) {
            return Err(RegistryError::DuplicateMethod(name));
        }
        debug!(method = %name, "registered method");
        self.methods.insert(
            name,
            MethodEntry {
                spec,
                kind,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a method. Returns `true` if it existed.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    /// Expose every method of `other` under `prefix` + its name.
    ///
    /// Nothing is added if any prefixed name is already taken.
    pub fn mount(&mut self, prefix: &str, other: Dispatcher) -> Result<(), RegistryError> {
        if let Some(taken) = other
            .methods
            .keys()
            .map(|name| format!("{}{}", prefix, name))
            .find(|name| self.methods.contains_key(name))
        {
            return Err(RegistryError::DuplicateMethod(taken));
        }
        for (name, entry) in other.methods {
            self.methods.insert(format!("{}{}", prefix, name), entry);
        }
        Ok(())
    }

    /// Install the callback for failed notifications.
    pub fn set_notification_hook(&mut self, hook: NotificationErrorHook) {
        self.notification_hook = Some(hook);
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Route `request` to its handler and build the reply.
    ///
    /// Returns `None` for notifications. Handler panics are contained and
    /// reported as `InternalError`.
    pub async fn dispatch(&self, request: Request) -> Option<Message> {
        debug!(method = %request.method, id = ?request.id, "dispatching request");

        let outcome = self.invoke(&request).await;
        match (request.id.clone(), outcome) {
            (Some(id), Ok(result)) => Some(Message::Response(protocol::Response { id, result })),
            (Some(id), Err((code, message, data))) => Some(Message::Error(ErrorResponse::new(
                Some(id),
                code,
                message,
                data,
            ))),
            (None, Ok(_)) => None,
            (None, Err((code, message, _))) => {
                warn!(method = %request.method, code = code.code(), %message, "notification failed");
                if let Some(hook) = &self.notification_hook {
                    hook(&NotificationFailure {
                        method: request.method.clone(),
                        code,
                        message,
                    });
                }
                None
            }
        }
    }

    async fn invoke(&self, request: &Request) -> Result<Value, (ErrorCode, String, Option<Value>)> {
        if let Err(reason) = request.validate() {
            return Err((ErrorCode::InvalidRequest, reason, None));
        }

        let entry = self.methods.get(&request.method).ok_or_else(|| {
            (
                ErrorCode::MethodNotFound,
                format!("Method not found: {}", request.method),
                None,
            )
        })?;

        if entry.kind == MethodKind::NotificationOnly && !request.is_notification() {
            return Err((
                ErrorCode::InvalidRequest,
                format!("method '{}' only accepts notifications", request.method),
                None,
            ));
        }

        entry
            .spec
            .check(request)
            .map_err(|reason| (ErrorCode::InvalidParams, reason, None))?;

        let params = Params::new(
            request.method.clone(),
            request.args.clone(),
            request.kwargs.clone(),
        );
        // Invoked inside the task so a panic before the future exists is caught too
        let handler = entry.handler.clone();
        let task = tokio::spawn(async move { handler(params).await });

        match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(HandlerError::Application { message, data })) => {
                Err((ErrorCode::ApplicationError, message, data))
            }
            Ok(Err(HandlerError::InvalidParams(reason))) => {
                Err((ErrorCode::InvalidParams, reason, None))
            }
            Err(join_error) => {
                error!(method = %request.method, error = %join_error, "handler did not complete");
                Err((
                    ErrorCode::InternalError,
                    ErrorCode::InternalError.default_message().to_string(),
                    None,
                ))
            }
        }
    }
}
