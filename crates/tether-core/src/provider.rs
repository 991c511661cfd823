//! The local object graph a remote peer may call into.
//!
//! Rust has no runtime reflection, so a `Provider` is an explicit registry:
//! a tree of named members built once through the builder methods below.
//! Incoming calls name a member by dotted path (`"nested.double"`), which
//! [`Provider::resolve`] walks one segment at a time, applying the guards in
//! [`crate::path`] before every lookup.
//!
//! # Example
//!
//! ```
//! use tether::{Provider, RemoteError};
//!
//! let provider = Provider::new()
//!     .sync_method("plus", |(x, y): (f64, f64)| Ok::<_, RemoteError>(x + y))
//!     .object(
//!         "nested",
//!         Provider::new().sync_method("double", |(x,): (f64,)| Ok::<_, RemoteError>(x * 2.0)),
//!     );
//!
//! assert!(provider.resolve("nested.double").is_ok());
//! assert!(provider.resolve("nested._double").is_err());
//! ```
//!
//! Handlers are plain closures; state they need (the "this" of a method) is
//! captured by the closure, typically behind an `Arc`.

use crate::error::RemoteError;
use crate::path;
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Future returned by a registered handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, RemoteError>>;

/// A callable member: receives the argument values of a Call.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
enum Member {
    Function(Handler),
    Object(Provider),
}

/// Registry of functions and nested objects exposed to the remote side.
#[derive(Clone, Default)]
pub struct Provider {
    members: BTreeMap<String, Member>,
}

impl Provider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler working on raw argument values.
    pub fn function<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        self.members.insert(name.into(), Member::Function(handler));
        self
    }

    /// Register an async handler whose arguments arrive as a typed tuple.
    ///
    /// A call whose parameters do not deserialize into `A` fails with a
    /// `TypeError` without running the handler.
    pub fn method<A, R, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RemoteError>> + Send + 'static,
    {
        self.function(name, move |args| {
            let pending = decode_arguments::<A>(args).map(&handler);
            async move {
                let ret = pending?.await?;
                Ok(serde_json::to_value(ret)?)
            }
        })
    }

    /// Register a synchronous handler; the engine awaits it like any other.
    pub fn sync_method<A, R, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Result<R, RemoteError> + Send + Sync + 'static,
    {
        self.function(name, move |args| {
            let ret = decode_arguments::<A>(args)
                .and_then(&handler)
                .and_then(|ret| serde_json::to_value(ret).map_err(RemoteError::from));
            futures::future::ready(ret)
        })
    }

    /// Register a nested object reachable as `name.<member>`.
    pub fn object(mut self, name: impl Into<String>, child: Provider) -> Self {
        self.members.insert(name.into(), Member::Object(child));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Every registered function, as sorted dotted paths.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, base: &str, out: &mut Vec<String>) {
        for (name, member) in &self.members {
            let full = path::join(base, name);
            match member {
                Member::Function(_) => out.push(full),
                Member::Object(child) => child.collect_paths(&full, out),
            }
        }
    }

    /// Walk `listener` and return the function it names.
    pub fn resolve(&self, listener: &str) -> Result<Handler, RemoteError> {
        path::check_listener(listener)?;
        let segments: Vec<&str> = listener.split('.').collect();
        let mut current = self;

        for (index, segment) in segments.iter().enumerate() {
            let last = index + 1 == segments.len();

            match current.members.get(*segment) {
                Some(Member::Object(child)) if !last => current = child,
                Some(Member::Function(handler)) if last => return Ok(handler.clone()),
                Some(Member::Object(_)) => {
                    return Err(RemoteError::type_error(format!(
                        "Provider.{} is not a function",
                        listener
                    )))
                }
                Some(Member::Function(_)) => {
                    return Err(RemoteError::type_error(format!(
                        "Provider.{}: cannot access members of a function",
                        listener
                    )))
                }
                None if last && *segment == "toString" => {
                    return Err(RemoteError::security(format!(
                        "Function.toString() is not allowed: Provider.{}()",
                        listener
                    )))
                }
                None => {
                    return Err(RemoteError::type_error(format!(
                        "Provider.{} is not a function",
                        listener
                    )))
                }
            }
        }

        Err(RemoteError::type_error(format!(
            "Provider.{} is not a function",
            listener
        )))
    }

    /// Resolve `listener` and start its handler.
    ///
    /// Resolution and the synchronous part of the handler run before this
    /// returns; the returned future drives the rest. A panicking handler,
    /// at either stage, becomes a `Panic` failure.
    pub fn start(&self, listener: &str, args: Vec<Value>) -> HandlerFuture {
        let handler = match self.resolve(listener) {
            Ok(handler) => handler,
            Err(e) => return futures::future::ready(Err(e)).boxed(),
        };
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(future) => future,
            Err(payload) => return futures::future::ready(Err(panic_failure(payload))).boxed(),
        };

        AssertUnwindSafe(future)
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|payload| Err(panic_failure(payload))))
            .boxed()
    }

    /// Resolve and run `listener` to completion.
    pub async fn invoke(&self, listener: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        self.start(listener, args).await
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("functions", &self.paths())
            .finish()
    }
}

/// Decode a parameter list into the handler's argument tuple.
///
/// An empty list also decodes as `()`.
fn decode_arguments<A: DeserializeOwned>(args: Vec<Value>) -> Result<A, RemoteError> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(parsed) => Ok(parsed),
        Err(_) if empty => serde_json::from_value(Value::Null).map_err(|e| {
            RemoteError::type_error(format!("invalid arguments: {}", e))
        }),
        Err(e) => Err(RemoteError::type_error(format!("invalid arguments: {}", e))),
    }
}

fn panic_failure(payload: Box<dyn std::any::Any + Send>) -> RemoteError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    RemoteError::new("Panic", message)
}

/// The Provider a Communicator currently serves.
///
/// `Unspecified` ("not set yet") and `Absent` ("explicitly none") fail
/// incoming calls with different messages.
#[derive(Debug, Clone, Default)]
pub enum ProviderSlot {
    #[default]
    Unspecified,
    Absent,
    Present(Arc<Provider>),
}

impl ProviderSlot {
    pub fn get(&self) -> Result<&Arc<Provider>, RemoteError> {
        match self {
            ProviderSlot::Present(provider) => Ok(provider),
            ProviderSlot::Unspecified => Err(RemoteError::error(
                "the provider is not specified yet",
            )),
            ProviderSlot::Absent => Err(RemoteError::error("the provider is null")),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, ProviderSlot::Present(_))
    }
}

impl From<Provider> for ProviderSlot {
    fn from(provider: Provider) -> Self {
        ProviderSlot::Present(Arc::new(provider))
    }
}

impl From<Arc<Provider>> for ProviderSlot {
    fn from(provider: Arc<Provider>) -> Self {
        ProviderSlot::Present(provider)
    }
}

impl From<Option<Provider>> for ProviderSlot {
    fn from(provider: Option<Provider>) -> Self {
        match provider {
            Some(provider) => provider.into(),
            None => ProviderSlot::Absent,
        }
    }
}
