//! ADDRESS dispatch: host-supplied command targets.
//!
//! Provides:
//! - **[`AddressHandler`]**: the async callback a host implements
//! - **[`AddressTarget`]**: a named handler plus its advertised methods,
//!   metadata and interpolation setting
//! - **[`AddressRegistry`]**: case-insensitive name lookup
//! - **[`Response`]**: the result envelope every dispatch produces
//!
//! Handlers receive the interpolated message, a snapshot of the visible
//! variables and a [`SourceContext`] describing where the command came
//! from. Errors a handler returns are turned into a failure envelope with
//! `errorType: "Error"` and `operation: "handler_execution"`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::value::Value;

// ---------------------------------------------------------------------------
//  Requests
// ---------------------------------------------------------------------------

/// Which construct produced a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    /// A clause that is not an instruction, sent to the active target.
    Instruction,
    /// `ADDRESS target "command"`
    Command,
    /// `ADDRESS target LINES(n)`
    Lines,
    /// `<<DELIM` heredoc payload.
    Heredoc,
    /// `LET x = method p=v ...`
    Method,
}

/// Where a dispatched command came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceContext {
    /// Line of the command.
    pub line: u32,
    pub kind: DispatchKind,
    /// Method name for [`DispatchKind::Method`] dispatches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Evaluated named parameters for [`DispatchKind::Method`] dispatches.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
    /// Script name, when the host supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// Everything a handler gets for one command.
#[derive(Debug, Clone)]
pub struct AddressRequest {
    /// Target name as registered.
    pub target: String,
    /// Command text after interpolation.
    pub message: String,
    /// Variables visible at the dispatch site.
    pub context: BTreeMap<String, Value>,
    pub source: SourceContext,
}

impl AddressRequest {
    /// Look up a context variable case-insensitively.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.context
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Look up a method parameter case-insensitively.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.source
            .params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

// ---------------------------------------------------------------------------
//  Responses
// ---------------------------------------------------------------------------

/// Error type a handler returns.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(rexx::address::handler))]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result envelope of one ADDRESS dispatch.
///
/// Serializes with camelCase keys and metadata flattened into the top
/// level, e.g. `{"success":false,"message":"...","errorType":"Error",
/// "operation":"handler_execution","timestamp":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// RFC 3339 creation time.
    pub timestamp: String,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

impl Response {
    fn new(success: bool) -> Self {
        Self {
            success,
            result: None,
            message: None,
            error_type: None,
            operation: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata: BTreeMap::new(),
        }
    }

    /// Success with a result value.
    pub fn success(result: impl Into<Value>) -> Self {
        Self {
            result: Some(result.into()),
            ..Self::new(true)
        }
    }

    /// Success without a result.
    pub fn ok() -> Self {
        Self::new(true)
    }

    /// Failure envelope.
    pub fn failure(
        message: impl Into<String>,
        error_type: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            message: Some(message.into()),
            error_type: Some(error_type.into()),
            operation: Some(operation.into()),
            ..Self::new(false)
        }
    }

    /// The envelope for an error raised inside a handler.
    pub fn handler_error(error: &HandlerError) -> Self {
        Self::failure(error.message.clone(), "Error", "handler_execution")
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The envelope as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// The envelope as a script value (an object).
    pub fn to_value(&self) -> Value {
        Value::from_json(self.to_json())
    }
}

// ---------------------------------------------------------------------------
//  Handlers and targets
// ---------------------------------------------------------------------------

/// Future returned by a handler. Interpreters are single-threaded, so the
/// future need not be `Send`.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + 'a>>;

/// A host callback for one ADDRESS target.
pub trait AddressHandler {
    fn handle(&self, request: AddressRequest) -> HandlerFuture<'_>;
}

impl<F, Fut> AddressHandler for F
where
    F: Fn(AddressRequest) -> Fut,
    Fut: Future<Output = Result<Response, HandlerError>> + 'static,
{
    fn handle(&self, request: AddressRequest) -> HandlerFuture<'_> {
        Box::pin(self(request))
    }
}

/// A registered ADDRESS target.
#[derive(Clone)]
pub struct AddressTarget {
    name: String,
    handler: Rc<dyn AddressHandler>,
    methods: Vec<String>,
    metadata: BTreeMap<String, String>,
    interpolate: bool,
}

impl AddressTarget {
    pub fn new(name: impl Into<String>, handler: impl AddressHandler + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Rc::new(handler),
            methods: Vec::new(),
            metadata: BTreeMap::new(),
            interpolate: true,
        }
    }

    /// Restrict method-style calls to these names. With no methods listed,
    /// any method name is passed through.
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Send payloads verbatim, without `{var}` substitution.
    pub fn without_interpolation(mut self) -> Self {
        self.interpolate = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn interpolates(&self) -> bool {
        self.interpolate
    }

    pub fn accepts_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Run the handler, converting a handler error into the failure
    /// envelope.
    pub async fn dispatch(&self, request: AddressRequest) -> Response {
        match self.handler.handle(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(target_name = %self.name, error = %err, "ADDRESS handler failed");
                Response::handler_error(&err)
            }
        }
    }
}

impl fmt::Debug for AddressTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressTarget")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("metadata", &self.metadata)
            .field("interpolate", &self.interpolate)
            .finish_non_exhaustive()
    }
}

/// Registered targets by lowercase name.
#[derive(Debug, Clone, Default)]
pub struct AddressRegistry {
    targets: HashMap<String, AddressTarget>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target, returning any target it replaces.
    pub fn register(&mut self, target: AddressTarget) -> Option<AddressTarget> {
        self.targets.insert(target.name.to_ascii_lowercase(), target)
    }

    pub fn get(&self, name: &str) -> Option<&AddressTarget> {
        self.targets.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.values().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}
