//! Route Registration
//!
//! A [`Route`] pairs an endpoint name with an asynchronous handler. Routes
//! are immutable once constructed and live for the process lifetime after
//! insertion into a [`RouteTable`].
//!
//! The table is owned by one server instance and frozen at setup time; it is
//! read-only-shared across connection tasks afterwards, so no lock guards it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::IpcError;
use crate::request::Request;

/// Boxed future returned by route handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), IpcError>> + Send>>;

/// An asynchronous route callback.
///
/// Implemented for every `Fn(Request) -> Future` closure; the asynchronous
/// requirement of the protocol is enforced by the type system rather than a
/// runtime check.
pub trait Handler: Send + Sync + 'static {
    /// Invoke the handler for one request.
    fn call(&self, request: Request) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), IpcError>> + Send + 'static,
{
    fn call(&self, request: Request) -> HandlerFuture {
        Box::pin((self)(request))
    }
}

/// A named, registered route.
///
/// The name is always prefixed with `/`. Fields are private; a route cannot
/// be mutated after construction.
#[derive(Clone)]
pub struct Route {
    name: String,
    handler: Arc<dyn Handler>,
}

impl Route {
    /// Create a route, normalizing the name.
    ///
    /// A missing leading `/` is prepended.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Config`] when the name is empty.
    pub fn new<H: Handler>(name: impl Into<String>, handler: H) -> Result<Self, IpcError> {
        let mut name = name.into();
        if name.is_empty() {
            return Err(IpcError::Config(
                "cannot have an empty route name".to_string(),
            ));
        }
        if !name.starts_with('/') {
            name.insert(0, '/');
        }
        Ok(Self {
            name,
            handler: Arc::new(handler),
        })
    }

    /// The route name, always prefixed with `/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the route's handler with a request.
    pub fn call(&self, request: Request) -> HandlerFuture {
        self.handler.call(request)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route").field("name", &self.name).finish()
    }
}

/// Endpoint-name-keyed collection of routes.
///
/// Keys are case-sensitive and unique; inserting a route under an existing
/// name replaces the previous registration (last one wins).
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route, returning the displaced registration if the name was
    /// already taken.
    pub fn insert(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.name.clone(), route)
    }

    /// Look up a route by endpoint name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    /// Whether an endpoint name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Iterate over the registered endpoint names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}
