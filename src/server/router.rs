//! Request routing
//!
//! Routes are registered up front through [`RouterBuilder`] and matched on
//! the exact decoded path. Unknown paths get 404; a known path requested
//! with an unregistered method gets 405 with an `Allow` header.

use std::collections::HashMap;
use std::sync::Arc;

use crate::http::connection::{Application, BoxFuture};
use crate::http::context::HttpContext;
use crate::http::request::Method;
use crate::http::response::StatusCode;

/// A route handler
pub type Handler =
    Arc<dyn for<'a> Fn(&'a mut HttpContext) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct Route {
    handlers: Vec<(Method, Handler)>,
}

impl Route {
    fn allow(&self) -> String {
        self.handlers
            .iter()
            .map(|(method, _)| method.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Routing table implementing [`Application`]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    fn find(&self, method: &Method, path: &str) -> Result<Handler, Option<String>> {
        let Some(route) = self.routes.get(path) else {
            return Err(None);
        };
        route
            .handlers
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, handler)| Arc::clone(handler))
            .ok_or_else(|| Some(route.allow()))
    }
}

impl Application for Router {
    fn process_request<'a>(&'a self, ctx: &'a mut HttpContext) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            match self.find(ctx.method(), ctx.path()) {
                Ok(handler) => handler(ctx).await,
                Err(None) => {
                    tracing::debug!(path = %ctx.path(), "no route");
                    ctx.set_status(StatusCode::NOT_FOUND)?;
                    Ok(())
                }
                Err(Some(allow)) => {
                    ctx.set_status(StatusCode::METHOD_NOT_ALLOWED)?;
                    ctx.response_headers_mut()?.insert("Allow", allow);
                    Ok(())
                }
            }
        })
    }
}

/// Builder for [`Router`]
///
/// # Example
///
/// ```
/// use keel::http::connection::BoxFuture;
/// use keel::http::context::HttpContext;
/// use keel::http::request::Method;
/// use keel::server::router::Router;
///
/// fn health(ctx: &mut HttpContext) -> BoxFuture<'_, anyhow::Result<()>> {
///     Box::pin(async move {
///         ctx.write(b"ok").await?;
///         Ok(())
///     })
/// }
///
/// let router = Router::builder().route(Method::GET, "/health", health).build();
/// assert_eq!(router.len(), 1);
/// ```
#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<String, Route>,
}

impl RouterBuilder {
    /// Registers `handler` for `method` on `path`. A later registration of
    /// the same pair replaces the earlier one.
    pub fn route<F>(mut self, method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut HttpContext) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let route = self.routes.entry(path.into()).or_default();
        route.handlers.retain(|(m, _)| *m != method);
        route.handlers.push((method, Arc::new(handler)));
        self
    }

    pub fn build(self) -> Router {
        Router {
            routes: self.routes,
        }
    }
}

impl Router {
    /// Number of registered (method, path) pairs
    pub fn len(&self) -> usize {
        self.routes.values().map(|r| r.handlers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
