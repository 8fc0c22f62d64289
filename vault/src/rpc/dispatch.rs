use super::jsonrpc::{Request, Response, RpcError};
use super::plugins::{PluginStorage, VaultPlugin};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

pub type MethodResult = Result<Value, RpcError>;
pub type BoxedMethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;

/// One dispatchable method. Implementations are registered by name; the
/// dispatcher clones the `Arc` out of its table before awaiting so slow
/// methods never hold the table lock.
pub trait RpcMethod: Send + Sync {
    fn call(&self, params: Option<Value>, ctx: RequestContext) -> BoxedMethodFuture;
}

pub struct MethodFn<F>(F);

impl<F, Fut> RpcMethod for MethodFn<F>
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    fn call(&self, params: Option<Value>, ctx: RequestContext) -> BoxedMethodFuture {
        Box::pin((self.0)(params, ctx))
    }
}

/// Wrap an async closure as an [`RpcMethod`].
pub fn method<F, Fut>(f: F) -> MethodFn<F>
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    MethodFn(f)
}

/// Per-request context handed to methods: the calling peer, the plugin
/// storage when the method belongs to a plugin, and a handle onto the
/// carrying connection for methods that push notifications (PTY output).
#[derive(Clone, Default)]
pub struct RequestContext {
    pub peer: Option<SocketAddr>,
    pub storage: Option<PluginStorage>,
    pub connection: Option<crate::transport::server::ConnectionHandle>,
}

impl RequestContext {
    pub fn new(peer: SocketAddr) -> Self {
        RequestContext {
            peer: Some(peer),
            storage: None,
            connection: None,
        }
    }

    #[cfg(test)]
    pub fn test_context() -> Self {
        RequestContext::default()
    }
}

/// Table-driven method dispatch.
#[derive(Default)]
pub struct Dispatcher {
    methods: RwLock<HashMap<String, Arc<dyn RpcMethod>>>,
    plugins: RwLock<Vec<String>>,
    plugin_storage: RwLock<HashMap<String, PluginStorage>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_method(&self, name: &str, handler: Arc<dyn RpcMethod>) {
        self.methods
            .write()
            .unwrap()
            .insert(name.to_string(), handler);
    }

    /// Copy a plugin's method table into the dispatcher under the
    /// `<plugin>.<method>` prefix.
    pub fn register_plugin(&self, plugin: &dyn VaultPlugin) {
        for (name, handler) in plugin.methods() {
            self.add_method(&format!("{}.{name}", plugin.name()), handler);
        }
        self.plugins.write().unwrap().push(plugin.name().to_string());
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.read().unwrap().clone()
    }

    /// Storage map for the plugin owning `method`, created on first use.
    fn storage_for(&self, method: &str) -> Option<PluginStorage> {
        let plugin = method.split_once('.')?.0.to_string();
        let mut storage = self.plugin_storage.write().unwrap();
        Some(storage.entry(plugin).or_default().clone())
    }

    /// Run one request. Returns `None` for notifications, which MUST NOT
    /// be answered.
    pub async fn dispatch(&self, request: Request, mut ctx: RequestContext) -> Option<Response> {
        let handler = self.methods.read().unwrap().get(&request.method).cloned();

        let Some(handler) = handler else {
            if request.is_notification() {
                debug!(method = %request.method, "dropping notification for unknown method");
                return None;
            }
            let error = RpcError::MethodNotFound(request.method.clone());
            return Some(Response::failure(request.id, &error));
        };

        ctx.storage = self.storage_for(&request.method);

        let outcome = handler.call(request.params.clone(), ctx).await;

        if request.is_notification() {
            if let Err(err) = outcome {
                warn!(method = %request.method, %err, "notification handler failed");
            }
            return None;
        }

        let id = request.id.expect("non-notification carries an id");
        Some(match outcome {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::failure(Some(id), &error),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::jsonrpc::METHOD_NOT_FOUND;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new();
        dispatcher.add_method(
            "echo",
            Arc::new(method(|params: Option<Value>, _ctx| async move {
                Ok(params.unwrap_or(Value::Null))
            })),
        );
        dispatcher
    }

    #[tokio::test]
    async fn test_dispatch_calls_registered_method() {
        let dispatcher = echo_dispatcher();
        let request = Request::new("echo", json!({"x": 1}), 1);

        let response = dispatcher
            .dispatch(request, RequestContext::test_context())
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_method_reports_method_not_found() {
        let dispatcher = echo_dispatcher();
        let request = Request::new("nope", json!(null), 2);

        let response = dispatcher
            .dispatch(request, RequestContext::test_context())
            .await
            .unwrap();
        assert_eq!(response.error.as_ref().unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notifications_are_never_answered() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let dispatcher = Dispatcher::new();
        dispatcher.add_method(
            "tick",
            Arc::new(method(|_params, _ctx| async {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })),
        );

        let known = Request::notification("tick", json!(null));
        assert!(dispatcher
            .dispatch(known, RequestContext::test_context())
            .await
            .is_none());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        let unknown = Request::notification("missing", json!(null));
        assert!(dispatcher
            .dispatch(unknown, RequestContext::test_context())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_object() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_method(
            "fails",
            Arc::new(method(|_params, _ctx| async {
                Err(RpcError::InvalidParams("expected a list".into()))
            })),
        );

        let response = dispatcher
            .dispatch(
                Request::new("fails", json!(null), 3),
                RequestContext::test_context(),
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);
    }
}
