//! Method tables: the handlers a server routes requests to.

use courier_core::RemoteError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// What a handler eventually produces.
pub type HandlerResult = Result<Value, RemoteError>;

pub(crate) type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Named handlers, built with [`MethodTable::method`].
///
/// ```rust,ignore
/// let methods = MethodTable::new()
///     .method("ping", |_args| async { Ok(json!("pong")) })
///     .method("save", move |args| {
///         let history = history.clone();
///         async move { history.save(&args[0]).await }
///     });
/// ```
#[derive(Clone, Default)]
pub struct MethodTable {
    handlers: BTreeMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an async handler. Arguments arrive already checked against the
    /// contract's declared arity and types.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn handlers_run_with_their_arguments() {
        let table = MethodTable::new()
            .method("echo", |args| async move { Ok(Value::Array(args)) })
            .method("fail", |_| async { Err(RemoteError::handler("no antenna")) });

        assert_eq!(table.names().collect::<Vec<_>>(), vec!["echo", "fail"]);

        let echo = table.get("echo").unwrap();
        assert_eq!(echo(vec![json!(1), json!("a")]).await.unwrap(), json!([1, "a"]));

        let fail = table.get("fail").unwrap();
        assert_eq!(fail(vec![]).await.unwrap_err().message, "no antenna");
        assert!(table.get("missing").is_none());
    }
}
