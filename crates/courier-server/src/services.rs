//! Named service table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use courier_common::{Result, RpcError};

pub type ServiceFuture = BoxFuture<'static, Result<Value>>;

/// A service takes the call's positional arguments and yields its result.
pub type Service = Arc<dyn Fn(Vec<Value>) -> ServiceFuture + Send + Sync>;

/// Services a server exposes, looked up by name on every call.
#[derive(Clone, Default)]
pub struct Services {
    table: HashMap<String, Service>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) `name`.
    pub fn insert<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.table
            .insert(name.into(), Arc::new(move |args| f(args).boxed()));
        self
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.insert(name, f);
        self
    }

    /// Adds every service of `other`, replacing same-named ones.
    pub fn extend(&mut self, other: Services) {
        self.table.extend(other.table);
    }

    pub fn get(&self, name: &str) -> Option<Service> {
        self.table.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Runs `name` with `args`, failing with `ServiceNotFound` when absent.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match self.get(name) {
            Some(service) => service(args).await,
            None => Err(not_found(name)),
        }
    }
}

pub(crate) fn not_found(name: &str) -> RpcError {
    RpcError::ServiceNotFound(format!("no such service: {}.", name))
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").field("names", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plus(args: Vec<Value>) -> impl Future<Output = Result<Value>> {
        async move {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        }
    }

    #[tokio::test]
    async fn test_call_by_name() {
        let services = Services::new().with("plus", plus);
        assert_eq!(services.call("plus", vec![json!(1), json!(2)]).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_missing_service() {
        let err = Services::new().call("missing", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::ServiceNotFound(_)));
        assert_eq!(err.to_string(), "no such service: missing.");
    }

    #[tokio::test]
    async fn test_extend_replaces_same_name() {
        let mut services = Services::new()
            .with("ping", |_| async { Ok(json!("pong")) })
            .with("plus", plus);
        services.extend(Services::new().with("ping", |_| async { Ok(json!("PONG")) }));

        assert_eq!(services.names(), vec!["ping", "plus"]);
        assert_eq!(services.len(), 2);
        assert_eq!(services.call("ping", vec![]).await.unwrap(), json!("PONG"));
    }
}
