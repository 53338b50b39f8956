//! Map-based procedure registry.
//!
//! A small [`ProcedureGateway`] that looks procedures up by exact path. It is
//! enough to drive the demo server and the tests; anything richer plugs in
//! through the gateway trait instead.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{Stream, StreamExt};
use futures_util::FutureExt;
use serde_json::Value;

use super::error::RpcError;
use super::gateway::{ProcedureCall, ProcedureGateway, ProcedureOutput};
use super::wire::ProcedureKind;

type Resolver<C> =
    Arc<dyn Fn(Arc<C>, Option<Value>) -> BoxFuture<'static, Result<ProcedureOutput, RpcError>> + Send + Sync>;

struct Procedure<C> {
    kind: ProcedureKind,
    resolver: Resolver<C>,
}

/// Procedures keyed by path.
pub struct ProcedureRouter<C> {
    procedures: HashMap<String, Procedure<C>>,
}

impl<C> Default for ProcedureRouter<C> {
    fn default() -> Self {
        Self {
            procedures: HashMap::new(),
        }
    }
}

impl<C: Send + Sync + 'static> ProcedureRouter<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a procedure returning a raw [`ProcedureOutput`].
    pub fn procedure<F, Fut>(mut self, kind: ProcedureKind, path: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<C>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProcedureOutput, RpcError>> + Send + 'static,
    {
        let resolver: Resolver<C> = Arc::new(move |ctx, input| f(ctx, input).boxed());
        self.procedures
            .insert(path.into(), Procedure { kind, resolver });
        self
    }

    pub fn query<F, Fut>(self, path: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<C>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.procedure(ProcedureKind::Query, path, move |ctx, input| {
            f(ctx, input).map(|r| r.map(ProcedureOutput::Data))
        })
    }

    pub fn mutation<F, Fut>(self, path: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<C>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.procedure(ProcedureKind::Mutation, path, move |ctx, input| {
            f(ctx, input).map(|r| r.map(ProcedureOutput::Data))
        })
    }

    /// Register a subscription. The factory runs once per subscribe call.
    pub fn subscription<F, S>(self, path: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<C>, Option<Value>) -> Result<S, RpcError> + Send + Sync + 'static,
        S: Stream<Item = Result<Value, RpcError>> + Send + 'static,
    {
        self.procedure(ProcedureKind::Subscription, path, move |ctx, input| {
            let output = f(ctx, input).map(|s| ProcedureOutput::Stream(s.boxed()));
            std::future::ready(output)
        })
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

impl<C: Send + Sync + 'static> ProcedureGateway<C> for ProcedureRouter<C> {
    fn call(
        &self,
        ctx: Arc<C>,
        call: ProcedureCall,
    ) -> BoxFuture<'static, Result<ProcedureOutput, RpcError>> {
        match self.procedures.get(&call.path) {
            Some(procedure) if procedure.kind == call.kind => (procedure.resolver)(ctx, call.input),
            _ => {
                let err = RpcError::not_found(format!(
                    "No \"{}\"-procedure on path \"{}\"",
                    call.kind, call.path
                ));
                std::future::ready(Err(err)).boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error::ErrorCode;
    use serde_json::json;

    fn router() -> ProcedureRouter<()> {
        ProcedureRouter::new()
            .query("echo", |_ctx, input| async move {
                Ok::<_, RpcError>(input.unwrap_or(Value::Null))
            })
            .subscription("count", |_ctx, _input| {
                Ok(futures_util::stream::iter(vec![Ok(json!(1)), Ok(json!(2))]))
            })
    }

    fn call(kind: ProcedureKind, path: &str, input: Option<Value>) -> ProcedureCall {
        ProcedureCall {
            path: path.to_string(),
            kind,
            input,
        }
    }

    #[tokio::test]
    async fn test_query_dispatch() {
        let out = router()
            .call(Arc::new(()), call(ProcedureKind::Query, "echo", Some(json!("hi"))))
            .await
            .unwrap();
        assert!(matches!(out, ProcedureOutput::Data(v) if v == json!("hi")));
    }

    #[tokio::test]
    async fn test_subscription_dispatch() {
        let out = router()
            .call(Arc::new(()), call(ProcedureKind::Subscription, "count", None))
            .await
            .unwrap();
        let ProcedureOutput::Stream(stream) = out else {
            panic!("expected a stream");
        };
        let items: Vec<_> = stream.map(Result::unwrap).collect().await;
        assert_eq!(items, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_not_found() {
        let err = router()
            .call(Arc::new(()), call(ProcedureKind::Mutation, "echo", None))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.message, "No \"mutation\"-procedure on path \"echo\"");
    }

    #[test]
    fn test_paths_sorted() {
        assert_eq!(router().paths(), vec!["count", "echo"]);
        assert_eq!(router().len(), 2);
    }
}
