//! Registration-time dispatch tables.
//!
//! Each handler type registers its callable methods once, by name, with a
//! typed argument tuple. Inbound requests are resolved case-insensitively,
//! checked against the declared arity, decoded into the tuple, and invoked.
//! Method bodies return `anyhow::Result`; errors and panics become
//! [`ResolveError`]s and never escape to the receive loop.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use socketry_core::ResolveError;
use tracing::warn;

use crate::handler::HandlerContext;

/// Outcome of one invocation. `Ok(None)` means no reply is sent.
pub type InvokeResult = Result<Option<Value>, ResolveError>;

/// Result of calling a registered method: available now, or after awaiting.
pub enum Invocation {
    /// Completed synchronously (sync methods and every resolve failure).
    Ready(InvokeResult),
    /// Completes once the method's future resolves.
    Deferred(BoxFuture<'static, InvokeResult>),
}

impl Invocation {
    /// Drive the invocation to completion.
    pub async fn resolve(self) -> InvokeResult {
        match self {
            Self::Ready(result) => result,
            Self::Deferred(future) => future.await,
        }
    }

    /// Whether the result still has to be awaited.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

/// Positional argument list decodable into a typed tuple.
///
/// Implemented for tuples of up to six `DeserializeOwned` elements; `ARITY`
/// is the tuple length and is checked before decoding.
pub trait FromArguments: Sized + Send + 'static {
    /// Declared parameter count.
    const ARITY: usize;

    /// Decode `arguments`, which must hold exactly [`Self::ARITY`] values.
    fn from_arguments(method: &str, arguments: Vec<Value>) -> Result<Self, ResolveError>;
}

fn decode_argument<T: DeserializeOwned>(
    method: &str,
    index: usize,
    value: Value,
) -> Result<T, ResolveError> {
    serde_json::from_value(value).map_err(|source| ResolveError::InvalidArgument {
        method: method.to_owned(),
        index,
        source,
    })
}

macro_rules! impl_from_arguments {
    ($arity:literal; $($ty:ident $idx:tt),*) => {
        impl<$($ty: DeserializeOwned + Send + 'static),*> FromArguments for ($($ty,)*) {
            const ARITY: usize = $arity;

            #[allow(unused_variables, unused_mut)]
            fn from_arguments(method: &str, arguments: Vec<Value>) -> Result<Self, ResolveError> {
                let mut values = arguments.into_iter();
                Ok(($(
                    decode_argument::<$ty>(method, $idx, values.next().unwrap_or(Value::Null))?,
                )*))
            }
        }
    };
}

impl_from_arguments!(0;);
impl_from_arguments!(1; A 0);
impl_from_arguments!(2; A 0, B 1);
impl_from_arguments!(3; A 0, B 1, C 2);
impl_from_arguments!(4; A 0, B 1, C 2, D 3);
impl_from_arguments!(5; A 0, B 1, C 2, D 3, E 4);
impl_from_arguments!(6; A 0, B 1, C 2, D 3, E 4, F 5);

type Invoker<H> =
    Box<dyn Fn(Arc<H>, HandlerContext, &str, Vec<Value>) -> Invocation + Send + Sync>;

struct MethodEntry<H> {
    name: String,
    arity: usize,
    replies: bool,
    invoke: Invoker<H>,
}

/// Name → typed invoker mapping for handler type `H`.
pub struct MethodTable<H> {
    methods: HashMap<String, MethodEntry<H>>,
}

impl<H> Default for MethodTable<H> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }
}

impl<H: Send + Sync + 'static> MethodTable<H> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async method whose result is sent back as a reply.
    ///
    /// A method returning `()` registers like a notification and sends no
    /// reply.
    pub fn method<A, R, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: FromArguments,
        R: Serialize + Send + 'static,
        F: Fn(Arc<H>, HandlerContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let invoke: Invoker<H> = Box::new(
            move |handler: Arc<H>, ctx: HandlerContext, method: &str, arguments: Vec<Value>| {
                let args = match A::from_arguments(method, arguments) {
                    Ok(args) => args,
                    Err(e) => return Invocation::Ready(Err(e)),
                };
                let future = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                    f(handler, ctx, args)
                })) {
                    Ok(future) => future,
                    Err(payload) => return Invocation::Ready(Err(panicked(method, &*payload))),
                };
                let method = method.to_owned();
                Invocation::Deferred(Box::pin(async move {
                    match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(Ok(value)) => encode_reply(&method, &value),
                        Ok(Err(e)) => Err(failed(&method, &e)),
                        Err(payload) => Err(panicked(&method, &*payload)),
                    }
                }))
            },
        );
        self.insert(name, A::ARITY, !is_unit::<R>(), invoke)
    }

    /// Register a synchronous method whose result is sent back as a reply.
    /// As with [`Self::method`], a `()` result sends no reply.
    pub fn method_sync<A, R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: FromArguments,
        R: Serialize + 'static,
        F: Fn(&H, &HandlerContext, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let invoke: Invoker<H> = Box::new(
            move |handler: Arc<H>, ctx: HandlerContext, method: &str, arguments: Vec<Value>| {
                let args = match A::from_arguments(method, arguments) {
                    Ok(args) => args,
                    Err(e) => return Invocation::Ready(Err(e)),
                };
                let result =
                    match std::panic::catch_unwind(AssertUnwindSafe(|| f(&handler, &ctx, args))) {
                        Ok(Ok(value)) => encode_reply(method, &value),
                        Ok(Err(e)) => Err(failed(method, &e)),
                        Err(payload) => Err(panicked(method, &*payload)),
                    };
                Invocation::Ready(result)
            },
        );
        self.insert(name, A::ARITY, !is_unit::<R>(), invoke)
    }

    /// Register an async method with no result. No reply is sent.
    pub fn notification<A, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: FromArguments,
        F: Fn(Arc<H>, HandlerContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let invoke: Invoker<H> = Box::new(
            move |handler: Arc<H>, ctx: HandlerContext, method: &str, arguments: Vec<Value>| {
                let args = match A::from_arguments(method, arguments) {
                    Ok(args) => args,
                    Err(e) => return Invocation::Ready(Err(e)),
                };
                let future = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                    f(handler, ctx, args)
                })) {
                    Ok(future) => future,
                    Err(payload) => return Invocation::Ready(Err(panicked(method, &*payload))),
                };
                let method = method.to_owned();
                Invocation::Deferred(Box::pin(async move {
                    match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(Ok(())) => Ok(None),
                        Ok(Err(e)) => Err(failed(&method, &e)),
                        Err(payload) => Err(panicked(&method, &*payload)),
                    }
                }))
            },
        );
        self.insert(name, A::ARITY, false, invoke)
    }

    fn insert(&mut self, name: &str, arity: usize, replies: bool, invoke: Invoker<H>) -> &mut Self {
        let entry = MethodEntry {
            name: name.to_owned(),
            arity,
            replies,
            invoke,
        };
        if let Some(previous) = self.methods.insert(name.to_lowercase(), entry) {
            warn!(method = %previous.name, "method registered twice, keeping the later registration");
        }
        self
    }

    /// Resolve `method`, check arity, decode arguments, and invoke.
    pub fn invoke(
        &self,
        handler: &Arc<H>,
        ctx: &HandlerContext,
        method: &str,
        arguments: Vec<Value>,
    ) -> Invocation {
        let Some(entry) = self.methods.get(&method.to_lowercase()) else {
            return Invocation::Ready(Err(ResolveError::MethodNotFound {
                method: method.to_owned(),
            }));
        };
        if arguments.len() != entry.arity {
            return Invocation::Ready(Err(ResolveError::ParameterMismatch {
                method: method.to_owned(),
                expected: entry.arity,
                actual: arguments.len(),
            }));
        }
        (entry.invoke)(Arc::clone(handler), ctx.clone(), method, arguments)
    }

    /// Whether `name` resolves to a registered method.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(&name.to_lowercase())
    }

    /// Declared parameter count of `name`.
    pub fn arity(&self, name: &str) -> Option<usize> {
        self.methods.get(&name.to_lowercase()).map(|e| e.arity)
    }

    /// Whether `name` produces a reply.
    pub fn replies(&self, name: &str) -> Option<bool> {
        self.methods.get(&name.to_lowercase()).map(|e| e.replies)
    }

    /// Registered method names, as registered, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.values().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method is registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

fn is_unit<R: 'static>() -> bool {
    TypeId::of::<R>() == TypeId::of::<()>()
}

fn encode_reply<R: Serialize + 'static>(method: &str, value: &R) -> InvokeResult {
    if is_unit::<R>() {
        return Ok(None);
    }
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| ResolveError::Handler {
            method: method.to_owned(),
            message: format!("result is not serializable: {e}"),
        })
}

fn failed(method: &str, error: &anyhow::Error) -> ResolveError {
    ResolveError::Handler {
        method: method.to_owned(),
        message: format!("{error:#}"),
    }
}

fn panicked(method: &str, payload: &(dyn Any + Send)) -> ResolveError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    };
    ResolveError::Panicked {
        method: method.to_owned(),
        message,
    }
}
