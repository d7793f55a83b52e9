//! Exported methods.
//!
//! A [`Method`] pairs an external name and its in/out signatures with a
//! handler. Typed handlers take an [`Args`] tuple and return one; the
//! signatures come from those tuples, so the introspection data and the
//! decoding can never disagree.

use buslink_types::error::names;
use buslink_types::introspect::{ArgInfo, Direction, MethodInfo};
use buslink_types::value::coerce_values;
use buslink_types::{Args, BusError, BusResult, Signature, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

type AsyncHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, BusResult<Vec<Value>>> + Send + Sync>;
type BlockingHandler = Arc<dyn Fn(Vec<Value>) -> BusResult<Vec<Value>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Async(AsyncHandler),
    /// Runs on the blocking worker pool.
    Blocking(BlockingHandler),
}

/// Behavioural flags of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodFlags {
    /// Nothing is sent back, not even errors.
    pub no_reply: bool,
    pub deprecated: bool,
    /// Callable but left out of introspection.
    pub hidden: bool,
    /// Callable without authorization.
    pub unprivileged: bool,
    /// When false, the handler holds the object's exclusive lock.
    pub thread_safe: bool,
}

impl Default for MethodFlags {
    fn default() -> Self {
        Self {
            no_reply: false,
            deprecated: false,
            hidden: false,
            unprivileged: false,
            thread_safe: true,
        }
    }
}

/// One exported method.
#[derive(Clone)]
pub struct Method {
    name: String,
    in_signature: Signature,
    out_signature: Signature,
    in_names: Vec<String>,
    out_names: Vec<String>,
    flags: MethodFlags,
    handler: Handler,
}

impl Method {
    /// An async method with typed arguments and results.
    pub fn new<A, R, F, Fut>(name: &str, f: F) -> Self
    where
        A: Args + Send + 'static,
        R: Args + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<R>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |values: Vec<Value>| match A::from_values(values) {
            Ok(args) => f(args).map(|r| r.map(R::into_values)).boxed(),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        });
        Self::with_handler(name, A::signature(), R::signature(), Handler::Async(handler))
    }

    /// A synchronous method run on the blocking worker pool.
    pub fn blocking<A, R, F>(name: &str, f: F) -> Self
    where
        A: Args + 'static,
        R: Args + 'static,
        F: Fn(A) -> BusResult<R> + Send + Sync + 'static,
    {
        let handler: BlockingHandler =
            Arc::new(move |values: Vec<Value>| {
                A::from_values(values).and_then(&f).map(R::into_values)
            });
        Self::with_handler(name, A::signature(), R::signature(), Handler::Blocking(handler))
    }

    /// A method over raw values with explicit signatures.
    pub fn dynamic<F, Fut>(name: &str, in_signature: Signature, out_signature: Signature, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusResult<Vec<Value>>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |values: Vec<Value>| f(values).boxed());
        Self::with_handler(name, in_signature, out_signature, Handler::Async(handler))
    }

    fn with_handler(name: &str, in_signature: Signature, out_signature: Signature, handler: Handler) -> Self {
        Self {
            name: name.to_string(),
            in_signature,
            out_signature,
            in_names: Vec::new(),
            out_names: Vec::new(),
            flags: MethodFlags::default(),
            handler,
        }
    }

    /// Name the input arguments, in order.
    pub fn arg_names(mut self, names: &[&str]) -> Self {
        self.in_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Name the results, in order.
    pub fn result_names(mut self, names: &[&str]) -> Self {
        self.out_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.flags.no_reply = true;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.flags.deprecated = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.flags.hidden = true;
        self
    }

    pub fn unprivileged(mut self) -> Self {
        self.flags.unprivileged = true;
        self
    }

    /// Serialize this handler with every other non-thread-safe handler of
    /// the same object.
    pub fn not_thread_safe(mut self) -> Self {
        self.flags.thread_safe = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn in_signature(&self) -> &Signature {
        &self.in_signature
    }

    pub fn out_signature(&self) -> &Signature {
        &self.out_signature
    }

    /// Decode, run the handler and encode the results against the declared
    /// return signature.
    pub async fn invoke(&self, args: Vec<Value>) -> BusResult<Vec<Value>> {
        let args = coerce_values(args, &self.in_signature)?;
        let out = match &self.handler {
            Handler::Async(f) => f(args).await?,
            Handler::Blocking(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| BusError::remote(names::FAILED, format!("worker failed: {e}")))??
            }
        };
        coerce_values(out, &self.out_signature)
    }

    /// Introspection entry.
    pub fn info(&self) -> MethodInfo {
        let mut args = describe(&self.in_signature, &self.in_names, Direction::In);
        args.extend(describe(&self.out_signature, &self.out_names, Direction::Out));
        MethodInfo {
            name: self.name.clone(),
            args,
            deprecated: self.flags.deprecated,
            no_reply: self.flags.no_reply,
        }
    }
}

pub(crate) fn describe(signature: &Signature, names: &[String], direction: Direction) -> Vec<ArgInfo> {
    signature
        .split()
        .into_iter()
        .enumerate()
        .map(|(i, sig)| ArgInfo {
            name: names.get(i).cloned(),
            signature: sig.to_string(),
            direction,
        })
        .collect()
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("in", &self.in_signature)
            .field("out", &self.out_signature)
            .field("flags", &self.flags)
            .finish()
    }
}
