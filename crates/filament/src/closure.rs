//! Serializable closures and the remote table.
//!
//! A [`Closure`] is a `(label, environment)` pair. The label names a
//! resolver registered in the receiving node's [`RemoteTable`]; the
//! environment is whatever that resolver decodes. Because labels are plain
//! strings agreed on at build time, a closure survives the trip across the
//! wire and reconstructs into a runnable value on the far side.
//!
//! Process bodies ship as [`ProcBody`]: a deferred computation that may
//! produce a result message, which is what lets the composition combinators
//! ([`cp_seq`], [`cp_bind`]) and the `call` machinery thread values through
//! without knowing their types. The reserved labels registered in every
//! table make the combinators themselves round-trip across nodes.

use crate::error::ClosureError;
use crate::process::{Fault, Process, ProcessResult};
use filament_core::{CodecError, Message, ProcessId, RawClosure, Remotable};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::any::{self, Any};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

/// Label of the sequencing combinator, [`cp_seq`].
pub const LABEL_SEQ: &str = "filament.seq";
/// Label of the binding combinator, [`cp_bind`].
pub const LABEL_BIND: &str = "filament.bind";
/// Label of the link-back prologue used by `spawn_supervised`.
pub const LABEL_LINK_BACK: &str = "filament.link_back";
/// Label of the result-forwarding wrapper used by `call`.
pub const LABEL_SEND_RESULT: &str = "filament.send_result";

/// A deferred process computation.
///
/// The optional [`Message`] a body produces is its result in serialized
/// form; plain spawned processes produce none.
pub struct ProcBody(
    Box<dyn FnOnce(Process) -> BoxFuture<'static, ProcessResult<Option<Message>>> + Send>,
);

impl ProcBody {
    /// A body with no result.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<()>> + Send + 'static,
    {
        Self::raw(move |process| async move { f(process).await.map(|()| None) })
    }

    /// A body whose result is packed into a message for composition or
    /// reply forwarding.
    pub fn returning<T, F, Fut>(f: F) -> Self
    where
        T: Remotable,
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<T>> + Send + 'static,
    {
        Self::raw(move |process| async move {
            let value = f(process).await?;
            let message = Message::pack(&value).map_err(Fault::from)?;
            Ok(Some(message))
        })
    }

    /// A body in result-message form. Mostly for combinator resolvers.
    pub fn raw<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Process) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<Option<Message>>> + Send + 'static,
    {
        Self(Box::new(move |process| Box::pin(f(process))))
    }

    pub(crate) fn call(self, process: Process) -> BoxFuture<'static, ProcessResult<Option<Message>>> {
        (self.0)(process)
    }
}

impl fmt::Debug for ProcBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProcBody")
    }
}

/// A deferred computation awaiting one input message; the target of
/// [`cp_bind`].
pub struct StepBody(
    Box<dyn FnOnce(Process, Message) -> BoxFuture<'static, ProcessResult<Option<Message>>> + Send>,
);

impl StepBody {
    /// A step consuming a typed input.
    pub fn new<A, F, Fut>(f: F) -> Self
    where
        A: Remotable,
        F: FnOnce(Process, A) -> Fut + Send + 'static,
        Fut: Future<Output = ProcessResult<Option<Message>>> + Send + 'static,
    {
        Self(Box::new(move |process, message| {
            Box::pin(async move {
                let input = message.unpack::<A>().map_err(Fault::from)?;
                f(process, input).await
            })
        }))
    }

    pub(crate) fn call(
        self,
        process: Process,
        input: Message,
    ) -> BoxFuture<'static, ProcessResult<Option<Message>>> {
        (self.0)(process, input)
    }
}

impl fmt::Debug for StepBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepBody")
    }
}

/// A serializable deferred computation producing a `T` when resolved.
pub struct Closure<T> {
    raw: RawClosure,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Closure<T> {
    /// Builds a closure from a label and an already-encoded environment.
    pub fn new(label: impl Into<String>, env: Vec<u8>) -> Self {
        Self {
            raw: RawClosure::new(label, env),
            _marker: PhantomData,
        }
    }

    /// Builds a closure, encoding the environment.
    pub fn from_env<E: Remotable>(
        label: impl Into<String>,
        env: &E,
    ) -> Result<Self, CodecError> {
        let bytes = postcard::to_allocvec(env).map_err(CodecError::Encode)?;
        Ok(Self::new(label, bytes))
    }

    /// The serializable form.
    pub fn raw(&self) -> &RawClosure {
        &self.raw
    }

    /// Consumes into the serializable form.
    pub fn into_raw(self) -> RawClosure {
        self.raw
    }
}

impl<T> Clone for Closure<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Closure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("label", &self.raw.label)
            .field("env_len", &self.raw.env.len())
            .finish()
    }
}

/// A dynamically typed resolution result, tagged with its concrete type
/// name for mismatch reporting.
pub struct DynValue {
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl DynValue {
    /// Wraps a concrete value.
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            type_name: any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    /// The concrete type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recovers the concrete value, or reports the mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, ClosureError> {
        match self.value.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(_) => Err(ClosureError::TypeMismatch {
                expected: any::type_name::<T>().to_string(),
                found: self.type_name.to_string(),
            }),
        }
    }
}

type Resolver = Box<dyn Fn(&RemoteTable, &[u8]) -> Result<DynValue, ClosureError> + Send + Sync>;

/// The node-local label table, immutable after boot.
///
/// Resolvers receive the table itself so composition labels can resolve
/// their nested closures recursively.
pub struct RemoteTable {
    entries: HashMap<String, Resolver>,
}

impl RemoteTable {
    /// Starts a builder with the reserved labels pre-registered.
    pub fn builder() -> RemoteTableBuilder {
        RemoteTableBuilder::new()
    }

    /// Resolves a raw closure to a dynamic value.
    pub fn resolve(&self, raw: &RawClosure) -> Result<DynValue, ClosureError> {
        let resolver = self
            .entries
            .get(&raw.label)
            .ok_or_else(|| ClosureError::UnknownLabel(raw.label.clone()))?;
        resolver(self, &raw.env)
    }

    /// Resolves a raw closure expected to be a process body.
    pub fn resolve_body(&self, raw: &RawClosure) -> Result<ProcBody, ClosureError> {
        self.resolve(raw)?.downcast::<ProcBody>()
    }
}

impl fmt::Debug for RemoteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTable")
            .field("labels", &self.entries.len())
            .finish()
    }
}

/// Builds a [`RemoteTable`] from user registrations.
pub struct RemoteTableBuilder {
    entries: HashMap<String, Resolver>,
}

impl RemoteTableBuilder {
    fn new() -> Self {
        let mut builder = Self {
            entries: HashMap::new(),
        };
        builder.insert(LABEL_SEQ, resolve_seq);
        builder.insert(LABEL_BIND, resolve_bind);
        builder.insert(LABEL_LINK_BACK, resolve_link_back);
        builder.insert(LABEL_SEND_RESULT, resolve_send_result);
        builder
    }

    fn insert(
        &mut self,
        label: &str,
        resolver: impl Fn(&RemoteTable, &[u8]) -> Result<DynValue, ClosureError>
        + Send
        + Sync
        + 'static,
    ) {
        self.entries.insert(label.to_string(), Box::new(resolver));
    }

    /// Registers an arbitrary resolver under `label`.
    pub fn register(
        mut self,
        label: &str,
        resolver: impl Fn(&RemoteTable, &[u8]) -> Result<DynValue, ClosureError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.insert(label, resolver);
        self
    }

    /// Registers a process-body constructor taking a typed environment.
    pub fn register_body<E, F>(self, label: &str, construct: F) -> Self
    where
        E: Remotable,
        F: Fn(E) -> ProcBody + Send + Sync + 'static,
    {
        self.register(label, move |_table, env| {
            let env: E = decode_env(env)?;
            Ok(DynValue::new(construct(env)))
        })
    }

    /// Finalizes the table.
    pub fn build(self) -> RemoteTable {
        RemoteTable {
            entries: self.entries,
        }
    }
}

fn decode_env<E: DeserializeOwned>(env: &[u8]) -> Result<E, ClosureError> {
    postcard::from_bytes(env).map_err(|e| ClosureError::Environment(CodecError::Decode(e)))
}

fn resolve_seq(table: &RemoteTable, env: &[u8]) -> Result<DynValue, ClosureError> {
    let (a, b): (RawClosure, RawClosure) = decode_env(env)?;
    let first = table.resolve_body(&a)?;
    let second = table.resolve_body(&b)?;
    Ok(DynValue::new(ProcBody::raw(move |process| async move {
        first.call(process.clone()).await?;
        second.call(process).await
    })))
}

fn resolve_bind(table: &RemoteTable, env: &[u8]) -> Result<DynValue, ClosureError> {
    let (a, k): (RawClosure, RawClosure) = decode_env(env)?;
    let first = table.resolve_body(&a)?;
    let step: StepBody = table.resolve(&k)?.downcast()?;
    Ok(DynValue::new(ProcBody::raw(move |process| async move {
        let out = first.call(process.clone()).await?;
        let input = out.ok_or_else(|| {
            Fault::Error("bind: upstream closure produced no result".to_string())
        })?;
        step.call(process, input).await
    })))
}

fn resolve_link_back(_table: &RemoteTable, env: &[u8]) -> Result<DynValue, ClosureError> {
    let parent: ProcessId = decode_env(env)?;
    Ok(DynValue::new(ProcBody::raw(move |process| async move {
        process.link(parent);
        Ok(None)
    })))
}

fn resolve_send_result(table: &RemoteTable, env: &[u8]) -> Result<DynValue, ClosureError> {
    let (caller, inner): (ProcessId, RawClosure) = decode_env(env)?;
    let body = table.resolve_body(&inner)?;
    Ok(DynValue::new(ProcBody::raw(move |process| async move {
        let out = body.call(process.clone()).await?;
        if let Some(message) = out {
            process.send_message(caller, message);
        }
        Ok(None)
    })))
}

/// `cp_seq(a, b)`: run `a`, discard its result, then run `b`.
///
/// The combinator is itself a closure under a deterministic label, so it
/// composes and ships like any user closure.
pub fn cp_seq(
    a: Closure<ProcBody>,
    b: Closure<ProcBody>,
) -> Result<Closure<ProcBody>, CodecError> {
    let env = postcard::to_allocvec(&(a.into_raw(), b.into_raw())).map_err(CodecError::Encode)?;
    Ok(Closure::new(LABEL_SEQ, env))
}

/// `cp_bind(a, k)`: run `a`, feed its result to the step `k`.
pub fn cp_bind(
    a: Closure<ProcBody>,
    k: Closure<StepBody>,
) -> Result<Closure<ProcBody>, CodecError> {
    let env = postcard::to_allocvec(&(a.into_raw(), k.into_raw())).map_err(CodecError::Encode)?;
    Ok(Closure::new(LABEL_BIND, env))
}

/// A prologue that links the spawned process back to `parent`.
pub fn link_back(parent: ProcessId) -> Result<Closure<ProcBody>, CodecError> {
    Closure::from_env(LABEL_LINK_BACK, &parent)
}

/// Wraps `inner` so that its result message is sent to `caller`.
pub fn send_result(
    caller: ProcessId,
    inner: Closure<ProcBody>,
) -> Result<Closure<ProcBody>, CodecError> {
    let env =
        postcard::to_allocvec(&(caller, inner.into_raw())).map_err(CodecError::Encode)?;
    Ok(Closure::new(LABEL_SEND_RESULT, env))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RemoteTable {
        RemoteTable::builder()
            .register_body("test.noop", |(): ()| {
                ProcBody::new(|_process| async move { Ok(()) })
            })
            .build()
    }

    #[test]
    fn test_unknown_label() {
        let table = table();
        let raw = RawClosure::new("no.such.label", Vec::new());
        assert!(matches!(
            table.resolve(&raw),
            Err(ClosureError::UnknownLabel(_))
        ));
    }

    #[test]
    fn test_resolve_registered_body() {
        let table = table();
        let closure = Closure::<ProcBody>::from_env("test.noop", &()).unwrap();
        assert!(table.resolve_body(closure.raw()).is_ok());
    }

    #[test]
    fn test_type_mismatch_reported() {
        let table = table();
        let closure = Closure::<ProcBody>::from_env("test.noop", &()).unwrap();
        let err = table
            .resolve(closure.raw())
            .unwrap()
            .downcast::<String>()
            .unwrap_err();
        match err {
            ClosureError::TypeMismatch { expected, found } => {
                assert!(expected.contains("String"));
                assert!(found.contains("ProcBody"));
            }
            other => panic!("expected type mismatch, got {other}"),
        }
    }

    #[test]
    fn test_bad_environment() {
        let table = RemoteTable::builder()
            .register_body("test.takes_u64", |_n: u64| {
                ProcBody::new(|_process| async move { Ok(()) })
            })
            .build();
        // An empty environment does not decode as u64.
        let raw = RawClosure::new("test.takes_u64", Vec::new());
        assert!(matches!(
            table.resolve(&raw),
            Err(ClosureError::Environment(_))
        ));
    }

    #[test]
    fn test_seq_resolves_recursively() {
        let table = table();
        let a = Closure::<ProcBody>::from_env("test.noop", &()).unwrap();
        let b = Closure::<ProcBody>::from_env("test.noop", &()).unwrap();
        let seq = cp_seq(a, b).unwrap();
        assert_eq!(seq.raw().label, LABEL_SEQ);
        assert!(table.resolve_body(seq.raw()).is_ok());
    }

    #[test]
    fn test_seq_with_unknown_inner_fails() {
        let table = table();
        let a = Closure::<ProcBody>::from_env("test.noop", &()).unwrap();
        let b = Closure::<ProcBody>::new("missing", Vec::new());
        let seq = cp_seq(a, b).unwrap();
        assert!(matches!(
            table.resolve_body(seq.raw()),
            Err(ClosureError::UnknownLabel(_))
        ));
    }
}
