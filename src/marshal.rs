//! Custom marshal capabilities.
//!
//! A type can take over its own JSON rendering through one of four hooks,
//! probed in priority order at compile time:
//!
//! 1. [`WriteJsonContext`] — writes JSON and observes the per-call context,
//! 2. [`WriteJson`] — writes JSON directly into the sink,
//! 3. [`MarshalJson`] — returns ready-made JSON bytes,
//! 4. [`MarshalText`] — returns text, emitted as an escaped JSON string.
//!
//! Hooks are registered per type in a process-global registry. Every
//! registration bumps an epoch that participates in the program-cache key,
//! so programs compiled before a registration are never reused after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::LazyLock;

use facet::{Facet, Shape};
use facet_reflect::Peek;
use parking_lot::RwLock;

use crate::error::BoxError;
use crate::escape::{self, EscapeOpts};
use crate::opts::Context;
use crate::writer::Sink;

/// Streams JSON for a value, with access to the per-call [`Context`].
pub trait WriteJsonContext {
    /// Writes the value's JSON representation into `sink`.
    fn write_json_context(&self, cx: &Context, sink: &mut dyn Sink) -> Result<(), BoxError>;
}

/// Streams JSON for a value.
pub trait WriteJson {
    /// Writes the value's JSON representation into `sink`.
    fn write_json(&self, sink: &mut dyn Sink) -> Result<(), BoxError>;
}

/// Produces the value's JSON representation as bytes.
pub trait MarshalJson {
    /// Returns ready-made JSON bytes, copied verbatim into the output.
    fn marshal_json(&self) -> Result<Vec<u8>, BoxError>;
}

/// Produces a plain-text representation, emitted as a JSON string.
pub trait MarshalText {
    /// Returns the text form; it is escaped and quoted by the encoder.
    fn marshal_text(&self) -> Result<String, BoxError>;
}

/// Capability kinds, declared in dispatch priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum MarshalKind {
    WriterContext,
    Writer,
    JsonBytes,
    TextBytes,
}

/// What an invoke thunk gets to see besides the value.
pub(crate) struct MarshalEnv {
    pub cx: Context,
    pub esc: Option<EscapeOpts>,
}

type InvokeFn = fn(Peek<'_, '_, '_>, &MarshalEnv, &mut Vec<u8>) -> Result<(), BoxError>;

/// An erased, registered hook. Copyable so programs can embed it.
#[derive(Clone, Copy)]
pub(crate) struct MarshalHook {
    pub kind: MarshalKind,
    pub invoke: InvokeFn,
}

// Shape pointers always reference 'static data, so the key is safe to move
// across threads.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ShapeKey(*const Shape<'static>);

unsafe impl Send for ShapeKey {}
unsafe impl Sync for ShapeKey {}

impl ShapeKey {
    pub(crate) fn of(shape: &'static Shape<'static>) -> Self {
        ShapeKey(shape as *const Shape<'static>)
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<ShapeKey, Vec<MarshalHook>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

static EPOCH: AtomicU32 = AtomicU32::new(0);

/// Registry generation; compiled programs are keyed by it.
pub(crate) fn epoch() -> u32 {
    EPOCH.load(Ordering::Acquire)
}

fn install(shape: &'static Shape<'static>, hook: MarshalHook) {
    let mut registry = REGISTRY.write();
    let hooks = registry.entry(ShapeKey::of(shape)).or_default();
    hooks.retain(|h| h.kind != hook.kind);
    hooks.push(hook);
    EPOCH.fetch_add(1, Ordering::AcqRel);
}

/// Highest-priority hook registered for `shape`, if any.
pub(crate) fn probe(shape: &'static Shape<'static>) -> Option<MarshalHook> {
    let registry = REGISTRY.read();
    registry
        .get(&ShapeKey::of(shape))?
        .iter()
        .min_by_key(|h| h.kind)
        .copied()
}

/// Registered text capability for `shape`; map keys only consider this one.
pub(crate) fn probe_text(shape: &'static Shape<'static>) -> Option<MarshalHook> {
    let registry = REGISTRY.read();
    registry
        .get(&ShapeKey::of(shape))?
        .iter()
        .find(|h| h.kind == MarshalKind::TextBytes)
        .copied()
}

/// Registers `T`'s [`WriteJsonContext`] capability.
pub fn register_write_json_context<T>()
where
    T: WriteJsonContext + for<'a> Facet<'a>,
{
    fn invoke<T: WriteJsonContext + for<'a> Facet<'a>>(
        peek: Peek<'_, '_, '_>,
        env: &MarshalEnv,
        buf: &mut Vec<u8>,
    ) -> Result<(), BoxError> {
        let value = peek.get::<T>().map_err(|e| -> BoxError { e.to_string().into() })?;
        value.write_json_context(&env.cx, buf)
    }
    install(
        T::SHAPE,
        MarshalHook {
            kind: MarshalKind::WriterContext,
            invoke: invoke::<T>,
        },
    );
}

/// Registers `T`'s [`WriteJson`] capability.
pub fn register_write_json<T>()
where
    T: WriteJson + for<'a> Facet<'a>,
{
    fn invoke<T: WriteJson + for<'a> Facet<'a>>(
        peek: Peek<'_, '_, '_>,
        _env: &MarshalEnv,
        buf: &mut Vec<u8>,
    ) -> Result<(), BoxError> {
        let value = peek.get::<T>().map_err(|e| -> BoxError { e.to_string().into() })?;
        value.write_json(buf)
    }
    install(
        T::SHAPE,
        MarshalHook {
            kind: MarshalKind::Writer,
            invoke: invoke::<T>,
        },
    );
}

/// Registers `T`'s [`MarshalJson`] capability.
pub fn register_marshal_json<T>()
where
    T: MarshalJson + for<'a> Facet<'a>,
{
    fn invoke<T: MarshalJson + for<'a> Facet<'a>>(
        peek: Peek<'_, '_, '_>,
        _env: &MarshalEnv,
        buf: &mut Vec<u8>,
    ) -> Result<(), BoxError> {
        let value = peek.get::<T>().map_err(|e| -> BoxError { e.to_string().into() })?;
        let bytes = value.marshal_json()?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }
    install(
        T::SHAPE,
        MarshalHook {
            kind: MarshalKind::JsonBytes,
            invoke: invoke::<T>,
        },
    );
}

/// Registers `T`'s [`MarshalText`] capability.
pub fn register_marshal_text<T>()
where
    T: MarshalText + for<'a> Facet<'a>,
{
    fn invoke<T: MarshalText + for<'a> Facet<'a>>(
        peek: Peek<'_, '_, '_>,
        env: &MarshalEnv,
        buf: &mut Vec<u8>,
    ) -> Result<(), BoxError> {
        let value = peek.get::<T>().map_err(|e| -> BoxError { e.to_string().into() })?;
        let text = value.marshal_text()?;
        match env.esc {
            Some(opts) => escape::append_quoted(buf, text.as_bytes(), opts),
            None => escape::append_raw_quoted(buf, text.as_bytes()),
        }
        Ok(())
    }
    install(
        T::SHAPE,
        MarshalHook {
            kind: MarshalKind::TextBytes,
            invoke: invoke::<T>,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Facet)]
    struct Tagged(u32);

    impl MarshalText for Tagged {
        fn marshal_text(&self) -> Result<String, BoxError> {
            Ok(format!("tag-{}", self.0))
        }
    }

    impl WriteJson for Tagged {
        fn write_json(&self, sink: &mut dyn Sink) -> Result<(), BoxError> {
            sink.write(b"\"writer\"");
            Ok(())
        }
    }

    #[test]
    fn probe_prefers_the_writer_capability() {
        register_marshal_text::<Tagged>();
        register_write_json::<Tagged>();

        let hook = probe(Tagged::SHAPE).unwrap();
        assert_eq!(hook.kind, MarshalKind::Writer);

        // Map keys only consider the text capability.
        let hook = probe_text(Tagged::SHAPE).unwrap();
        assert_eq!(hook.kind, MarshalKind::TextBytes);
    }

    #[test]
    fn registration_bumps_the_epoch() {
        #[derive(Facet)]
        struct Other(u8);
        impl MarshalText for Other {
            fn marshal_text(&self) -> Result<String, BoxError> {
                Ok("other".into())
            }
        }
        let before = epoch();
        register_marshal_text::<Other>();
        assert!(epoch() > before);
    }
}
