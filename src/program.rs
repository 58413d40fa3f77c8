//! The compiled encoding program.
//!
//! A [`Program`] is an immutable tree of typed instructions produced once
//! per `(shape, flags)` and shared behind an `Arc`. The engine walks the
//! tree against a value; nothing in here touches value memory.

use facet::Shape;

use crate::escape::{self, EscapeOpts};
use crate::marshal::MarshalHook;

/// A compiled program for one root shape.
pub(crate) struct Program {
    pub shape: &'static Shape<'static>,
    pub root: Instr,
}

/// One encoding instruction.
///
/// Scalar variants carry no payload; composite variants own their
/// sub-programs. `Recurse` closes cycles by shape reference and is resolved
/// through the program cache during execution.
pub(crate) enum Instr {
    /// `()` and unit structs.
    Unit,
    Bool,
    Char,
    I8,
    I16,
    I32,
    I64,
    I128,
    Isize,
    U8,
    U16,
    U32,
    U64,
    U128,
    Usize,
    F32,
    F64,
    /// Any string scalar (`String`, `&str`, `Cow<str>`).
    Str,
    /// A pre-rendered number literal ([`crate::Number`]); validated when
    /// encoded.
    NumberLiteral,
    /// Verbatim passthrough ([`crate::RawJson`]).
    RawJson,
    /// `Vec<u8>` / `&[u8]`: base64 by default, raw string on option.
    Bytes,
    /// `[u8; N]`: array of numbers by default, quoted string on option.
    ByteArray(usize),
    /// Sequences of a single element program.
    Slice(Box<Instr>),
    /// Sets render as JSON arrays.
    Set(Box<Instr>),
    /// Fixed-length arrays.
    Array {
        elem: Box<Instr>,
        len: usize,
    },
    Map(Box<MapPlan>),
    Struct(Box<StructPlan>),
    /// Tuples and tuple structs render as JSON arrays.
    Tuple(Vec<Instr>),
    /// `Option<T>`: `null` (or the empty collection form, per options) when
    /// absent.
    Option(Box<Instr>),
    /// Smart pointers and references; dereferenced to the pointee.
    Pointer(Box<Instr>),
    Enum(Box<EnumPlan>),
    /// Transparent wrappers defer to their single inner value.
    Transparent(Box<Instr>),
    /// `chrono::DateTime<Utc>`.
    DateTimeUtc,
    /// `chrono::DateTime<FixedOffset>`.
    DateTimeFixed,
    /// `std::time::Duration`.
    Duration,
    /// A user marshal hook selected at compile time.
    Marshal(MarshalPlan),
    /// Back-reference to an enclosing shape's program.
    Recurse(&'static Shape<'static>),
}

pub(crate) struct MarshalPlan {
    /// Shape the hook was registered for; names the culprit in errors.
    pub shape: &'static Shape<'static>,
    pub hook: MarshalHook,
}

pub(crate) struct MapPlan {
    pub key: MapKeyKind,
    pub value: Instr,
}

/// How map keys are rendered. Strings win over a registered text-marshal
/// capability, which wins over integers; everything else was rejected at
/// compile time.
pub(crate) enum MapKeyKind {
    Str,
    Signed,
    Unsigned,
    Text(MarshalPlan),
}

pub(crate) struct StructPlan {
    /// Visible fields in output order.
    pub fields: Vec<FieldPlan>,
}

pub(crate) struct FieldPlan {
    /// Display name, post rename.
    pub name: String,
    /// Precomputed `"name":` keys for the three escape modes.
    pub key: FieldKey,
    /// Access path from the struct the plan belongs to; dereference steps
    /// come from flattened `Option`/pointer fields and skip the field when
    /// they hit an absent value.
    pub path: Vec<PathStep>,
    pub instr: Instr,
    pub omitempty: bool,
    pub quoted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PathStep {
    /// Index into the struct's fields.
    Field(usize),
    /// Dereference an option or pointer on the way to a flattened struct.
    Deref,
}

/// `"name":` rendered once per escape mode at compile time.
pub(crate) struct FieldKey {
    /// Default escaping, HTML-safe.
    pub escaped: Box<[u8]>,
    /// HTML escaping disabled.
    pub no_html: Box<[u8]>,
    /// Escaping disabled entirely.
    pub raw: Box<[u8]>,
}

impl FieldKey {
    pub(crate) fn new(name: &str) -> FieldKey {
        let render = |opts: Option<EscapeOpts>| -> Box<[u8]> {
            let mut buf = Vec::with_capacity(name.len() + 3);
            match opts {
                Some(opts) => escape::append_quoted(&mut buf, name.as_bytes(), opts),
                None => escape::append_raw_quoted(&mut buf, name.as_bytes()),
            }
            buf.push(b':');
            buf.into_boxed_slice()
        };
        FieldKey {
            escaped: render(Some(EscapeOpts::default())),
            no_html: render(Some(EscapeOpts {
                html: false,
                ..EscapeOpts::default()
            })),
            raw: render(None),
        }
    }

    /// Picks the variant matching the call's escape options.
    pub(crate) fn select(&self, esc: Option<EscapeOpts>) -> &[u8] {
        match esc {
            None => &self.raw,
            Some(opts) if opts.html => &self.escaped,
            Some(_) => &self.no_html,
        }
    }
}

pub(crate) struct EnumPlan {
    pub variants: Vec<VariantPlan>,
}

pub(crate) struct VariantPlan {
    pub name: &'static str,
    /// `"Name":` for the wrapping object of data-carrying variants.
    pub key: FieldKey,
    pub kind: VariantShape,
    pub fields: Vec<VariantFieldPlan>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VariantShape {
    /// Renders as the bare variant-name string.
    Unit,
    /// Single unnamed payload, rendered directly.
    Newtype,
    /// Multiple unnamed payloads, rendered as an array.
    Tuple,
    /// Named payloads, rendered as an object.
    Struct,
}

pub(crate) struct VariantFieldPlan {
    pub key: FieldKey,
    pub instr: Instr,
}
