//! Program execution.
//!
//! The engine walks a compiled [`Program`] and a [`Peek`] of the value in
//! lockstep, appending bytes to the per-call buffer. It holds no mutable
//! shared state; recursion is bounded by the value's actual depth, with
//! back-reference instructions resolved through the program cache.

use std::borrow::Cow;
use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Utc};
use facet_reflect::Peek;

use crate::cache;
use crate::compile::CompileFlags;
use crate::error::Error;
use crate::escape;
use crate::float;
use crate::marshal::MarshalEnv;
use crate::opts::EncodeOptions;
use crate::program::{
    FieldPlan, Instr, MapKeyKind, MapPlan, MarshalPlan, PathStep, Program, StructPlan,
    VariantShape,
};
use crate::raw::{self, Number, RawJson};
use crate::time;
use crate::writer;

macro_rules! peek_get {
    ($peek:expr, $ty:ty) => {
        $peek
            .get::<$ty>()
            .map_err(|e| Error::unsupported_value(e.to_string()))?
    };
}

pub(crate) struct Engine<'a> {
    opts: &'a EncodeOptions,
    flags: CompileFlags,
    whitelist: Option<HashSet<&'a str>>,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(opts: &'a EncodeOptions, flags: CompileFlags) -> Self {
        let whitelist = opts
            .fields
            .as_ref()
            .map(|names| names.iter().map(String::as_str).collect());
        Engine {
            opts,
            flags,
            whitelist,
        }
    }

    pub(crate) fn run(
        &self,
        program: &Program,
        peek: Peek<'_, '_, '_>,
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        self.exec(&program.root, peek, buf, true)
    }

    fn exec(
        &self,
        instr: &Instr,
        peek: Peek<'_, '_, '_>,
        buf: &mut Vec<u8>,
        root: bool,
    ) -> Result<(), Error> {
        match instr {
            Instr::Unit => writer::append_null(buf),
            Instr::Bool => writer::append_bool(buf, *peek_get!(peek, bool)),
            Instr::Char => {
                let c = *peek_get!(peek, char);
                let mut tmp = [0u8; 4];
                self.append_string(buf, c.encode_utf8(&mut tmp).as_bytes());
            }
            Instr::I8 => writer::append_int(buf, *peek_get!(peek, i8) as i128, self.opts.base()),
            Instr::I16 => writer::append_int(buf, *peek_get!(peek, i16) as i128, self.opts.base()),
            Instr::I32 => writer::append_int(buf, *peek_get!(peek, i32) as i128, self.opts.base()),
            Instr::I64 => writer::append_int(buf, *peek_get!(peek, i64) as i128, self.opts.base()),
            Instr::I128 => {
                writer::append_int(buf, *peek_get!(peek, i128), self.opts.base());
            }
            Instr::Isize => {
                writer::append_int(buf, *peek_get!(peek, isize) as i128, self.opts.base());
            }
            Instr::U8 => writer::append_uint(buf, *peek_get!(peek, u8) as u128, self.opts.base()),
            Instr::U16 => writer::append_uint(buf, *peek_get!(peek, u16) as u128, self.opts.base()),
            Instr::U32 => writer::append_uint(buf, *peek_get!(peek, u32) as u128, self.opts.base()),
            Instr::U64 => writer::append_uint(buf, *peek_get!(peek, u64) as u128, self.opts.base()),
            Instr::U128 => {
                writer::append_uint(buf, *peek_get!(peek, u128), self.opts.base());
            }
            Instr::Usize => {
                writer::append_uint(buf, *peek_get!(peek, usize) as u128, self.opts.base());
            }
            Instr::F32 => float::append_f32(buf, *peek_get!(peek, f32))?,
            Instr::F64 => float::append_f64(buf, *peek_get!(peek, f64))?,
            Instr::Str => {
                let s = peek
                    .as_str()
                    .ok_or_else(|| Error::unsupported_value("string value not viewable"))?;
                self.append_string(buf, s.as_bytes());
            }
            Instr::NumberLiteral => {
                let n = peek_get!(peek, Number);
                if !raw::is_valid_number(n.as_str()) {
                    return Err(Error::unsupported_value(format!(
                        "invalid number literal {:?}",
                        n.as_str()
                    )));
                }
                buf.extend_from_slice(n.as_str().as_bytes());
            }
            Instr::RawJson => {
                let r = peek_get!(peek, RawJson);
                buf.extend_from_slice(r.as_str().as_bytes());
            }
            Instr::Bytes => {
                let bytes = byte_slice(peek)?;
                if self.opts.raw_byte_slice {
                    self.append_string(buf, &bytes);
                } else {
                    writer::append_base64(buf, &bytes);
                }
            }
            Instr::ByteArray(_) => {
                let bytes = collect_bytes(peek)?;
                if self.opts.byte_array_as_string {
                    self.append_string(buf, &bytes);
                } else {
                    buf.push(b'[');
                    for (i, b) in bytes.iter().enumerate() {
                        if i > 0 {
                            buf.push(b',');
                        }
                        writer::append_uint(buf, *b as u128, self.opts.base());
                    }
                    buf.push(b']');
                }
            }
            Instr::Slice(elem) | Instr::Array { elem, .. } => {
                let list = peek
                    .into_list_like()
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                buf.push(b'[');
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        buf.push(b',');
                    }
                    self.exec(elem, item, buf, false)?;
                }
                buf.push(b']');
            }
            Instr::Set(elem) => {
                let set = peek
                    .into_set()
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                buf.push(b'[');
                for (i, item) in set.iter().enumerate() {
                    if i > 0 {
                        buf.push(b',');
                    }
                    self.exec(elem, item, buf, false)?;
                }
                buf.push(b']');
            }
            Instr::Map(plan) => self.exec_map(plan, peek, buf)?,
            Instr::Struct(plan) => self.exec_struct(plan, peek, buf, root)?,
            Instr::Tuple(elems) => {
                let tuple = peek
                    .into_struct()
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                buf.push(b'[');
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        buf.push(b',');
                    }
                    let item = tuple
                        .field(i)
                        .map_err(|e| Error::unsupported_value(e.to_string()))?;
                    self.exec(elem, item, buf, false)?;
                }
                buf.push(b']');
            }
            Instr::Option(inner) => {
                let opt = peek
                    .into_option()
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                match opt.value() {
                    Some(value) => self.exec(inner, value, buf, root)?,
                    None => self.append_absent(inner, buf),
                }
            }
            Instr::Pointer(inner) => {
                let ptr = peek
                    .into_pointer()
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                match ptr.borrow_inner() {
                    Some(value) => self.exec(inner, value, buf, root)?,
                    None => self.append_absent(inner, buf),
                }
            }
            Instr::Enum(plan) => {
                let peek_enum = peek
                    .into_enum()
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                let index = peek_enum
                    .variant_index()
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                let variant = &plan.variants[index];
                let esc = self.opts.escape_opts();
                match variant.kind {
                    VariantShape::Unit => self.append_string(buf, variant.name.as_bytes()),
                    VariantShape::Newtype => {
                        buf.push(b'{');
                        buf.extend_from_slice(variant.key.select(esc));
                        let value = enum_field(&peek_enum, 0)?;
                        self.exec(&variant.fields[0].instr, value, buf, false)?;
                        buf.push(b'}');
                    }
                    VariantShape::Tuple => {
                        buf.push(b'{');
                        buf.extend_from_slice(variant.key.select(esc));
                        buf.push(b'[');
                        for (i, field) in variant.fields.iter().enumerate() {
                            if i > 0 {
                                buf.push(b',');
                            }
                            let value = enum_field(&peek_enum, i)?;
                            self.exec(&field.instr, value, buf, false)?;
                        }
                        buf.push(b']');
                        buf.push(b'}');
                    }
                    VariantShape::Struct => {
                        buf.push(b'{');
                        buf.extend_from_slice(variant.key.select(esc));
                        buf.push(b'{');
                        for (i, field) in variant.fields.iter().enumerate() {
                            if i > 0 {
                                buf.push(b',');
                            }
                            buf.extend_from_slice(field.key.select(esc));
                            let value = enum_field(&peek_enum, i)?;
                            self.exec(&field.instr, value, buf, false)?;
                        }
                        buf.push(b'}');
                        buf.push(b'}');
                    }
                }
            }
            Instr::Transparent(inner) => {
                let st = peek
                    .into_struct()
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                let value = st
                    .field(0)
                    .map_err(|e| Error::unsupported_value(e.to_string()))?;
                self.exec(inner, value, buf, root)?;
            }
            Instr::DateTimeUtc => {
                let dt = peek_get!(peek, DateTime<Utc>);
                time::append_datetime(buf, dt, self.opts)?;
            }
            Instr::DateTimeFixed => {
                let dt = peek_get!(peek, DateTime<FixedOffset>);
                time::append_datetime(buf, dt, self.opts)?;
            }
            Instr::Duration => {
                let d = peek_get!(peek, std::time::Duration);
                time::append_duration(buf, d.as_nanos() as i128, self.opts.duration_format)?;
            }
            Instr::Marshal(plan) => self.exec_marshal(plan, peek, buf)?,
            Instr::Recurse(shape) => {
                let program = cache::get_or_compile(*shape, self.flags)?;
                self.exec(&program.root, peek, buf, false)?;
            }
        }
        Ok(())
    }

    fn exec_marshal(
        &self,
        plan: &MarshalPlan,
        peek: Peek<'_, '_, '_>,
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let env = MarshalEnv {
            cx: self.opts.context(),
            esc: self.opts.escape_opts(),
        };
        (plan.hook.invoke)(peek, &env, buf).map_err(|e| Error::marshaler(plan.shape, e))
    }

    fn exec_map(&self, plan: &MapPlan, peek: Peek<'_, '_, '_>, buf: &mut Vec<u8>) -> Result<(), Error> {
        let map = peek
            .into_map()
            .map_err(|e| Error::unsupported_value(e.to_string()))?;

        buf.push(b'{');
        if self.opts.unsorted_map {
            let mut first = true;
            for (key, value) in map.iter() {
                if !first {
                    buf.push(b',');
                }
                first = false;
                self.append_map_key(&plan.key, key, buf)?;
                buf.push(b':');
                self.exec(&plan.value, value, buf, false)?;
            }
        } else {
            let mut entries: Vec<(Vec<u8>, Peek<'_, '_, '_>)> = Vec::with_capacity(map.len());
            for (key, value) in map.iter() {
                let mut rendered = Vec::new();
                self.append_map_key(&plan.key, key, &mut rendered)?;
                entries.push((rendered, value));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (i, (key, value)) in entries.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                buf.extend_from_slice(key);
                buf.push(b':');
                self.exec(&plan.value, *value, buf, false)?;
            }
        }
        buf.push(b'}');
        Ok(())
    }

    fn append_map_key(
        &self,
        kind: &MapKeyKind,
        key: Peek<'_, '_, '_>,
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        match kind {
            MapKeyKind::Str => {
                let s = key
                    .as_str()
                    .ok_or_else(|| Error::unsupported_value("map key not viewable as string"))?;
                self.append_string(buf, s.as_bytes());
            }
            MapKeyKind::Signed => {
                let v = signed_value(key)?;
                buf.push(b'"');
                writer::append_int(buf, v, 10);
                buf.push(b'"');
            }
            MapKeyKind::Unsigned => {
                let v = unsigned_value(key)?;
                buf.push(b'"');
                writer::append_uint(buf, v, 10);
                buf.push(b'"');
            }
            MapKeyKind::Text(plan) => self.exec_marshal(plan, key, buf)?,
        }
        Ok(())
    }

    fn exec_struct(
        &self,
        plan: &StructPlan,
        peek: Peek<'_, '_, '_>,
        buf: &mut Vec<u8>,
        root: bool,
    ) -> Result<(), Error> {
        let esc = self.opts.escape_opts();
        buf.push(b'{');
        let mut first = true;
        'fields: for field in &plan.fields {
            if root {
                if let Some(whitelist) = &self.whitelist {
                    if !whitelist.contains(field.name.as_str()) {
                        continue;
                    }
                }
            }

            // Walk the access path; a dereference through an absent value
            // drops the field, as if it were not there at all.
            let mut value = peek;
            for step in &field.path {
                match step {
                    PathStep::Field(i) => {
                        let st = value
                            .into_struct()
                            .map_err(|e| Error::unsupported_value(e.to_string()))?;
                        value = st
                            .field(*i)
                            .map_err(|e| Error::unsupported_value(e.to_string()))?;
                    }
                    PathStep::Deref => match deref_once(value)? {
                        Some(inner) => value = inner,
                        None => continue 'fields,
                    },
                }
            }

            if field.omitempty && is_empty(value) {
                continue;
            }

            if !first {
                buf.push(b',');
            }
            first = false;
            buf.extend_from_slice(field.key.select(esc));

            if field.quoted {
                if let Some(kind) = quoted_leaf(&field.instr) {
                    self.exec_quoted(field, value, kind, buf)?;
                    continue;
                }
            }
            self.exec(&field.instr, value, buf, false)?;
        }
        buf.push(b'}');
        Ok(())
    }

    /// Renders a `quoted` field: the scalar's ordinary rendering wrapped in
    /// JSON quotes. Strings are re-escaped as a nested string; `null` from
    /// an absent pointer stays bare.
    fn exec_quoted(
        &self,
        field: &FieldPlan,
        value: Peek<'_, '_, '_>,
        kind: QuotedKind,
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let mut scratch = Vec::new();
        self.exec(&field.instr, value, &mut scratch, false)?;
        if scratch == b"null" {
            buf.extend_from_slice(&scratch);
            return Ok(());
        }
        match kind {
            QuotedKind::Text => match self.opts.escape_opts() {
                Some(opts) => escape::append_quoted(buf, &scratch, opts),
                None => escape::append_raw_quoted(buf, &scratch),
            },
            QuotedKind::Literal => {
                if scratch.first() == Some(&b'"') {
                    // Already a string form (integer beyond base 10).
                    buf.extend_from_slice(&scratch);
                } else {
                    buf.push(b'"');
                    buf.extend_from_slice(&scratch);
                    buf.push(b'"');
                }
            }
        }
        Ok(())
    }

    /// `null`, or the empty composite when the matching option asks for it.
    fn append_absent(&self, inner: &Instr, buf: &mut Vec<u8>) {
        match absent_form(inner) {
            AbsentForm::Slice if self.opts.nil_slice_empty => buf.extend_from_slice(b"[]"),
            AbsentForm::Map if self.opts.nil_map_empty => buf.extend_from_slice(b"{}"),
            _ => writer::append_null(buf),
        }
    }

    fn append_string(&self, buf: &mut Vec<u8>, bytes: &[u8]) {
        match self.opts.escape_opts() {
            Some(opts) => escape::append_quoted(buf, bytes, opts),
            None => escape::append_raw_quoted(buf, bytes),
        }
    }
}

enum AbsentForm {
    Slice,
    Map,
    Other,
}

fn absent_form(instr: &Instr) -> AbsentForm {
    match instr {
        Instr::Slice(_) | Instr::Set(_) | Instr::Bytes => AbsentForm::Slice,
        Instr::Map(_) => AbsentForm::Map,
        Instr::Pointer(inner) | Instr::Option(inner) | Instr::Transparent(inner) => {
            absent_form(inner)
        }
        _ => AbsentForm::Other,
    }
}

#[derive(Clone, Copy)]
enum QuotedKind {
    /// A string scalar; quoting nests an escaped string.
    Text,
    /// A bare literal (bool, integer, float); quoting just wraps it.
    Literal,
}

/// The scalar kind a `quoted` field resolves to, seen through options,
/// pointers and transparent wrappers. Composites are unaffected by the
/// attribute.
fn quoted_leaf(instr: &Instr) -> Option<QuotedKind> {
    match instr {
        Instr::Str => Some(QuotedKind::Text),
        Instr::Bool
        | Instr::I8
        | Instr::I16
        | Instr::I32
        | Instr::I64
        | Instr::I128
        | Instr::Isize
        | Instr::U8
        | Instr::U16
        | Instr::U32
        | Instr::U64
        | Instr::U128
        | Instr::Usize
        | Instr::F32
        | Instr::F64 => Some(QuotedKind::Literal),
        Instr::Option(inner) | Instr::Pointer(inner) | Instr::Transparent(inner) => {
            quoted_leaf(inner)
        }
        _ => None,
    }
}

fn enum_field<'mem, 'facet, 'shape>(
    peek_enum: &facet_reflect::PeekEnum<'mem, 'facet, 'shape>,
    index: usize,
) -> Result<Peek<'mem, 'facet, 'shape>, Error> {
    peek_enum
        .field(index)
        .map_err(|e| Error::unsupported_value(e.to_string()))?
        .ok_or_else(|| Error::unsupported_value("enum variant field not accessible"))
}

fn deref_once<'mem, 'facet, 'shape>(
    peek: Peek<'mem, 'facet, 'shape>,
) -> Result<Option<Peek<'mem, 'facet, 'shape>>, Error> {
    if let Ok(opt) = peek.into_option() {
        return Ok(opt.value());
    }
    let ptr = peek
        .into_pointer()
        .map_err(|e| Error::unsupported_value(e.to_string()))?;
    Ok(ptr.borrow_inner())
}

fn byte_slice<'mem>(peek: Peek<'mem, '_, '_>) -> Result<Cow<'mem, [u8]>, Error> {
    if let Some(bytes) = peek.as_bytes() {
        return Ok(Cow::Borrowed(bytes));
    }
    if let Ok(v) = peek.get::<Vec<u8>>() {
        return Ok(Cow::Owned(v.clone()));
    }
    collect_bytes(peek).map(Cow::Owned)
}

fn collect_bytes(peek: Peek<'_, '_, '_>) -> Result<Vec<u8>, Error> {
    let list = peek
        .into_list_like()
        .map_err(|e| Error::unsupported_value(e.to_string()))?;
    let mut out = Vec::with_capacity(list.len());
    for item in list.iter() {
        out.push(*item
            .get::<u8>()
            .map_err(|e| Error::unsupported_value(e.to_string()))?);
    }
    Ok(out)
}

fn signed_value(peek: Peek<'_, '_, '_>) -> Result<i128, Error> {
    use facet_reflect::ScalarType;
    let v = match peek.scalar_type() {
        Some(ScalarType::I8) => *peek_get!(peek, i8) as i128,
        Some(ScalarType::I16) => *peek_get!(peek, i16) as i128,
        Some(ScalarType::I32) => *peek_get!(peek, i32) as i128,
        Some(ScalarType::I64) => *peek_get!(peek, i64) as i128,
        Some(ScalarType::I128) => *peek_get!(peek, i128),
        Some(ScalarType::ISize) => *peek_get!(peek, isize) as i128,
        _ => return Err(Error::unsupported_value("map key is not a signed integer")),
    };
    Ok(v)
}

fn unsigned_value(peek: Peek<'_, '_, '_>) -> Result<u128, Error> {
    use facet_reflect::ScalarType;
    let v = match peek.scalar_type() {
        Some(ScalarType::U8) => *peek_get!(peek, u8) as u128,
        Some(ScalarType::U16) => *peek_get!(peek, u16) as u128,
        Some(ScalarType::U32) => *peek_get!(peek, u32) as u128,
        Some(ScalarType::U64) => *peek_get!(peek, u64) as u128,
        Some(ScalarType::U128) => *peek_get!(peek, u128),
        Some(ScalarType::USize) => *peek_get!(peek, usize) as u128,
        _ => {
            return Err(Error::unsupported_value(
                "map key is not an unsigned integer",
            ))
        }
    };
    Ok(v)
}

/// Emptiness for `omitempty`, driven by the value's shape: false, zero,
/// the empty string, an empty collection, or an absent option/pointer.
/// Zero-length arrays are always empty; time values never are.
fn is_empty(peek: Peek<'_, '_, '_>) -> bool {
    use facet::Def;
    use facet_reflect::ScalarType;

    match peek.scalar_type() {
        Some(ScalarType::Bool) => return !peek.get::<bool>().map(|v| *v).unwrap_or(true),
        Some(ScalarType::Str | ScalarType::String | ScalarType::CowStr) => {
            return peek.as_str().map(str::is_empty).unwrap_or(false);
        }
        Some(ScalarType::F32) => return peek.get::<f32>().map(|v| *v == 0.0).unwrap_or(false),
        Some(ScalarType::F64) => return peek.get::<f64>().map(|v| *v == 0.0).unwrap_or(false),
        Some(
            ScalarType::I8
            | ScalarType::I16
            | ScalarType::I32
            | ScalarType::I64
            | ScalarType::I128
            | ScalarType::ISize,
        ) => return signed_value(peek).map(|v| v == 0).unwrap_or(false),
        Some(
            ScalarType::U8
            | ScalarType::U16
            | ScalarType::U32
            | ScalarType::U64
            | ScalarType::U128
            | ScalarType::USize,
        ) => return unsigned_value(peek).map(|v| v == 0).unwrap_or(false),
        _ => {}
    }

    match peek.shape().def {
        Def::List(_) | Def::Slice(_) => peek
            .into_list_like()
            .map(|l| l.is_empty())
            .unwrap_or(false),
        Def::Array(ad) => ad.n == 0,
        Def::Set(_) => peek.into_set().map(|s| s.iter().next().is_none()).unwrap_or(false),
        Def::Map(_) => peek.into_map().map(|m| m.is_empty()).unwrap_or(false),
        Def::Option(_) => peek
            .into_option()
            .map(|o| o.is_none())
            .unwrap_or(false),
        Def::Pointer(_) => peek
            .into_pointer()
            .map(|p| p.borrow_inner().is_none())
            .unwrap_or(false),
        _ => false,
    }
}
