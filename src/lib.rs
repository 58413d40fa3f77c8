//! jato — a compiled JSON encoder over runtime type shapes.
//!
//! For every value type, jato lowers the type's [`facet::Shape`] into a
//! reusable encoding program once, caches it for the process lifetime, and
//! executes it against values to produce JSON bytes. The output follows
//! the conventions of the reference encoder family: map keys sorted by
//! default, HTML-safe string escaping, UTF-8 coercion, base64 byte
//! slices, shortest round-trip floats.
//!
//! ```
//! use facet::Facet;
//!
//! #[derive(Facet)]
//! struct Friend {
//!     age: u32,
//!     name: String,
//! }
//!
//! let friend = Friend { age: 42, name: "Alice".into() };
//! let json = jato::to_string(&friend).unwrap();
//! assert_eq!(json, r#"{"age":42,"name":"Alice"}"#);
//! ```
//!
//! Per-call behavior is tuned through [`EncodeOptions`]; types can take
//! over their own rendering by registering one of the marshal
//! capabilities (see [`WriteJson`] and friends).

mod cache;
mod compile;
mod engine;
mod error;
mod escape;
mod float;
mod marshal;
mod opts;
mod program;
mod raw;
mod time;
mod writer;

use std::cell::RefCell;

use facet::{Facet, Shape};
use facet_reflect::Peek;

pub use crate::error::{BoxError, Error};
pub use crate::marshal::{
    register_marshal_json, register_marshal_text, register_write_json,
    register_write_json_context, MarshalJson, MarshalText, WriteJson, WriteJsonContext,
};
pub use crate::opts::{Context, EncodeOptions};
pub use crate::raw::{Number, RawJson};
pub use crate::time::DurationFormat;
pub use crate::writer::{IoSink, Sink};

use crate::compile::CompileFlags;
use crate::engine::Engine;

/// A reusable encoder bound to one value type.
///
/// The encoder itself is cheap; the compiled program lives in the global
/// cache and is shared with every other encoder (and the free functions)
/// for the same type.
pub struct Encoder {
    shape: &'static Shape<'static>,
}

impl Encoder {
    /// Creates an encoder for `T`.
    pub fn new<'f, T: Facet<'f>>() -> Self {
        Encoder { shape: T::SHAPE }
    }

    /// Creates an encoder for an already-resolved shape.
    pub fn for_shape(shape: &'static Shape<'static>) -> Self {
        Encoder { shape }
    }

    /// The shape this encoder renders.
    pub fn shape(&self) -> &'static Shape<'static> {
        self.shape
    }

    /// Compiles the encoding program eagerly. Without this, compilation
    /// happens on the first encode.
    pub fn compile(&self) -> Result<(), Error> {
        cache::get_or_compile(self.shape, CompileFlags::current()).map(|_| ())
    }

    /// Encodes `value` into `sink`. The value's type must be the type the
    /// encoder was created for.
    pub fn encode<'f, T, S>(
        &self,
        value: &T,
        sink: &mut S,
        opts: &EncodeOptions,
    ) -> Result<(), Error>
    where
        T: Facet<'f>,
        S: Sink,
    {
        self.encode_peek(Peek::new(value), sink, opts)
    }

    /// Encodes an already-reflected value into `sink`.
    pub fn encode_peek<S: Sink>(
        &self,
        peek: Peek<'_, '_, 'static>,
        sink: &mut S,
        opts: &EncodeOptions,
    ) -> Result<(), Error> {
        if peek.shape() != self.shape {
            return Err(Error::TypeMismatch {
                expected: self.shape,
                actual: peek.shape(),
            });
        }
        encode_to(self.shape, peek, sink, opts)
    }
}

/// Encodes `value` to a byte vector with default options.
pub fn to_vec<'f, T: Facet<'f>>(value: &T) -> Result<Vec<u8>, Error> {
    to_vec_with(value, &EncodeOptions::new())
}

/// Encodes `value` to a byte vector.
pub fn to_vec_with<'f, T: Facet<'f>>(value: &T, opts: &EncodeOptions) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    encode_to(T::SHAPE, Peek::new(value), &mut out, opts)?;
    Ok(out)
}

/// Encodes `value` to a string with default options.
pub fn to_string<'f, T: Facet<'f>>(value: &T) -> Result<String, Error> {
    to_string_with(value, &EncodeOptions::new())
}

/// Encodes `value` to a string.
///
/// Fails if the output is not UTF-8, which can only happen when escaping
/// or UTF-8 coercion has been disabled for a value holding invalid bytes.
pub fn to_string_with<'f, T: Facet<'f>>(value: &T, opts: &EncodeOptions) -> Result<String, Error> {
    let bytes = to_vec_with(value, opts)?;
    String::from_utf8(bytes).map_err(|_| Error::unsupported_value("output is not valid UTF-8"))
}

/// Encodes `value` into a `std::io::Write` with default options.
pub fn to_writer<'f, T: Facet<'f>, W: std::io::Write>(value: &T, writer: W) -> Result<(), Error> {
    to_writer_with(value, writer, &EncodeOptions::new())
}

/// Encodes `value` into a `std::io::Write`.
pub fn to_writer_with<'f, T: Facet<'f>, W: std::io::Write>(
    value: &T,
    writer: W,
    opts: &EncodeOptions,
) -> Result<(), Error> {
    let mut sink = IoSink::new(writer);
    encode_to(T::SHAPE, Peek::new(value), &mut sink, opts)?;
    sink.into_result().map_err(Error::from)
}

fn encode_to<S: Sink>(
    shape: &'static Shape<'static>,
    peek: Peek<'_, '_, '_>,
    sink: &mut S,
    opts: &EncodeOptions,
) -> Result<(), Error> {
    opts.validate()?;
    let flags = CompileFlags::current();
    let program = cache::get_or_compile(shape, flags)?;
    with_scratch(|buf| {
        let engine = Engine::new(opts, flags);
        engine.run(&program, peek, buf)?;
        sink.reserve(buf.len());
        sink.write(buf);
        Ok(())
    })
}

thread_local! {
    // Per-call scratch buffers, reused across encodes on the same thread.
    static SCRATCH: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

fn with_scratch<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    let mut buf = SCRATCH
        .with(|pool| pool.borrow_mut().pop())
        .unwrap_or_default();
    let out = f(&mut buf);
    buf.clear();
    SCRATCH.with(|pool| pool.borrow_mut().push(buf));
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};
    use facet::Facet;

    use super::*;

    fn json<'f, T: Facet<'f>>(value: &T) -> String {
        to_string(value).unwrap()
    }

    fn json_with<'f, T: Facet<'f>>(value: &T, opts: &EncodeOptions) -> String {
        to_string_with(value, opts).unwrap()
    }

    // ── Scalars ──────────────────────────────────────────────────────

    #[test]
    fn basic_types() {
        assert_eq!(json(&true), "true");
        assert_eq!(json(&false), "false");
        assert_eq!(json(&String::from("Loreum")), "\"Loreum\"");
        assert_eq!(json(&i8::MAX), "127");
        assert_eq!(json(&i16::MAX), "32767");
        assert_eq!(json(&i32::MAX), "2147483647");
        assert_eq!(json(&i64::MAX), "9223372036854775807");
        assert_eq!(json(&i64::MIN), "-9223372036854775808");
        assert_eq!(json(&u8::MAX), "255");
        assert_eq!(json(&u16::MAX), "65535");
        assert_eq!(json(&u32::MAX), "4294967295");
        assert_eq!(json(&u64::MAX), "18446744073709551615");
        assert_eq!(json(&0xBEEFusize), "48879");
        assert_eq!(json(&Option::<i32>::None), "null");
        assert_eq!(json(&Some(Box::new(5i32))), "5");
        assert_eq!(json(&()), "null");
        assert_eq!(json(&'ǣ'), "\"ǣ\"");
    }

    #[test]
    fn integer_bases() {
        let opts = EncodeOptions::new().integer_base(16);
        assert_eq!(json_with(&-1i8, &opts), "\"-1\"");
        assert_eq!(json_with(&255u8, &opts), "\"ff\"");

        let opts = EncodeOptions::new().integer_base(2);
        assert_eq!(json_with(&255u8, &opts), "11111111");

        let opts = EncodeOptions::new().integer_base(36);
        assert_eq!(json_with(&35u8, &opts), "\"z\"");
    }

    #[test]
    fn floats() {
        assert_eq!(json(&3.25f64), "3.25");
        assert_eq!(json(&f64::MAX), "1.7976931348623157e+308");
        assert_eq!(json(&1.0f32), "1");
        assert!(matches!(to_vec(&f64::NAN), Err(Error::UnsupportedValue(_))));
        assert!(matches!(
            to_vec(&f32::INFINITY),
            Err(Error::UnsupportedValue(_))
        ));
    }

    // ── Strings and escaping ─────────────────────────────────────────

    #[test]
    fn string_escaping() {
        let input = String::from_utf8(vec![
            b'A', 1, 2, 3, b'"', b'\\', b'B', b'C', 8, 12, b'\n', b'\r', b'\t', 0xC7, 0xA3,
        ])
        .unwrap();
        // 0xC7 0xA3 is ǣ; the rest exercises the control shortcuts.
        let want = "\"A\\u0001\\u0002\\u0003\\\"\\\\BC\\u0008\\u000c\\n\\r\\t\u{1e3}\"";
        assert_eq!(json(&input), want);

        // Solidus escaping is kept.
        assert_eq!(json(&String::from("a/b")), "\"a\\/b\"");

        let sep = String::from("x\u{2028}y\u{2029}z");
        assert_eq!(json(&sep), "\"x\\u2028y\\u2029z\"");
    }

    #[test]
    fn html_escaping_options() {
        let s = String::from("<>&");
        assert_eq!(json(&s), "\"\\u003c\\u003e\\u0026\"");
        assert_eq!(
            json_with(&s, &EncodeOptions::new().no_html_escaping()),
            "\"<>&\""
        );
        // Escaping off entirely supersedes the HTML option.
        assert_eq!(
            json_with(&s, &EncodeOptions::new().no_string_escaping()),
            "\"<>&\""
        );
    }

    // ── Composites ───────────────────────────────────────────────────

    #[test]
    fn sequences() {
        assert_eq!(json(&Vec::<u32>::new()), "[]");
        assert_eq!(json(&vec![1i32, 2, 3]), "[1,2,3]");
        assert_eq!(
            json(&vec!["a".to_string(), "b".to_string()]),
            "[\"a\",\"b\"]"
        );
        assert_eq!(json(&[true, false]), "[true,false]");
        assert_eq!(json(&vec![Some(1u32), None]), "[1,null]");
    }

    #[derive(Facet)]
    struct Pair(i32, String);

    #[test]
    fn tuple_structs_render_as_arrays() {
        assert_eq!(json(&Pair(7, "x".into())), "[7,\"x\"]");
    }

    #[test]
    fn maps_sort_by_rendered_key() {
        let mut m = HashMap::new();
        m.insert("c".to_string(), 3i32);
        m.insert("a".to_string(), 1);
        m.insert("b".to_string(), 2);
        assert_eq!(json(&m), "{\"a\":1,\"b\":2,\"c\":3}");

        // Integer keys sort lexicographically by their rendered bytes.
        let mut m = HashMap::new();
        m.insert(10i64, "a".to_string());
        m.insert(2, "b".to_string());
        assert_eq!(json(&m), "{\"10\":\"a\",\"2\":\"b\"}");
    }

    #[test]
    fn unsorted_map_emits_every_entry_once() {
        let mut m = HashMap::new();
        m.insert("a".to_string(), 1i32);
        m.insert("b".to_string(), 2);
        m.insert("c".to_string(), 3);
        let out = json_with(&m, &EncodeOptions::new().unsorted_map());
        assert_eq!(out.len(), "{\"a\":1,\"b\":2,\"c\":3}".len());
        for frag in ["\"a\":1", "\"b\":2", "\"c\":3"] {
            assert!(out.contains(frag), "{out}");
        }
    }

    #[test]
    fn absent_collections() {
        assert_eq!(json(&Option::<Vec<String>>::None), "null");
        assert_eq!(
            json_with(
                &Option::<Vec<String>>::None,
                &EncodeOptions::new().nil_slice_empty()
            ),
            "[]"
        );
        assert_eq!(json(&Option::<HashMap<String, i32>>::None), "null");
        assert_eq!(
            json_with(
                &Option::<HashMap<String, i32>>::None,
                &EncodeOptions::new().nil_map_empty()
            ),
            "{}"
        );
    }

    // ── Byte slices and arrays ───────────────────────────────────────

    #[test]
    fn byte_slices_use_base64() {
        let b = b"Loreum".to_vec();
        assert_eq!(json(&b), "\"TG9yZXVt\"");
        assert_eq!(
            json_with(&b, &EncodeOptions::new().raw_byte_slice()),
            "\"Loreum\""
        );
        assert_eq!(json(&Vec::<u8>::new()), "\"\"");
    }

    #[test]
    fn byte_arrays_default_to_numbers() {
        let a = [b'a', b'b', b'c'];
        assert_eq!(json(&a), "[97,98,99]");
        assert_eq!(
            json_with(&a, &EncodeOptions::new().byte_array_as_string()),
            "\"abc\""
        );
    }

    #[derive(Facet)]
    #[facet(transparent)]
    struct Blob(Vec<u8>);

    #[test]
    fn named_byte_slices_follow_the_underlying_rule() {
        assert_eq!(json(&Blob(b"Loreum".to_vec())), "\"TG9yZXVt\"");
    }

    // ── Structs ──────────────────────────────────────────────────────

    #[derive(Facet)]
    struct BasicFields {
        a: String,
        b: i64,
        #[facet(rename = "renamed")]
        c: bool,
        #[facet(skip_serializing)]
        d: u8,
        e: f64,
    }

    #[test]
    fn struct_fields_in_declaration_order() {
        let v = BasicFields {
            a: "Loreum".into(),
            b: -42,
            c: true,
            d: 9,
            e: 3.25,
        };
        assert_eq!(json(&v), r#"{"a":"Loreum","b":-42,"renamed":true,"e":3.25}"#);
    }

    #[derive(Facet)]
    struct OmitEmpty {
        #[facet(omitempty)]
        a: String,
        #[facet(omitempty)]
        b: String,
        #[facet(omitempty)]
        c: Option<String>,
        #[facet(omitempty)]
        d: Option<String>,
        #[facet(omitempty)]
        e: bool,
        #[facet(omitempty)]
        f: i32,
        #[facet(omitempty)]
        g: f64,
        #[facet(omitempty)]
        h: Vec<String>,
        #[facet(omitempty)]
        i: HashMap<String, i32>,
        #[facet(omitempty)]
        k: [i32; 2],
    }

    #[test]
    fn omitempty_drops_empty_values() {
        let v = OmitEmpty {
            a: "Loreum".into(),
            b: String::new(),
            c: Some(String::new()),
            d: None,
            e: false,
            f: 0,
            g: 0.0,
            h: Vec::new(),
            i: HashMap::new(),
            k: [0, 0],
        };
        // A present-but-empty string behind an option is not empty; a
        // fixed-size array of nonzero length never is.
        assert_eq!(json(&v), r#"{"a":"Loreum","c":"","k":[0,0]}"#);
    }

    #[test]
    fn omitempty_zero_integers_in_any_base() {
        #[derive(Facet)]
        struct Z {
            #[facet(omitempty)]
            n: u32,
        }
        let opts = EncodeOptions::new().integer_base(16);
        assert_eq!(json_with(&Z { n: 0 }, &opts), "{}");
        assert_eq!(json_with(&Z { n: 255 }, &opts), "{\"n\":\"ff\"}");
    }

    #[derive(Facet)]
    struct Quoted {
        #[facet(quoted)]
        a1: i32,
        #[facet(quoted)]
        a2: Option<i32>,
        #[facet(quoted)]
        a3: Option<i32>,
        #[facet(quoted)]
        b: u32,
        #[facet(quoted)]
        c: bool,
        #[facet(quoted)]
        e: String,
    }

    #[test]
    fn quoted_fields_wrap_their_scalars() {
        let v = Quoted {
            a1: -42,
            a2: None,
            a3: Some(84),
            b: 42,
            c: true,
            e: "Loreum".into(),
        };
        assert_eq!(
            json(&v),
            r#"{"a1":"-42","a2":null,"a3":"84","b":"42","c":"true","e":"\"Loreum\""}"#
        );
    }

    #[test]
    fn field_names_with_html_characters() {
        #[derive(Facet)]
        struct Tagged {
            #[facet(rename = "ben&jerry")]
            a: i32,
            #[facet(rename = "a>2")]
            b: i32,
        }
        let v = Tagged { a: 1, b: 2 };
        assert_eq!(json(&v), "{\"ben\\u0026jerry\":1,\"a\\u003e2\":2}");
        assert_eq!(
            json_with(&v, &EncodeOptions::new().no_html_escaping()),
            r#"{"ben&jerry":1,"a>2":2}"#
        );
    }

    // ── Flattened (embedded) fields ──────────────────────────────────

    #[derive(Facet)]
    struct S1 {
        x: i32,
    }

    #[derive(Facet)]
    struct S2 {
        x: i32,
    }

    #[derive(Facet)]
    struct AmbiguousX {
        #[facet(flatten)]
        s1: S1,
        #[facet(flatten)]
        s2: S2,
    }

    #[test]
    fn ambiguous_flattened_names_vanish() {
        let v = AmbiguousX {
            s1: S1 { x: 1 },
            s2: S2 { x: 3 },
        };
        assert_eq!(json(&v), "{}");
    }

    #[derive(Facet)]
    struct DominantX {
        #[facet(flatten)]
        s1: S1,
        #[facet(flatten)]
        s2: S2,
        x: i32,
    }

    #[test]
    fn outer_field_dominates() {
        let v = DominantX {
            s1: S1 { x: 2 },
            s2: S2 { x: 4 },
            x: 6,
        };
        assert_eq!(json(&v), r#"{"x":6}"#);
    }

    #[derive(Facet)]
    struct BehindPointer {
        #[facet(flatten)]
        inner: Option<S1>,
        y: u8,
    }

    #[test]
    fn flattened_fields_behind_an_absent_pointer_are_skipped() {
        assert_eq!(json(&BehindPointer { inner: None, y: 7 }), r#"{"y":7}"#);
        assert_eq!(
            json(&BehindPointer {
                inner: Some(S1 { x: 3 }),
                y: 7
            }),
            r#"{"x":3,"y":7}"#
        );
    }

    #[derive(Facet)]
    struct WlInner {
        #[facet(rename = "epsilon")]
        e: String,
        f: String,
    }

    #[derive(Facet)]
    struct Wl {
        #[facet(rename = "alpha")]
        a: String,
        #[facet(rename = "beta")]
        b: String,
        c: String,
        d: String,
        #[facet(flatten)]
        y: WlInner,
    }

    #[test]
    fn whitelist_restricts_root_fields() {
        let v = Wl {
            a: "Loreum".into(),
            b: "hidden".into(),
            c: "Ipsum".into(),
            d: "hidden".into(),
            y: WlInner {
                e: "Sit Amet".into(),
                f: "hidden".into(),
            },
        };
        let opts = EncodeOptions::new().with_fields(["alpha", "c", "epsilon"]);
        assert_eq!(
            json_with(&v, &opts),
            r#"{"alpha":"Loreum","c":"Ipsum","epsilon":"Sit Amet"}"#
        );
    }

    // ── Recursive types ──────────────────────────────────────────────

    #[derive(Facet)]
    struct Node {
        a: String,
        x: Option<Box<Node>>,
    }

    #[test]
    fn recursive_values_encode_to_their_actual_depth() {
        let v = Node {
            a: "Loreum".into(),
            x: Some(Box::new(Node {
                a: "Ipsem".into(),
                x: None,
            })),
        };
        assert_eq!(json(&v), r#"{"a":"Loreum","x":{"a":"Ipsem","x":null}}"#);
    }

    // ── Enums ────────────────────────────────────────────────────────

    #[derive(Facet)]
    #[repr(u8)]
    enum Payload {
        Empty,
        Text(String),
        Rect { w: u32, h: u32 },
    }

    #[test]
    fn enums_dispatch_on_the_active_variant() {
        assert_eq!(json(&Payload::Empty), "\"Empty\"");
        assert_eq!(json(&Payload::Text("hi".into())), r#"{"Text":"hi"}"#);
        assert_eq!(
            json(&Payload::Rect { w: 3, h: 4 }),
            r#"{"Rect":{"w":3,"h":4}}"#
        );
    }

    // ── Number and RawJson ───────────────────────────────────────────

    #[test]
    fn number_literals_pass_through_validated() {
        assert_eq!(json(&Number::new("24.42")), "24.42");
        assert_eq!(json(&Number::new("1E+42")), "1E+42");
        for bad in ["084", "1E+4.0", "-", "", "invalid"] {
            let err = to_vec(&Number::new(bad)).unwrap_err();
            assert!(matches!(err, Error::UnsupportedValue(_)), "{bad}");
        }
    }

    #[test]
    fn raw_json_is_verbatim() {
        #[derive(Facet)]
        struct Doc {
            n: Number,
            r: RawJson,
        }
        let v = Doc {
            n: Number::from(-42i64),
            r: RawJson::new(r#"{"x":[1,2]}"#),
        };
        assert_eq!(json(&v), r#"{"n":-42,"r":{"x":[1,2]}}"#);
    }

    // ── Time and duration ────────────────────────────────────────────

    #[test]
    fn time_and_duration_leaves() {
        #[derive(Facet)]
        struct Stamped {
            t: chrono::DateTime<Utc>,
            d: std::time::Duration,
        }
        let v = Stamped {
            t: Utc.with_ymd_and_hms(2009, 7, 12, 11, 3, 25).unwrap(),
            d: std::time::Duration::new(3820, 0),
        };
        assert_eq!(json(&v), r#"{"t":"2009-07-12T11:03:25Z","d":"1h3m40s"}"#);
        let opts = EncodeOptions::new()
            .unix_timestamp()
            .duration_format(DurationFormat::Seconds);
        assert_eq!(json_with(&v, &opts), r#"{"t":1247396605,"d":3820}"#);
    }

    // ── Marshal capabilities ─────────────────────────────────────────

    #[derive(Facet)]
    struct Upper(String);

    impl WriteJson for Upper {
        fn write_json(&self, sink: &mut dyn Sink) -> Result<(), BoxError> {
            let mut out = String::with_capacity(self.0.len() + 2);
            out.push('"');
            out.push_str(&self.0.to_uppercase());
            out.push('"');
            sink.write_str(&out);
            Ok(())
        }
    }

    #[test]
    fn write_json_hook_takes_over() {
        register_write_json::<Upper>();
        #[derive(Facet)]
        struct Holder {
            u: Upper,
        }
        let v = Holder {
            u: Upper("loreum".into()),
        };
        assert_eq!(json(&v), r#"{"u":"LOREUM"}"#);
    }

    #[derive(Facet)]
    struct Everything(u8);

    impl WriteJsonContext for Everything {
        fn write_json_context(&self, cx: &Context, sink: &mut dyn Sink) -> Result<(), BoxError> {
            let tag = cx.get::<String>().map(String::as_str).unwrap_or("none");
            sink.write_str(&format!("\"ctx:{tag}\""));
            Ok(())
        }
    }

    impl WriteJson for Everything {
        fn write_json(&self, sink: &mut dyn Sink) -> Result<(), BoxError> {
            sink.write(b"\"writer\"");
            Ok(())
        }
    }

    impl MarshalJson for Everything {
        fn marshal_json(&self) -> Result<Vec<u8>, BoxError> {
            Ok(b"\"json\"".to_vec())
        }
    }

    impl MarshalText for Everything {
        fn marshal_text(&self) -> Result<String, BoxError> {
            Ok("text".into())
        }
    }

    #[test]
    fn capability_priority_is_fixed() {
        register_marshal_text::<Everything>();
        register_marshal_json::<Everything>();
        register_write_json::<Everything>();
        register_write_json_context::<Everything>();

        let cx = Context::new(String::from("k7"));
        let out = json_with(&Everything(0), &EncodeOptions::new().with_context(cx));
        assert_eq!(out, "\"ctx:k7\"");

        // Without a payload the hook still runs, observing the empty
        // context.
        assert_eq!(json(&Everything(0)), "\"ctx:none\"");
    }

    #[derive(Facet, PartialEq, Eq, Hash)]
    struct Texty(u32);

    impl MarshalText for Texty {
        fn marshal_text(&self) -> Result<String, BoxError> {
            Ok(format!("<{}>", self.0))
        }
    }

    #[test]
    fn text_capability_is_escaped_and_quoted() {
        register_marshal_text::<Texty>();
        assert_eq!(json(&Texty(9)), "\"\\u003c9\\u003e\"");
    }

    #[test]
    fn text_capability_keys_maps() {
        register_marshal_text::<Texty>();
        let mut m: HashMap<Texty, String> = HashMap::new();
        m.insert(Texty(2), "b".to_string());
        m.insert(Texty(1), "a".to_string());
        let out = json_with(&m, &EncodeOptions::new().no_html_escaping());
        assert_eq!(out, r#"{"<1>":"a","<2>":"b"}"#);
    }

    #[derive(Facet)]
    struct Failing(u8);

    impl MarshalJson for Failing {
        fn marshal_json(&self) -> Result<Vec<u8>, BoxError> {
            Err("hook failed".into())
        }
    }

    #[test]
    fn marshaler_errors_are_wrapped() {
        use std::error::Error as _;
        register_marshal_json::<Failing>();
        let err = to_vec(&Failing(0)).unwrap_err();
        match &err {
            Error::Marshaler { shape, source } => {
                assert_eq!(*shape, Failing::SHAPE);
                assert_eq!(source.to_string(), "hook failed");
            }
            other => panic!("expected marshaler error, got {other}"),
        }
        assert_eq!(err.source().unwrap().to_string(), "hook failed");
    }

    // ── Error surface ────────────────────────────────────────────────

    #[derive(Facet)]
    struct TypeA {
        n: u8,
    }

    #[derive(Facet)]
    struct TypeB {
        n: u8,
    }

    #[test]
    fn encoding_the_wrong_type_is_a_mismatch() {
        let enc = Encoder::new::<TypeA>();
        let mut out = Vec::new();
        let err = enc
            .encode(&TypeB { n: 1 }, &mut out, &EncodeOptions::new())
            .unwrap_err();
        match err {
            Error::TypeMismatch { expected, actual } => {
                assert_eq!(expected, TypeA::SHAPE);
                assert_eq!(actual, TypeB::SHAPE);
            }
            other => panic!("expected type mismatch, got {other}"),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn unsupported_types_fail_compile() {
        let enc = Encoder::new::<fn()>();
        assert!(matches!(enc.compile(), Err(Error::UnsupportedType(_))));
    }

    #[test]
    fn invalid_options_fail_before_any_output() {
        #[derive(Facet)]
        struct Empty {}
        let enc = Encoder::new::<Empty>();
        let mut out = Vec::new();
        for opts in [
            EncodeOptions::new().integer_base(1),
            EncodeOptions::new().integer_base(37),
            EncodeOptions::new().time_layout(""),
            EncodeOptions::new().time_layout("%Q"),
        ] {
            let err = enc.encode(&Empty {}, &mut out, &opts).unwrap_err();
            assert!(matches!(err, Error::InvalidOption(_)));
            assert!(out.is_empty());
        }
    }

    // ── Sharing and concurrency ──────────────────────────────────────

    #[test]
    fn concurrent_encodes_share_one_program() {
        #[derive(Facet)]
        struct Shared {
            n: u64,
            s: String,
        }
        let enc = Encoder::new::<Shared>();
        enc.compile().unwrap();
        std::thread::scope(|scope| {
            for i in 0..8u64 {
                let enc = &enc;
                scope.spawn(move || {
                    let v = Shared {
                        n: i,
                        s: "x".repeat(i as usize),
                    };
                    let mut out = Vec::new();
                    enc.encode(&v, &mut out, &EncodeOptions::new()).unwrap();
                    let want = format!("{{\"n\":{},\"s\":\"{}\"}}", i, "x".repeat(i as usize));
                    assert_eq!(String::from_utf8(out).unwrap(), want);
                });
            }
        });
    }

    #[test]
    fn io_writer_sink() {
        let mut out = Vec::new();
        to_writer(&vec![1u32, 2], &mut out).unwrap();
        assert_eq!(out, b"[1,2]");
    }
}
