//! Per-call encoding options.
//!
//! Options are validated in one pass before anything is emitted, so an
//! invalid combination never produces partial output.

use std::any::Any;
use std::sync::Arc;

use chrono::format::{Item, StrftimeItems};

use crate::error::Error;
use crate::escape::EscapeOpts;
use crate::time::DurationFormat;

/// Ambient value threaded to [`WriteJsonContext`](crate::WriteJsonContext)
/// marshalers, carrying an arbitrary caller payload.
#[derive(Clone)]
pub struct Context(Option<Arc<dyn Any + Send + Sync>>);

impl Context {
    /// An empty context; what context-aware marshalers observe when the
    /// caller did not supply one.
    pub const fn empty() -> Self {
        Context(None)
    }

    /// Wraps a caller payload.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Context(Some(Arc::new(value)))
    }

    /// Borrows the payload, if it has the requested type.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref::<T>())
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::empty()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_some() {
            "Context(..)"
        } else {
            "Context(empty)"
        })
    }
}

/// Time rendering selected by the options, resolved per leaf.
pub(crate) enum TimeFormat<'a> {
    Rfc3339,
    Layout(&'a str),
    Unix,
}

/// Options accepted by a single encode call.
///
/// Built fluently and passed by reference; the default value encodes with
/// sorted map keys, HTML-safe escaping, base-10 integers and RFC 3339
/// times.
#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    pub(crate) context: Option<Context>,
    pub(crate) time_layout: Option<String>,
    pub(crate) unix_timestamp: bool,
    pub(crate) duration_format: DurationFormat,
    pub(crate) integer_base: Option<u32>,
    pub(crate) unsorted_map: bool,
    pub(crate) nil_map_empty: bool,
    pub(crate) nil_slice_empty: bool,
    pub(crate) no_html_escaping: bool,
    pub(crate) no_string_escaping: bool,
    pub(crate) no_utf8_coercion: bool,
    pub(crate) byte_array_as_string: bool,
    pub(crate) raw_byte_slice: bool,
    pub(crate) fields: Option<Vec<String>>,
}

impl EncodeOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads `ctx` to context-aware marshalers.
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.context = Some(ctx);
        self
    }

    /// Renders time leaves with a strftime layout. Empty or malformed
    /// layouts are rejected when the encode call validates its options.
    pub fn time_layout(mut self, layout: impl Into<String>) -> Self {
        self.time_layout = Some(layout.into());
        self
    }

    /// Renders time leaves as unix seconds. Takes precedence over
    /// [`time_layout`](Self::time_layout).
    pub fn unix_timestamp(mut self) -> Self {
        self.unix_timestamp = true;
        self
    }

    /// Selects the rendering of duration leaves.
    pub fn duration_format(mut self, format: DurationFormat) -> Self {
        self.duration_format = format;
        self
    }

    /// Renders integers in `base`; must lie in `[2, 36]`. Bases above 10
    /// emit quoted strings.
    pub fn integer_base(mut self, base: u32) -> Self {
        self.integer_base = Some(base);
        self
    }

    /// Emits map entries in iteration order instead of sorting keys.
    pub fn unsorted_map(mut self) -> Self {
        self.unsorted_map = true;
        self
    }

    /// Emits `{}` instead of `null` for an absent map.
    pub fn nil_map_empty(mut self) -> Self {
        self.nil_map_empty = true;
        self
    }

    /// Emits `[]` instead of `null` for an absent slice.
    pub fn nil_slice_empty(mut self) -> Self {
        self.nil_slice_empty = true;
        self
    }

    /// Leaves `<`, `>` and `&` unescaped.
    pub fn no_html_escaping(mut self) -> Self {
        self.no_html_escaping = true;
        self
    }

    /// Copies string bytes verbatim between quotes. Supersedes the HTML
    /// and UTF-8 coercion options.
    pub fn no_string_escaping(mut self) -> Self {
        self.no_string_escaping = true;
        self
    }

    /// Leaves invalid UTF-8 bytes in place instead of replacing them with
    /// U+FFFD.
    pub fn no_utf8_coercion(mut self) -> Self {
        self.no_utf8_coercion = true;
        self
    }

    /// Renders `[u8; N]` values as a quoted string instead of an array of
    /// numbers.
    pub fn byte_array_as_string(mut self) -> Self {
        self.byte_array_as_string = true;
        self
    }

    /// Renders byte slices as a quoted raw string instead of base64.
    pub fn raw_byte_slice(mut self) -> Self {
        self.raw_byte_slice = true;
        self
    }

    /// Restricts the root struct to the listed display names (promoted
    /// flattened names included).
    pub fn with_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Checks every option value; called once per encode, before emission.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if let Some(base) = self.integer_base {
            if !(2..=36).contains(&base) {
                return Err(Error::invalid_option(format!(
                    "integer base {base} out of range [2,36]"
                )));
            }
        }
        if let Some(layout) = &self.time_layout {
            if layout.is_empty() {
                return Err(Error::invalid_option("empty time layout"));
            }
            let malformed = StrftimeItems::new(layout).any(|it| matches!(it, Item::Error));
            if malformed {
                return Err(Error::invalid_option(format!(
                    "malformed time layout {layout:?}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn base(&self) -> u32 {
        self.integer_base.unwrap_or(10)
    }

    pub(crate) fn time_format(&self) -> TimeFormat<'_> {
        if self.unix_timestamp {
            TimeFormat::Unix
        } else if let Some(layout) = &self.time_layout {
            TimeFormat::Layout(layout)
        } else {
            TimeFormat::Rfc3339
        }
    }

    /// Escaping knobs for string leaves; `None` when escaping is disabled
    /// entirely.
    pub(crate) fn escape_opts(&self) -> Option<EscapeOpts> {
        if self.no_string_escaping {
            return None;
        }
        Some(EscapeOpts {
            html: !self.no_html_escaping,
            coerce_utf8: !self.no_utf8_coercion,
        })
    }

    pub(crate) fn context(&self) -> Context {
        self.context.clone().unwrap_or_default()
    }
}
