//! Value conversion between Rust types and PostgreSQL text format.
//!
//! Results arrive in text format (simple query protocol), so decoding is
//! a parse of the server's textual representation checked against the
//! column's type OID. Parameters travel the other way as SQL literals
//! spliced into the query text in place of `$1`, `$2`, ...

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

/// Trait for decoding PostgreSQL text values into Rust types.
///
/// The OID parameter allows implementations to check the PostgreSQL type
/// and reject incompatible types with clear error messages.
pub trait FromWireValue<'a>: Sized {
    /// Decode from NULL value.
    ///
    /// Default implementation returns an error. Override for types that can
    /// represent NULL (like `Option<T>`).
    fn from_null() -> Result<Self> {
        Err(Error::Decode("unexpected NULL value".into()))
    }

    /// Decode from text format bytes.
    fn from_text(oid: Oid, bytes: &'a [u8]) -> Result<Self>;
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))
}

impl<'a, T: FromWireValue<'a>> FromWireValue<'a> for Option<T> {
    fn from_null() -> Result<Self> {
        Ok(None)
    }

    fn from_text(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        T::from_text(oid, bytes).map(Some)
    }
}

impl FromWireValue<'_> for bool {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BOOL {
            return Err(Error::Decode(format!("cannot decode oid {} as bool", oid)));
        }
        match bytes {
            b"t" | b"true" => Ok(true),
            b"f" | b"false" => Ok(false),
            _ => Err(Error::Decode(format!(
                "invalid boolean: {:?}",
                String::from_utf8_lossy(bytes)
            ))),
        }
    }
}

macro_rules! impl_from_text_number {
    ($T:ty, $name:literal, $($oid:path)|+) => {
        impl FromWireValue<'_> for $T {
            fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
                if !matches!(oid, $($oid)|+) {
                    return Err(Error::Decode(format!(
                        concat!("cannot decode oid {} as ", $name),
                        oid
                    )));
                }
                utf8(bytes)?
                    .parse()
                    .map_err(|e| Error::Decode(format!(concat!("invalid ", $name, ": {}"), e)))
            }
        }
    };
}

impl_from_text_number!(i16, "i16", oid::INT2);
impl_from_text_number!(i32, "i32", oid::INT2 | oid::INT4);
impl_from_text_number!(i64, "i64", oid::INT2 | oid::INT4 | oid::INT8);
impl_from_text_number!(u32, "u32", oid::OID);
impl_from_text_number!(f32, "f32", oid::FLOAT4);
impl_from_text_number!(f64, "f64", oid::FLOAT4 | oid::FLOAT8 | oid::NUMERIC);

impl<'a> FromWireValue<'a> for &'a str {
    fn from_text(oid: Oid, bytes: &'a [u8]) -> Result<Self> {
        if !matches!(
            oid,
            oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::UNKNOWN
        ) {
            return Err(Error::Decode(format!("cannot decode oid {} as str", oid)));
        }
        utf8(bytes)
    }
}

impl FromWireValue<'_> for String {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        <&str>::from_text(oid, bytes).map(str::to_owned)
    }
}

impl FromWireValue<'_> for Vec<u8> {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        if oid != oid::BYTEA {
            return Err(Error::Decode(format!(
                "cannot decode oid {} as Vec<u8>",
                oid
            )));
        }
        // Text format for bytea is hex-encoded: \xDEADBEEF
        let digits = bytes
            .strip_prefix(b"\\x")
            .ok_or_else(|| Error::Decode("bytea is not in hex format".into()))?;
        hex::decode(digits).map_err(|e| Error::Decode(format!("invalid bytea: {}", e)))
    }
}

/// Trait for rendering a Rust value as a SQL literal.
pub trait ToSqlLiteral {
    /// Append the literal to `out`.
    fn write_literal(&self, out: &mut String);
}

/// Quote a string as a SQL literal.
///
/// Single quotes are doubled. A string containing backslashes is emitted
/// as an escape string (`E'...'`) with the backslashes doubled, so the
/// result is the same whatever `standard_conforming_strings` is set to.
pub fn quote_literal(s: &str, out: &mut String) {
    let has_backslash = memchr::memchr(b'\\', s.as_bytes()).is_some();
    if has_backslash {
        out.push('E');
    }
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
}

/// Quote an identifier (cursor name, channel) with double quotes.
pub fn quote_ident(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl ToSqlLiteral for bool {
    fn write_literal(&self, out: &mut String) {
        out.push_str(if *self { "true" } else { "false" });
    }
}

macro_rules! impl_to_literal_int {
    ($($T:ty),+) => {
        $(
            impl ToSqlLiteral for $T {
                fn write_literal(&self, out: &mut String) {
                    out.push_str(&self.to_string());
                }
            }
        )+
    };
}

impl_to_literal_int!(i16, i32, i64, u32);

macro_rules! impl_to_literal_float {
    ($($T:ty => $cast:literal),+) => {
        $(
            impl ToSqlLiteral for $T {
                fn write_literal(&self, out: &mut String) {
                    if self.is_nan() {
                        out.push_str(concat!("'NaN'::", $cast));
                    } else if self.is_infinite() {
                        out.push_str(if self.is_sign_positive() {
                            concat!("'Infinity'::", $cast)
                        } else {
                            concat!("'-Infinity'::", $cast)
                        });
                    } else {
                        out.push_str(&self.to_string());
                    }
                }
            }
        )+
    };
}

impl_to_literal_float!(f32 => "float4", f64 => "float8");

impl ToSqlLiteral for str {
    fn write_literal(&self, out: &mut String) {
        quote_literal(self, out);
    }
}

impl ToSqlLiteral for String {
    fn write_literal(&self, out: &mut String) {
        quote_literal(self, out);
    }
}

impl ToSqlLiteral for [u8] {
    fn write_literal(&self, out: &mut String) {
        out.push_str("'\\x");
        out.push_str(&hex::encode(self));
        out.push_str("'::bytea");
    }
}

impl ToSqlLiteral for Vec<u8> {
    fn write_literal(&self, out: &mut String) {
        self.as_slice().write_literal(out);
    }
}

impl<T: ToSqlLiteral> ToSqlLiteral for Option<T> {
    fn write_literal(&self, out: &mut String) {
        match self {
            Some(v) => v.write_literal(out),
            None => out.push_str("NULL"),
        }
    }
}

impl<T: ToSqlLiteral + ?Sized> ToSqlLiteral for &T {
    fn write_literal(&self, out: &mut String) {
        (*self).write_literal(out);
    }
}

/// Trait for a positional parameter list.
pub trait ToParams {
    /// Number of parameters.
    fn param_count(&self) -> usize;

    /// Render every parameter as a SQL literal, in order.
    fn to_literals(&self, out: &mut Vec<String>);
}

impl ToParams for () {
    fn param_count(&self) -> usize {
        0
    }

    fn to_literals(&self, _out: &mut Vec<String>) {}
}

impl<T: ToParams + ?Sized> ToParams for &T {
    fn param_count(&self) -> usize {
        (*self).param_count()
    }

    fn to_literals(&self, out: &mut Vec<String>) {
        (*self).to_literals(out);
    }
}

impl<T: ToSqlLiteral> ToParams for [T] {
    fn param_count(&self) -> usize {
        self.len()
    }

    fn to_literals(&self, out: &mut Vec<String>) {
        for value in self {
            let mut literal = String::new();
            value.write_literal(&mut literal);
            out.push(literal);
        }
    }
}

impl<T: ToSqlLiteral> ToParams for Vec<T> {
    fn param_count(&self) -> usize {
        self.len()
    }

    fn to_literals(&self, out: &mut Vec<String>) {
        self.as_slice().to_literals(out);
    }
}

// Tuple implementations via macro
macro_rules! impl_to_params {
    ($count:expr, $($idx:tt: $T:ident),+) => {
        impl<$($T: ToSqlLiteral),+> ToParams for ($($T,)+) {
            fn param_count(&self) -> usize {
                $count
            }

            fn to_literals(&self, out: &mut Vec<String>) {
                $(
                    let mut literal = String::new();
                    self.$idx.write_literal(&mut literal);
                    out.push(literal);
                )+
            }
        }
    };
}

impl_to_params!(1, 0: T0);
impl_to_params!(2, 0: T0, 1: T1);
impl_to_params!(3, 0: T0, 1: T1, 2: T2);
impl_to_params!(4, 0: T0, 1: T1, 2: T2, 3: T3);
impl_to_params!(5, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4);
impl_to_params!(6, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5);
impl_to_params!(7, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6);
impl_to_params!(8, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6, 7: T7);

/// Replace `$n` placeholders in `sql` with the literals of `params`.
///
/// Placeholders inside quoted strings, quoted identifiers, dollar-quoted
/// bodies and `--` comments are left alone. With no parameters the query
/// text is returned untouched.
pub fn bind_params<'s, P: ToParams + ?Sized>(sql: &'s str, params: &P) -> Result<Cow<'s, str>> {
    if params.param_count() == 0 {
        return Ok(Cow::Borrowed(sql));
    }
    let mut literals = Vec::with_capacity(params.param_count());
    params.to_literals(&mut literals);

    let bytes = sql.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(sql.len() + 16 * literals.len());
    let mut i = 0;
    while let Some(&b) = bytes.get(i) {
        match b {
            b'\'' | b'"' => {
                let end = memchr::memchr(b, bytes.get(i + 1..).unwrap_or_default())
                    .map_or(bytes.len(), |p| i + 1 + p + 1);
                out.extend_from_slice(bytes.get(i..end).unwrap_or_default());
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = memchr::memchr(b'\n', bytes.get(i..).unwrap_or_default())
                    .map_or(bytes.len(), |p| i + p);
                out.extend_from_slice(bytes.get(i..end).unwrap_or_default());
                i = end;
            }
            b'$' => {
                let rest = bytes.get(i + 1..).unwrap_or_default();
                let digits = rest.iter().take_while(|c| c.is_ascii_digit()).count();
                if digits > 0 {
                    let n: usize = std::str::from_utf8(rest.get(..digits).unwrap_or_default())
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let literal = n
                        .checked_sub(1)
                        .and_then(|idx| literals.get(idx))
                        .ok_or_else(|| {
                            Error::usage(format!(
                                "placeholder ${} out of range: {} parameters given",
                                n,
                                literals.len()
                            ))
                        })?;
                    out.extend_from_slice(literal.as_bytes());
                    i += 1 + digits;
                } else if let Some(tag_len) = dollar_tag_len(rest) {
                    // $tag$ ... $tag$
                    let tag = bytes.get(i..i + tag_len + 2).unwrap_or_default();
                    let body_start = i + tag.len();
                    let end = memchr::memmem::find(bytes.get(body_start..).unwrap_or_default(), tag)
                        .map_or(bytes.len(), |p| body_start + p + tag.len());
                    out.extend_from_slice(bytes.get(i..end).unwrap_or_default());
                    i = end;
                } else {
                    out.push(b);
                    i += 1;
                }
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out)
        .map(Cow::Owned)
        .map_err(|e| Error::Protocol(format!("query is not UTF-8 after binding: {}", e)))
}

/// Length of the tag of a dollar quote opening at `rest` (which follows the
/// first `$`), if it is one.
fn dollar_tag_len(rest: &[u8]) -> Option<usize> {
    let tag_len = rest
        .iter()
        .take_while(|c| c.is_ascii_alphanumeric() || **c == b'_')
        .count();
    if rest.first().is_some_and(u8::is_ascii_digit) {
        return None;
    }
    (rest.get(tag_len) == Some(&b'$')).then_some(tag_len)
}
