//! Builtin functions available inside username templates.

use std::fmt::Write as _;

use base64::Engine as _;
use chrono::Utc;
use rand::distributions::{Alphanumeric, DistString};
use sha2::{Digest, Sha256};

/// Runtime value flowing through a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Str(String),
    Int(i64),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "int",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
        }
    }
}

/// The closed set of template functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Printf,
    Truncate,
    TruncateSha256,
    Uppercase,
    Lowercase,
    Replace,
    Sha256,
    Base64,
    Random,
    UnixTime,
    UnixTimeMillis,
    Timestamp,
    Uuid,
}

impl Builtin {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "printf" => Self::Printf,
            "truncate" => Self::Truncate,
            "truncate_sha256" => Self::TruncateSha256,
            "uppercase" => Self::Uppercase,
            "lowercase" => Self::Lowercase,
            "replace" => Self::Replace,
            "sha256" => Self::Sha256,
            "base64" => Self::Base64,
            "random" => Self::Random,
            "unix_time" => Self::UnixTime,
            "unix_time_millis" => Self::UnixTimeMillis,
            "timestamp" => Self::Timestamp,
            "uuid" => Self::Uuid,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Printf => "printf",
            Self::Truncate => "truncate",
            Self::TruncateSha256 => "truncate_sha256",
            Self::Uppercase => "uppercase",
            Self::Lowercase => "lowercase",
            Self::Replace => "replace",
            Self::Sha256 => "sha256",
            Self::Base64 => "base64",
            Self::Random => "random",
            Self::UnixTime => "unix_time",
            Self::UnixTimeMillis => "unix_time_millis",
            Self::Timestamp => "timestamp",
            Self::Uuid => "uuid",
        }
    }

    fn arity(self) -> Option<usize> {
        match self {
            Self::Printf => None,
            Self::UnixTime | Self::UnixTimeMillis | Self::Uuid => Some(0),
            Self::Uppercase
            | Self::Lowercase
            | Self::Sha256
            | Self::Base64
            | Self::Random
            | Self::Timestamp => Some(1),
            Self::Truncate | Self::TruncateSha256 => Some(2),
            Self::Replace => Some(3),
        }
    }

    pub(crate) fn call(self, args: Vec<Value>) -> Result<Value, String> {
        if let Some(want) = self.arity() {
            if args.len() != want {
                return Err(format!(
                    "wrong number of args for {}: want {} got {}",
                    self.name(),
                    want,
                    args.len()
                ));
            }
        }

        let out = match self {
            Self::Printf => {
                let (format, rest) = args
                    .split_first()
                    .ok_or_else(|| "wrong number of args for printf: want at least 1 got 0".to_string())?;
                printf(&self.str_arg(format)?, rest)
            }
            Self::Truncate => truncate(self.int_arg(&args[0])?, &self.str_arg(&args[1])?)?,
            Self::TruncateSha256 => {
                truncate_sha256(self.int_arg(&args[0])?, &self.str_arg(&args[1])?)?
            }
            Self::Uppercase => self.str_arg(&args[0])?.to_uppercase(),
            Self::Lowercase => self.str_arg(&args[0])?.to_lowercase(),
            Self::Replace => {
                let find = self.str_arg(&args[0])?;
                let replacement = self.str_arg(&args[1])?;
                let input = self.str_arg(&args[2])?;
                input.replace(&find, &replacement)
            }
            Self::Sha256 => hex::encode(Sha256::digest(self.str_arg(&args[0])?.as_bytes())),
            Self::Base64 => {
                base64::engine::general_purpose::STANDARD.encode(self.str_arg(&args[0])?)
            }
            Self::Random => random(self.int_arg(&args[0])?)?,
            Self::UnixTime => Utc::now().timestamp().to_string(),
            Self::UnixTimeMillis => Utc::now().timestamp_millis().to_string(),
            Self::Timestamp => timestamp(&self.str_arg(&args[0])?)?,
            Self::Uuid => uuid::Uuid::new_v4().to_string(),
        };

        Ok(Value::Str(out))
    }

    fn str_arg(self, value: &Value) -> Result<String, String> {
        match value {
            Value::Str(s) => Ok(s.clone()),
            other => Err(format!(
                "{}: expected string argument, got {}",
                self.name(),
                other.type_name()
            )),
        }
    }

    fn int_arg(self, value: &Value) -> Result<i64, String> {
        match value {
            Value::Int(n) => Ok(*n),
            other => Err(format!(
                "{}: expected integer argument, got {}",
                self.name(),
                other.type_name()
            )),
        }
    }
}

/// First `max_len` characters of `input`
pub(crate) fn truncate(max_len: i64, input: &str) -> Result<String, String> {
    if max_len <= 0 {
        return Err(format!("max length must be > 0 but was {max_len}"));
    }
    Ok(input.chars().take(max_len as usize).collect())
}

/// Truncate to `max_len` characters, replacing the tail with 8 hex chars of its hash
pub(crate) fn truncate_sha256(max_len: i64, input: &str) -> Result<String, String> {
    if max_len <= 8 {
        return Err(format!("max length must be > 8 but was {max_len}"));
    }
    let max_len = max_len as usize;
    if input.chars().count() <= max_len {
        return Ok(input.to_string());
    }

    let split = input
        .char_indices()
        .nth(max_len - 8)
        .map(|(idx, _)| idx)
        .unwrap_or(input.len());
    let (head, tail) = input.split_at(split);
    let digest = hex::encode(Sha256::digest(tail.as_bytes()));
    Ok(format!("{head}{}", &digest[..8]))
}

fn random(len: i64) -> Result<String, String> {
    if len < 0 {
        return Err(format!("random length must be >= 0 but was {len}"));
    }
    Ok(Alphanumeric.sample_string(&mut rand::thread_rng(), len as usize))
}

fn timestamp(layout: &str) -> Result<String, String> {
    let spec = go_layout_to_strftime(layout);
    let mut out = String::new();
    write!(out, "{}", Utc::now().format(&spec))
        .map_err(|_| format!("invalid timestamp format {layout:?}"))?;
    Ok(out)
}

/// Translate a Go reference-time layout into a chrono format string.
///
/// Times are always rendered in UTC, so zone offsets become constants.
pub(crate) fn go_layout_to_strftime(layout: &str) -> String {
    const CHUNKS: &[(&str, &str)] = &[
        ("January", "%B"),
        ("Monday", "%A"),
        (".000000000", "%.9f"),
        (".999999999", "%.9f"),
        ("Z07:00", "Z"),
        ("-07:00", "+00:00"),
        (".000000", "%.6f"),
        (".999999", "%.6f"),
        ("Z0700", "Z"),
        ("-0700", "+0000"),
        ("2006", "%Y"),
        (".000", "%.3f"),
        (".999", "%.3f"),
        ("Jan", "%b"),
        ("Mon", "%a"),
        ("MST", "UTC"),
        ("-07", "+00"),
        ("_2", "%e"),
        ("01", "%m"),
        ("02", "%d"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("06", "%y"),
        ("15", "%H"),
        ("PM", "%p"),
        ("pm", "%P"),
        ("1", "%-m"),
        ("2", "%-d"),
        ("3", "%-I"),
        ("4", "%-M"),
        ("5", "%-S"),
    ];

    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;
    'outer: while let Some(ch) = rest.chars().next() {
        for (chunk, spec) in CHUNKS {
            if let Some(tail) = rest.strip_prefix(chunk) {
                out.push_str(spec);
                rest = tail;
                continue 'outer;
            }
        }
        if ch == '%' {
            out.push_str("%%");
        } else {
            out.push(ch);
        }
        rest = &rest[ch.len_utf8()..];
    }
    out
}

/// Minimal `fmt.Sprintf` supporting `%s %d %v %q %%`
fn printf(format: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some(arg) = args.next() else {
            let _ = write!(out, "%!{verb}(MISSING)");
            continue;
        };
        match (verb, arg) {
            ('s' | 'v', value) => {
                let _ = write!(out, "{value}");
            }
            ('d', Value::Int(n)) => {
                let _ = write!(out, "{n}");
            }
            ('q', Value::Str(s)) => {
                let _ = write!(out, "{s:?}");
            }
            (verb, value) => {
                let _ = write!(out, "%!{verb}({}={value})", value.type_name());
            }
        }
    }

    for extra in args {
        let _ = write!(out, "%!(EXTRA {}={extra})", extra.type_name());
    }
    out
}
