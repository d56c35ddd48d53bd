//! Built-in operations.

use crate::operation::{ArgValue, OperationRegistry};

pub mod encoding;
pub mod flow;
pub mod text;
pub mod timing;

pub fn register_defaults(registry: &mut OperationRegistry) {
    flow::register(registry);
    text::register(registry);
    encoding::register(registry);
    timing::register(registry);
}

fn arg_str(args: &[ArgValue], idx: usize) -> &str {
    args.get(idx).and_then(ArgValue::as_str).unwrap_or_default()
}

fn arg_bool(args: &[ArgValue], idx: usize) -> bool {
    args.get(idx).and_then(ArgValue::as_bool).unwrap_or(false)
}

fn arg_f64(args: &[ArgValue], idx: usize) -> Option<f64> {
    args.get(idx).and_then(ArgValue::as_f64)
}

/// Text and encoding of a toggle argument.
fn arg_toggle(args: &[ArgValue], idx: usize) -> (&str, &str) {
    match args.get(idx) {
        Some(ArgValue::Toggle { string, option }) => (string, option),
        Some(other) => (other.as_str().unwrap_or_default(), ""),
        None => ("", ""),
    }
}

/// Expands backslash escapes: `\n`, `\r`, `\t`, `\0`, `\\`, `\xNN` and
/// `\u{...}`. Unknown escapes are kept as written.
pub fn unescape(text: &str) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('x') => {
                let mut hex = String::new();
                while hex.len() < 2
                    && let Some(digit) = chars.next_if(char::is_ascii_hexdigit)
                {
                    hex.push(digit);
                }
                if hex.len() != 2 {
                    return Err(format!("'\\x' needs two hex digits in '{text}'"));
                }
                let code = u8::from_str_radix(&hex, 16).map_err(|err| err.to_string())?;
                out.push(char::from(code));
            }
            Some('u') => {
                if chars.next_if_eq(&'{').is_none() {
                    return Err(format!("'\\u' must be followed by '{{' in '{text}'"));
                }
                let mut hex = String::new();
                while let Some(digit) = chars.next_if(char::is_ascii_hexdigit) {
                    hex.push(digit);
                }
                if chars.next_if_eq(&'}').is_none() || hex.is_empty() {
                    return Err(format!("Unterminated '\\u{{...}}' escape in '{text}'"));
                }
                let code = u32::from_str_radix(&hex, 16).map_err(|err| err.to_string())?;
                let decoded = char::from_u32(code)
                    .ok_or_else(|| format!("'\\u{{{hex}}}' is not a valid character"))?;
                out.push(decoded);
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Ok(out)
}
