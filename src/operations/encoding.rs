use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use sha2::{Digest, Sha256, Sha512};

use super::{arg_bool, arg_str};
use crate::dish::{DishType, DishValue};
use crate::error::OperationError;
use crate::operation::{
    ArgSpec, ArgValue, FnOperation, HighlightRange, OperationDescriptor, OperationRegistry,
    OperationResult, RunContext,
};

const ALPHABETS: [&str; 2] = ["Standard", "URL safe"];
const HEX_DELIMITERS: [&str; 5] = ["Space", "None", "Comma", "Colon", "Line feed"];

pub(super) fn register(registry: &mut OperationRegistry) {
    registry.register(
        FnOperation::sync(
            OperationDescriptor::new("To Base64", DishType::ArrayBuffer, DishType::String)
                .with_description("Encodes bytes as Base64 text.")
                .with_arg(ArgSpec::option("Alphabet", &ALPHABETS)),
            to_base64,
        )
        .with_highlight(base64_forward, base64_backward),
    );
    registry.register(
        FnOperation::sync(
            OperationDescriptor::new("From Base64", DishType::String, DishType::ByteArray)
                .with_description("Decodes Base64 text into bytes.")
                .with_arg(ArgSpec::option("Alphabet", &ALPHABETS))
                .with_arg(ArgSpec::boolean("Remove non-alphabet chars", true)),
            from_base64,
        )
        .with_highlight(base64_backward, base64_forward),
    );
    registry.register(
        FnOperation::sync(
            OperationDescriptor::new("To Hex", DishType::ArrayBuffer, DishType::String)
                .with_description("Writes each byte as two hexadecimal digits.")
                .with_arg(ArgSpec::option("Delimiter", &HEX_DELIMITERS)),
            to_hex,
        )
        .with_highlight(hex_forward, hex_backward),
    );
    registry.register(
        FnOperation::sync(
            OperationDescriptor::new("From Hex", DishType::String, DishType::ByteArray)
                .with_description("Reads hexadecimal digit pairs, ignoring any separators."),
            from_hex,
        )
        .with_highlight(hex_backward, hex_forward),
    );
    registry.register(FnOperation::sync(
        OperationDescriptor::new("SHA2", DishType::ArrayBuffer, DishType::String)
            .with_description("SHA-2 digest of the input, as lower-case hex.")
            .with_arg(ArgSpec::option("Size", &["256", "512"])),
        sha2_digest,
    ));
    registry.register(FnOperation::sync(
        OperationDescriptor::new("JSON Beautify", DishType::Json, DishType::String)
            .with_description("Pretty-prints JSON, keeping key order.")
            .with_arg(ArgSpec::string("Indent string", "    ")),
        |input, args, _ctx| {
            let json = input.into_json()?;
            crate::dish::json_with_indent(&json, arg_str(args, 0))
                .map(DishValue::String)
                .map_err(OperationError::defect)
        },
    ));
    registry.register(FnOperation::sync(
        OperationDescriptor::new("JSON Minify", DishType::Json, DishType::String)
            .with_description("Removes all insignificant whitespace from JSON."),
        |input, _args, _ctx| Ok(DishValue::String(input.into_json()?.to_string())),
    ));
}

fn to_base64(input: DishValue, args: &[ArgValue], _ctx: &RunContext) -> OperationResult {
    let bytes = input.as_bytes()?;
    let encoded = match arg_str(args, 0) {
        "URL safe" => URL_SAFE.encode(bytes),
        _ => STANDARD.encode(bytes),
    };
    Ok(DishValue::String(encoded))
}

fn from_base64(input: DishValue, args: &[ArgValue], _ctx: &RunContext) -> OperationResult {
    let text = input.into_string()?;
    let url_safe = arg_str(args, 0) == "URL safe";
    let in_alphabet = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '='
            || if url_safe {
                c == '-' || c == '_'
            } else {
                c == '+' || c == '/'
            }
    };
    let cleaned: String = if arg_bool(args, 1) {
        text.chars().filter(|c| in_alphabet(*c)).collect()
    } else {
        text.trim().to_string()
    };
    let engine = if url_safe { &URL_SAFE } else { &STANDARD };
    engine
        .decode(cleaned.as_bytes())
        .map(|bytes| DishValue::ByteArray(bytes.into()))
        .map_err(|err| OperationError::invalid(format!("Invalid Base64 input: {err}")))
}

fn hex_delimiter(args: &[ArgValue]) -> &'static str {
    match arg_str(args, 0) {
        "None" => "",
        "Comma" => ",",
        "Colon" => ":",
        "Line feed" => "\n",
        // From Hex carries no delimiter argument; its input is usually spaced.
        _ => " ",
    }
}

fn to_hex(input: DishValue, args: &[ArgValue], _ctx: &RunContext) -> OperationResult {
    let bytes = input.as_bytes()?;
    let pairs: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    Ok(DishValue::String(pairs.join(hex_delimiter(args))))
}

fn from_hex(input: DishValue, _args: &[ArgValue], _ctx: &RunContext) -> OperationResult {
    let text = input.into_string()?;
    let digits: Vec<u8> = text
        .bytes()
        .filter(u8::is_ascii_hexdigit)
        .collect();
    if digits.len() % 2 != 0 {
        return Err(OperationError::invalid(format!(
            "Hex input has an odd number of digits ({})",
            digits.len()
        )));
    }
    let bytes: Vec<u8> = digits
        .chunks(2)
        .map(|pair| {
            let high = hex_value(pair[0]);
            let low = hex_value(pair[1]);
            (high << 4) | low
        })
        .collect();
    Ok(DishValue::ByteArray(bytes.into()))
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => 0,
    }
}

fn sha2_digest(input: DishValue, args: &[ArgValue], _ctx: &RunContext) -> OperationResult {
    let bytes = input.as_bytes()?;
    let digest: Vec<u8> = match arg_str(args, 0) {
        "512" => Sha512::digest(bytes).to_vec(),
        _ => Sha256::digest(bytes).to_vec(),
    };
    Ok(DishValue::String(
        digest.iter().map(|b| format!("{b:02x}")).collect(),
    ))
}

fn base64_forward(ranges: &[HighlightRange], _args: &[ArgValue]) -> Vec<HighlightRange> {
    ranges
        .iter()
        .map(|r| HighlightRange::new(r.start / 3 * 4, r.end.div_ceil(3) * 4))
        .collect()
}

fn base64_backward(ranges: &[HighlightRange], _args: &[ArgValue]) -> Vec<HighlightRange> {
    ranges
        .iter()
        .map(|r| HighlightRange::new(r.start / 4 * 3, r.end.div_ceil(4) * 3))
        .collect()
}

fn hex_forward(ranges: &[HighlightRange], args: &[ArgValue]) -> Vec<HighlightRange> {
    let width = 2 + hex_delimiter(args).len();
    ranges
        .iter()
        .map(|r| {
            let end = (r.end * width).saturating_sub(width - 2);
            HighlightRange::new(r.start * width, end.max(r.start * width))
        })
        .collect()
}

fn hex_backward(ranges: &[HighlightRange], args: &[ArgValue]) -> Vec<HighlightRange> {
    let width = 2 + hex_delimiter(args).len();
    ranges
        .iter()
        .map(|r| HighlightRange::new(r.start / width, r.end.div_ceil(width)))
        .collect()
}
