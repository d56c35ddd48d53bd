use once_cell::sync::Lazy;
use regex::{Captures, NoExpand, Regex, RegexBuilder};

use super::{arg_bool, arg_str, arg_toggle, unescape};
use crate::dish::{DishType, DishValue};
use crate::error::OperationError;
use crate::operation::{
    ArgSpec, ArgValue, FnOperation, HighlightRange, OperationDescriptor, OperationRegistry,
    OperationResult, RunContext,
};

const FIND_MODES: [&str; 3] = ["Regex", "Extended (\\n, \\t, \\x...)", "Simple string"];

static WORD_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\b\w)").expect("word pattern is valid"));
static SENTENCE_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\.|^)\s*(\b\w)").expect("sentence pattern is valid"));
static PARAGRAPH_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(?:\n|^)\s*(\b\w)").expect("paragraph pattern is valid"));

pub(super) fn register(registry: &mut OperationRegistry) {
    registry.register(
        FnOperation::sync(
            OperationDescriptor::new("To Upper case", DishType::String, DishType::String)
                .with_description("Converts the input to upper case.")
                .with_arg(ArgSpec::option(
                    "Scope",
                    &["All", "Word", "Sentence", "Paragraph"],
                )),
            to_upper_case,
        )
        .with_highlight(same_ranges, same_ranges),
    );
    registry.register(
        FnOperation::sync(
            OperationDescriptor::new("To Lower case", DishType::String, DishType::String)
                .with_description("Converts the input to lower case."),
            |input, _args, _ctx| Ok(DishValue::String(input.into_string()?.to_lowercase())),
        )
        .with_highlight(same_ranges, same_ranges),
    );
    registry.register(FnOperation::sync(
        OperationDescriptor::new("Reverse", DishType::ByteArray, DishType::ByteArray)
            .with_description("Reverses the input by byte, character or line.")
            .with_arg(ArgSpec::option("By", &["Character", "Byte", "Line"])),
        reverse,
    ));
    registry.register(FnOperation::sync(
        OperationDescriptor::new("Find / Replace", DishType::String, DishType::String)
            .with_description("Replaces every match of a pattern.")
            .with_arg(ArgSpec::toggle("Find", "", &FIND_MODES))
            .with_arg(ArgSpec::string("Replace", ""))
            .with_arg(ArgSpec::boolean("Global match", true))
            .with_arg(ArgSpec::boolean("Case insensitive", false))
            .with_arg(ArgSpec::boolean("Multiline matching", true))
            .with_arg(ArgSpec::boolean("Dot matches all", false)),
        find_replace,
    ));
}

fn same_ranges(ranges: &[HighlightRange], _args: &[ArgValue]) -> Vec<HighlightRange> {
    ranges.to_vec()
}

fn to_upper_case(input: DishValue, args: &[ArgValue], _ctx: &RunContext) -> OperationResult {
    let text = input.into_string()?;
    let pattern: &Regex = match arg_str(args, 0) {
        "All" => return Ok(DishValue::String(text.to_uppercase())),
        "Word" => &*WORD_START,
        "Sentence" => &*SENTENCE_START,
        "Paragraph" => &*PARAGRAPH_START,
        other => return Err(OperationError::invalid(format!("Unknown scope '{other}'"))),
    };
    let upper = pattern.replace_all(&text, |caps: &Captures| {
        let whole = &caps[0];
        let start = caps.get(1).map(|m| m.start() - caps.get(0).map_or(0, |w| w.start()));
        match start {
            Some(offset) => format!("{}{}", &whole[..offset], whole[offset..].to_uppercase()),
            None => whole.to_string(),
        }
    });
    Ok(DishValue::String(upper.into_owned()))
}

fn reverse(input: DishValue, args: &[ArgValue], _ctx: &RunContext) -> OperationResult {
    let mut bytes = input.into_bytes()?;
    match arg_str(args, 0) {
        "Byte" => bytes.reverse(),
        "Character" => {
            let text = String::from_utf8(bytes).map_err(|err| {
                OperationError::invalid(format!("Input is not valid UTF-8: {err}"))
            })?;
            bytes = text.chars().rev().collect::<String>().into_bytes();
        }
        "Line" => {
            let lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').rev().collect();
            bytes = lines.join(&b'\n');
        }
        other => return Err(OperationError::invalid(format!("Unknown unit '{other}'"))),
    }
    Ok(DishValue::ByteArray(bytes.into()))
}

fn find_replace(input: DishValue, args: &[ArgValue], _ctx: &RunContext) -> OperationResult {
    let text = input.into_string()?;
    let (find, mode) = arg_toggle(args, 0);
    let replacement = arg_str(args, 1);
    let literal = mode != FIND_MODES[0];
    let pattern = match mode {
        "Regex" => find.to_string(),
        "Simple string" => regex::escape(find),
        _ => regex::escape(&unescape(find).map_err(OperationError::invalid)?),
    };
    let re = RegexBuilder::new(&pattern)
        .case_insensitive(arg_bool(args, 3))
        .multi_line(arg_bool(args, 4))
        .dot_matches_new_line(arg_bool(args, 5))
        .build()
        .map_err(|err| OperationError::invalid(format!("Invalid pattern '{find}': {err}")))?;
    let limit = if arg_bool(args, 2) { 0 } else { 1 };
    let output = if literal {
        re.replacen(&text, limit, NoExpand(replacement))
    } else {
        re.replacen(&text, limit, replacement)
    };
    Ok(DishValue::String(output.into_owned()))
}
