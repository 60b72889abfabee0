use crate::codec::{decode_text, Decoded};
use crate::core::types::{generic, severity, P4Result, Record, Value};
use once_cell::sync::Lazy;
use regex::Regex;

/// The environment-dump command whose reply is plain text, not records
pub const SET_COMMAND: &str = "set";

/// `P4NAME=value` lines of `p4 set`; the value runs to the end of the line
static SET_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)(P4[^=\s]*)=([^\r\n]*)").expect("static regex is valid")
});

/// Fold decoded stdout and captured stderr into the caller-facing result.
///
/// Records are bucketed by `code` in wire order; `text`/`binary` chunks are
/// concatenated into `data`; the prompt is kept as a scalar. Non-empty stderr
/// adds exactly one trailing error record.
pub fn aggregate(command: &str, decoded: Decoded, stderr: &[u8]) -> P4Result {
    let mut result = P4Result::new();

    match decoded {
        Decoded::Records(records) => {
            for record in records {
                match record.code() {
                    Some("text") | Some("binary") => {
                        let chunk = record.get("data").map(Value::to_string).unwrap_or_default();
                        result.data.get_or_insert_with(String::new).push_str(&chunk);
                    }
                    Some("prompt") => {
                        result.prompt = record.get_str("prompt").map(str::to_string);
                    }
                    code => {
                        let code = code.unwrap_or_default().to_string();
                        result.push(code, record);
                    }
                }
            }
        }
        Decoded::Undecodable(bytes) => {
            result.data = Some(decode_text(&bytes));
            result.mark_undecodable();
        }
    }

    if command == SET_COMMAND {
        let prompt = result.prompt.take().unwrap_or_default();
        result = P4Result::new();
        result.set_list("stat", vec![parse_set(&prompt)]);
    }

    if !stderr.is_empty() {
        result.push("error", stderr_record(stderr));
    }

    result
}

/// Parse `p4 set` output into a single record of `P4NAME => value`
pub fn parse_set(text: &str) -> Record {
    SET_LINE
        .captures_iter(text)
        .map(|caps| (caps[1].to_string(), Value::Str(caps[2].trim_end().to_string())))
        .collect()
}

/// The error record synthesized from anything `p4` wrote on stderr
pub fn stderr_record(stderr: &[u8]) -> Record {
    let mut record = Record::with_code("error");
    record.insert("data", String::from_utf8_lossy(stderr).into_owned());
    record.insert("severity", severity::E_FAILED);
    record.insert("generic", generic::EV_ILLEGAL);
    record
}
