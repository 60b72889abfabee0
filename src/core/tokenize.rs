//! Shell-like splitting of a command string into `p4` arguments.
//!
//! Tokens are separated by single spaces. A double-quoted span may cover
//! several tokens and is rejoined with single spaces; `\` suppresses the
//! special meaning of the next character. Escape markers are left in the
//! output, so `"a \"b\" c"` yields `a \"b\" c`.

use crate::core::error::{Error, Result};

/// Split `command` into arguments.
///
/// # Errors
///
/// Returns [`Error::UnbalancedQuotes`] if a quoted span is still open at the
/// end of the input.
///
/// # Examples
///
/// ```
/// use p4_sdk_rs::core::tokenize;
///
/// let args = tokenize(r#"a "b c" d"#).unwrap();
/// assert_eq!(args, ["a", "b c", "d"]);
/// assert!(tokenize(r#"a "b c"#).is_err());
/// ```
pub fn tokenize(command: &str) -> Result<Vec<String>> {
    let args: Vec<&str> = command.split(' ').filter(|arg| !arg.is_empty()).collect();
    let mut out = Vec::with_capacity(args.len());
    let mut quote_open = false;
    let mut span_start: Option<usize> = None;

    for (index, arg) in args.iter().enumerate() {
        let mut quoted = false;
        for _ in unescaped_quotes(arg) {
            quote_open = !quote_open;
            quoted = true;
        }

        match (quote_open, span_start) {
            (false, None) => {
                if quoted {
                    out.push(strip_outer(arg).to_string());
                } else {
                    out.push((*arg).to_string());
                }
            }
            (true, None) => span_start = Some(index),
            (false, Some(start)) => {
                let block = args[start..=index].join(" ");
                out.push(remove_span_quotes(&block));
                span_start = None;
            }
            (true, Some(_)) => {}
        }
    }

    if quote_open {
        return Err(Error::UnbalancedQuotes(command.to_string()));
    }
    Ok(out)
}

/// Byte offsets of every `"` not preceded by an escaping `\`
fn unescaped_quotes(text: &str) -> impl Iterator<Item = usize> + '_ {
    let mut escaped = false;
    text.char_indices().filter_map(move |(offset, c)| {
        if escaped {
            escaped = false;
            None
        } else if c == '\\' {
            escaped = true;
            None
        } else if c == '"' {
            Some(offset)
        } else {
            None
        }
    })
}

/// Drop the first and last character of a single-token quoted literal
fn strip_outer(arg: &str) -> &str {
    let mut chars = arg.chars();
    chars.next();
    chars.next_back();
    chars.as_str()
}

/// Remove the two quotes that bound a multi-token span
fn remove_span_quotes(block: &str) -> String {
    let quotes: Vec<usize> = unescaped_quotes(block).take(2).collect();
    match quotes.as_slice() {
        [open, close] => {
            let mut joined = String::with_capacity(block.len());
            joined.push_str(&block[..*open]);
            joined.push_str(&block[open + 1..*close]);
            joined.push_str(&block[close + 1..]);
            joined
        }
        _ => block.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_words() {
        assert_eq!(tokenize("files //depot/...").unwrap(), ["files", "//depot/..."]);
    }

    #[test]
    fn test_extra_spaces_are_dropped() {
        assert_eq!(tokenize("  login   -s ").unwrap(), ["login", "-s"]);
        assert!(tokenize("").unwrap().is_empty());
    }

    #[test]
    fn test_multi_token_span() {
        assert_eq!(tokenize(r#"a "b c" d"#).unwrap(), ["a", "b c", "d"]);
        assert_eq!(
            tokenize(r#"change -d "a long  description here""#).unwrap(),
            ["change", "-d", "a long description here"]
        );
    }

    #[test]
    fn test_single_token_quoted_literal() {
        assert_eq!(tokenize(r#"print "//depot/a b""#).unwrap(), ["print", "//depot/a b"]);
        assert_eq!(tokenize(r#"describe "42""#).unwrap(), ["describe", "42"]);
        assert_eq!(tokenize(r#"x """#).unwrap(), ["x", ""]);
    }

    #[test]
    fn test_unbalanced_quotes_fail() {
        let err = tokenize(r#"a "b c"#).unwrap_err();
        assert!(matches!(err, Error::UnbalancedQuotes(_)));
        assert!(tokenize(r#"""#).is_err());
    }

    #[test]
    fn test_escaped_quote_does_not_toggle() {
        assert_eq!(tokenize(r#"say \"hi"#).unwrap(), ["say", r#"\"hi"#]);
    }

    #[test]
    fn test_escape_markers_are_kept_inside_span() {
        assert_eq!(
            tokenize(r#"-d "a \"b\" c""#).unwrap(),
            ["-d", r#"a \"b\" c"#]
        );
    }

    #[test]
    fn test_non_ascii_span() {
        assert_eq!(tokenize(r#"-d "café au lait""#).unwrap(), ["-d", "café au lait"]);
    }

    proptest! {
        #[test]
        fn prop_unquoted_words_round_trip(words in prop::collection::vec("[a-zA-Z0-9/._-]{1,12}", 0..8)) {
            let command = words.join(" ");
            prop_assert_eq!(tokenize(&command).unwrap(), words);
        }

        #[test]
        fn prop_quoted_span_is_rejoined(words in prop::collection::vec("[a-z]{1,6}", 1..5)) {
            let command = format!("cmd \"{}\" tail", words.join(" "));
            let tokens = tokenize(&command).unwrap();
            prop_assert_eq!(tokens, vec!["cmd".to_string(), words.join(" "), "tail".to_string()]);
        }
    }
}
