//! Search value escaping.
//!
//! Search values may escape their separators with a backslash: `\,` inside a
//! value list, `\|` inside a token or quantity, `\$` inside a composite and
//! `\\` for a literal backslash. Values keep their escapes until the
//! structural split for their type is done.

/// Splits on `sep`, ignoring escaped occurrences. Escapes are kept.
pub fn split_unescaped(input: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            out.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    out.push(&input[start..]);
    out
}

/// Removes escapes; `None` for a dangling or unknown escape.
pub fn unescape(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            next @ ('\\' | ',' | '$' | '|') => out.push(next),
            _ => return None,
        }
    }
    Some(out)
}
