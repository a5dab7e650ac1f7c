//! Block normalization. Turns raw input like `g1 x100 Y100 f400 (rapid)`
//! into `G1X100Y100F400`, verifies optional checksums, and lifts active
//! comments (`({...})` and `(MSG ...)`) out of the body into a single merged
//! JSON payload carried alongside the command string.

use crate::status::Status;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedBlock {
    /// Uppercased command text with whitespace and comments removed.
    pub commands: String,
    /// Merged active-comment payload, if any.
    pub active_comment: Option<String>,
    /// True if the line began with a block-delete `/`.
    pub block_delete: bool,
}

/// Verify an optional `*NN` checksum suffix. The checksum is the XOR of all
/// characters before the `*`. A line carrying a checksum must also carry a
/// line number. Returns the line with the suffix removed, plus whether a
/// checksum was present.
pub fn verify_checksum(line: &str) -> Result<(&str, bool), Status> {
    let star = match line.find('*') {
        Some(p) => p,
        None => return Ok((line, false)),
    };
    let body = &line[..star];
    let mut checksum: u8 = 0;
    for b in body.bytes() {
        checksum ^= b;
    }
    let given: i64 = line[star + 1..]
        .trim()
        .parse()
        .map_err(|_| Status::BadNumberFormat)?;
    if given != checksum as i64 {
        return Err(Status::ChecksumMatchFailed);
    }
    if !body.trim_start().starts_with('N') && !body.trim_start().starts_with('n') {
        return Err(Status::MissingLineNumberWithChecksum);
    }
    Ok((body, true))
}

/// Merge the body of one active comment into the accumulated payload. If the
/// payload already ends with `}` the objects are joined with a comma.
fn merge_open(ac: &mut String) {
    if ac.ends_with('}') {
        ac.pop();
        ac.push(',');
    } else {
        ac.push('{');
    }
}

/// Copy a `({...})` active comment starting just after the `(`. Advances `i`
/// past the closing `)`. Strings are copied verbatim including escapes;
/// whitespace outside strings is dropped.
fn copy_active_json(chars: &[char], i: &mut usize, ac: &mut String) {
    merge_open(ac);
    *i += 1; // skip the '{'
    let mut in_string = false;
    let mut escaped = false;
    while *i < chars.len() {
        let c = chars[*i];
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            ac.push(c);
        } else if c == '"' {
            in_string = true;
            ac.push(c);
        } else if c == ')' {
            *i += 1;
            return;
        } else if !c.is_whitespace() {
            ac.push(c);
        }
        *i += 1;
    }
}

/// Copy a `(MSG ...)` comment starting just after the specifier. Rewrites it
/// as a `msg` entry in the payload, escaping embedded quotes.
fn copy_msg(chars: &[char], i: &mut usize, ac: &mut String) {
    merge_open(ac);
    ac.push_str("\"msg\":\"");
    if chars.get(*i) == Some(&' ') {
        *i += 1; // skip the single space after MSG
    }
    while *i < chars.len() {
        let c = chars[*i];
        if c == ')' {
            *i += 1;
            break;
        }
        if c == '"' || c == '\\' {
            ac.push('\\');
        }
        ac.push(c);
        *i += 1;
    }
    ac.push('"');
    ac.push('}');
}

fn matches_msg(chars: &[char], i: usize) -> bool {
    chars.len() >= i + 3
        && chars[i].eq_ignore_ascii_case(&'m')
        && chars[i + 1].eq_ignore_ascii_case(&'s')
        && chars[i + 2].eq_ignore_ascii_case(&'g')
}

/// Normalize one line of G-code. The caller is expected to have already
/// stripped any checksum suffix via [`verify_checksum`].
pub fn normalize(line: &str) -> NormalizedBlock {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut ac = String::new();
    let mut block_delete = false;
    let mut last_was_digit = false;

    let mut i = 0;
    if chars.first() == Some(&'/') {
        block_delete = true;
        i = 1;
    }

    while i < chars.len() {
        let c = chars[i];
        if c == ';' || c == '%' {
            break; // comment to end of line
        }
        if c == '(' {
            i += 1;
            if chars.get(i) == Some(&'{') {
                copy_active_json(&chars, &mut i, &mut ac);
            } else if matches_msg(&chars, i) {
                i += 3;
                copy_msg(&chars, &mut i, &mut ac);
            } else {
                // plain comment: skip to the closing paren
                while i < chars.len() && chars[i] != ')' {
                    i += 1;
                }
                if i < chars.len() {
                    i += 1;
                }
            }
            continue;
        }
        if !c.is_whitespace() && !c.is_control() {
            if c.is_ascii_digit() || c == '.' {
                // octal defense: drop leading zeros ahead of another digit
                let keep = last_was_digit
                    || c != '0'
                    || !chars.get(i + 1).map_or(false, |n| n.is_ascii_digit());
                if keep {
                    out.push(c.to_ascii_uppercase());
                }
                last_was_digit = true;
            } else if c.is_ascii_alphanumeric() || c == '-' {
                last_was_digit = false;
                out.push(c.to_ascii_uppercase());
            }
            // anything else is an invalid character and is dropped
        }
        i += 1;
    }

    NormalizedBlock {
        commands: out,
        active_comment: if ac.is_empty() { None } else { Some(ac) },
        block_delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_normalization() {
        let b = normalize("g1 x100 Y100 f400");
        assert_eq!(b.commands, "G1X100Y100F400");
        assert!(b.active_comment.is_none());
        assert!(!b.block_delete);
    }

    #[test]
    fn semicolon_and_percent_end_the_line() {
        assert_eq!(normalize("G1 X1 ; rest ignored").commands, "G1X1");
        assert_eq!(normalize("G1 X1 % rest ignored").commands, "G1X1");
        assert_eq!(normalize("; whole line comment").commands, "");
    }

    #[test]
    fn plain_comments_are_elided() {
        let b = normalize("G0 (rapid move) X10 (to the right)");
        assert_eq!(b.commands, "G0X10");
        assert!(b.active_comment.is_none());
    }

    #[test]
    fn octal_defense_strips_leading_zeros() {
        assert_eq!(normalize("G1 X0123.004").commands, "G1X123.004");
        assert_eq!(normalize("G1 X-0234.003").commands, "G1X-234.003");
        assert_eq!(normalize("G1 X0").commands, "G1X0");
        assert_eq!(normalize("G04 P1").commands, "G4P1");
    }

    #[test]
    fn block_delete_detected() {
        let b = normalize("/G1 X10");
        assert!(b.block_delete);
        assert_eq!(b.commands, "G1X10");
    }

    #[test]
    fn active_comment_moved_to_payload() {
        let b = normalize("G0 ({\"a\":1}) X10 (plain)");
        assert_eq!(b.commands, "G0X10");
        assert_eq!(b.active_comment.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn multiple_active_comments_merge() {
        let b = normalize("M100 ({\"a\":1}) (plain) ({\"b\":2})");
        assert_eq!(b.commands, "M100");
        assert_eq!(b.active_comment.as_deref(), Some("{\"a\":1,\"b\":2}"));
    }

    #[test]
    fn msg_comment_becomes_payload() {
        let b = normalize("G1 X5 (MSG tool change next)");
        assert_eq!(b.commands, "G1X5");
        assert_eq!(b.active_comment.as_deref(), Some("{\"msg\":\"tool change next\"}"));
    }

    #[test]
    fn msg_quotes_are_escaped() {
        let b = normalize("(MSG say \"hi\")");
        assert_eq!(b.active_comment.as_deref(), Some("{\"msg\":\"say \\\"hi\\\"\"}"));
    }

    #[test]
    fn checksum_accepts_valid() {
        // XOR of "N5G1X1" is computed here rather than hard-coded
        let body = "N5 G1 X1";
        let sum = body.bytes().fold(0u8, |a, b| a ^ b);
        let line = format!("{}*{}", body, sum);
        let (stripped, present) = verify_checksum(&line).unwrap();
        assert_eq!(stripped, body);
        assert!(present);
    }

    #[test]
    fn checksum_rejects_mismatch() {
        let body = "N5 G1 X1";
        let sum = body.bytes().fold(0u8, |a, b| a ^ b);
        let line = format!("{}*{}", body, sum.wrapping_add(1));
        assert_eq!(verify_checksum(&line).unwrap_err(), Status::ChecksumMatchFailed);
    }

    #[test]
    fn checksum_requires_line_number() {
        let body = "G1 X1";
        let sum = body.bytes().fold(0u8, |a, b| a ^ b);
        let line = format!("{}*{}", body, sum);
        assert_eq!(
            verify_checksum(&line).unwrap_err(),
            Status::MissingLineNumberWithChecksum
        );
    }

    #[test]
    fn no_checksum_passes_through() {
        let (s, present) = verify_checksum("G1 X1").unwrap();
        assert_eq!(s, "G1 X1");
        assert!(!present);
    }

    #[test]
    fn idempotent_on_canonical_input() {
        let first = normalize("G1X100Y-2.5F400");
        let second = normalize(&first.commands);
        assert_eq!(first.commands, second.commands);
    }
}
