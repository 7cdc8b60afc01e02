//! Lexical statement splitting.
//!
//! Finds `;` terminators that are not inside string literals, quoted
//! identifiers or comments. Trigger bodies (`BEGIN ... END`) are not
//! recognised and split at their inner semicolons.

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    Quoted(u8),
    LineComment,
    BlockComment,
}

/// Splits off the first statement of `sql`.
///
/// Returns the trimmed statement text without its terminator and the rest of
/// the input after the terminator, or `None` if `sql` holds only whitespace,
/// comments and empty statements.
pub fn next_statement(sql: &str) -> Option<(&str, &str)> {
    let mut rest = sql;
    loop {
        let start = skip_trivia(rest);
        rest = &rest[start..];
        if rest.is_empty() {
            return None;
        }
        match find_terminator(rest) {
            Some(0) => rest = &rest[1..],
            Some(end) => return Some((rest[..end].trim_end(), &rest[end + 1..])),
            None => return Some((rest.trim_end(), "")),
        }
    }
}

/// Returns true when `sql` ends with a terminated statement, ignoring trailing
/// whitespace and comments.
pub fn is_complete(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut state = Lex::Code;
    let mut complete = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match state {
            Lex::Code => match b {
                b';' => complete = true,
                b'\'' | b'"' | b'`' => {
                    state = Lex::Quoted(b);
                    complete = false;
                }
                b'[' => {
                    state = Lex::Quoted(b']');
                    complete = false;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    state = Lex::LineComment;
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = Lex::BlockComment;
                    i += 1;
                }
                b if b.is_ascii_whitespace() => {}
                _ => complete = false,
            },
            Lex::Quoted(close) => {
                if b == close {
                    state = Lex::Code;
                }
            }
            Lex::LineComment => {
                if b == b'\n' {
                    state = Lex::Code;
                }
            }
            Lex::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = Lex::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    complete && !matches!(state, Lex::Quoted(_) | Lex::BlockComment)
}

fn skip_trivia(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
        } else if bytes[i..].starts_with(b"--") {
            match bytes[i..].iter().position(|&b| b == b'\n') {
                Some(nl) => i += nl + 1,
                None => return bytes.len(),
            }
        } else if bytes[i..].starts_with(b"/*") {
            match find_sub(&bytes[i + 2..], b"*/") {
                Some(end) => i += end + 4,
                None => return bytes.len(),
            }
        } else {
            break;
        }
    }
    i
}

fn find_terminator(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut state = Lex::Code;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match state {
            Lex::Code => match b {
                b';' => return Some(i),
                b'\'' | b'"' | b'`' => state = Lex::Quoted(b),
                b'[' => state = Lex::Quoted(b']'),
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    state = Lex::LineComment;
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = Lex::BlockComment;
                    i += 1;
                }
                _ => {}
            },
            Lex::Quoted(close) => {
                if b == close {
                    state = Lex::Code;
                }
            }
            Lex::LineComment => {
                if b == b'\n' {
                    state = Lex::Code;
                }
            }
            Lex::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = Lex::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    None
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
