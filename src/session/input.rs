//! Bounded framing of the client byte stream.
//!
//! A line whose first non-blank character is `.` is a dot-command and ends
//! at the newline. Anything else is SQL and ends at the first newline (or end
//! of the buffered data) where the text so far is a complete statement list.

use std::io::{ErrorKind, Read};

use crate::engine::split::is_complete;
use crate::error::{Result, ServerError};

/// Default input buffer limit.
pub const DEFAULT_MAX_INPUT: usize = 32 * 1024;

const READ_CHUNK: usize = 4096;

/// One unit of client input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A dot-command line, without the trailing newline.
    Command(String),
    /// One or more `;`-terminated statements.
    Sql(String),
}

/// Splits a byte stream into [`Input`] items without buffering more than a fixed limit.
pub struct InputReader<R> {
    reader: R,
    buf: Vec<u8>,
    limit: usize,
    eof: bool,
}

impl<R: Read> InputReader<R> {
    /// Wraps `reader`; input without a delimiter within `limit` bytes is an error.
    pub fn new(reader: R, limit: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK),
            limit: limit.max(1),
            eof: false,
        }
    }

    /// Returns the next input item, or `None` once the peer has closed the stream.
    pub fn next_input(&mut self) -> Result<Option<Input>> {
        loop {
            if let Some(input) = self.extract() {
                return Ok(Some(input));
            }
            if self.eof {
                return Ok(self.drain_tail());
            }
            if self.buf.len() >= self.limit {
                return Err(ServerError::Oversized { limit: self.limit });
            }
            let mut chunk = [0u8; READ_CHUNK];
            let want = READ_CHUNK.min(self.limit - self.buf.len());
            match self.reader.read(&mut chunk[..want]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn extract(&mut self) -> Option<Input> {
        let start = match self.buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => start,
            None => {
                self.buf.clear();
                return None;
            }
        };
        if self.buf[start] == b'.' {
            let newline = self.buf[start..].iter().position(|&b| b == b'\n')? + start;
            let line = String::from_utf8_lossy(&self.buf[start..newline])
                .trim_end()
                .to_string();
            self.buf.drain(..=newline);
            return Some(Input::Command(line));
        }
        let buf = &self.buf;
        let end = buf[start..]
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b == b'\n')
            .map(|(i, _)| start + i + 1)
            .chain(std::iter::once(buf.len()))
            .find(|&end| is_complete(&String::from_utf8_lossy(&buf[start..end])))?;
        let sql = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
        self.buf.drain(..end);
        Some(Input::Sql(sql))
    }

    fn drain_tail(&mut self) -> Option<Input> {
        let text = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if text.is_empty() {
            None
        } else if text.starts_with('.') {
            Some(Input::Command(text))
        } else {
            Some(Input::Sql(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(data: &str) -> Vec<Input> {
        let mut reader = InputReader::new(Cursor::new(data.as_bytes().to_vec()), DEFAULT_MAX_INPUT);
        let mut out = Vec::new();
        while let Some(input) = reader.next_input().unwrap() {
            out.push(input);
        }
        out
    }

    #[test]
    fn separates_commands_from_sql() {
        let inputs = read_all("CREATE TABLE t(x);\n.repeats 3\nINSERT INTO t\n VALUES(1);\n.run\n");
        assert_eq!(
            inputs,
            vec![
                Input::Sql("CREATE TABLE t(x);\n".into()),
                Input::Command(".repeats 3".into()),
                Input::Sql("INSERT INTO t\n VALUES(1);\n".into()),
                Input::Command(".run".into()),
            ]
        );
    }

    #[test]
    fn handles_crlf_and_unterminated_tail() {
        let inputs = read_all(".list\r\nSELECT 1");
        assert_eq!(
            inputs,
            vec![Input::Command(".list".into()), Input::Sql("SELECT 1".into())]
        );
    }

    #[test]
    fn semicolon_inside_literal_does_not_end_the_batch() {
        let inputs = read_all("INSERT INTO t VALUES('a;\nb');\n");
        assert_eq!(inputs, vec![Input::Sql("INSERT INTO t VALUES('a;\nb');\n".into())]);
    }

    #[test]
    fn oversized_input_is_rejected() {
        let data = "x".repeat(200);
        let mut reader = InputReader::new(Cursor::new(data.into_bytes()), 64);
        match reader.next_input() {
            Err(ServerError::Oversized { limit }) => assert_eq!(limit, 64),
            other => panic!("expected oversized error, got {other:?}"),
        }
    }
}
