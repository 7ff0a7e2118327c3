//! Incremental parser for a top-level JSON array of objects.
//!
//! Bytes are fed as they arrive. Only the element currently being read is
//! buffered; each complete element is handed to `serde_json`.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::work::Record;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamParseError {
    #[error("expected '[' at offset {offset}, found {found:?}")]
    ExpectedArray { offset: u64, found: char },

    #[error("expected an object at offset {offset}, found {found:?}")]
    ExpectedObject { offset: u64, found: char },

    #[error("expected ',' or ']' at offset {offset}, found {found:?}")]
    ExpectedSeparator { offset: u64, found: char },

    #[error("unexpected {found:?} after the closing ']' at offset {offset}")]
    TrailingContent { offset: u64, found: char },

    #[error("invalid element ending at offset {offset}: {reason}")]
    InvalidElement { offset: u64, reason: String },

    #[error("output ended before the array was closed")]
    UnexpectedEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    BeforeArray,
    BeforeFirstElement,
    BeforeElement,
    InElement,
    AfterElement,
    Closed,
    Failed,
}

#[derive(Debug)]
pub struct JsonArrayStream {
    state: ScanState,
    element: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    offset: u64,
    error: Option<StreamParseError>,
}

impl Default for JsonArrayStream {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonArrayStream {
    pub fn new() -> Self {
        Self {
            state: ScanState::BeforeArray,
            element: Vec::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            offset: 0,
            error: None,
        }
    }

    /// Consumes `chunk`, appending every completed element to `out`.
    ///
    /// Elements completed before an error are still appended. After an
    /// error the parser stays failed.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Record>) -> Result<(), StreamParseError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }

        for &byte in chunk {
            let result = self.step(byte, out);
            self.offset += 1;
            if let Err(e) = result {
                self.state = ScanState::Failed;
                self.element.clear();
                self.error = Some(e.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Signals end of input.
    pub fn finish(&mut self) -> Result<(), StreamParseError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if self.state == ScanState::Closed {
            Ok(())
        } else {
            self.state = ScanState::Failed;
            self.error = Some(StreamParseError::UnexpectedEnd);
            Err(StreamParseError::UnexpectedEnd)
        }
    }

    fn step(&mut self, byte: u8, out: &mut Vec<Record>) -> Result<(), StreamParseError> {
        let offset = self.offset;
        match self.state {
            ScanState::InElement => self.scan_element(byte, out),
            _ if is_whitespace(byte) => Ok(()),
            ScanState::BeforeArray => match byte {
                b'[' => {
                    self.state = ScanState::BeforeFirstElement;
                    Ok(())
                }
                _ => Err(StreamParseError::ExpectedArray {
                    offset,
                    found: byte as char,
                }),
            },
            ScanState::BeforeFirstElement if byte == b']' => {
                self.state = ScanState::Closed;
                Ok(())
            }
            ScanState::BeforeFirstElement | ScanState::BeforeElement => match byte {
                b'{' => {
                    self.start_element(byte);
                    Ok(())
                }
                _ => Err(StreamParseError::ExpectedObject {
                    offset,
                    found: byte as char,
                }),
            },
            ScanState::AfterElement => match byte {
                b',' => {
                    self.state = ScanState::BeforeElement;
                    Ok(())
                }
                b']' => {
                    self.state = ScanState::Closed;
                    Ok(())
                }
                _ => Err(StreamParseError::ExpectedSeparator {
                    offset,
                    found: byte as char,
                }),
            },
            ScanState::Closed => Err(StreamParseError::TrailingContent {
                offset,
                found: byte as char,
            }),
            ScanState::Failed => Ok(()),
        }
    }

    fn start_element(&mut self, byte: u8) {
        self.state = ScanState::InElement;
        self.element.clear();
        self.element.push(byte);
        self.depth = 1;
        self.in_string = false;
        self.escaped = false;
    }

    fn scan_element(&mut self, byte: u8, out: &mut Vec<Record>) -> Result<(), StreamParseError> {
        self.element.push(byte);

        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return Ok(());
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' | b'[' => self.depth += 1,
            b'}' | b']' => {
                self.depth -= 1;
                if self.depth == 0 {
                    let record: Map<String, Value> = serde_json::from_slice(&self.element)
                        .map_err(|e| StreamParseError::InvalidElement {
                            offset: self.offset,
                            reason: e.to_string(),
                        })?;
                    self.element.clear();
                    self.state = ScanState::AfterElement;
                    out.push(record);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_all(chunks: &[&[u8]]) -> (Vec<Record>, Result<(), StreamParseError>) {
        let mut parser = JsonArrayStream::new();
        let mut out = Vec::new();
        for chunk in chunks {
            if let Err(e) = parser.feed(chunk, &mut out) {
                return (out, Err(e));
            }
        }
        let result = parser.finish();
        (out, result)
    }

    #[test]
    fn test_empty_array() {
        let (records, result) = parse_all(&[b"  [ ]\n"]);
        assert!(result.is_ok());
        assert!(records.is_empty());
    }

    #[test]
    fn test_objects_split_across_chunks() {
        let (records, result) = parse_all(&[
            b"[{\"a\":",
            b"1},",
            b" {\"b\": {\"nested\": [1, 2, {\"c\": \"}]\"}]}",
            b"}\n]",
        ]);
        assert!(result.is_ok());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["a"], json!(1));
        assert_eq!(records[1]["b"]["nested"][2]["c"], json!("}]"));
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let (records, result) = parse_all(&[br#"[{"msg": "say \"hi\" {"}]"#]);
        assert!(result.is_ok());
        assert_eq!(records[0]["msg"], json!("say \"hi\" {"));
    }

    #[test]
    fn test_byte_at_a_time() {
        let input = br#"[{"metric":"m1","category":"c1"},{"metric":"m2","category":"c2"}]"#;
        let mut parser = JsonArrayStream::new();
        let mut out = Vec::new();
        for byte in input.iter() {
            parser.feed(std::slice::from_ref(byte), &mut out).unwrap();
        }
        parser.finish().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["category"], json!("c2"));
    }

    #[test]
    fn test_records_before_error_are_kept() {
        let (records, result) = parse_all(&[b"[{\"metric\":\"m1\"},\n{\"key\":\"value\",}\n]"]);
        assert_eq!(records.len(), 1);
        assert!(matches!(
            result,
            Err(StreamParseError::InvalidElement { .. })
        ));
    }

    #[test]
    fn test_must_start_with_array() {
        let (_, result) = parse_all(&[b"{\"a\": 1}"]);
        assert!(matches!(
            result,
            Err(StreamParseError::ExpectedArray { found: '{', .. })
        ));
    }

    #[test]
    fn test_elements_must_be_objects() {
        let (_, result) = parse_all(&[b"[1, 2]"]);
        assert!(matches!(
            result,
            Err(StreamParseError::ExpectedObject { found: '1', .. })
        ));
    }

    #[test]
    fn test_trailing_comma() {
        let (records, result) = parse_all(&[b"[{\"a\":1},]"]);
        assert_eq!(records.len(), 1);
        assert!(matches!(
            result,
            Err(StreamParseError::ExpectedObject { found: ']', .. })
        ));
    }

    #[test]
    fn test_missing_separator() {
        let (_, result) = parse_all(&[b"[{\"a\":1} {\"a\":2}]"]);
        assert!(matches!(
            result,
            Err(StreamParseError::ExpectedSeparator { found: '{', .. })
        ));
    }

    #[test]
    fn test_unclosed_array() {
        let (records, result) = parse_all(&[b"[{\"a\":1},"]);
        assert_eq!(records.len(), 1);
        assert_eq!(result, Err(StreamParseError::UnexpectedEnd));

        let (_, result) = parse_all(&[b""]);
        assert_eq!(result, Err(StreamParseError::UnexpectedEnd));
    }

    #[test]
    fn test_trailing_content() {
        let (_, result) = parse_all(&[b"[] x"]);
        assert!(matches!(
            result,
            Err(StreamParseError::TrailingContent { offset: 3, .. })
        ));
    }

    #[test]
    fn test_failed_parser_stays_failed() {
        let mut parser = JsonArrayStream::new();
        let mut out = Vec::new();
        assert!(parser.feed(b"nope", &mut out).is_err());
        assert!(parser.feed(b"[]", &mut out).is_err());
        assert!(parser.finish().is_err());
    }
}
