use bytes::{Buf, BytesMut};
use objloader_types::{Base, Item, ObjectId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ProtocolError, ProtocolResult};

/// Payloads carrying this type are raw encodings the loader does not handle;
/// they are treated as missing.
pub const RAW_ENCODING_MARKER: &[u8] = b"Objects.Other.RawEncoding";

const LINE_END: u8 = b'\n';
const FIELD_SEPARATOR: u8 = b'\t';
const MAX_ERROR_PREVIEW: usize = 120;

// ---- Request body ----

/// Body of a batch download request.
///
/// The id list travels as a JSON array encoded into a string:
/// `{"objects": "[\"id1\",\"id2\"]"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetObjectsRequest {
    pub objects: String,
}

impl GetObjectsRequest {
    pub fn from_ids(ids: &[ObjectId]) -> ProtocolResult<Self> {
        let objects =
            serde_json::to_string(ids).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self { objects })
    }

    /// The requested ids.
    pub fn ids(&self) -> ProtocolResult<Vec<ObjectId>> {
        serde_json::from_str(&self.objects).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

// ---- Response lines ----

/// Encode one response record as `<id>\t<json>\n`.
pub fn encode_line(base: &Base) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(base).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    let mut line = Vec::with_capacity(base.id().len() + json.len() + 2);
    line.extend_from_slice(base.id().as_bytes());
    line.push(FIELD_SEPARATOR);
    line.extend_from_slice(&json);
    line.push(LINE_END);
    Ok(line)
}

/// Decode one `<id>\t<json>` record (without its newline).
///
/// `size` on the returned item is the byte length of the JSON payload.
pub fn parse_line(line: &[u8]) -> ProtocolResult<Item> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let Some(tab) = line.iter().position(|b| *b == FIELD_SEPARATOR) else {
        return Err(ProtocolError::InvalidLine(preview(line)));
    };
    let id = std::str::from_utf8(&line[..tab]).map_err(|_| ProtocolError::InvalidUtf8)?;
    let payload = &line[tab + 1..];

    if contains(payload, RAW_ENCODING_MARKER) {
        return Ok(Item::not_found(id));
    }
    let base = decode_base(id, payload)?;
    Ok(Item::with_size(base, payload.len()))
}

/// Decode the body of a single-object response.
///
/// Returns `None` for payloads the loader does not handle.
pub fn parse_single(id: &ObjectId, body: &[u8]) -> ProtocolResult<Option<Item>> {
    if contains(body, RAW_ENCODING_MARKER) {
        return Ok(None);
    }
    let base = decode_base(id.as_str(), body)?;
    Ok(Some(Item::with_size(base, body.len())))
}

fn decode_base(id: &str, payload: &[u8]) -> ProtocolResult<Base> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
    Base::from_value(value).map_err(|e| ProtocolError::Decode {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Incremental parser for a streamed response body.
///
/// Bytes are fed as they arrive. A record completes only when its newline is
/// seen, so a record split across chunks is carried over to the next call.
#[derive(Debug, Default)]
pub struct LineParser {
    pending: BytesMut,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every record it completed, in order.
    ///
    /// Each record is decoded independently: one bad record does not affect
    /// its neighbours. Blank lines are skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolResult<Item>> {
        self.pending.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == LINE_END) {
            let line = self.pending.split_to(self.scanned + offset);
            self.pending.advance(1);
            self.scanned = 0;
            if line.is_empty() || &line[..] == b"\r" {
                continue;
            }
            records.push(parse_line(&line));
        }
        self.scanned = self.pending.len();
        records
    }

    /// Bytes received after the last newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of stream. An unterminated trailing record is discarded.
    pub fn finish(self) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            warn!(bytes = dropped, "discarding unterminated record at end of stream");
        }
        dropped
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn preview(line: &[u8]) -> String {
    let end = line.len().min(MAX_ERROR_PREVIEW);
    String::from_utf8_lossy(&line[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_body_nests_json_array_in_string() {
        let req = GetObjectsRequest::from_ids(&[ObjectId::new("a"), ObjectId::new("b")]).unwrap();
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body, json!({"objects": "[\"a\",\"b\"]"}));
        assert_eq!(req.ids().unwrap(), vec![ObjectId::new("a"), ObjectId::new("b")]);
    }

    #[test]
    fn parses_record_and_sets_size() {
        let item = parse_line(b"abc\t{\"id\":\"abc\",\"v\":1}").unwrap();
        assert_eq!(item.base_id.as_str(), "abc");
        assert_eq!(item.size, Some(r#"{"id":"abc","v":1}"#.len()));
        assert_eq!(item.base.unwrap().get("v"), Some(&json!(1)));
    }

    #[test]
    fn line_without_tab_is_invalid() {
        assert!(matches!(
            parse_line(b"no separator here"),
            Err(ProtocolError::InvalidLine(_))
        ));
    }

    #[test]
    fn malformed_json_reports_id() {
        let err = parse_line(b"bad\t{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { ref id, .. } if id == "bad"));
    }

    #[test]
    fn raw_encoding_is_not_found() {
        let item =
            parse_line(b"r\t{\"id\":\"r\",\"speckle_type\":\"Objects.Other.RawEncoding\"}").unwrap();
        assert_eq!(item, Item::not_found("r"));
    }

    #[test]
    fn records_split_across_chunks() {
        let mut parser = LineParser::new();
        assert!(parser.feed(b"a\t{\"id\":").is_empty());
        let records = parser.feed(b"\"a\"}\nb\t{\"id\":\"b\"}\nc\t{");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_ref().unwrap().base_id.as_str(), "a");
        assert_eq!(records[1].as_ref().unwrap().base_id.as_str(), "b");
        assert_eq!(parser.pending_len(), 3);
        assert_eq!(parser.finish(), 3);
    }

    #[test]
    fn large_record_fed_byte_by_byte() {
        let base = Base::from_value(json!({"id": "big", "blob": "x".repeat(64 * 1024)})).unwrap();
        let line = encode_line(&base).unwrap();
        let mut parser = LineParser::new();
        let (last, body) = line.split_last().unwrap();
        for byte in body {
            assert!(parser.feed(std::slice::from_ref(byte)).is_empty());
            // Only the new byte is searched on each call.
            assert_eq!(parser.scanned, parser.pending_len());
        }
        let records = parser.feed(std::slice::from_ref(last));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].as_ref().unwrap().base, Some(base));
        assert_eq!(parser.pending_len(), 0);
        assert_eq!(parser.scanned, 0);
    }

    #[test]
    fn bad_record_does_not_poison_batch() {
        let mut parser = LineParser::new();
        let records = parser.feed(b"a\t{\"id\":\"a\"}\nb\t{oops\n\nc\t{\"id\":\"c\"}\r\n");
        assert_eq!(records.len(), 3);
        assert!(records[0].is_ok());
        assert!(records[1].is_err());
        assert_eq!(records[2].as_ref().unwrap().base_id.as_str(), "c");
    }

    #[test]
    fn encoded_line_parses_back() {
        let base = Base::from_value(json!({"id": "x", "n": [1, 2]})).unwrap();
        let line = encode_line(&base).unwrap();
        let mut parser = LineParser::new();
        let records = parser.feed(&line);
        assert_eq!(records[0].as_ref().unwrap().base, Some(base));
    }

    #[test]
    fn single_response() {
        let id = ObjectId::new("root");
        let item = parse_single(&id, br#"{"id":"root"}"#).unwrap().unwrap();
        assert_eq!(item.base_id, id);
        assert!(parse_single(&id, br#"{"id":"root","t":"Objects.Other.RawEncoding"}"#)
            .unwrap()
            .is_none());
        assert!(parse_single(&id, b"[]").is_err());
    }
}
