//! Request/response envelopes and their frame codecs.
//!
//! Text frames carry JSON and binary frames carry MessagePack with named
//! fields. A response always goes out in the codec of its request.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlconsole_db::{DynamicValue, PoolStats, StoreError};
use thiserror::Error;

use crate::encoder::Table;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
    #[error("{0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "Query", alias = "query", default)]
    pub query: String,
}

/// At most one of `err`, `columns`/`rows` and `stats` is populated.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Vec<DynamicValue>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub duration: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<PoolStats>,
}

impl Response {
    pub fn table(table: Table, elapsed: Duration) -> Self {
        Self {
            columns: table.columns,
            rows: table.rows,
            duration: format!("{elapsed:?}"),
            ..Self::default()
        }
    }

    pub fn error(err: &StoreError) -> Self {
        Self {
            err: err.to_string(),
            ..Self::default()
        }
    }

    pub fn stats(stats: PoolStats) -> Self {
        Self {
            stats: Some(stats),
            ..Self::default()
        }
    }
}

pub fn decode_request(frame: &Frame) -> Result<(Request, WireCodec), CodecError> {
    match frame {
        Frame::Text(text) => Ok((serde_json::from_str(text)?, WireCodec::Json)),
        Frame::Binary(bytes) => Ok((rmp_serde::from_slice(bytes)?, WireCodec::Msgpack)),
    }
}

pub fn encode_response(response: &Response, codec: WireCodec) -> Result<Frame, CodecError> {
    match codec {
        WireCodec::Json => Ok(Frame::Text(serde_json::to_string(response)?)),
        WireCodec::Msgpack => Ok(Frame::Binary(rmp_serde::to_vec_named(response)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_json(response: &Response) -> serde_json::Value {
        match encode_response(response, WireCodec::Json).expect("encode") {
            Frame::Text(text) => serde_json::from_str(&text).expect("json"),
            Frame::Binary(_) => panic!("json response must be a text frame"),
        }
    }

    #[test]
    fn request_accepts_both_field_spellings() {
        let frame = Frame::Text(r#"{"Query":"SELECT 1"}"#.into());
        let (request, codec) = decode_request(&frame).expect("decode");
        assert_eq!(request.query, "SELECT 1");
        assert_eq!(codec, WireCodec::Json);

        let frame = Frame::Text(r#"{"query":"stats"}"#.into());
        assert_eq!(decode_request(&frame).expect("decode").0.query, "stats");

        let frame = Frame::Text("{}".into());
        assert_eq!(decode_request(&frame).expect("decode").0.query, "");
    }

    #[test]
    fn malformed_frames_fail_to_decode() {
        assert!(decode_request(&Frame::Text("{not json".into())).is_err());
        assert!(decode_request(&Frame::Text(r#"{"Query":5}"#.into())).is_err());
        assert!(decode_request(&Frame::Binary(vec![0xc1])).is_err());
    }

    #[test]
    fn msgpack_requests_answer_in_msgpack() {
        let request = Request {
            query: "SELECT 1".into(),
        };
        let bytes = rmp_serde::to_vec_named(&request).expect("encode");
        let (decoded, codec) = decode_request(&Frame::Binary(bytes)).expect("decode");
        assert_eq!(decoded, request);
        assert_eq!(codec, WireCodec::Msgpack);

        let response = Response::table(
            Table {
                columns: vec!["b".into()],
                rows: vec![vec![DynamicValue::Bytes(vec![0, 255])]],
            },
            Duration::from_millis(3),
        );
        let Frame::Binary(bytes) = encode_response(&response, WireCodec::Msgpack).expect("encode")
        else {
            panic!("msgpack response must be a binary frame");
        };
        let bin = [0xc4, 0x02, 0x00, 0xff];
        assert!(bytes.windows(bin.len()).any(|window| window == bin));
        let duration = [0xa3, b'3', b'm', b's'];
        assert!(bytes.windows(duration.len()).any(|window| window == duration));
    }

    #[test]
    fn responses_omit_empty_slots() {
        let success = Response::table(
            Table {
                columns: vec!["x".into()],
                rows: vec![vec![DynamicValue::Int(1)]],
            },
            Duration::from_micros(1500),
        );
        assert_eq!(
            to_json(&success),
            json!({"columns": ["x"], "rows": [[1]], "duration": "1.5ms"})
        );

        let failure = Response::error(&StoreError::Query("no such table: t".into()));
        assert_eq!(to_json(&failure), json!({"err": "no such table: t"}));

        let empty = Response::table(
            Table {
                columns: Vec::new(),
                rows: Vec::new(),
            },
            Duration::from_nanos(250),
        );
        assert_eq!(to_json(&empty), json!({"duration": "250ns"}));
    }

    #[test]
    fn stats_response_carries_only_stats() {
        let stats = PoolStats {
            max_open_connections: 4,
            open_connections: 1,
            idle: 1,
            ..PoolStats::default()
        };
        let body = to_json(&Response::stats(stats));
        let object = body.as_object().expect("object");
        assert_eq!(object.keys().collect::<Vec<_>>(), vec!["stats"]);
        assert_eq!(body["stats"]["MaxOpenConnections"], 4);
        assert_eq!(body["stats"]["Idle"], 1);
    }
}
