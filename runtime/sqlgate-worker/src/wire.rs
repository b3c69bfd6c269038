//! Framing and envelopes for the gateway's stdin/stdout protocol.
//!
//! A frame is a little-endian `u32` length followed by that many bytes, at
//! most [`MAX_FRAME_SIZE`]. Input that ends exactly between frames is a clean
//! shutdown; input that ends inside a header or body is an error. Each frame holds one envelope, tried as msgpack first and
//! then as JSON; replies go out in the encoding the request arrived in.
//!
//! The envelope `codec` names the encoding of the payload (`json`, `msgpack`
//! or `raw`). Msgpack envelopes carry the payload as `bin`, JSON envelopes as
//! `payload_b64`. Unsolicited messages use request id 0, status
//! `Notification` and name their kind in `entry`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub const NOTIFICATION_STATUS: &str = "Notification";
pub const RESOURCE_UPDATED_ENTRY: &str = "resources/updated";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub entry: String,
    #[serde(default)]
    pub timeout_ms: u32,
    pub codec: String,
    #[serde(default)]
    pub payload: Option<ByteBuf>,
    #[serde(default)]
    pub payload_b64: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: String,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HashMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

#[derive(Serialize)]
struct ResponseEnvelopeJson<'a> {
    request_id: u64,
    status: &'a str,
    codec: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<&'a HashMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<&'a str>,
}

pub struct DecodedRequest {
    pub envelope: RequestEnvelope,
    pub wire: WireCodec,
    pub queued_at: Instant,
}

impl ResponseEnvelope {
    pub fn error(request_id: u64, status: &str, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: status.to_string(),
            codec: "raw".to_string(),
            payload: None,
            metrics: None,
            error: Some(message.into()),
            entry: None,
        }
    }

    /// Unsolicited `resources/updated` message for `uri`.
    pub fn resource_updated(uri: &str, codec: &str) -> Result<Self, String> {
        #[derive(Serialize)]
        struct Updated<'a> {
            uri: &'a str,
        }
        Ok(Self {
            request_id: 0,
            status: NOTIFICATION_STATUS.to_string(),
            codec: codec.to_string(),
            payload: Some(ByteBuf::from(encode_payload(&Updated { uri }, codec)?)),
            metrics: None,
            error: None,
            entry: Some(RESOURCE_UPDATED_ENTRY.to_string()),
        })
    }
}

impl WireCodec {
    /// Payload codec used for messages this side originates.
    pub fn payload_codec(self) -> &'static str {
        match self {
            WireCodec::Json => "json",
            WireCodec::Msgpack => "msgpack",
        }
    }
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Input ended after {filled} header bytes"),
                ));
            }
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame of {size} bytes exceeds max size"),
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Frame exceeds max size"))?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

pub fn decode_request(bytes: &[u8]) -> Result<DecodedRequest, String> {
    if let Ok(envelope) = rmp_serde::from_slice::<RequestEnvelope>(bytes) {
        return Ok(DecodedRequest {
            envelope,
            wire: WireCodec::Msgpack,
            queued_at: Instant::now(),
        });
    }
    let envelope = serde_json::from_slice::<RequestEnvelope>(bytes)
        .map_err(|err| format!("Invalid request: {err}"))?;
    Ok(DecodedRequest {
        envelope,
        wire: WireCodec::Json,
        queued_at: Instant::now(),
    })
}

pub fn extract_payload(envelope: &RequestEnvelope) -> Result<Vec<u8>, String> {
    if let Some(payload) = &envelope.payload {
        return Ok(payload.to_vec());
    }
    if let Some(encoded) = &envelope.payload_b64 {
        return BASE64
            .decode(encoded)
            .map_err(|err| format!("Invalid payload base64: {err}"));
    }
    Ok(Vec::new())
}

pub fn encode_response(response: &ResponseEnvelope, wire: WireCodec) -> Result<Vec<u8>, String> {
    match wire {
        WireCodec::Msgpack => rmp_serde::to_vec_named(response).map_err(|err| err.to_string()),
        WireCodec::Json => {
            let json = ResponseEnvelopeJson {
                request_id: response.request_id,
                status: &response.status,
                codec: &response.codec,
                payload_b64: response.payload.as_ref().map(|payload| BASE64.encode(payload)),
                metrics: response.metrics.as_ref(),
                error: response.error.as_deref(),
                entry: response.entry.as_deref(),
            };
            serde_json::to_vec(&json).map_err(|err| err.to_string())
        }
    }
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8], codec: &str) -> Result<T, String> {
    match codec {
        "msgpack" => rmp_serde::from_slice(payload).map_err(|err| err.to_string()),
        "json" => serde_json::from_slice(payload).map_err(|err| err.to_string()),
        _ => Err(format!("Unsupported payload codec '{codec}'")),
    }
}

pub fn encode_payload<T: Serialize>(payload: &T, codec: &str) -> Result<Vec<u8>, String> {
    match codec {
        "msgpack" => rmp_serde::to_vec_named(payload).map_err(|err| err.to_string()),
        "json" => serde_json::to_vec(payload).map_err(|err| err.to_string()),
        "raw" => Ok(Vec::new()),
        _ => Err(format!("Unsupported payload codec '{codec}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, json};
    use std::io::Cursor;

    #[test]
    fn frames_are_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").expect("write");
        assert_eq!(&buf[..4], &5u32.to_le_bytes());
        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader).expect("read"), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut reader).expect("eof"), None);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let err = read_frame(&mut Cursor::new(vec![5u8, 0])).expect_err("short header");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        let mut body = 5u32.to_le_bytes().to_vec();
        body.extend_from_slice(b"he");
        let err = read_frame(&mut Cursor::new(body)).expect_err("short body");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let err = read_frame(&mut Cursor::new(header.to_vec())).expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn request_codec_is_detected() {
        let payload = encode_payload(&json!({"query": "SELECT 1"}), "msgpack").expect("payload");
        #[derive(Serialize)]
        struct Outgoing {
            request_id: u64,
            entry: &'static str,
            timeout_ms: u32,
            codec: &'static str,
            payload: ByteBuf,
        }
        let msgpack = rmp_serde::to_vec_named(&Outgoing {
            request_id: 7,
            entry: "read_query",
            timeout_ms: 0,
            codec: "msgpack",
            payload: ByteBuf::from(payload.clone()),
        })
        .expect("msgpack envelope");
        let decoded = decode_request(&msgpack).expect("msgpack");
        assert_eq!(decoded.wire, WireCodec::Msgpack);
        assert_eq!(decoded.envelope.request_id, 7);
        assert_eq!(extract_payload(&decoded.envelope).expect("payload"), payload);

        let json_envelope = serde_json::to_vec(&json!({
            "request_id": 8,
            "entry": "read_query",
            "codec": "json",
            "payload_b64": BASE64.encode(br#"{"query":"SELECT 1"}"#),
        }))
        .expect("json envelope");
        let decoded = decode_request(&json_envelope).expect("json");
        assert_eq!(decoded.wire, WireCodec::Json);
        assert_eq!(decoded.envelope.timeout_ms, 0);
        let body: JsonValue =
            decode_payload(&extract_payload(&decoded.envelope).expect("payload"), "json")
                .expect("body");
        assert_eq!(body["query"], "SELECT 1");

        assert!(decode_request(b"not an envelope").is_err());
    }

    #[test]
    fn json_responses_carry_base64_payloads() {
        let response = ResponseEnvelope {
            request_id: 3,
            status: "Ok".to_string(),
            codec: "json".to_string(),
            payload: Some(ByteBuf::from(b"{}".to_vec())),
            metrics: None,
            error: None,
            entry: Some("list_tables".to_string()),
        };
        let encoded = encode_response(&response, WireCodec::Json).expect("encode");
        let value: JsonValue = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(value["payload_b64"], BASE64.encode(b"{}"));
        assert!(value.get("payload").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn notification_envelope() {
        let note = ResponseEnvelope::resource_updated("memo://insights", "json").expect("note");
        assert_eq!(note.request_id, 0);
        assert_eq!(note.status, "Notification");
        assert_eq!(note.entry.as_deref(), Some("resources/updated"));
        let body: JsonValue =
            decode_payload(note.payload.as_ref().expect("payload"), "json").expect("body");
        assert_eq!(body, json!({"uri": "memo://insights"}));
    }
}
