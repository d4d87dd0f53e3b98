//! Stream Codec
//!
//! Maps upstream frames to [`InboundMessage`]s and control requests to
//! frames.
//!
//! - **Text frames**: JSON, one object or an array of objects
//! - **Binary frames**: the same structure encoded as `MessagePack`
//!
//! A frame is all-or-nothing: if any object in it is malformed the whole
//! frame is rejected. Session control objects (acks, heartbeats) are skipped.

use serde_json::{Map, Value};

use super::messages::{ControlRequest, WireType};
use crate::application::ports::{CodecError, ControlFrame, Frame, FrameCodec};
use crate::domain::market::{InboundMessage, MarketPayload};

/// JSON / `MessagePack` codec for the market stream.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn decode_value(value: Value) -> Result<Vec<InboundMessage>, CodecError> {
        match value {
            Value::Array(items) => {
                let mut messages = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(message) = Self::decode_object(item)? {
                        messages.push(message);
                    }
                }
                Ok(messages)
            }
            object @ Value::Object(_) => Ok(Self::decode_object(object)?.into_iter().collect()),
            other => Err(CodecError::Malformed(format!(
                "expected object or array, got {}",
                type_name(&other)
            ))),
        }
    }

    fn decode_object(value: Value) -> Result<Option<InboundMessage>, CodecError> {
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(CodecError::Malformed(format!(
                    "expected object, got {}",
                    type_name(&other)
                )));
            }
        };

        let wire_type = object
            .get("type")
            .and_then(Value::as_str)
            .and_then(WireType::parse);
        let untyped = !object.contains_key("type");

        if wire_type.is_some_and(WireType::is_control) {
            tracing::trace!(?wire_type, "Skipping control message");
            return Ok(None);
        }

        let topic = match object.get("topic") {
            Some(Value::String(topic)) if !topic.is_empty() => topic.clone(),
            Some(_) => {
                return Err(CodecError::Malformed(
                    "topic must be a non-empty string".to_string(),
                ));
            }
            None => return Err(CodecError::Malformed("missing topic".to_string())),
        };

        let payload = match wire_type {
            Some(WireType::Tick) => MarketPayload::Tick(from_object(object)?),
            Some(WireType::Book) => MarketPayload::BookDelta(from_object(object)?),
            Some(WireType::Status) => MarketPayload::Status(from_object(object)?),
            None if untyped && object.contains_key("price") => {
                MarketPayload::Tick(from_object(object)?)
            }
            _ => MarketPayload::Other(Value::Object(object)),
        };

        Ok(Some(InboundMessage::new(topic, payload)))
    }
}

impl FrameCodec for JsonCodec {
    fn decode(&self, frame: &Frame) -> Result<Vec<InboundMessage>, CodecError> {
        let value: Value = match frame {
            Frame::Text(text) => serde_json::from_str(text.trim())?,
            Frame::Binary(bytes) => rmp_serde::from_slice(bytes)?,
        };
        Self::decode_value(value)
    }

    fn encode(&self, control: &ControlFrame) -> Result<Frame, CodecError> {
        let request = match control {
            ControlFrame::Join(topics) => ControlRequest::subscribe(topics.clone()),
            ControlFrame::Leave(topics) => ControlRequest::unsubscribe(topics.clone()),
        };
        Ok(Frame::Text(request.to_json()?))
    }
}

fn from_object<T>(object: Map<String, Value>) -> Result<T, CodecError>
where
    T: serde::de::DeserializeOwned,
{
    Ok(serde_json::from_value(Value::Object(object))?)
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rust_decimal::Decimal;
    use test_case::test_case;

    fn decode_text(text: &str) -> Result<Vec<InboundMessage>, CodecError> {
        JsonCodec::new().decode(&Frame::Text(text.to_string()))
    }

    #[test]
    fn untyped_object_with_price_is_a_tick() {
        let messages = decode_text(r#"{"topic":"AAPL.tick","price":150.2}"#).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "AAPL.tick");
        assert_eq!(messages[0].payload.price(), Some(Decimal::new(1502, 1)));
    }

    #[test]
    fn array_of_mixed_payloads() {
        let messages = decode_text(
            r#"[
                {"topic":"AAPL.tick","type":"tick","price":"150.25","size":100},
                {"topic":"AAPL.book","type":"book","sequence":42,
                 "bids":[{"price":150.1,"size":3}],"asks":[{"price":150.3,"size":1}]},
                {"topic":"AAPL.status","type":"status","status":"halted","message":"LUDP"}
            ]"#,
        )
        .unwrap();

        let kinds: Vec<_> = messages.iter().map(|m| m.payload.kind()).collect();
        assert_eq!(kinds, vec!["tick", "book_delta", "status"]);
        assert_eq!(messages[1].payload.price(), Some(Decimal::new(1502, 1)));
    }

    #[test]
    fn control_messages_are_skipped() {
        let messages = decode_text(
            r#"[{"type":"subscribed","topics":["AAPL.tick"]},{"topic":"AAPL.tick","price":1}]"#,
        )
        .unwrap();
        assert_eq!(messages.len(), 1);

        assert!(decode_text(r#"{"type":"heartbeat"}"#).unwrap().is_empty());
    }

    #[test]
    fn unknown_shapes_are_kept_verbatim() {
        let messages = decode_text(r#"{"topic":"AAPL.news","headline":"x"}"#).unwrap();
        assert_eq!(messages[0].payload.kind(), "other");

        let messages = decode_text(r#"{"topic":"AAPL.x","type":"imbalance","qty":5}"#).unwrap();
        assert_eq!(messages[0].payload.kind(), "other");
    }

    #[test_case("not json" ; "invalid json")]
    #[test_case("42" ; "scalar")]
    #[test_case(r#"{"price":1}"# ; "missing topic")]
    #[test_case(r#"{"topic":7,"price":1}"# ; "numeric topic")]
    #[test_case(r#"{"topic":"AAPL.tick","type":"tick"}"# ; "tick without price")]
    #[test_case(r#"[{"topic":"AAPL.tick","price":1},"oops"]"# ; "bad array element")]
    fn malformed_frames_are_rejected(text: &str) {
        assert!(decode_text(text).is_err());
    }

    #[test]
    fn binary_frames_decode_msgpack() {
        let value = serde_json::json!([{"topic": "MSFT.tick", "price": 410.5}]);
        let bytes = rmp_serde::to_vec_named(&value).unwrap();

        let messages = JsonCodec::new().decode(&Frame::Binary(bytes)).unwrap();

        assert_eq!(messages[0].topic, "MSFT.tick");
        assert_eq!(messages[0].payload.price(), Some(Decimal::new(4105, 1)));
    }

    #[test]
    fn invalid_msgpack_is_rejected() {
        let result = JsonCodec::new().decode(&Frame::Binary(vec![0xc1]));
        assert!(matches!(result, Err(CodecError::MsgPack(_))));
    }

    #[test]
    fn encodes_control_frames() {
        let codec = JsonCodec::new();

        let join = codec
            .encode(&ControlFrame::Join(vec!["AAPL.tick".to_string()]))
            .unwrap();
        assert_eq!(
            join,
            Frame::Text(r#"{"action":"subscribe","topics":["AAPL.tick"]}"#.to_string())
        );

        let leave = codec
            .encode(&ControlFrame::Leave(vec!["AAPL.tick".to_string()]))
            .unwrap();
        assert_eq!(
            leave,
            Frame::Text(r#"{"action":"unsubscribe","topics":["AAPL.tick"]}"#.to_string())
        );
    }
}
