//! Item messages: what the producer sends and what a worker parses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::item::Track;
use super::job::JobId;
use crate::error::{Error, Result};

/// Outbound message body, one per track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMessage {
    pub job_id: JobId,
    pub source_ref: String,
    pub item: Track,
}

/// A message as handed over by the transport, before parsing.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport-assigned ID, used to ack or dead-letter this delivery.
    pub msg_id: i64,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_attempt: u32,
    pub body: Value,
}

/// A parsed item message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub job_id: JobId,
    pub source_ref: Option<String>,
    pub track: Track,
    pub delivery_attempt: u32,
}

impl Envelope {
    /// Parse a message body.
    ///
    /// Accepts the direct `{job_id, item}` shape (`track` is accepted for
    /// `item`) as well as a notification wrapper whose `Message` field holds
    /// that object as a JSON string.
    pub fn parse(body: &Value, delivery_attempt: u32) -> Result<Self> {
        let unwrapped;
        let body = match body.get("Message") {
            Some(Value::String(inner)) => {
                unwrapped = serde_json::from_str::<Value>(inner).map_err(|e| {
                    Error::MalformedMessage(format!("notification Message is not JSON: {e}"))
                })?;
                &unwrapped
            }
            Some(Value::Object(_)) => &body["Message"],
            _ => body,
        };

        let job_id = body
            .get("job_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedMessage("missing job_id".to_string()))?
            .parse::<JobId>()
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;

        let payload = body
            .get("item")
            .or_else(|| body.get("track"))
            .ok_or_else(|| Error::MalformedMessage("missing item payload".to_string()))?;

        let track = Track::from_value(payload).ok_or_else(|| {
            Error::MalformedMessage("item payload needs a non-empty title and artist".to_string())
        })?;

        let source_ref = body
            .get("source_ref")
            .or_else(|| body.get("source_file"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            job_id,
            source_ref,
            track,
            delivery_attempt,
        })
    }
}

impl InboundMessage {
    pub fn parse(&self) -> Result<Envelope> {
        Envelope::parse(&self.body, self.delivery_attempt)
    }
}
