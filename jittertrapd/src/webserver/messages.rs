use jt_sampler::FrameStats;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard ceiling on one encoded WebSocket message. Anything larger is a
/// protocol bug, not a payload to deliver.
pub const MAX_JSON_MSG_LEN: usize = 4096;

/// One pre-encoded JSON message as stored in the queue slots. Slots are
/// default-constructed up front and rewritten in place on produce.
#[derive(Debug, Clone, Default)]
pub struct WsPayload(pub String);

/// Message encoding failures.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// serde_json rejected the value.
    #[error("unable to encode message: {0}")]
    Json(#[from] serde_json::Error),
    /// The encoded message exceeds [`MAX_JSON_MSG_LEN`].
    #[error("encoded message too long: {0} bytes")]
    TooLong(usize),
}

/// Everything the daemon sends to a viewer, as `{"msg": ..., "p": ...}`.
#[derive(Debug, Serialize)]
#[serde(tag = "msg", content = "p", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Aggregate statistics for one reporting interval.
    Stats(FrameStats),
    /// Coarser statistics spanning one second, for slow viewers.
    StatsSummary(FrameStats),
    /// The session cannot be served.
    Error {
        /// Human-readable reason.
        reason: String,
    },
    /// The interfaces a client may select.
    IfaceList {
        /// Allowed and present interface names.
        ifaces: Vec<String>,
    },
    /// The interface currently being sampled.
    Iface {
        /// Interface name.
        iface: String,
    },
    /// The sample period currently in effect.
    SamplePeriod {
        /// Period in microseconds.
        period_us: u32,
    },
    /// The session's delivery rate changed.
    TierChange {
        /// New minimum interval between delivered messages.
        min_interval_ms: u64,
    },
}

/// Requests a viewer may send, mirroring the server wire shape.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "msg", content = "p", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Redirect sampling to another interface.
    SelectIface {
        /// Interface name; must be allowed and present.
        iface: String,
    },
    /// Change the sample period.
    SetSamplePeriod {
        /// Requested period in microseconds; clamped to the floor.
        period_us: u32,
    },
}

/// Encodes a message to a standalone string, for direct socket sends.
pub fn encode(message: &ServerMessage) -> Result<String, EncodeError> {
    let text = serde_json::to_string(message)?;
    if text.len() > MAX_JSON_MSG_LEN {
        return Err(EncodeError::TooLong(text.len()));
    }
    Ok(text)
}

/// Encodes a message in place into a queue slot.
pub fn encode_into(message: &ServerMessage, slot: &mut WsPayload) -> Result<(), EncodeError> {
    slot.0 = encode(message)?;
    Ok(())
}
