use serde::{Deserialize, Serialize};

use hireloop_core::UploadQueueJob;

/// Bus channel the queue change events travel on.
pub const DEFAULT_QUEUE_CHANNEL: &str = "candidate_upload_queue";

/// Message kind tag (`"type"` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Queue,
}

/// Queue change envelope: `{"type":"queue","data":[...jobs]}`.
///
/// The same shape is used for the initial socket snapshot, for every bus
/// publish and for every message forwarded to sockets.
///
/// Notes:
/// - Each envelope is complete and self-contained; clients never see partial state.
/// - `data` is either the full snapshot or the jobs touched by one mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    data: Vec<UploadQueueJob>,
}

impl QueueEnvelope {
    pub fn queue(data: Vec<UploadQueueJob>) -> Self {
        Self {
            kind: EnvelopeKind::Queue,
            data,
        }
    }

    pub fn data(&self) -> &[UploadQueueJob] {
        &self.data
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
