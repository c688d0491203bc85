//! Marker stream decoder: `stream_data` payload → store upserts.

use std::collections::HashSet;

use marker_types::{MarkerId, MarkerRecord, StreamDataMessage};
use serde_json::Value;
use tracing::debug;

use crate::error::DecodeError;
use crate::store::MarkerPositionStore;

/// Outcome of one decoded message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub accepted: usize,
    pub filtered: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MarkerStreamDecoder {
    allow_list: Option<HashSet<MarkerId>>,
}

impl MarkerStreamDecoder {
    /// `None` accepts every id; `Some` keeps only the listed ids.
    pub fn new(allowed: Option<&[MarkerId]>) -> Self {
        Self { allow_list: allowed.map(|ids| ids.iter().copied().collect()) }
    }

    pub fn allows(&self, id: MarkerId) -> bool {
        self.allow_list.as_ref().map_or(true, |set| set.contains(&id))
    }

    /// Parse a `stream_data` message and split records by the allow-list.
    /// Nothing is returned on error; a bad record fails the whole message.
    pub fn decode(&self, message: &Value) -> Result<(Vec<MarkerRecord>, usize), DecodeError> {
        if let Some(cmd) = message.get("command").and_then(Value::as_str) {
            if cmd != "stream_data" {
                return Err(DecodeError::UnexpectedCommand(cmd.to_string()));
            }
        }
        let parsed: StreamDataMessage = serde_json::from_value(message.clone())?;
        let records = parsed.data.ok_or(DecodeError::MissingData)?;

        let total = records.len();
        let kept: Vec<MarkerRecord> = records.into_iter().filter(|r| self.allows(r.marker_id)).collect();
        let filtered = total - kept.len();
        Ok((kept, filtered))
    }

    /// Decode and apply to the store in one write.
    pub async fn decode_into(
        &self,
        message: &Value,
        store: &MarkerPositionStore,
    ) -> Result<DecodeSummary, DecodeError> {
        let (records, filtered) = self.decode(message)?;
        if records.is_empty() {
            return Ok(DecodeSummary { accepted: 0, filtered });
        }
        for r in &records {
            debug!(
                "Marker {} → ({:.3}, {:.3}, {:.3})",
                r.marker_id, r.position.x, r.position.y, r.position.z
            );
        }
        let accepted = store.upsert_many(records.iter().map(|r| (r.marker_id, r.position))).await;
        Ok(DecodeSummary { accepted, filtered })
    }
}
