//! Report splitting
//!
//! Reports such as NotifyReport carry an item list that can outgrow the
//! CSMS message size limit. The splitter partitions the list greedily, in
//! order, into CALLs that each fit the budget once framed. Every part carries
//! the original fields (`requestId`, `generatedAt`, ...), a `seqNo` counting
//! from 0 and `tbc: true` on all but the last part.

use serde_json::Value;
use tracing::warn;

use crate::ocpp::{Call, OcppError};

const SEQ_NO_FIELD: &str = "seqNo";
const TBC_FIELD: &str = "tbc";

#[derive(Debug, Clone, Copy)]
pub struct ReportSplitter {
    max_message_size: usize,
}

impl ReportSplitter {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Whether the framed CALL exceeds the budget
    pub fn is_oversized(&self, call: &Call) -> Result<bool, OcppError> {
        Ok(call.wire_len()? > self.max_message_size)
    }

    /// Split `payload` on its `items_field` array.
    ///
    /// `next_id` supplies the message id of each part. A payload without an
    /// item array comes back as a single unchanged part. An item that does not
    /// fit the budget on its own is sent alone in an oversized part.
    pub fn split(
        &self,
        action: &str,
        payload: &Value,
        items_field: &str,
        mut next_id: impl FnMut() -> String,
    ) -> Result<Vec<Call>, OcppError> {
        let items = match payload.get(items_field) {
            Some(Value::Array(items)) if !items.is_empty() => items,
            _ => return Ok(vec![Call::new(next_id(), action, payload)?]),
        };

        let item_lens = items
            .iter()
            .map(|item| serde_json::to_vec(item).map(|bytes| bytes.len()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut calls = Vec::new();
        let mut start = 0;
        while start < items.len() {
            let message_id = next_id();
            let seq_no = calls.len();

            // Envelope with an empty item list; `tbc: false` is the longer form
            let envelope = Call {
                message_id: message_id.clone(),
                action: action.to_string(),
                payload: part_payload(payload, items_field, Vec::new(), seq_no, false),
            };
            let mut size = envelope.wire_len()? + item_lens[start];
            let mut end = start + 1;

            if size > self.max_message_size {
                warn!(
                    "Splitter: {} item {} is {} bytes framed, over the {} byte limit",
                    action, start, size, self.max_message_size
                );
            }

            while end < items.len() && size + 1 + item_lens[end] <= self.max_message_size {
                size += 1 + item_lens[end];
                end += 1;
            }

            let last = end == items.len();
            calls.push(Call {
                message_id,
                action: action.to_string(),
                payload: part_payload(
                    payload,
                    items_field,
                    items[start..end].to_vec(),
                    seq_no,
                    !last,
                ),
            });
            start = end;
        }

        Ok(calls)
    }
}

fn part_payload(
    original: &Value,
    items_field: &str,
    items: Vec<Value>,
    seq_no: usize,
    tbc: bool,
) -> Value {
    let mut payload = original.clone();
    if let Value::Object(map) = &mut payload {
        map.insert(items_field.to_string(), Value::Array(items));
        map.insert(SEQ_NO_FIELD.to_string(), Value::from(seq_no));
        map.insert(TBC_FIELD.to_string(), Value::Bool(tbc));
    }
    payload
}
