//! Message routing.
//!
//! Every record is "handled" whatever its content: its offset is recorded in the offset
//! map and the caller marks it on the session. Records with a missing or unknown `type`
//! header, or with a payload that does not decode, have no other effect. There is no
//! retry loop for poison records.

use crate::queue::QueueRecord;
use crate::state::AggregationState;
use keystats_core::{Message, MessageKind, MESSAGE_TYPE_HEADER};
use keystats_metadata::StatsStore;
use keystats_observability::metrics::{RECORDS_CONSUMED_TOTAL, RECORDS_SKIPPED_TOTAL};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingKind,
    UnknownKind,
    Decode,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingKind => "missing_kind",
            SkipReason::UnknownKind => "unknown_kind",
            SkipReason::Decode => "decode_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied { kind: MessageKind, keystem: String },
    Skipped(SkipReason),
}

/// Applies records to the aggregation state.
#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn StatsStore>,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self { store }
    }

    /// Route one record into `state`.
    ///
    /// Delete requests reset the keystem (creating it empty if unseen). Samples are
    /// applied to the keystem's aggregate, hydrated from the store on first touch.
    pub async fn route(&self, state: &mut AggregationState, record: &QueueRecord) -> RouteOutcome {
        let outcome = self.apply(state, record).await;

        state.record_offset(record.partition, record.offset);
        match &outcome {
            RouteOutcome::Applied { kind, .. } => {
                RECORDS_CONSUMED_TOTAL.with_label_values(&[kind.as_str()]).inc();
            }
            RouteOutcome::Skipped(reason) => {
                RECORDS_SKIPPED_TOTAL.with_label_values(&[reason.as_str()]).inc();
            }
        }
        outcome
    }

    async fn apply(&self, state: &mut AggregationState, record: &QueueRecord) -> RouteOutcome {
        let kind = match record.header(MESSAGE_TYPE_HEADER) {
            Some(value) => match MessageKind::from_header_value(value) {
                Some(kind) => kind,
                None => {
                    tracing::debug!(
                        partition = record.partition,
                        offset = record.offset,
                        kind = %String::from_utf8_lossy(value),
                        "Unknown message type, skipping"
                    );
                    return RouteOutcome::Skipped(SkipReason::UnknownKind);
                }
            },
            None => {
                tracing::debug!(
                    partition = record.partition,
                    offset = record.offset,
                    "No message type header, skipping"
                );
                return RouteOutcome::Skipped(SkipReason::MissingKind);
            }
        };

        let message = match Message::decode(kind, &record.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    partition = record.partition,
                    offset = record.offset,
                    kind = %kind,
                    error = %e,
                    "Failed to decode record, skipping"
                );
                return RouteOutcome::Skipped(SkipReason::Decode);
            }
        };

        match message {
            Message::Delete(request) => {
                tracing::info!(keystem = %request.used_keystem, "Resetting keystem");
                state.reset(&request.used_keystem);
                RouteOutcome::Applied {
                    kind,
                    keystem: request.used_keystem,
                }
            }
            Message::Stats(sample) => {
                state
                    .hydrate(self.store.as_ref(), &sample.used_keystem)
                    .await
                    .apply(&sample);
                RouteOutcome::Applied {
                    kind,
                    keystem: sample.used_keystem,
                }
            }
        }
    }
}
