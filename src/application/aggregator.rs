use crate::domain::bundle::{BundleType, Entry, Identifier};
use crate::domain::outcome::{
    EntryError, EntryOutcome, EntryResponse, Issue, OperationOutcome, ResponseBundle,
    ResponseEntry,
};
use tracing::error;
use uuid::Uuid;

/// Collects per-entry outcomes into the `transaction-response` Bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeAggregator;

impl OutcomeAggregator {
    /// Builds the response with one entry per input entry, in input order.
    ///
    /// `outcomes` is indexed by entry position. A slot still empty here means
    /// the entry's task ended without reporting, which is surfaced as an
    /// internal error on that entry alone.
    pub fn assemble(
        &self,
        identifier: Option<Identifier>,
        entries: &[Entry],
        mut outcomes: Vec<Option<EntryOutcome>>,
        issues: Vec<Issue>,
    ) -> ResponseBundle {
        outcomes.resize(entries.len(), None);
        let entry = entries
            .iter()
            .zip(outcomes)
            .map(|(entry, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    error!(index = entry.index, "Entry finished without an outcome");
                    Err(EntryError::Internal(
                        "entry processing ended without a result".to_string(),
                    ))
                });
                ResponseEntry {
                    full_url: entry.full_url.clone(),
                    response: EntryResponse::from(&outcome),
                }
            })
            .collect();

        ResponseBundle {
            resource_type: "Bundle".to_string(),
            id: Uuid::new_v4().to_string(),
            bundle_type: BundleType::TransactionResponse,
            identifier,
            entry,
            issues: OperationOutcome::new(issues),
        }
    }
}
