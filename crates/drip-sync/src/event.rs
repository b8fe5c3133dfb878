//! Client-visible replay events.

use drip_core::{OrderKey, Sequenced};
use drip_delta::Patch;
use drip_store::{CeaCursor, Document, DocumentKey};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CsOp {
    /// The document is (now) in the subset; `full` is its current state.
    Addition { full: Document },
    /// Partial change of a document already in the subset. Replay reports
    /// after-matching updates as additions, so it never produces this.
    Update { id: DocumentKey, diff: Patch },
    /// The document left the subset.
    Subtraction { id: DocumentKey },
    /// Progress without a change to the subset.
    Noop,
}

/// One replay event and the cursor that resumes right after it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CsEvent {
    pub cursor: CeaCursor,
    #[serde(flatten)]
    pub op: CsOp,
}

impl CsEvent {
    pub fn new(cursor: CeaCursor, op: CsOp) -> Self {
        Self { cursor, op }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.op, CsOp::Noop)
    }

    /// Key of the document this event is about.
    pub fn document_key(&self) -> Option<DocumentKey> {
        match &self.op {
            CsOp::Addition { full } => DocumentKey::of(full).ok(),
            CsOp::Update { id, .. } | CsOp::Subtraction { id } => Some(id.clone()),
            CsOp::Noop => None,
        }
    }
}

impl Sequenced for CsEvent {
    fn order_key(&self) -> OrderKey {
        self.cursor.key
    }
}
