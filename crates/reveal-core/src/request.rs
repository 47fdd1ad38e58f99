//! Pending reveal requests. Local bookkeeping that correlates a submitted
//! batch with the callbacks that eventually settle it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subject::SubjectId;

/// Lifecycle of a [`PendingRequest`].
///
/// Transitions are monotonic:
/// `Submitted -> PartiallyResolved* -> Resolved`, or
/// `Submitted | PartiallyResolved -> Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
  Submitted,
  PartiallyResolved,
  Resolved,
  Expired,
}

impl RequestState {
  /// `Resolved` and `Expired` accept no further transitions.
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Resolved | Self::Expired)
  }
}

/// A batch the provider has accepted and whose results are still owed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
  /// Identifier assigned by the provider on acceptance.
  pub request_id:   String,
  pub subject_ids:  Vec<SubjectId>,
  /// Subjects for which a result has been received.
  pub settled:      BTreeSet<SubjectId>,
  pub submitted_at: DateTime<Utc>,
  /// Submission attempt (1-based) that produced this request.
  pub attempt:      u32,
  pub state:        RequestState,
  /// When the request entered a terminal state.
  pub finished_at:  Option<DateTime<Utc>>,
}

impl PendingRequest {
  pub fn new(
    request_id: impl Into<String>,
    subject_ids: Vec<SubjectId>,
    attempt: u32,
    submitted_at: DateTime<Utc>,
  ) -> Self {
    Self {
      request_id: request_id.into(),
      subject_ids,
      settled: BTreeSet::new(),
      submitted_at,
      attempt,
      state: RequestState::Submitted,
      finished_at: None,
    }
  }

  pub fn covers(&self, subject_id: &SubjectId) -> bool {
    self.subject_ids.contains(subject_id)
  }

  /// Subjects still waiting for a result.
  pub fn unsettled(&self) -> impl Iterator<Item = &SubjectId> {
    self.subject_ids.iter().filter(|id| !self.settled.contains(*id))
  }

  pub fn is_fully_settled(&self) -> bool {
    self.unsettled().next().is_none()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sid(s: &str) -> SubjectId { SubjectId::new(s).unwrap() }

  #[test]
  fn new_request_is_submitted_and_unsettled() {
    let req = PendingRequest::new("r1", vec![sid("a"), sid("b")], 1, Utc::now());
    assert_eq!(req.state, RequestState::Submitted);
    assert_eq!(req.unsettled().count(), 2);
    assert!(!req.is_fully_settled());
    assert!(req.covers(&sid("a")));
    assert!(!req.covers(&sid("c")));
  }

  #[test]
  fn terminal_states() {
    assert!(RequestState::Resolved.is_terminal());
    assert!(RequestState::Expired.is_terminal());
    assert!(!RequestState::Submitted.is_terminal());
    assert!(!RequestState::PartiallyResolved.is_terminal());
  }
}
