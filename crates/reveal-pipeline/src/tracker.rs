//! In-memory correlation between accepted submissions and their callbacks.
//!
//! Every operation is a short critical section on a single mutex; nothing
//! here awaits. Subjects are claimed by at most one owner at a time: a
//! [`Reservation`] while a submission is in flight, then the live request the
//! provider accepted. Claiming before the provider call is what stops two
//! overlapping submissions from sending the same subject twice.

use std::{
  collections::HashMap,
  sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Duration, Utc};
use reveal_core::{
  request::{PendingRequest, RequestState},
  result::RevealResult,
  subject::SubjectId,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
  #[error("request id {0:?} is already tracked")]
  DuplicateRequestId(String),

  #[error("subject {subject_id} is already pending in request {request_id:?}")]
  SubjectAlreadyPending {
    subject_id: SubjectId,
    request_id: String,
  },

  #[error("subject {0} is already being submitted")]
  SubjectInFlight(SubjectId),

  #[error("a request must cover at least one subject")]
  NoSubjects,

  #[error("subject {0} is not held by this reservation")]
  NotReserved(SubjectId),
}

/// What [`RequestTracker::resolve`] did with a batch of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
  /// The request was live; settled subjects were recorded.
  Updated(PendingRequest),
  /// The request had already reached a terminal state and was left as is.
  AlreadyTerminal(PendingRequest),
  /// No such request (never registered, or evicted).
  NotFound,
}

impl ResolveOutcome {
  pub fn request(&self) -> Option<&PendingRequest> {
    match self {
      Self::Updated(req) | Self::AlreadyTerminal(req) => Some(req),
      Self::NotFound => None,
    }
  }
}

/// Owner of a subject claim.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Claim {
  Reserved(u64),
  Request(String),
}

impl Claim {
  fn conflict(&self, subject_id: &SubjectId) -> TrackerError {
    match self {
      Self::Reserved(_) => TrackerError::SubjectInFlight(subject_id.clone()),
      Self::Request(request_id) => TrackerError::SubjectAlreadyPending {
        subject_id: subject_id.clone(),
        request_id: request_id.clone(),
      },
    }
  }

  fn is_request(&self, request_id: &str) -> bool {
    matches!(self, Self::Request(id) if id == request_id)
  }
}

#[derive(Debug, Default)]
struct TrackerState {
  requests:         HashMap<String, PendingRequest>,
  /// Subject → current owner.
  claims:           HashMap<SubjectId, Claim>,
  next_reservation: u64,
}

/// Pending-request registry shared by the submitter and callback receiver.
#[derive(Debug)]
pub struct RequestTracker {
  expiry:    Duration,
  retention: Duration,
  state:     Mutex<TrackerState>,
}

impl RequestTracker {
  /// `expiry`: how long a request may wait for callbacks.
  /// `retention`: how long a terminal request is kept for late callbacks.
  pub fn new(expiry: Duration, retention: Duration) -> Self {
    Self {
      expiry,
      retention,
      state: Mutex::new(TrackerState::default()),
    }
  }

  /// Track a newly accepted request submitted now, as attempt 1.
  pub fn register(
    &self,
    request_id:  impl Into<String>,
    subject_ids: Vec<SubjectId>,
  ) -> Result<PendingRequest, TrackerError> {
    self.register_at(request_id, subject_ids, 1, Utc::now())
  }

  pub fn register_at(
    &self,
    request_id:   impl Into<String>,
    subject_ids:  Vec<SubjectId>,
    attempt:      u32,
    submitted_at: DateTime<Utc>,
  ) -> Result<PendingRequest, TrackerError> {
    let mut held = self.reserve(&subject_ids)?;
    held.commit(&subject_ids, request_id, attempt, submitted_at)
  }

  /// Claim every subject in `subject_ids` for an upcoming submission, or
  /// none of them if any is already claimed.
  pub fn reserve(&self, subject_ids: &[SubjectId]) -> Result<Reservation<'_>, TrackerError> {
    if subject_ids.is_empty() {
      return Err(TrackerError::NoSubjects);
    }
    let mut state = self.lock();
    if let Some(err) = subject_ids
      .iter()
      .find_map(|id| state.claims.get(id).map(|claim| claim.conflict(id)))
    {
      return Err(err);
    }
    Ok(self.claim_free(&mut state, subject_ids))
  }

  /// Claim the free subjects in `subject_ids` and report the rest.
  pub fn reserve_available(
    &self,
    subject_ids: &[SubjectId],
  ) -> (Reservation<'_>, Vec<(SubjectId, TrackerError)>) {
    let mut state = self.lock();
    let conflicts = subject_ids
      .iter()
      .filter_map(|id| state.claims.get(id).map(|claim| (id.clone(), claim.conflict(id))))
      .collect();
    (self.claim_free(&mut state, subject_ids), conflicts)
  }

  fn claim_free(&self, state: &mut TrackerState, subject_ids: &[SubjectId]) -> Reservation<'_> {
    state.next_reservation += 1;
    let id = state.next_reservation;
    let mut held = Vec::new();
    for subject_id in subject_ids {
      if !state.claims.contains_key(subject_id) {
        state.claims.insert(subject_id.clone(), Claim::Reserved(id));
        held.push(subject_id.clone());
      }
    }
    Reservation { tracker: self, id, held }
  }

  /// Record `results` against `request_id`.
  ///
  /// Results for subjects outside the request are ignored. Terminal requests
  /// are returned unchanged; unknown ids yield [`ResolveOutcome::NotFound`].
  pub fn resolve(&self, request_id: &str, results: &[RevealResult]) -> ResolveOutcome {
    self.resolve_at(request_id, results, Utc::now())
  }

  pub fn resolve_at(
    &self,
    request_id: &str,
    results:    &[RevealResult],
    now:        DateTime<Utc>,
  ) -> ResolveOutcome {
    let mut guard = self.lock();
    let TrackerState { requests, claims, .. } = &mut *guard;

    let Some(request) = requests.get_mut(request_id) else {
      tracing::warn!(request_id, results = results.len(), "callback for unknown request");
      return ResolveOutcome::NotFound;
    };
    if request.state.is_terminal() {
      tracing::debug!(request_id, state = ?request.state, "callback for terminal request");
      return ResolveOutcome::AlreadyTerminal(request.clone());
    }

    let mut newly_settled = 0;
    for result in results {
      if !request.covers(&result.subject_id) {
        tracing::warn!(
          request_id,
          subject_id = %result.subject_id,
          "result for subject outside request"
        );
        continue;
      }
      if request.settled.insert(result.subject_id.clone()) {
        newly_settled += 1;
        release_claim(claims, &result.subject_id, |c| c.is_request(request_id));
      }
    }

    if request.is_fully_settled() {
      request.state = RequestState::Resolved;
      request.finished_at = Some(now);
    } else if !request.settled.is_empty() {
      request.state = RequestState::PartiallyResolved;
    }

    tracing::debug!(
      request_id,
      newly_settled,
      state = ?request.state,
      "resolved callback results"
    );
    ResolveOutcome::Updated(request.clone())
  }

  /// Expire live requests older than the expiry timeout and evict terminal
  /// ones past the retention window. Returns the requests expired by this
  /// call so the caller can remediate their unsettled subjects.
  pub fn sweep(&self, now: DateTime<Utc>) -> Vec<PendingRequest> {
    let mut guard = self.lock();
    let TrackerState { requests, claims, .. } = &mut *guard;
    let mut expired = Vec::new();

    for request in requests.values_mut() {
      if request.state.is_terminal() || now - request.submitted_at < self.expiry {
        continue;
      }
      request.state = RequestState::Expired;
      request.finished_at = Some(now);
      for subject_id in request.unsettled() {
        release_claim(claims, subject_id, |c| c.is_request(&request.request_id));
      }
      expired.push(request.clone());
    }

    let retention = self.retention;
    let before = requests.len();
    requests.retain(|_, request| match request.finished_at {
      Some(at) if request.state.is_terminal() => now - at < retention,
      _ => true,
    });
    let evicted = before - requests.len();

    if !expired.is_empty() || evicted > 0 {
      tracing::info!(expired = expired.len(), evicted, "swept pending requests");
    }
    expired
  }

  pub fn get(&self, request_id: &str) -> Option<PendingRequest> {
    self.lock().requests.get(request_id).cloned()
  }

  /// All tracked requests, oldest first.
  pub fn list(&self) -> Vec<PendingRequest> {
    let mut all: Vec<_> = self.lock().requests.values().cloned().collect();
    all.sort_by(|a, b| {
      a.submitted_at
        .cmp(&b.submitted_at)
        .then_with(|| a.request_id.cmp(&b.request_id))
    });
    all
  }

  /// `true` if `subject_id` is being submitted or a live request still owes
  /// a result for it.
  pub fn is_pending(&self, subject_id: &SubjectId) -> bool {
    self.lock().claims.contains_key(subject_id)
  }

  fn lock(&self) -> MutexGuard<'_, TrackerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn release_claim(
  claims:     &mut HashMap<SubjectId, Claim>,
  subject_id: &SubjectId,
  owned:      impl FnOnce(&Claim) -> bool,
) {
  if claims.get(subject_id).is_some_and(owned) {
    claims.remove(subject_id);
  }
}

// ─── Reservation ─────────────────────────────────────────────────────────────

/// Subjects claimed for a submission that the provider has not accepted yet.
///
/// Committing a subset turns it into a [`PendingRequest`]. Whatever is still
/// held when the reservation is dropped is released, including when the
/// submitting task is cancelled mid-call.
#[derive(Debug)]
#[must_use = "dropping a reservation releases its subjects"]
pub struct Reservation<'a> {
  tracker: &'a RequestTracker,
  id:      u64,
  /// In the order they were reserved.
  held:    Vec<SubjectId>,
}

impl Reservation<'_> {
  pub fn subject_ids(&self) -> &[SubjectId] { &self.held }

  pub fn is_empty(&self) -> bool { self.held.is_empty() }

  /// Move `subject_ids` from this reservation into a newly accepted request.
  pub fn commit(
    &mut self,
    subject_ids:  &[SubjectId],
    request_id:   impl Into<String>,
    attempt:      u32,
    submitted_at: DateTime<Utc>,
  ) -> Result<PendingRequest, TrackerError> {
    let request_id = request_id.into();
    if subject_ids.is_empty() {
      return Err(TrackerError::NoSubjects);
    }
    if let Some(missing) = subject_ids.iter().find(|id| !self.held.contains(id)) {
      return Err(TrackerError::NotReserved(missing.clone()));
    }

    let mut state = self.tracker.lock();
    if state.requests.contains_key(&request_id) {
      return Err(TrackerError::DuplicateRequestId(request_id));
    }

    let mut unique = subject_ids.to_vec();
    unique.sort();
    unique.dedup();

    for id in &unique {
      state.claims.insert(id.clone(), Claim::Request(request_id.clone()));
    }
    self.held.retain(|id| unique.binary_search(id).is_err());

    let request = PendingRequest::new(request_id.clone(), unique, attempt, submitted_at);
    state.requests.insert(request_id, request.clone());

    tracing::debug!(
      request_id = %request.request_id,
      subjects = request.subject_ids.len(),
      attempt,
      "registered pending request"
    );
    Ok(request)
  }

  /// Give `subject_ids` back without creating a request.
  pub fn release(&mut self, subject_ids: &[SubjectId]) {
    let mut state = self.tracker.lock();
    let id = self.id;
    self.held.retain(|subject_id| {
      if !subject_ids.contains(subject_id) {
        return true;
      }
      release_claim(&mut state.claims, subject_id, |c| *c == Claim::Reserved(id));
      false
    });
  }
}

impl Drop for Reservation<'_> {
  fn drop(&mut self) {
    if self.held.is_empty() {
      return;
    }
    let held = std::mem::take(&mut self.held);
    let mut state = self.tracker.lock();
    for subject_id in &held {
      release_claim(&mut state.claims, subject_id, |c| *c == Claim::Reserved(self.id));
    }
    tracing::debug!(subjects = held.len(), "released unsubmitted subjects");
  }
}
