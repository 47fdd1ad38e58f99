//! Ingestion of provider callbacks.
//!
//! Unknown, late and duplicate deliveries are normal operating conditions:
//! they are counted and logged, never surfaced as errors. Only a body that
//! cannot be read at all is refused.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use reveal_core::{result::RevealResult, store::ContactStore};
use serde::Serialize;

use crate::{
  merge::MergeEngine,
  payload::{self, PayloadError},
  tracker::{RequestTracker, ResolveOutcome},
};

/// Counts reported back to the provider for one delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleOutcome {
  pub accepted:        usize,
  pub unknown_request: usize,
  pub parse_errors:    usize,
  pub merge_errors:    usize,
}

pub struct CallbackReceiver<S> {
  tracker: Arc<RequestTracker>,
  merge:   Arc<MergeEngine<S>>,
}

impl<S: ContactStore> CallbackReceiver<S> {
  pub fn new(tracker: Arc<RequestTracker>, merge: Arc<MergeEngine<S>>) -> Self {
    Self { tracker, merge }
  }

  /// Process one callback body. Safe to call concurrently and to call again
  /// with the same body.
  pub async fn handle(
    &self,
    header_request_id: Option<&str>,
    body:              &[u8],
  ) -> Result<HandleOutcome, PayloadError> {
    let parsed = payload::parse(header_request_id, body, Utc::now())?;
    let mut outcome = HandleOutcome {
      parse_errors: parsed.errors.len(),
      ..Default::default()
    };

    // One tracker transition per request id, in payload order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<RevealResult>> = HashMap::new();
    for item in parsed.items {
      let results = groups.entry(item.request_id.clone()).or_insert_with(|| {
        order.push(item.request_id.clone());
        Vec::new()
      });
      results.push(item.result);
    }

    for request_id in order {
      let results = groups.remove(&request_id).unwrap_or_default();
      let resolved = self.tracker.resolve(&request_id, &results);
      let Some(request) = resolved.request() else {
        outcome.unknown_request += results.len();
        continue;
      };
      if let ResolveOutcome::AlreadyTerminal(_) = resolved {
        tracing::info!(
          request_id,
          state = ?request.state,
          "merging results for a terminal request"
        );
      }

      for result in &results {
        if !request.covers(&result.subject_id) {
          outcome.unknown_request += 1;
          continue;
        }
        match self.merge.merge(result).await {
          Ok(_) => outcome.accepted += 1,
          Err(err) => {
            tracing::warn!(
              request_id,
              subject_id = %result.subject_id,
              error = %err,
              "failed to merge callback result"
            );
            outcome.merge_errors += 1;
          }
        }
      }
    }

    tracing::info!(
      accepted = outcome.accepted,
      unknown_request = outcome.unknown_request,
      parse_errors = outcome.parse_errors,
      merge_errors = outcome.merge_errors,
      "handled callback"
    );
    Ok(outcome)
  }
}

#[cfg(test)]
mod tests {
  use reveal_core::{
    contact::ContactStatus,
    request::RequestState,
    store::ContactQuery,
    subject::SubjectId,
  };
  use reveal_store_sqlite::SqliteStore;

  use super::*;

  struct Fixture {
    tracker:  Arc<RequestTracker>,
    merge:    Arc<MergeEngine<SqliteStore>>,
    receiver: Arc<CallbackReceiver<SqliteStore>>,
  }

  async fn fixture() -> Fixture {
    let tracker = Arc::new(RequestTracker::new(
      chrono::Duration::minutes(15),
      chrono::Duration::hours(1),
    ));
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let merge = Arc::new(MergeEngine::new(store));
    let receiver = Arc::new(CallbackReceiver::new(tracker.clone(), merge.clone()));
    Fixture { tracker, merge, receiver }
  }

  fn sid(s: &str) -> SubjectId { SubjectId::new(s).unwrap() }

  async fn contacts(f: &Fixture) -> usize {
    f.merge.store().query(&ContactQuery::default()).await.unwrap().len()
  }

  #[tokio::test]
  async fn known_results_are_resolved_and_merged() {
    let f = fixture().await;
    f.tracker.register("r1", vec![sid("a"), sid("b")]).unwrap();

    let body = br#"[{"subjectId": "a", "status": "success", "email": "a@x.com"}]"#;
    let outcome = f.receiver.handle(Some("r1"), body).await.unwrap();
    assert_eq!(outcome, HandleOutcome { accepted: 1, ..Default::default() });
    assert_eq!(f.tracker.get("r1").unwrap().state, RequestState::PartiallyResolved);

    let body = br#"[{"subjectId": "b", "status": "not_found"}]"#;
    f.receiver.handle(Some("r1"), body).await.unwrap();
    assert_eq!(f.tracker.get("r1").unwrap().state, RequestState::Resolved);

    let stored = f.merge.store().query(&ContactQuery::default()).await.unwrap();
    assert_eq!(stored.len(), 2);
    let b = stored.iter().find(|r| r.subject_id == Some(sid("b"))).unwrap();
    assert_eq!(b.status, ContactStatus::NoContactInfo);
  }

  #[tokio::test]
  async fn redelivery_is_idempotent() {
    let f = fixture().await;
    f.tracker.register("r1", vec![sid("a")]).unwrap();
    let body = br#"[{"subjectId": "a", "status": "success", "email": "a@x.com"}]"#;

    f.receiver.handle(Some("r1"), body).await.unwrap();
    let before = f.merge.store().query(&ContactQuery::default()).await.unwrap();
    let again = f.receiver.handle(Some("r1"), body).await.unwrap();
    let after = f.merge.store().query(&ContactQuery::default()).await.unwrap();

    assert_eq!(again.accepted, 1);
    assert_eq!(before, after);
  }

  #[tokio::test]
  async fn unknown_requests_and_foreign_subjects_are_counted() {
    let f = fixture().await;
    f.tracker.register("r1", vec![sid("a")]).unwrap();

    let body = br#"[
      {"subjectId": "a", "status": "success", "phone": "555"},
      {"subjectId": "zzz", "status": "success", "phone": "556"},
      {"subjectId": "q", "status": "success", "requestId": "ghost"},
      {"bogus": true}
    ]"#;
    let outcome = f.receiver.handle(Some("r1"), body).await.unwrap();
    assert_eq!(
      outcome,
      HandleOutcome { accepted: 1, unknown_request: 2, parse_errors: 1, merge_errors: 0 }
    );
    assert_eq!(contacts(&f).await, 1);
  }

  #[tokio::test]
  async fn concurrent_known_and_unknown_callbacks() {
    let f = fixture().await;
    f.tracker.register("known", vec![sid("a"), sid("b")]).unwrap();

    let known = {
      let receiver = f.receiver.clone();
      tokio::spawn(async move {
        receiver
          .handle(
            Some("known"),
            br#"[{"subjectId": "a", "status": "success"}, {"subjectId": "b", "status": "failed"}]"#,
          )
          .await
      })
    };
    let unknown = {
      let receiver = f.receiver.clone();
      tokio::spawn(async move {
        receiver
          .handle(Some("never-registered"), br#"[{"subjectId": "c", "status": "success"}]"#)
          .await
      })
    };

    let known = known.await.unwrap().unwrap();
    let unknown = unknown.await.unwrap().unwrap();
    assert_eq!(known.accepted, 2);
    assert_eq!(unknown.unknown_request, 1);
    assert_eq!(f.tracker.get("known").unwrap().state, RequestState::Resolved);
    assert_eq!(contacts(&f).await, 2);
  }

  #[tokio::test]
  async fn late_results_for_expired_requests_are_still_merged() {
    let f = fixture().await;
    let long_ago = Utc::now() - chrono::Duration::hours(2);
    f.tracker.register_at("r1", vec![sid("a")], 1, long_ago).unwrap();
    f.tracker.sweep(Utc::now() - chrono::Duration::minutes(30));

    let body = br#"[{"subjectId": "a", "status": "success", "email": "late@x.com"}]"#;
    let outcome = f.receiver.handle(Some("r1"), body).await.unwrap();
    assert_eq!(outcome.accepted, 1);
    assert_eq!(f.tracker.get("r1").unwrap().state, RequestState::Expired);
  }

  #[tokio::test]
  async fn unreadable_body_is_refused() {
    let f = fixture().await;
    assert!(f.receiver.handle(Some("r1"), b"<xml/>").await.is_err());
  }
}
