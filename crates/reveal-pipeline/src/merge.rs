//! Folds partial contacts into the store without creating duplicates.
//!
//! Identity is resolved by looking up every key a patch carries, in priority
//! order (subject id, LinkedIn URL, email). The highest-priority match wins.
//! Fields are first-write-wins; only `status` moves, and only forward.
//!
//! Lookup and write run under one engine-wide lock so two merges for the
//! same person cannot both miss and both insert.

use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
};

use chrono::Utc;
use reveal_core::{
  contact::{ContactPatch, ContactRecord, ContactStatus},
  identity::IdentityKey,
  result::RevealResult,
  store::ContactStore,
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum MergeError {
  #[error("contact carries no identity key")]
  NoIdentity,

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl MergeError {
  fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(err))
  }
}

pub struct MergeEngine<S> {
  store: Arc<S>,
  lock:  Mutex<()>,
}

impl<S: ContactStore> MergeEngine<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store, lock: Mutex::new(()) }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  /// Merge one provider result.
  pub async fn merge(&self, result: &RevealResult) -> Result<ContactRecord, MergeError> {
    self.merge_patch(ContactPatch::from(result)).await
  }

  /// Merge one partial contact.
  pub async fn merge_patch(&self, patch: ContactPatch) -> Result<ContactRecord, MergeError> {
    let patch = patch.scrubbed();
    let keys = patch.identity_keys();
    if keys.is_empty() {
      return Err(MergeError::NoIdentity);
    }
    let _guard = self.lock.lock().await;
    self.merge_locked(patch, &keys).await
  }

  /// Merge a batch, collapsing patches that share any identity key, even
  /// transitively, before touching the store. Returns one record per
  /// distinct contact, in order of first appearance.
  ///
  /// Fails before writing anything if a patch has no identity key.
  pub async fn merge_many(
    &self,
    patches: Vec<ContactPatch>,
  ) -> Result<Vec<ContactRecord>, MergeError> {
    let patches: Vec<ContactPatch> = patches.into_iter().map(ContactPatch::scrubbed).collect();
    let keys: Vec<Vec<IdentityKey>> = patches.iter().map(ContactPatch::identity_keys).collect();
    if keys.iter().any(Vec::is_empty) {
      return Err(MergeError::NoIdentity);
    }

    let groups = group_by_shared_keys(&keys);
    tracing::debug!(patches = patches.len(), groups = groups.len(), "merging batch");

    let mut slots: Vec<Option<ContactPatch>> = patches.into_iter().map(Some).collect();
    let mut records: Vec<ContactRecord> = Vec::with_capacity(groups.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for group in groups {
      let mut members = group.into_iter().filter_map(|i| slots[i].take());
      let Some(mut folded) = members.next() else { continue };
      for other in members {
        folded.absorb(other);
      }
      let folded_keys = folded.identity_keys();

      let record = {
        let _guard = self.lock.lock().await;
        self.merge_locked(folded, &folded_keys).await?
      };
      // Two groups can still land on one stored record through keys it
      // already held.
      match positions.get(&record.primary_key) {
        Some(&at) => records[at] = record,
        None => {
          positions.insert(record.primary_key.clone(), records.len());
          records.push(record);
        }
      }
    }
    Ok(records)
  }

  async fn merge_locked(
    &self,
    patch: ContactPatch,
    keys:  &[IdentityKey],
  ) -> Result<ContactRecord, MergeError> {
    let mut matches: Vec<(&IdentityKey, ContactRecord)> = Vec::new();
    for key in keys {
      if let Some(found) = self.store.find(key).await.map_err(MergeError::store)? {
        matches.push((key, found));
      }
    }

    let now = Utc::now();
    let (existing, claimed) = match matches.split_first() {
      None => (None, HashSet::new()),
      Some(((winning_key, winner), rest)) => {
        let others: Vec<&ContactRecord> = rest
          .iter()
          .map(|(_, record)| record)
          .filter(|record| record.primary_key != winner.primary_key)
          .collect();
        if !others.is_empty() {
          tracing::warn!(
            winner = %winner.primary_key,
            winning_key = %winning_key,
            others = ?others.iter().map(|r| r.primary_key.as_str()).collect::<Vec<_>>(),
            "identity conflict: patch matches several records; keeping the higher-priority match"
          );
        }
        let claimed: HashSet<IdentityKey> =
          others.iter().flat_map(|record| record.identity_keys()).collect();
        (Some(winner.clone()), claimed)
      }
    };

    let base = existing
      .clone()
      .unwrap_or_else(|| ContactRecord::empty(&keys[0], now));
    let mut record = apply(base, &patch, &claimed);

    if existing.as_ref().is_some_and(|prev| same_content(prev, &record)) {
      return Ok(record);
    }
    record.last_updated = now;

    let stored = self.store.upsert(record).await.map_err(MergeError::store)?;
    tracing::debug!(
      primary_key = %stored.primary_key,
      status = stored.status.as_str(),
      created = existing.is_none(),
      "merged contact"
    );
    Ok(stored)
  }
}

/// Fill empty fields of `record` from `patch` and advance its status.
///
/// Identity fields whose key already belongs to another record are skipped.
fn apply(
  mut record: ContactRecord,
  patch:      &ContactPatch,
  claimed:    &HashSet<IdentityKey>,
) -> ContactRecord {
  let free = |key: Option<IdentityKey>| key.is_none_or(|k| !claimed.contains(&k));

  if record.subject_id.is_none()
    && let Some(id) = &patch.subject_id
    && free(Some(IdentityKey::SubjectId(id.clone())))
  {
    record.subject_id = Some(id.clone());
  }
  if record.linkedin_url.is_none()
    && let Some(url) = &patch.linkedin_url
    && free(IdentityKey::linkedin(url))
  {
    record.linkedin_url = Some(url.clone());
  }
  if record.email.is_none()
    && let Some(email) = &patch.email
    && free(IdentityKey::email(email))
  {
    record.email = Some(email.clone());
  }

  for (slot, value) in [
    (&mut record.phone, &patch.phone),
    (&mut record.name, &patch.name),
    (&mut record.title, &patch.title),
    (&mut record.company, &patch.company),
  ] {
    if slot.is_none() {
      slot.clone_from(value);
    }
  }

  record.status = record.status.max(patch.implied_status());
  if record.has_contact_info() {
    record.status = ContactStatus::Revealed;
  }
  record
}

fn same_content(a: &ContactRecord, b: &ContactRecord) -> bool {
  ContactRecord { last_updated: b.last_updated, ..a.clone() } == *b
}

/// Connected components of patches linked by a shared identity key, each
/// listed in input order, ordered by first member.
fn group_by_shared_keys(keys: &[Vec<IdentityKey>]) -> Vec<Vec<usize>> {
  let mut parent: Vec<usize> = (0..keys.len()).collect();
  let mut owner: HashMap<&IdentityKey, usize> = HashMap::new();

  fn root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
      parent[i] = parent[parent[i]];
      i = parent[i];
    }
    i
  }

  for (i, patch_keys) in keys.iter().enumerate() {
    for key in patch_keys {
      match owner.get(key) {
        Some(&j) => {
          let (a, b) = (root(&mut parent, i), root(&mut parent, j));
          // The earlier patch stays the representative.
          if a != b {
            parent[a.max(b)] = a.min(b);
          }
        }
        None => {
          owner.insert(key, i);
        }
      }
    }
  }

  let mut groups: Vec<Vec<usize>> = Vec::new();
  let mut index: HashMap<usize, usize> = HashMap::new();
  for i in 0..keys.len() {
    let r = root(&mut parent, i);
    let at = *index.entry(r).or_insert_with(|| {
      groups.push(Vec::new());
      groups.len() - 1
    });
    groups[at].push(i);
  }
  groups
}

#[cfg(test)]
mod tests {
  use reveal_core::{
    result::{RevealFields, RevealStatus},
    store::ContactQuery,
    subject::SubjectId,
  };
  use reveal_store_sqlite::SqliteStore;

  use super::*;

  async fn engine() -> MergeEngine<SqliteStore> {
    MergeEngine::new(Arc::new(SqliteStore::open_in_memory().await.unwrap()))
  }

  async fn all(engine: &MergeEngine<SqliteStore>) -> Vec<ContactRecord> {
    engine.store().query(&ContactQuery::default()).await.unwrap()
  }

  fn sid(s: &str) -> SubjectId { SubjectId::new(s).unwrap() }

  fn revealed(subject: &str, email: &str) -> RevealResult {
    RevealResult {
      subject_id:  sid(subject),
      status:      RevealStatus::Success,
      fields:      RevealFields { email: Some(email.into()), ..Default::default() },
      received_at: Utc::now(),
    }
  }

  fn patch(subject: Option<&str>, linkedin: Option<&str>, email: Option<&str>) -> ContactPatch {
    ContactPatch {
      subject_id:   subject.map(sid),
      linkedin_url: linkedin.map(str::to_owned),
      email:        email.map(str::to_owned),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn merging_twice_is_idempotent() {
    let e = engine().await;
    let result = revealed("s1", "a@x.com");

    let first = e.merge(&result).await.unwrap();
    let second = e.merge(&result).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(all(&e).await, vec![first.clone()]);
    assert_eq!(first.status, ContactStatus::Revealed);
  }

  #[tokio::test]
  async fn transitive_duplicates_collapse_to_one_record() {
    let e = engine().await;
    let records = e
      .merge_many(vec![
        patch(Some("1"), Some("L1"), None),
        patch(Some("2"), Some("L1"), Some("e@x.com")),
        patch(None, Some("L2"), Some("e@x.com")),
      ])
      .await
      .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subject_id, Some(sid("1")));
    assert_eq!(records[0].linkedin_url.as_deref(), Some("L1"));
    assert_eq!(records[0].email.as_deref(), Some("e@x.com"));
    assert_eq!(all(&e).await.len(), 1);
  }

  #[tokio::test]
  async fn unrelated_patches_stay_separate() {
    let e = engine().await;
    let records = e
      .merge_many(vec![
        patch(Some("1"), None, None),
        patch(Some("2"), None, Some("b@x.com")),
        patch(Some("1"), None, Some("a@x.com")),
      ])
      .await
      .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].subject_id, Some(sid("1")));
    assert_eq!(records[0].email.as_deref(), Some("a@x.com"));
    assert_eq!(records[1].subject_id, Some(sid("2")));
  }

  #[tokio::test]
  async fn first_write_wins_per_field() {
    let e = engine().await;
    e.merge(&revealed("s1", "a@x.com")).await.unwrap();
    let record = e.merge(&revealed("s1", "b@x.com")).await.unwrap();
    assert_eq!(record.email.as_deref(), Some("a@x.com"));
  }

  #[tokio::test]
  async fn later_merge_fills_empty_fields() {
    let e = engine().await;
    e.merge_patch(patch(Some("s1"), None, None)).await.unwrap();
    let record = e
      .merge_patch(ContactPatch {
        name: Some("Jane".into()),
        ..patch(None, Some("https://www.linkedin.com/in/jane/"), None)
      })
      .await
      .unwrap();
    // Different key, no overlap: a second record.
    assert_eq!(all(&e).await.len(), 2);
    assert_eq!(record.name.as_deref(), Some("Jane"));

    let record = e
      .merge_patch(ContactPatch {
        title: Some("CTO".into()),
        ..patch(Some("s1"), None, None)
      })
      .await
      .unwrap();
    assert_eq!(record.title.as_deref(), Some("CTO"));
    assert_eq!(all(&e).await.len(), 2);
  }

  #[tokio::test]
  async fn status_only_advances() {
    let e = engine().await;
    let not_found = RevealResult {
      subject_id:  sid("s1"),
      status:      RevealStatus::NotFound,
      fields:      RevealFields::default(),
      received_at: Utc::now(),
    };

    let record = e.merge_patch(patch(Some("s1"), None, None)).await.unwrap();
    assert_eq!(record.status, ContactStatus::New);

    let record = e.merge(&not_found).await.unwrap();
    assert_eq!(record.status, ContactStatus::NoContactInfo);

    let record = e.merge(&revealed("s1", "a@x.com")).await.unwrap();
    assert_eq!(record.status, ContactStatus::Revealed);

    let record = e.merge(&not_found).await.unwrap();
    assert_eq!(record.status, ContactStatus::Revealed);
  }

  #[tokio::test]
  async fn ambiguous_match_prefers_higher_priority_key() {
    let e = engine().await;
    let by_subject = e.merge_patch(patch(Some("s1"), None, None)).await.unwrap();
    let by_email = e.merge_patch(patch(Some("s2"), None, Some("e@x.com"))).await.unwrap();

    let merged = e
      .merge_patch(ContactPatch {
        phone: Some("555".into()),
        ..patch(Some("s1"), None, Some("E@x.com"))
      })
      .await
      .unwrap();

    assert_eq!(merged.primary_key, by_subject.primary_key);
    assert_eq!(merged.phone.as_deref(), Some("555"));
    // The email belongs to the other record; it is not copied over.
    assert_eq!(merged.email, None);

    let stored = all(&e).await;
    assert_eq!(stored.len(), 2);
    assert!(stored.contains(&by_email));
  }

  #[tokio::test]
  async fn patch_without_identity_is_rejected() {
    let e = engine().await;
    let err = e
      .merge_patch(ContactPatch { name: Some("Nobody".into()), ..Default::default() })
      .await
      .unwrap_err();
    assert!(matches!(err, MergeError::NoIdentity));

    let err = e
      .merge_many(vec![patch(Some("1"), None, None), ContactPatch::default()])
      .await
      .unwrap_err();
    assert!(matches!(err, MergeError::NoIdentity));
    assert!(all(&e).await.is_empty());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_merges_for_one_identity_create_one_record() {
    let e = Arc::new(engine().await);
    let tasks: Vec<_> = (0..16)
      .map(|i| {
        let e = e.clone();
        tokio::spawn(async move {
          e.merge(&revealed("s1", &format!("user{i}@x.com"))).await.unwrap()
        })
      })
      .collect();
    for task in tasks {
      task.await.unwrap();
    }
    assert_eq!(all(&e).await.len(), 1);
  }

  #[test]
  fn grouping_is_transitive_and_ordered() {
    let k = |s: &str| IdentityKey::SubjectId(sid(s));
    let e = |s: &str| IdentityKey::Email(s.into());
    let groups = group_by_shared_keys(&[
      vec![k("a")],
      vec![k("b")],
      vec![k("c"), e("x")],
      vec![k("b"), e("x")],
    ]);
    assert_eq!(groups, vec![vec![0], vec![1, 2, 3]]);
  }
}
