//! Metadata search over the encrypted corpus.
//!
//! There is no persistent index: a query lists every key, decrypts each
//! record and applies the predicate — O(n) per query, which is fine at
//! secret-store cardinalities (hundreds to low thousands).  Records that no
//! longer decrypt or parse are skipped, logged per key, and counted; they
//! never abort the scan.

use sealbox_provider::error::Result;
use sealbox_provider::provider::{SearchQuery, SortField, SortOrder};
use sealbox_provider::secret::Secret;

use crate::store::RecordStore;

/// Run `query` against every secret in the store.
pub(crate) fn scan(store: &RecordStore, query: &SearchQuery) -> Result<Vec<Secret>> {
    let mut matches = Vec::new();
    let mut skipped = 0usize;

    for key in store.list("")? {
        match store.get(&key) {
            Ok(secret) => {
                if query.matches(&secret) {
                    matches.push(secret);
                }
            }
            Err(e) if e.is_corruption() => {
                tracing::warn!(key = %key, error = %e, "skipping unreadable secret in search");
                skipped += 1;
            }
            // Custody and I/O failures affect the whole scan, not one
            // record; surface them.
            Err(e) => return Err(e),
        }
    }

    if let Some(field) = query.sort {
        matches.sort_by_key(|s| match field {
            SortField::Created => s.created_at,
            SortField::Updated => s.updated_at,
        });
        if query.order == SortOrder::Descending {
            matches.reverse();
        }
    }

    if let Some(limit) = query.limit {
        matches.truncate(limit);
    }

    tracing::debug!(
        matched = matches.len(),
        skipped = skipped,
        "search scan complete"
    );
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::crypto::Cipher;
    use crate::keychain::{FileKeychain, Keychain, MASTER_KEY_NAME};

    fn test_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("keys"));
        keychain.generate(MASTER_KEY_NAME).unwrap();
        let store = RecordStore::new(dir.path().join("secrets"), Cipher::new(Arc::new(keychain)));
        (dir, store)
    }

    fn seed(store: &RecordStore, key: &str, tags: &[&str], metadata: &[(&str, &str)]) {
        store
            .set(
                key,
                "v",
                metadata
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                tags.iter().map(|t| t.to_string()).collect(),
                None,
            )
            .unwrap();
    }

    #[test]
    fn tag_containment_semantics() {
        let (_dir, store) = test_store();
        seed(&store, "a", &["x"], &[]);
        seed(&store, "b", &["x", "y"], &[]);
        seed(&store, "c", &["y"], &[]);

        let by_x = scan(
            &store,
            &SearchQuery {
                tags: vec!["x".into()],
                ..Default::default()
            },
        )
        .unwrap();
        let keys: Vec<_> = by_x.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let by_xy = scan(
            &store,
            &SearchQuery {
                tags: vec!["x".into(), "y".into()],
                ..Default::default()
            },
        )
        .unwrap();
        let keys: Vec<_> = by_xy.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["b"]);
    }

    #[test]
    fn metadata_equality_and_limit() {
        let (_dir, store) = test_store();
        seed(&store, "p1", &[], &[("env", "prod")]);
        seed(&store, "p2", &[], &[("env", "prod")]);
        seed(&store, "d1", &[], &[("env", "dev")]);

        let query = SearchQuery {
            metadata: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            ..Default::default()
        };
        assert_eq!(scan(&store, &query).unwrap().len(), 2);

        let capped = SearchQuery {
            limit: Some(1),
            ..query
        };
        assert_eq!(scan(&store, &capped).unwrap().len(), 1);
    }

    #[test]
    fn sort_by_updated_descending() {
        let (_dir, store) = test_store();
        seed(&store, "first", &[], &[]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        seed(&store, "second", &[], &[]);

        let query = SearchQuery {
            sort: Some(SortField::Updated),
            order: SortOrder::Descending,
            ..Default::default()
        };
        let results = scan(&store, &query).unwrap();
        assert_eq!(results[0].key, "second");
        assert_eq!(results[1].key, "first");
    }

    #[test]
    fn unreadable_records_are_skipped_not_fatal() {
        let (dir, store) = test_store();
        seed(&store, "good", &[], &[]);
        seed(&store, "bad", &[], &[]);
        std::fs::write(dir.path().join("secrets/bad"), b"garbage").unwrap();

        let results = scan(&store, &SearchQuery::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "good");
    }
}
