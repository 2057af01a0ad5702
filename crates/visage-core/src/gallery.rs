//! In-memory gallery of enrolled face embeddings and user metadata.
//!
//! The gallery exclusively owns its arrays and user map; every mutation
//! goes through one of the methods below and no caller retains a reference
//! to the underlying arrays across calls. `labels[i]` and `embeddings[i]`
//! always describe the same user — `upsert` removes any prior entry for the
//! id before appending, so each id appears at most once.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{Embedding, UserInfo};

struct GalleryData {
    labels: Vec<i64>,
    embeddings: Vec<Embedding>,
    users: HashMap<i64, UserInfo>,
}

impl GalleryData {
    fn empty() -> Self {
        Self {
            labels: Vec::new(),
            embeddings: Vec::new(),
            users: HashMap::new(),
        }
    }
}

pub struct Gallery {
    inner: RwLock<GalleryData>,
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new()
    }
}

impl Gallery {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GalleryData::empty()),
        }
    }

    /// Rebuild the gallery from scratch. The new state is built entirely
    /// before the swap, so readers never observe a half-populated gallery.
    pub fn load_all(&self, entries: Vec<(i64, Embedding)>, users: HashMap<i64, UserInfo>) {
        let mut labels = Vec::with_capacity(entries.len());
        let mut embeddings = Vec::with_capacity(entries.len());
        for (id, embedding) in entries {
            labels.push(id);
            embeddings.push(embedding);
        }
        let next = GalleryData {
            labels,
            embeddings,
            users,
        };

        let mut guard = self.inner.write().expect("gallery lock poisoned");
        *guard = next;
    }

    /// Add or replace the embedding and metadata for `enroll_id`.
    pub fn upsert(&self, enroll_id: i64, embedding: Embedding, name: impl Into<String>, is_active: bool) {
        let mut guard = self.inner.write().expect("gallery lock poisoned");
        if let Some(pos) = guard.labels.iter().position(|&id| id == enroll_id) {
            guard.labels.remove(pos);
            guard.embeddings.remove(pos);
        }
        guard.labels.push(enroll_id);
        guard.embeddings.push(embedding);
        guard.users.insert(
            enroll_id,
            UserInfo {
                enroll_id,
                name: name.into(),
                has_face: true,
                is_active,
            },
        );
    }

    /// Remove `enroll_id` from both the embedding list and the user map.
    pub fn remove(&self, enroll_id: i64) -> bool {
        let mut guard = self.inner.write().expect("gallery lock poisoned");
        let had_embedding = if let Some(pos) = guard.labels.iter().position(|&id| id == enroll_id) {
            guard.labels.remove(pos);
            guard.embeddings.remove(pos);
            true
        } else {
            false
        };
        let had_user = guard.users.remove(&enroll_id).is_some();
        had_embedding || had_user
    }

    /// Mutate only the active flag of an existing user record, leaving the
    /// embedding untouched (used by the reconciler's active-flag pass).
    pub fn set_active(&self, enroll_id: i64, is_active: bool) -> bool {
        let mut guard = self.inner.write().expect("gallery lock poisoned");
        if let Some(user) = guard.users.get_mut(&enroll_id) {
            user.is_active = is_active;
            true
        } else {
            false
        }
    }

    /// Concurrent read of the full user map.
    pub fn users(&self) -> HashMap<i64, UserInfo> {
        self.inner.read().expect("gallery lock poisoned").users.clone()
    }

    pub fn user(&self, enroll_id: i64) -> Option<UserInfo> {
        self.inner.read().expect("gallery lock poisoned").users.get(&enroll_id).cloned()
    }

    /// Ids currently carrying an embedding, for the reconciler's eviction pass.
    pub fn embedded_ids(&self) -> Vec<i64> {
        self.inner.read().expect("gallery lock poisoned").labels.clone()
    }

    /// Run `f` against the parallel `(labels, embeddings)` arrays under a
    /// single shared-lock acquisition, so a match observes either the
    /// pre- or post-mutation state of any given id, never a torn mix.
    pub fn with_entries<R>(&self, f: impl FnOnce(&[i64], &[Embedding]) -> R) -> R {
        let guard = self.inner.read().expect("gallery lock poisoned");
        f(&guard.labels, &guard.embeddings)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("gallery lock poisoned").labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: Vec<f32>) -> Embedding {
        Embedding::new(v, "test")
    }

    #[test]
    fn upsert_then_remove_leaves_gallery_empty() {
        let gallery = Gallery::new();
        gallery.upsert(1, emb(vec![1.0, 0.0]), "alice", true);
        assert_eq!(gallery.len(), 1);
        assert!(gallery.remove(1));
        assert_eq!(gallery.len(), 0);
        assert!(gallery.user(1).is_none());
    }

    #[test]
    fn upsert_replaces_existing_entry_without_duplicating() {
        let gallery = Gallery::new();
        gallery.upsert(1, emb(vec![1.0, 0.0]), "alice", true);
        gallery.upsert(1, emb(vec![0.0, 1.0]), "alice", true);
        assert_eq!(gallery.len(), 1);
        gallery.with_entries(|labels, embeddings| {
            assert_eq!(labels, &[1]);
            assert_eq!(embeddings[0].values, vec![0.0, 1.0]);
        });
    }

    #[test]
    fn load_all_is_an_atomic_swap() {
        let gallery = Gallery::new();
        gallery.upsert(99, emb(vec![1.0]), "stale", true);

        let mut users = HashMap::new();
        users.insert(
            1,
            UserInfo {
                enroll_id: 1,
                name: "alice".into(),
                has_face: true,
                is_active: true,
            },
        );
        gallery.load_all(vec![(1, emb(vec![1.0, 0.0]))], users);

        assert_eq!(gallery.len(), 1);
        assert!(gallery.user(99).is_none());
        assert!(gallery.user(1).is_some());
    }

    #[test]
    fn set_active_mutates_in_place_without_touching_embedding() {
        let gallery = Gallery::new();
        gallery.upsert(1, emb(vec![1.0, 0.0]), "alice", true);
        assert!(gallery.set_active(1, false));
        assert_eq!(gallery.user(1).unwrap().is_active, false);
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn labels_and_embeddings_stay_parallel_after_many_mutations() {
        let gallery = Gallery::new();
        for i in 0..10 {
            gallery.upsert(i, emb(vec![i as f32]), format!("user{i}"), true);
        }
        gallery.remove(3);
        gallery.remove(7);
        gallery.upsert(3, emb(vec![30.0]), "user3", true);

        gallery.with_entries(|labels, embeddings| {
            assert_eq!(labels.len(), embeddings.len());
            for (label, embedding) in labels.iter().zip(embeddings.iter()) {
                if *label == 3 {
                    assert_eq!(embedding.values, vec![30.0]);
                }
            }
        });
    }
}
