// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::Utc;
use sha2::{Digest, Sha256};

use huddle_protocol::{ContentRef, ContentType, ContextItem, ParticipantId};

/// Keyed store of a session's shared context items.
///
/// Items with inline content and no caller-supplied ref get a computed
/// one: SHA-256 over the raw bytes for text, over the serialized JSON for
/// structured content, with the byte size recorded alongside.
#[derive(Debug, Default)]
pub struct ContextStore {
    items: HashMap<String, ContextItem>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) an item, computing its content ref if needed.
    pub fn add(&mut self, mut item: ContextItem) {
        if item.content_ref.is_none() {
            if let Some(content) = &item.content {
                item.content_ref = Some(compute_ref(content, item.content_type));
            }
        }
        self.items.insert(item.key.clone(), item);
    }

    /// Patch an existing item: replace whichever fields are supplied,
    /// recompute the hash, bump `updated_at`.  Returns `false` for an
    /// unknown key.
    pub fn update(
        &mut self,
        key: &str,
        content: Option<serde_json::Value>,
        content_type: Option<ContentType>,
        visible_to: Option<Vec<ParticipantId>>,
    ) -> bool {
        let Some(item) = self.items.get_mut(key) else {
            return false;
        };
        if let Some(ct) = content_type {
            item.content_type = ct;
        }
        if let Some(c) = content {
            item.content_ref = Some(compute_ref(&c, item.content_type));
            item.content = Some(c);
        }
        if let Some(v) = visible_to {
            item.visible_to = v;
        }
        item.updated_at = Utc::now();
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextItem> {
        self.items.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&ContextItem> {
        self.items.get(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items `participant` may see, key-sorted for deterministic replay.
    pub fn visible_to(&self, participant: &ParticipantId) -> Vec<&ContextItem> {
        let mut items: Vec<&ContextItem> = self
            .items
            .values()
            .filter(|i| i.is_visible_to(participant))
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }
}

/// Hash inline content into a [`ContentRef`].
///
/// Text content hashes its raw bytes; anything else hashes the serialized
/// JSON.  The MIME is derived from the declared content type.
pub fn compute_ref(content: &serde_json::Value, content_type: ContentType) -> ContentRef {
    let bytes: Vec<u8> = match content {
        serde_json::Value::String(s) => s.as_bytes().to_vec(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    };
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hash = hex::encode(hasher.finalize());

    let mime = match content_type {
        ContentType::Text | ContentType::AudioTranscript => Some("text/plain".to_string()),
        ContentType::Structured => Some("application/json".to_string()),
        ContentType::File | ContentType::Reference => None,
        ContentType::Image => Some("image/*".to_string()),
    };

    ContentRef {
        hash,
        size_bytes: bytes.len() as u64,
        mime,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(key: &str, content: serde_json::Value, visible_to: Vec<&str>) -> ContextItem {
        ContextItem {
            key: key.to_string(),
            content_type: ContentType::Text,
            content: Some(content),
            content_ref: None,
            visible_to: visible_to.into_iter().map(ParticipantId::from).collect(),
            added_by: ParticipantId::from("p1"),
            added_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn add_computes_hash_and_size() {
        let mut store = ContextStore::new();
        store.add(item("notes", json!("hello"), vec![]));
        let stored = store.get("notes").unwrap();
        let r = stored.content_ref.as_ref().unwrap();
        assert_eq!(r.size_bytes, 5);
        assert_eq!(r.hash.len(), 64, "hex sha-256");
        assert_eq!(r.mime.as_deref(), Some("text/plain"));
    }

    #[test]
    fn supplied_ref_is_not_overwritten() {
        let mut store = ContextStore::new();
        let mut i = item("blob", json!("x"), vec![]);
        i.content_ref = Some(ContentRef {
            hash: "cafe".into(),
            size_bytes: 99,
            mime: None,
        });
        store.add(i);
        assert_eq!(store.get("blob").unwrap().content_ref.as_ref().unwrap().hash, "cafe");
    }

    #[test]
    fn same_content_same_hash() {
        let a = compute_ref(&json!("identical"), ContentType::Text);
        let b = compute_ref(&json!("identical"), ContentType::Text);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn structured_content_hashes_json_bytes() {
        let r = compute_ref(&json!({"a": 1}), ContentType::Structured);
        assert_eq!(r.mime.as_deref(), Some("application/json"));
        assert_eq!(r.size_bytes, serde_json::to_vec(&json!({"a": 1})).unwrap().len() as u64);
    }

    #[test]
    fn update_recomputes_hash_and_bumps_updated_at() {
        let mut store = ContextStore::new();
        store.add(item("notes", json!("one"), vec![]));
        let before = store.get("notes").unwrap().clone();

        assert!(store.update("notes", Some(json!("two")), None, None));
        let after = store.get("notes").unwrap();
        assert_ne!(
            after.content_ref.as_ref().unwrap().hash,
            before.content_ref.as_ref().unwrap().hash
        );
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn update_unknown_key_is_false() {
        let mut store = ContextStore::new();
        assert!(!store.update("ghost", Some(json!("x")), None, None));
    }

    #[test]
    fn remove_returns_the_item() {
        let mut store = ContextStore::new();
        store.add(item("notes", json!("x"), vec![]));
        assert!(store.remove("notes").is_some());
        assert!(store.get("notes").is_none());
    }

    #[test]
    fn visibility_filter_honours_whitelist() {
        let mut store = ContextStore::new();
        store.add(item("public", json!("a"), vec![]));
        store.add(item("private", json!("b"), vec!["p1"]));

        let p1_view = store.visible_to(&ParticipantId::from("p1"));
        assert_eq!(p1_view.len(), 2);

        let p2_view = store.visible_to(&ParticipantId::from("p2"));
        assert_eq!(p2_view.len(), 1);
        assert_eq!(p2_view[0].key, "public");
    }

    #[test]
    fn visible_to_is_key_sorted() {
        let mut store = ContextStore::new();
        store.add(item("zebra", json!("z"), vec![]));
        store.add(item("alpha", json!("a"), vec![]));
        let keys: Vec<&str> = store
            .visible_to(&ParticipantId::from("p1"))
            .iter()
            .map(|i| i.key.as_str())
            .collect();
        assert_eq!(keys, vec!["alpha", "zebra"]);
    }
}
