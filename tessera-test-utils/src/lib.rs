//! Tessera Test Utilities
//!
//! Shared test infrastructure for the Tessera workspace:
//! - An in-memory remote store with call counters and fault injection
//! - Fixture documents (`Card`, `Library`) and common query descriptors
//! - Proptest generators
//! - Custom assertions for Tessera error variants

mod remote;

pub use remote::{InMemoryRemoteStore, StoredDocument};

// Re-export core types for convenience
pub use tessera_core::{
    ChangeEvent, CoherenceConfig, CoherenceError, Document, DocumentId, Filter, MutationOp,
    Payload, QueryDescriptor, RemoteError, RemoteStore, RemoteTimestamp, ScopeKey, ScopeProbe,
    TesseraError, TesseraResult,
};

use serde::{Deserialize, Serialize};

/// Collection holding [`Card`] documents.
pub const CARDS: &str = "cards";

/// Collection holding [`Library`] documents.
pub const LIBRARIES: &str = "libraries";

// ============================================================================
// FIXTURE DOCUMENTS
// ============================================================================

/// A study card belonging to a library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub library_id: String,
    pub front: String,
    pub back: String,
    #[serde(default)]
    pub created_at: Option<RemoteTimestamp>,
    #[serde(default)]
    pub updated_at: Option<RemoteTimestamp>,
}

impl Card {
    pub fn new(id: &str, library_id: &str, front: &str, back: &str) -> Self {
        Self {
            id: id.to_string(),
            library_id: library_id.to_string(),
            front: front.to_string(),
            back: back.to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Set both server timestamps, in milliseconds.
    pub fn at(mut self, created_at: i64, updated_at: Option<i64>) -> Self {
        self.created_at = Some(RemoteTimestamp::from_millis(created_at));
        self.updated_at = updated_at.map(RemoteTimestamp::from_millis);
        self
    }
}

impl Document for Card {
    fn document_id(&self) -> DocumentId {
        DocumentId::new(self.id.clone())
    }

    fn created_at(&self) -> Option<RemoteTimestamp> {
        self.created_at
    }

    fn updated_at(&self) -> Option<RemoteTimestamp> {
        self.updated_at
    }
}

impl StoredDocument for Card {
    fn stamp_created(&mut self, at: RemoteTimestamp) {
        self.created_at = Some(at);
        self.updated_at = None;
    }

    fn stamp_updated(&mut self, at: RemoteTimestamp) {
        self.updated_at = Some(at);
    }
}

/// A library of cards, owned by one user and optionally shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub shared_with: Vec<String>,
    #[serde(default)]
    pub created_at: Option<RemoteTimestamp>,
    #[serde(default)]
    pub updated_at: Option<RemoteTimestamp>,
}

impl Library {
    pub fn new(id: &str, owner_id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            shared_with: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn shared_with(mut self, users: &[&str]) -> Self {
        self.shared_with = users.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn at(mut self, created_at: i64, updated_at: Option<i64>) -> Self {
        self.created_at = Some(RemoteTimestamp::from_millis(created_at));
        self.updated_at = updated_at.map(RemoteTimestamp::from_millis);
        self
    }
}

impl Document for Library {
    fn document_id(&self) -> DocumentId {
        DocumentId::new(self.id.clone())
    }

    fn created_at(&self) -> Option<RemoteTimestamp> {
        self.created_at
    }

    fn updated_at(&self) -> Option<RemoteTimestamp> {
        self.updated_at
    }
}

impl StoredDocument for Library {
    fn stamp_created(&mut self, at: RemoteTimestamp) {
        self.created_at = Some(at);
        self.updated_at = None;
    }

    fn stamp_updated(&mut self, at: RemoteTimestamp) {
        self.updated_at = Some(at);
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Tessera fixture types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a short document id.
    pub fn arb_document_id() -> impl Strategy<Value = String> {
        "[a-z]{1,6}-[0-9]{1,3}"
    }

    /// Generate card text.
    pub fn arb_card_text() -> impl Strategy<Value = String> {
        "[A-Za-z ]{1,24}"
    }

    /// Generate a card in `library_id` without server timestamps.
    pub fn arb_card(library_id: &'static str) -> impl Strategy<Value = Card> {
        (arb_document_id(), arb_card_text(), arb_card_text())
            .prop_map(move |(id, front, back)| Card::new(&id, library_id, &front, &back))
    }

    /// Generate cards with distinct ids.
    pub fn arb_cards(library_id: &'static str, max: usize) -> impl Strategy<Value = Vec<Card>> {
        prop::collection::btree_map(arb_document_id(), (arb_card_text(), arb_card_text()), 1..=max)
            .prop_map(move |cards| {
                cards
                    .into_iter()
                    .map(|(id, (front, back))| Card::new(&id, library_id, &front, &back))
                    .collect()
            })
    }

    /// Generate a simple filter over card fields.
    pub fn arb_card_filter() -> impl Strategy<Value = Filter> {
        prop_oneof![
            "[a-z]{1,4}".prop_map(|v| Filter::eq("libraryId", v)),
            "[a-z]{1,4}".prop_map(|v| Filter::eq("front", v)),
            prop::collection::vec("[a-z]{1,4}", 1..4).prop_map(|vs| Filter::is_in("back", vs)),
        ]
    }

    /// Generate a burst of realtime event counts, one entry per burst.
    pub fn arb_event_bursts() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(1usize..12, 1..4)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;

    /// Library `lib/42` last updated at `updated_at`.
    pub fn library_42(updated_at: i64) -> Library {
        Library::new("42", "u1", "Spanish verbs").at(10, Some(updated_at))
    }

    /// Point query for a library.
    pub fn library_query(id: &str) -> QueryDescriptor {
        QueryDescriptor::point(LIBRARIES, id)
    }

    /// Every card in a library.
    pub fn cards_in(library_id: &str) -> QueryDescriptor {
        QueryDescriptor::collection(CARDS).filter(Filter::eq("libraryId", library_id))
    }

    /// Libraries a user owns or has been given access to.
    pub fn libraries_visible_to(user_id: &str) -> QueryDescriptor {
        QueryDescriptor::collection(LIBRARIES).filter(Filter::any_of([
            Filter::eq("ownerId", user_id),
            Filter::array_contains("sharedWith", user_id),
        ]))
    }

    /// A store seeded with `count` cards in `library_id`, created at 1..=count.
    pub fn seeded_cards(library_id: &str, count: usize) -> InMemoryRemoteStore<Card> {
        let store = InMemoryRemoteStore::new();
        for n in 1..=count {
            let card = Card::new(&format!("c{n}"), library_id, &format!("front {n}"), "back")
                .at(n as i64, None);
            store.put(CARDS, card);
        }
        store
    }

    /// A config with short windows for timer-driven tests.
    pub fn fast_config() -> CoherenceConfig {
        let mut config = CoherenceConfig::default();
        config.debounce_window_ms = 400;
        config.throttle.read_spacing_ms = 0;
        config.throttle.write_spacing_ms = 0;
        config.reconnect.initial_ms = 100;
        config.reconnect.max_ms = 1_000;
        config.reconnect.jitter_ms = 0;
        config.reconnect.max_attempts = 3;
        config
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for Tessera error variants.

    use super::*;

    /// Assert that a result is a transient network error.
    #[track_caller]
    pub fn assert_transient<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Remote(RemoteError::TransientNetwork { .. })) => {}
            other => panic!("Expected transient network error, got: {:?}", other),
        }
    }

    /// Assert that a result is a failed batch commit of `operations` ops.
    #[track_caller]
    pub fn assert_batch_commit_failed<T: std::fmt::Debug>(
        result: &TesseraResult<T>,
        operations: usize,
    ) {
        match result {
            Err(TesseraError::Remote(RemoteError::BatchCommitFailed { operations: n, .. })) => {
                assert_eq!(*n, operations, "Wrong operation count in BatchCommitFailed");
            }
            other => panic!("Expected BatchCommitFailed, got: {:?}", other),
        }
    }

    /// Assert that a result is a coherence error.
    #[track_caller]
    pub fn assert_coherence_error<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Coherence(_)) => {}
            other => panic!("Expected Coherence error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
