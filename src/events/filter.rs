//! Subscription filters.

use std::collections::HashSet;
use std::sync::Arc;

use crate::events::event::{EventKind, StreamEvent};

type Predicate = Arc<dyn Fn(&StreamEvent) -> bool + Send + Sync>;

/// Criteria an event must satisfy to reach a subscription. All set
/// criteria are ANDed; an empty filter matches everything.
#[derive(Clone, Default)]
pub struct EventFilter {
    kinds: Option<HashSet<EventKind>>,
    sources: Option<HashSet<String>>,
    symbols: Option<HashSet<String>>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    /// Filter that matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn for_sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn for_symbols<S: Into<String>>(mut self, symbols: impl IntoIterator<Item = S>) -> Self {
        self.symbols = Some(symbols.into_iter().map(Into::into).collect());
        self
    }

    /// Arbitrary final check, applied after the set criteria.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&StreamEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &StreamEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            match &event.source {
                Some(source) if sources.contains(source) => {}
                _ => return false,
            }
        }
        if let Some(symbols) = &self.symbols {
            match event.symbol() {
                Some(symbol) if symbols.contains(symbol) => {}
                _ => return false,
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(event) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("kinds", &self.kinds)
            .field("sources", &self.sources)
            .field("symbols", &self.symbols)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
