use std::collections::HashMap;

use super::pattern::Pattern;

struct Subscription<T> {
    pattern: Pattern,
    handlers: Vec<T>,
}

/// Registry of handlers keyed by topic pattern
///
/// Handlers registered under the same pattern keep their registration order.
/// There is no ordering between different patterns, and there is no
/// unsubscribe: the registry only grows.
pub struct EventRegistry<T> {
    subscriptions: Vec<Subscription<T>>,
    index: HashMap<String, usize>,
}

impl<T> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventRegistry<T> {
    pub fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Append `handler` to the handlers of `pattern`
    pub fn subscribe(&mut self, pattern: &str, handler: T) {
        match self.index.get(pattern) {
            Some(&position) => self.subscriptions[position].handlers.push(handler),
            None => {
                self.index.insert(pattern.to_string(), self.subscriptions.len());
                self.subscriptions.push(Subscription {
                    pattern: Pattern::new(pattern),
                    handlers: vec![handler],
                });
            }
        }
    }

    /// Every handler whose pattern matches `event`
    pub fn matching<'a>(&'a self, event: &'a str) -> impl Iterator<Item = &'a T> + 'a {
        self.subscriptions
            .iter()
            .filter(move |subscription| subscription.pattern.matches(event))
            .flat_map(|subscription| subscription.handlers.iter())
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|s| s.pattern.as_str())
    }

    /// Number of distinct patterns
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
