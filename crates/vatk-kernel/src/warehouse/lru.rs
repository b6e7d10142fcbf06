use std::collections::VecDeque;

/// Bounded most-recently-used list of vat ids.
#[derive(Debug, Clone)]
pub struct Lru {
    capacity: usize,
    // most recent first
    items: VecDeque<String>,
}

impl Lru {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
        }
    }

    /// Mark `id` most recent. Returns the id pushed out by the capacity limit,
    /// if any. Adding the current most recent id changes nothing.
    pub fn add(&mut self, id: &str) -> Option<String> {
        if self.items.front().map(String::as_str) == Some(id) {
            return None;
        }
        if let Some(at) = self.items.iter().position(|item| item == id) {
            self.items.remove(at);
        }
        self.items.push_front(id.to_string());
        if self.items.len() > self.capacity {
            self.items.pop_back()
        } else {
            None
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.items.iter().position(|item| item == id) {
            Some(at) => {
                self.items.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ids from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }
}
