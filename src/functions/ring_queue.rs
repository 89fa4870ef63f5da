//! Fixed-capacity circular buffer used for "value N steps ago"
//! queries.

use serde::Deserialize;
use serde::Serialize;

use crate::value::Value;

/// Rotating storage of the last `size` values.
///
/// Not synchronized. A queue lives inside one state key and is only
/// mutated through [`crate::context::OperatorContext::update_state`],
/// which holds that key exclusively for the duration of the update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingQueue {
    /// Grows up to `size` as slots are first written.
    data: Vec<Value>,
    /// Next slot to fetch. If `len` is 0 the queue is empty.
    head: usize,
    /// Next slot to append to. If `len == size` the queue is full.
    tail: usize,
    len: usize,
    size: usize,
}

impl RingQueue {
    pub fn new(size: usize) -> Self {
        Self {
            data: Vec::new(),
            head: 0,
            tail: 0,
            len: 0,
            size,
        }
    }

    /// Append `item` until the queue is full.
    pub fn fill(&mut self, item: Value) {
        while self.append(item.clone()) {}
    }

    /// Append if there is room. Returns `false` and drops `item` if
    /// the queue is full.
    pub fn append(&mut self, item: Value) -> bool {
        if self.is_full() {
            return false;
        }
        if self.tail == self.data.len() {
            self.data.push(item);
        } else {
            self.data[self.tail] = item;
        }
        self.tail = (self.tail + 1) % self.size;
        self.len += 1;
        true
    }

    /// Remove and return the oldest item.
    pub fn fetch(&mut self) -> Option<Value> {
        if self.is_empty() {
            return None;
        }
        let item = std::mem::take(&mut self.data[self.head]);
        self.head = (self.head + 1) % self.size;
        self.len -= 1;
        Some(item)
    }

    /// Return the oldest item without removing it.
    pub fn peek(&self) -> Option<&Value> {
        if self.is_empty() {
            None
        } else {
            Some(&self.data[self.head])
        }
    }

    pub fn is_full(&self) -> bool {
        self.len == self.size
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.size
    }
}

#[test]
fn fill_then_fetch_returns_default() {
    let mut rq = RingQueue::new(3);
    rq.fill(Value::from("dft"));
    assert!(rq.is_full());

    for _ in 0..3 {
        assert_eq!(rq.fetch(), Some(Value::from("dft")));
    }
    assert_eq!(rq.fetch(), None);
    assert!(rq.is_empty());
}

#[test]
fn append_then_fetch_keeps_len() {
    let mut rq = RingQueue::new(2);
    rq.fill(Value::Null);

    assert!(!rq.append(Value::from(1)));

    assert_eq!(rq.fetch(), Some(Value::Null));
    assert!(rq.append(Value::from(1)));
    assert_eq!(rq.len(), 2);

    assert_eq!(rq.fetch(), Some(Value::Null));
    assert!(rq.append(Value::from(2)));
    assert_eq!(rq.fetch(), Some(Value::from(1)));
    assert!(rq.append(Value::from(3)));
    assert_eq!(rq.len(), 2);
    assert_eq!(rq.peek(), Some(&Value::from(2)));
}

#[test]
fn indices_wrap() {
    let mut rq = RingQueue::new(3);
    for i in 0..10 {
        rq.append(Value::from(i));
        if rq.is_full() {
            rq.fetch();
        }
    }
    assert_eq!(rq.len(), 2);
    assert_eq!(rq.fetch(), Some(Value::from(8)));
    assert_eq!(rq.fetch(), Some(Value::from(9)));
    assert_eq!(rq.fetch(), None);
}

#[test]
fn zero_size_is_always_empty_and_full() {
    let mut rq = RingQueue::new(0);
    rq.fill(Value::from(1));
    assert!(!rq.append(Value::from(1)));
    assert_eq!(rq.fetch(), None);
    assert_eq!(rq.peek(), None);
}

#[test]
fn storage_grows_as_filled() {
    let mut rq = RingQueue::new(1 << 40);
    assert_eq!(rq.capacity(), 1 << 40);
    assert!(rq.append(Value::from(1)));
    assert!(rq.append(Value::from(2)));
    assert_eq!(rq.data.len(), 2);
    assert_eq!(rq.fetch(), Some(Value::from(1)));
    assert!(rq.append(Value::from(3)));
    assert_eq!(rq.data.len(), 3);
    assert_eq!(rq.len(), 2);
}
