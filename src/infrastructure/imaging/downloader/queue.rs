//! Ready queue ordering for pending downloads.

use std::collections::VecDeque;

use reqwest::Url;

use crate::domain::entities::{DownloaderOptions, ExecutionOrder};

/// Scheduling lane of a Ready download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Deferred behind every other lane.
    Low,
    /// Default lane.
    Normal,
    /// Promoted ahead of every other lane.
    High,
}

impl Priority {
    /// Lane selected by the option flags. `HIGH_PRIORITY` wins if both are set.
    #[must_use]
    pub fn from_options(options: DownloaderOptions) -> Self {
        if options.contains(DownloaderOptions::HIGH_PRIORITY) {
            Self::High
        } else if options.contains(DownloaderOptions::LOW_PRIORITY) {
            Self::Low
        } else {
            Self::Normal
        }
    }

    const fn lane(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Priority-aware deque of Ready downloads.
///
/// Ordering: a task in a higher lane is always promoted before any task in a lower lane.
/// Within one lane, FIFO promotes the longest-waiting task and LIFO the most recently
/// enqueued one. Enqueue order is the only tiebreak.
#[derive(Debug)]
pub struct ReadyQueue {
    lanes: [VecDeque<Url>; 3],
    order: ExecutionOrder,
}

impl ReadyQueue {
    #[must_use]
    pub fn new(order: ExecutionOrder) -> Self {
        Self {
            lanes: Default::default(),
            order,
        }
    }

    pub fn set_order(&mut self, order: ExecutionOrder) {
        self.order = order;
    }

    #[must_use]
    pub fn order(&self) -> ExecutionOrder {
        self.order
    }

    pub fn push(&mut self, url: Url, priority: Priority) {
        self.lanes[priority.lane()].push_back(url);
    }

    /// Removes and returns the next task to promote.
    pub fn pop(&mut self) -> Option<Url> {
        let order = self.order;
        self.lanes
            .iter_mut()
            .find(|lane| !lane.is_empty())
            .and_then(|lane| match order {
                ExecutionOrder::Fifo => lane.pop_front(),
                ExecutionOrder::Lifo => lane.pop_back(),
            })
    }

    /// Removes `url` from whichever lane holds it.
    pub fn remove(&mut self, url: &Url) -> bool {
        for lane in &mut self.lanes {
            if let Some(pos) = lane.iter().position(|queued| queued == url) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn url(name: &str) -> Url {
        Url::parse(&format!("https://example.com/{name}")).unwrap()
    }

    fn drain(queue: &mut ReadyQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop())
            .map(|u| u.path().trim_start_matches('/').to_string())
            .collect()
    }

    #[test_case(ExecutionOrder::Fifo, &["a", "b", "c"] ; "fifo")]
    #[test_case(ExecutionOrder::Lifo, &["c", "b", "a"] ; "lifo")]
    fn test_base_order(order: ExecutionOrder, expected: &[&str]) {
        let mut queue = ReadyQueue::new(order);
        for name in ["a", "b", "c"] {
            queue.push(url(name), Priority::Normal);
        }
        assert_eq!(drain(&mut queue), expected);
    }

    #[test_case(ExecutionOrder::Fifo, &["h1", "h2", "n1", "n2", "l1"] ; "fifo")]
    #[test_case(ExecutionOrder::Lifo, &["h2", "h1", "n2", "n1", "l1"] ; "lifo")]
    fn test_priority_lanes(order: ExecutionOrder, expected: &[&str]) {
        let mut queue = ReadyQueue::new(order);
        queue.push(url("n1"), Priority::Normal);
        queue.push(url("l1"), Priority::Low);
        queue.push(url("h1"), Priority::High);
        queue.push(url("n2"), Priority::Normal);
        queue.push(url("h2"), Priority::High);
        assert_eq!(drain(&mut queue), expected);
    }

    #[test]
    fn test_remove() {
        let mut queue = ReadyQueue::new(ExecutionOrder::Fifo);
        queue.push(url("a"), Priority::Low);
        queue.push(url("b"), Priority::High);

        assert!(queue.remove(&url("a")));
        assert!(!queue.remove(&url("a")));
        assert_eq!(queue.len(), 1);
        assert_eq!(drain(&mut queue), ["b"]);
        assert!(queue.is_empty());
    }

    #[test_case(DownloaderOptions::empty(), Priority::Normal ; "none")]
    #[test_case(DownloaderOptions::LOW_PRIORITY, Priority::Low ; "low")]
    #[test_case(DownloaderOptions::HIGH_PRIORITY, Priority::High ; "high")]
    #[test_case(DownloaderOptions::HIGH_PRIORITY | DownloaderOptions::LOW_PRIORITY, Priority::High ; "both")]
    fn test_priority_from_options(options: DownloaderOptions, expected: Priority) {
        assert_eq!(Priority::from_options(options), expected);
    }
}
