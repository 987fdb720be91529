//! Cost-weighted token-bucket priority queue.
//!
//! # Responsibilities
//! - Strict lane: always served first, highest priority first
//! - Normal lane: one sub-queue per priority, each with a token budget
//! - Round-robin between classes (connections) inside a sub-queue
//!
//! # Design Decisions
//! - Pure data structure with no locking or I/O, so fairness is testable
//!   without sockets or tasks
//! - Every normal dequeue hands `priority * cost / total + 1` tokens to each
//!   active priority, so a low priority level always accumulates budget and
//!   is eventually served
//! - When no level can afford its head item the highest priority is served
//!   anyway, the queue never idles while items are pending

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

#[derive(Debug)]
struct SubQueue<T, K> {
    classes: BTreeMap<K, VecDeque<(u64, T)>>,
    tokens: u64,
    max_tokens: u64,
    size: usize,
    cursor: Option<K>,
}

impl<T, K: Ord + Clone> SubQueue<T, K> {
    fn new(max_tokens: u64) -> Self {
        Self {
            classes: BTreeMap::new(),
            tokens: 0,
            max_tokens,
            size: 0,
            cursor: None,
        }
    }

    fn put_tokens(&mut self, t: u64) {
        self.tokens = (self.tokens + t).min(self.max_tokens);
    }

    fn take_tokens(&mut self, t: u64) {
        self.tokens = self.tokens.saturating_sub(t);
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn enqueue(&mut self, class: K, cost: u64, item: T) {
        self.classes.entry(class).or_default().push_back((cost, item));
        self.size += 1;
    }


    /// Class whose turn it is: the cursor, or the next class after it.
    fn current_class(&self) -> Option<K> {
        let from = match &self.cursor {
            Some(c) => self.classes.range((Bound::Included(c), Bound::Unbounded)).next(),
            None => None,
        };
        from.or_else(|| self.classes.iter().next())
            .map(|(k, _)| k.clone())
    }

    fn front_cost(&self) -> Option<u64> {
        let class = self.current_class()?;
        self.classes.get(&class)?.front().map(|(cost, _)| *cost)
    }

    fn pop_front(&mut self) -> Option<(u64, T)> {
        let class = self.current_class()?;
        let q = self.classes.get_mut(&class)?;
        let out = q.pop_front()?;
        if q.is_empty() {
            self.classes.remove(&class);
        }
        self.size -= 1;
        // advance round-robin past the class just served
        self.cursor = self
            .classes
            .range((Bound::Excluded(&class), Bound::Unbounded))
            .next()
            .or_else(|| self.classes.iter().next())
            .map(|(k, _)| k.clone());
        Some(out)
    }

    fn remove_class(&mut self, class: &K) -> Vec<T> {
        match self.classes.remove(class) {
            Some(q) => {
                self.size -= q.len();
                if self.cursor.as_ref() == Some(class) {
                    self.cursor = None;
                }
                q.into_iter().map(|(_, item)| item).collect()
            }
            None => Vec::new(),
        }
    }
}

/// Priority queue with a strict lane and token-bucketed normal lane.
#[derive(Debug)]
pub struct PrioritizedQueue<T, K> {
    total_priority: u64,
    max_tokens_per_subqueue: u64,
    min_cost: u64,
    strict: BTreeMap<u32, SubQueue<T, K>>,
    normal: BTreeMap<u32, SubQueue<T, K>>,
}

impl<T, K: Ord + Clone> PrioritizedQueue<T, K> {
    pub fn new(max_tokens_per_subqueue: u64, min_cost: u64) -> Self {
        Self {
            total_priority: 0,
            max_tokens_per_subqueue,
            min_cost: min_cost.min(max_tokens_per_subqueue),
            strict: BTreeMap::new(),
            normal: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.strict.values().map(|q| q.size).sum::<usize>()
            + self.normal.values().map(|q| q.size).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.strict.is_empty() && self.normal.is_empty()
    }

    fn clamp_cost(&self, cost: u64) -> u64 {
        cost.clamp(self.min_cost, self.max_tokens_per_subqueue)
    }

    fn normal_queue(&mut self, priority: u32) -> &mut SubQueue<T, K> {
        let max = self.max_tokens_per_subqueue;
        if !self.normal.contains_key(&priority) {
            self.total_priority += priority as u64;
        }
        self.normal
            .entry(priority)
            .or_insert_with(|| SubQueue::new(max))
    }

    fn drop_normal_if_empty(&mut self, priority: u32) {
        if self.normal.get(&priority).is_some_and(SubQueue::is_empty) {
            self.normal.remove(&priority);
            self.total_priority -= priority as u64;
        }
    }

    pub fn enqueue_strict(&mut self, class: K, priority: u32, item: T) {
        let max = self.max_tokens_per_subqueue;
        self.strict
            .entry(priority)
            .or_insert_with(|| SubQueue::new(max))
            .enqueue(class, 0, item);
    }

    pub fn enqueue(&mut self, class: K, priority: u32, cost: u64, item: T) {
        let cost = self.clamp_cost(cost);
        self.normal_queue(priority).enqueue(class, cost, item);
    }

    fn distribute_tokens(&mut self, cost: u64) {
        if self.total_priority == 0 {
            return;
        }
        let total = self.total_priority;
        for (prio, q) in self.normal.iter_mut() {
            q.put_tokens((*prio as u64 * cost) / total + 1);
        }
    }

    pub fn dequeue(&mut self) -> Option<T> {
        if let Some((&prio, q)) = self.strict.iter_mut().next_back() {
            let (_, item) = q.pop_front()?;
            if q.is_empty() {
                self.strict.remove(&prio);
            }
            return Some(item);
        }

        // Highest priority level that can afford its head item, else the
        // highest priority level regardless of tokens.
        let chosen = self
            .normal
            .iter()
            .rev()
            .find(|(_, q)| q.front_cost().is_some_and(|c| c < q.tokens))
            .or_else(|| self.normal.iter().next_back())
            .map(|(p, _)| *p)?;

        let q = self.normal.get_mut(&chosen)?;
        let (cost, item) = q.pop_front()?;
        q.take_tokens(cost);
        self.drop_normal_if_empty(chosen);
        self.distribute_tokens(cost);
        Some(item)
    }

    /// Remove every item queued for `class`, in both lanes.
    pub fn remove_by_class(&mut self, class: &K) -> Vec<T> {
        let mut out = Vec::new();
        self.strict.retain(|_, q| {
            out.extend(q.remove_class(class));
            !q.is_empty()
        });
        let mut emptied = Vec::new();
        for (prio, q) in self.normal.iter_mut() {
            out.extend(q.remove_class(class));
            if q.is_empty() {
                emptied.push(*prio);
            }
        }
        for prio in emptied {
            self.drop_normal_if_empty(prio);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_lane_served_first() {
        let mut q: PrioritizedQueue<&str, u32> = PrioritizedQueue::new(1000, 1);
        q.enqueue(1, 255, 10, "normal-high");
        q.enqueue_strict(1, 10, "strict-low");
        q.enqueue_strict(1, 200, "strict-high");

        assert_eq!(q.dequeue(), Some("strict-high"));
        assert_eq!(q.dequeue(), Some("strict-low"));
        assert_eq!(q.dequeue(), Some("normal-high"));
        assert_eq!(q.dequeue(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn low_priority_is_not_starved() {
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(1 << 20, 1);
        for _ in 0..1000 {
            q.enqueue(1, 196, 100, 196);
        }
        for _ in 0..10 {
            q.enqueue(2, 64, 100, 64);
        }

        let mut served_low = 0;
        for _ in 0..200 {
            if q.dequeue() == Some(64) {
                served_low += 1;
            }
        }
        assert!(served_low > 0, "low priority level never served");
        assert!(served_low < 200, "high priority level never served");
    }

    #[test]
    fn service_share_tracks_priority_weight() {
        // 3:1 weights with equal costs: the low level gets about a quarter
        // of the service and never waits long between turns
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(10_000, 1);
        for _ in 0..5000 {
            q.enqueue(1, 192, 100, 192);
            q.enqueue(2, 64, 100, 64);
        }

        let mut low_turns = Vec::new();
        for i in 0..4000 {
            match q.dequeue() {
                Some(64) => low_turns.push(i),
                Some(192) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        let share = low_turns.len() as f64 / 4000.0;
        assert!((0.20..=0.30).contains(&share), "low share {share}");
        let max_gap = low_turns.windows(2).map(|w| w[1] - w[0]).max().unwrap();
        assert!(max_gap <= 8, "low level waited {max_gap} dequeues");
        assert!(low_turns[0] <= 8, "first low service at {}", low_turns[0]);
    }

    #[test]
    fn heavier_weight_gets_larger_share() {
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(10_000, 1);
        for _ in 0..3000 {
            q.enqueue(1, 200, 50, 200);
            q.enqueue(2, 50, 50, 50);
        }
        let low = (0..2000).filter(|_| q.dequeue() == Some(50)).count();
        let share = low as f64 / 2000.0;
        // 4:1 weights
        assert!((0.15..=0.25).contains(&share), "low share {share}");
    }

    #[test]
    fn classes_round_robin_within_priority() {
        let mut q: PrioritizedQueue<(u32, u32), u32> = PrioritizedQueue::new(1000, 1);
        for i in 0..3 {
            q.enqueue(1, 100, 1, (1, i));
        }
        for i in 0..3 {
            q.enqueue(2, 100, 1, (2, i));
        }
        let order: Vec<u32> = std::iter::from_fn(|| q.dequeue()).map(|(c, _)| c).collect();
        assert_eq!(order, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn round_robin_skips_drained_class() {
        let mut q: PrioritizedQueue<(u32, u32), u32> = PrioritizedQueue::new(1000, 1);
        q.enqueue(1, 100, 1, (1, 0));
        for i in 0..3 {
            q.enqueue(2, 100, 1, (2, i));
            q.enqueue(3, 100, 1, (3, i));
        }
        let order: Vec<u32> = std::iter::from_fn(|| q.dequeue()).map(|(c, _)| c).collect();
        assert_eq!(order, vec![1, 2, 3, 2, 3, 2, 3]);
    }

    #[test]
    fn per_class_fifo_preserved() {
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(1000, 1);
        for i in 0..10 {
            q.enqueue(7, 127, 5, i);
        }
        let got: Vec<u32> = std::iter::from_fn(|| q.dequeue()).collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn cost_is_clamped() {
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(100, 10);
        q.enqueue(1, 10, 0, 1);
        q.enqueue(1, 10, 1_000_000, 2);
        let sub = q.normal.get(&10).unwrap();
        let costs: Vec<u64> = sub.classes[&1].iter().map(|(c, _)| *c).collect();
        assert_eq!(costs, vec![10, 100]);
    }

    #[test]
    fn remove_by_class_clears_both_lanes() {
        let mut q: PrioritizedQueue<u32, u32> = PrioritizedQueue::new(1000, 1);
        q.enqueue_strict(1, 255, 1);
        q.enqueue(1, 127, 10, 2);
        q.enqueue(2, 127, 10, 3);
        q.enqueue(1, 64, 10, 4);

        let mut removed = q.remove_by_class(&1);
        removed.sort();
        assert_eq!(removed, vec![1, 2, 4]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.total_priority, 127);
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.total_priority, 0);
    }
}
