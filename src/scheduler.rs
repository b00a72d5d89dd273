use crate::candidates::{CandidateQueues, CandidateTask};
use std::collections::VecDeque;

/// Drains candidate queues fairly.
///
/// Each pass visits every category once and, inside it, every broker once, taking the front
/// symbol of each non-empty queue. A symbol therefore waits at most one pass, i.e. no more
/// tasks than there are active (broker, category) queues, whatever the backlog size.
pub struct RoundRobinScheduler {
    categories: Vec<(String, Vec<(String, VecDeque<String>)>)>,
    pass: VecDeque<CandidateTask>,
}

impl RoundRobinScheduler {
    pub fn new(queues: CandidateQueues) -> Self {
        let categories = queues
            .into_inner()
            .into_iter()
            .map(|(category, brokers)| (category, brokers.into_iter().collect()))
            .collect();
        Self {
            categories,
            pass: VecDeque::new(),
        }
    }

    /// Tasks not yet handed out.
    pub fn remaining(&self) -> usize {
        self.pass.len()
            + self
                .categories
                .iter()
                .flat_map(|(_, brokers)| brokers.iter())
                .map(|(_, queue)| queue.len())
                .sum::<usize>()
    }

    fn fill_pass(&mut self) {
        for (category, brokers) in &mut self.categories {
            for (broker, queue) in brokers.iter_mut() {
                if let Some(symbol) = queue.pop_front() {
                    self.pass.push_back(CandidateTask {
                        broker: broker.clone(),
                        category: category.clone(),
                        symbol,
                    });
                }
            }
        }
    }
}

impl Iterator for RoundRobinScheduler {
    type Item = CandidateTask;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pass.is_empty() {
            self.fill_pass();
        }
        self.pass.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn order(scheduler: RoundRobinScheduler) -> Vec<(String, String)> {
        scheduler.map(|t| (t.symbol, t.broker)).collect()
    }

    #[test]
    fn alternates_brokers_within_a_category() {
        let mut queues = CandidateQueues::default();
        queues.insert("forex", "A", strings(&["s1", "s2"]));
        queues.insert("forex", "B", strings(&["s3"]));

        let got = order(RoundRobinScheduler::new(queues));
        let expected = vec![
            ("s1".to_string(), "A".to_string()),
            ("s3".to_string(), "B".to_string()),
            ("s2".to_string(), "A".to_string()),
        ];
        assert_eq!(got, expected);
    }

    #[test]
    fn one_slot_per_queue_per_pass() {
        let mut queues = CandidateQueues::default();
        queues.insert("crypto", "A", strings(&["c1", "c2", "c3"]));
        queues.insert("forex", "A", strings(&["f1"]));
        queues.insert("forex", "B", strings(&["f2", "f3"]));

        let scheduler = RoundRobinScheduler::new(queues);
        assert_eq!(scheduler.remaining(), 6);
        let symbols: Vec<String> = scheduler.map(|t| t.symbol).collect();
        assert_eq!(symbols, strings(&["c1", "f1", "f2", "c2", "f3", "c3"]));
    }

    #[test]
    fn every_task_is_yielded_exactly_once() {
        let mut queues = CandidateQueues::default();
        let mut expected = Vec::new();
        for broker in ["A", "B", "C"] {
            for category in ["x", "y"] {
                let symbols: Vec<String> = (0..4).map(|i| format!("{broker}{category}{i}")).collect();
                expected.extend(symbols.clone());
                queues.insert(category, broker, symbols);
            }
        }

        let mut got: Vec<String> = RoundRobinScheduler::new(queues).map(|t| t.symbol).collect();
        got.sort();
        expected.sort();
        assert_eq!(got, expected);
    }

    #[test]
    fn empty_queues_finish_immediately() {
        let mut scheduler = RoundRobinScheduler::new(CandidateQueues::default());
        assert_eq!(scheduler.next(), None);
    }
}
