//! Reversible step queue.
//!
//! One list with a movable head. `dequeue` returns the step at the head and
//! advances; `backtrack` moves the head back and returns the step it lands
//! on. After a failure, backtracking replays exactly the steps that were
//! dequeued, newest first, without a separate undo stack.

use super::step::{BoxStep, Step};

#[derive(Debug, Default)]
pub struct StepQueue {
    steps: Vec<BoxStep>,
    head: usize,
}

impl StepQueue {
    pub fn new(steps: Vec<BoxStep>) -> Self {
        Self { steps, head: 0 }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps dequeued and not backtracked over.
    pub fn position(&self) -> usize {
        self.head
    }

    /// Steps not yet dequeued.
    pub fn remaining(&self) -> usize {
        self.steps.len() - self.head
    }

    pub fn dequeue(&mut self) -> Option<(usize, &mut BoxStep)> {
        let index = self.head;
        let step = self.steps.get_mut(index)?;
        self.head += 1;
        Some((index, step))
    }

    pub fn backtrack(&mut self) -> Option<(usize, &mut BoxStep)> {
        if self.head == 0 {
            return None;
        }
        self.head -= 1;
        let index = self.head;
        self.steps.get_mut(index).map(|step| (index, step))
    }

    pub fn names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::WorkflowContext;
    use crate::workflow::step::{FnStep, StepOutput};

    fn queue_of(names: &[&str]) -> StepQueue {
        StepQueue::new(
            names
                .iter()
                .map(|n| BoxStep::new(FnStep::new(*n, |_ctx: &mut WorkflowContext| Ok(StepOutput::Empty))))
                .collect(),
        )
    }

    #[test]
    fn test_dequeue_then_backtrack_replays_in_reverse() {
        let mut queue = queue_of(&["a", "b", "c", "d"]);

        let mut forward = Vec::new();
        for _ in 0..3 {
            let (index, step) = queue.dequeue().unwrap();
            forward.push((index, step.name().to_string()));
        }
        assert_eq!(forward[2], (2, "c".to_string()));
        assert_eq!(queue.position(), 3);
        assert_eq!(queue.remaining(), 1);

        let mut backward = Vec::new();
        while let Some((_, step)) = queue.backtrack() {
            backward.push(step.name().to_string());
        }
        assert_eq!(backward, vec!["c", "b", "a"]);
        assert_eq!(queue.position(), 0);
    }

    #[test]
    fn test_exhausted_queue() {
        let mut queue = queue_of(&["only"]);
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.position(), 1);
        assert_eq!(queue.backtrack().map(|(i, _)| i), Some(0));
        assert!(queue.backtrack().is_none());
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = StepQueue::default();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
        assert!(queue.backtrack().is_none());
    }
}
