//! # Scheduled Tasks
//!
//! Named countdown tasks advanced by the owner's tick. A task completes when its
//! remaining time reaches zero; `tick` hands the completed actions back to the
//! caller, which runs them with whatever context it owns. Owners that schedule
//! while handling a frame call `advance` first and `take_due` last, so a task
//! created mid-frame is not charged for time that passed before it existed.
//!
//! Names are unique per manager: scheduling an existing name replaces it.

use std::borrow::Cow;
use std::time::Duration;

use tracing::trace;

/// A pending countdown
#[derive(Debug)]
pub struct ScheduledTask<T> {
    name: Cow<'static, str>,
    remaining: Duration,
    action: T,
}

impl<T> ScheduledTask<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }
}

/// Ordered collection of named countdown tasks
#[derive(Debug)]
pub struct TaskManager<T> {
    tasks: Vec<ScheduledTask<T>>,
}

impl<T> Default for TaskManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskManager<T> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Schedule `action` to complete after `delay`, replacing a task of the same name
    pub fn schedule(&mut self, name: impl Into<Cow<'static, str>>, delay: Duration, action: T) {
        let name = name.into();
        self.tasks.retain(|task| task.name != name);
        trace!(task = %name, delay_ms = delay.as_millis() as u64, "Task scheduled");
        self.tasks.push(ScheduledTask {
            name,
            remaining: delay,
            action,
        });
    }

    /// Cancel a task by name; returns whether it existed
    pub fn cancel(&mut self, name: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.name != name);
        before != self.tasks.len()
    }

    pub fn cancel_all(&mut self) {
        self.tasks.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.iter().any(|task| task.name == name)
    }

    pub fn remaining(&self, name: &str) -> Option<Duration> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .map(|task| task.remaining)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledTask<T>> {
        self.tasks.iter()
    }

    /// Advance every task by `elapsed` and return the completed actions in
    /// scheduling order
    pub fn tick(&mut self, elapsed: Duration) -> Vec<T> {
        self.advance(elapsed);
        self.take_due()
    }

    /// Count `elapsed` against the tasks scheduled so far without completing any
    pub fn advance(&mut self, elapsed: Duration) {
        for task in self.tasks.iter_mut() {
            task.remaining = task.remaining.saturating_sub(elapsed);
        }
    }

    /// Remove and return the actions whose countdown reached zero, in
    /// scheduling order
    pub fn take_due(&mut self) -> Vec<T> {
        if self.tasks.is_empty() {
            return Vec::new();
        }

        let mut completed = Vec::new();
        let mut index = 0;
        while index < self.tasks.len() {
            if self.tasks[index].remaining.is_zero() {
                let task = self.tasks.remove(index);
                trace!(task = %task.name, "Task completed");
                completed.push(task.action);
            } else {
                index += 1;
            }
        }
        completed
    }
}
