//! Shared crawl frontier: a FIFO of pending tasks plus the visited set.

#[cfg(test)]
mod tests;

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::config::normalize_blocklist;

/// A url waiting to be crawled at a given link distance from the seed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTask {
    pub url: String,
    pub depth: u32,
}

impl CrawlTask {
    #[inline]
    pub fn new(url: impl Into<String>, depth: u32) -> Self {
        Self {
            url: url.into(),
            depth,
        }
    }
}

/// Why a url was not accepted into (or out of) the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    Fragment,
    Blocked,
    TooDeep,
    Visited,
    AlreadyQueued,
}

#[derive(Debug, Default)]
struct FrontierState {
    queue: VecDeque<CrawlTask>,
    /// Urls currently sitting in `queue`
    queued: HashSet<String>,
    visited: HashSet<String>,
    /// Tasks handed out and not yet completed
    in_flight: usize,
    closed: bool,
}

/// Breadth-first frontier shared by all crawl workers.
///
/// Enqueue, dequeue and the visited check happen under one lock, so a url is
/// processed at most once however often it is discovered. A worker that finds
/// the queue empty waits while other tasks are in flight, since those may
/// still discover links; the frontier is drained once both are empty.
pub struct Frontier {
    state: Mutex<FrontierState>,
    notify: Notify,
    max_depth: u32,
    blocklist: Vec<String>,
}

impl Frontier {
    #[inline]
    pub fn new(max_depth: u32, blocked_domains: &[String]) -> Self {
        Self {
            state: Mutex::new(FrontierState::default()),
            notify: Notify::new(),
            max_depth,
            blocklist: normalize_blocklist(blocked_domains),
        }
    }

    /// Case-insensitive substring match against the whole url
    #[inline]
    pub fn is_blocked(&self, url: &str) -> bool {
        if self.blocklist.is_empty() {
            return false;
        }
        let url = url.to_lowercase();
        self.blocklist.iter().any(|entry| url.contains(entry.as_str()))
    }

    fn check(&self, task: &CrawlTask, visited: &HashSet<String>) -> Result<(), Rejection> {
        if task.url.is_empty() {
            Err(Rejection::Empty)
        } else if visited.contains(&task.url) {
            Err(Rejection::Visited)
        } else if self.is_blocked(&task.url) {
            Err(Rejection::Blocked)
        } else if task.depth > self.max_depth {
            Err(Rejection::TooDeep)
        } else if task.url.contains('#') {
            Err(Rejection::Fragment)
        } else {
            Ok(())
        }
    }

    /// Add a task unless it is rejected or already queued
    #[inline]
    pub fn push(&self, task: CrawlTask) -> Result<(), Rejection> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            self.check(&task, &state.visited)?;
            if !state.queued.insert(task.url.clone()) {
                return Err(Rejection::AlreadyQueued);
            }
            state.queue.push_back(task);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Next task to crawl, marked visited before it is returned.
    ///
    /// Waits while the queue is empty but other tasks are in flight. Returns
    /// `None` once the frontier is drained or closed. Every returned task
    /// must be followed by a call to [`Frontier::complete`].
    #[inline]
    pub async fn next(&self) -> Option<CrawlTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return None;
                }

                while let Some(task) = state.queue.pop_front() {
                    state.queued.remove(&task.url);
                    // Rules are checked again: the url may have been visited
                    // since it was queued
                    if let Err(reason) = self.check(&task, &state.visited) {
                        debug!("Skipping {} at dequeue: {:?}", task.url, reason);
                        continue;
                    }
                    state.visited.insert(task.url.clone());
                    state.in_flight += 1;
                    return Some(task);
                }

                if state.in_flight == 0 {
                    drop(state);
                    // Wake the other idle workers so they observe the drain
                    self.notify.notify_waiters();
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a task returned by [`Frontier::next`] as finished
    #[inline]
    pub fn complete(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Stop handing out tasks; in-flight tasks are unaffected
    #[inline]
    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_waiters();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    #[inline]
    pub fn visited_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .visited
            .len()
    }

    #[inline]
    pub fn queued_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }
}
