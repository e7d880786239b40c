use futures_util::Stream;
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::time::{self, Sleep};

/// Handle to a scheduled entry, usable to cancel it.
#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub(crate) struct Timeout {
    at: Instant,
    seq: u64,
}

/// Deadline queue multiplexing any number of scheduled values over a single
/// sleep, exposed as a `Stream` that yields each value at its deadline.
///
/// With no entries scheduled the stream yields `None`; callers guard their
/// `select!` arm with [`Timer::is_empty`].
pub(crate) struct Timer<T> {
    queue: BTreeMap<Timeout, T>,
    // Sleep armed for the head of the queue. Rebuilt whenever the head
    // changes; only touched inside `poll_next` so the timer can be used
    // outside a runtime until it is first polled.
    armed: Option<(Timeout, Pin<Box<Sleep>>)>,
    next_seq: u64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            armed: None,
            next_seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn schedule_in(&mut self, delay: Duration, value: T) -> Timeout {
        self.schedule_at(Instant::now() + delay, value)
    }

    pub fn schedule_at(&mut self, at: Instant, value: T) -> Timeout {
        let key = Timeout {
            at,
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        self.queue.insert(key, value);

        key
    }

    /// Remove a scheduled entry. Returns false if it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self, timeout: Timeout) -> bool {
        if let Some((armed, _)) = &self.armed {
            if *armed == timeout {
                self.armed = None;
            }
        }

        self.queue.remove(&timeout).is_some()
    }

    /// Drop every scheduled entry.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.armed = None;
    }
}

impl<T: Unpin> Stream for Timer<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let head = match this.queue.keys().next() {
                Some(head) => *head,
                None => {
                    this.armed = None;
                    return Poll::Ready(None);
                }
            };

            match &mut this.armed {
                Some((armed, sleep)) if *armed == head => {
                    match sleep.as_mut().poll(cx) {
                        Poll::Ready(()) => {
                            this.armed = None;
                            let value = this.queue.remove(&head);
                            debug_assert!(value.is_some());
                            return Poll::Ready(value);
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                _ => {
                    // Head changed since we last armed (new earlier entry or
                    // cancellation); re-arm and poll again.
                    this.armed = Some((head, Box::pin(time::sleep_until(head.at.into()))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut timer = Timer::new();

        timer.schedule_in(Duration::from_secs(2), "second");
        timer.schedule_in(Duration::from_secs(1), "first");
        timer.schedule_in(Duration::from_secs(3), "third");

        assert_eq!(timer.next().await, Some("first"));
        assert_eq!(timer.next().await, Some("second"));
        assert_eq!(timer.next().await, Some("third"));
        assert!(timer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_entries_never_fire() {
        let mut timer = Timer::new();

        let doomed = timer.schedule_in(Duration::from_secs(1), "doomed");
        timer.schedule_in(Duration::from_secs(2), "kept");

        assert!(timer.cancel(doomed));
        assert!(!timer.cancel(doomed));

        assert_eq!(timer.next().await, Some("kept"));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_entry_preempts_armed_head() {
        let mut timer = Timer::new();

        timer.schedule_in(Duration::from_secs(10), "late");

        // Arm the head by polling once.
        tokio::select! {
            biased;
            _ = timer.next() => panic!("nothing should fire yet"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        timer.schedule_in(Duration::from_secs(1), "early");

        assert_eq!(timer.next().await, Some("early"));
        assert_eq!(timer.next().await, Some("late"));
    }

    #[tokio::test]
    async fn empty_timer_ends_the_stream() {
        let mut timer: Timer<&str> = Timer::new();

        assert_eq!(timer.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_discards_everything() {
        let mut timer = Timer::new();

        timer.schedule_in(Duration::from_secs(1), "a");
        timer.schedule_in(Duration::from_secs(2), "b");
        timer.clear();

        assert!(timer.is_empty());
        assert_eq!(timer.next().await, None);
    }
}
