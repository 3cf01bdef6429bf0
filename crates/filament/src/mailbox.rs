//! Process mailbox with selective receive.
//!
//! The mailbox is an unbounded FIFO of tagged messages plus a matcher
//! interface. A receive walks the queue from head to tail trying each
//! matcher in order on each message; the first hit removes that message and
//! everything skipped stays in place. A blocked receiver re-scans only the
//! tail that arrived since its last pass, tracked by a scan marker — which
//! is sound because matchers are required to be pure: a message that did
//! not match once will never match.
//!
//! Waking uses a [`Notify`] per mailbox. `notify_one` stores a permit when
//! no receiver is parked, so a push that races a scan is never lost.

use crate::error::MailboxError;
use filament_core::{Message, Remotable};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

enum MatchOutcome<R> {
    Skip,
    Hit(R),
    Fail(filament_core::CodecError),
}

/// One clause of a selective receive: `Message → Option<handler result>`.
///
/// Matchers must be pure with respect to matching: whether a message
/// matches may depend only on the message. The handler itself may capture
/// and mutate state.
pub struct Match<R> {
    filter: Box<dyn FnMut(&Message) -> MatchOutcome<R> + Send>,
}

impl<R> Match<R> {
    /// Matches any message of type `T`.
    pub fn of<T, F>(mut handler: F) -> Self
    where
        T: Remotable,
        F: FnMut(T) -> R + Send + 'static,
    {
        Self {
            filter: Box::new(move |message| {
                if !message.is::<T>() {
                    return MatchOutcome::Skip;
                }
                match message.unpack::<T>() {
                    Ok(value) => MatchOutcome::Hit(handler(value)),
                    Err(err) => MatchOutcome::Fail(err),
                }
            }),
        }
    }

    /// Matches a message of type `T` satisfying `predicate`.
    ///
    /// A message of the right type that fails the predicate is skipped and
    /// stays in the queue.
    pub fn when<T, P, F>(predicate: P, mut handler: F) -> Self
    where
        T: Remotable,
        P: Fn(&T) -> bool + Send + 'static,
        F: FnMut(T) -> R + Send + 'static,
    {
        Self {
            filter: Box::new(move |message| {
                if !message.is::<T>() {
                    return MatchOutcome::Skip;
                }
                match message.unpack::<T>() {
                    Ok(value) if predicate(&value) => MatchOutcome::Hit(handler(value)),
                    Ok(_) => MatchOutcome::Skip,
                    Err(err) => MatchOutcome::Fail(err),
                }
            }),
        }
    }

    /// Matches any message at all, handing over the raw [`Message`].
    ///
    /// This is the only way to drop a message of an unknown type from the
    /// queue. Placed last in a matcher list, it catches whatever the typed
    /// clauses skipped.
    pub fn any<F>(mut handler: F) -> Self
    where
        F: FnMut(Message) -> R + Send + 'static,
    {
        Self {
            filter: Box::new(move |message| MatchOutcome::Hit(handler(message.clone()))),
        }
    }
}

/// An unbounded per-process message queue supporting selective receive.
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Appends a message and wakes a parked receiver, if any.
    pub fn push(&self, message: Message) {
        self.queue.lock().push_back(message);
        self.notify.notify_one();
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns `true` when no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// One pass over the unscanned suffix of the queue.
    ///
    /// `marker` is the index of the first unscanned message; on a miss it
    /// advances to the queue length so the next pass only sees new mail.
    fn scan<R>(
        &self,
        matches: &mut [Match<R>],
        marker: &mut usize,
    ) -> Option<Result<R, MailboxError>> {
        let mut queue = self.queue.lock();
        while *marker < queue.len() {
            for clause in matches.iter_mut() {
                match (clause.filter)(&queue[*marker]) {
                    MatchOutcome::Skip => {}
                    MatchOutcome::Hit(result) => {
                        queue.remove(*marker);
                        return Some(Ok(result));
                    }
                    MatchOutcome::Fail(err) => {
                        queue.remove(*marker);
                        return Some(Err(MailboxError::Decode(err)));
                    }
                }
            }
            *marker += 1;
        }
        None
    }

    /// Blocks until some matcher accepts a message.
    pub async fn receive<R>(&self, matches: &mut [Match<R>]) -> Result<R, MailboxError> {
        let mut marker = 0;
        loop {
            if let Some(outcome) = self.scan(matches, &mut marker) {
                return outcome;
            }
            self.notify.notified().await;
        }
    }

    /// Like [`receive`](Self::receive), bounded by a deadline.
    ///
    /// Returns `Ok(None)` on expiry. A zero duration is an explicit
    /// non-blocking poll: it never parks and reports `None` iff nothing
    /// matches at call time.
    pub async fn receive_timeout<R>(
        &self,
        duration: Duration,
        matches: &mut [Match<R>],
    ) -> Result<Option<R>, MailboxError> {
        if duration.is_zero() {
            return self.try_receive(matches);
        }
        match tokio::time::timeout(duration, self.receive(matches)).await {
            Ok(outcome) => outcome.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// A single non-blocking pass.
    pub fn try_receive<R>(&self, matches: &mut [Match<R>]) -> Result<Option<R>, MailboxError> {
        let mut marker = 0;
        match self.scan(matches, &mut marker) {
            Some(Ok(result)) => Ok(Some(result)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msg<T: Remotable>(value: &T) -> Message {
        Message::pack(value).unwrap()
    }

    #[tokio::test]
    async fn test_selective_receive_skips_nonmatching() {
        let mailbox = Mailbox::new();
        mailbox.push(msg(&"a".to_string()));
        mailbox.push(msg(&7i64));
        mailbox.push(msg(&"b".to_string()));

        let got = mailbox.receive(&mut [Match::of(|n: i64| n)]).await.unwrap();
        assert_eq!(got, 7);

        // The skipped strings are still queued, in order.
        let first = mailbox
            .receive(&mut [Match::of(|s: String| s)])
            .await
            .unwrap();
        let second = mailbox
            .receive(&mut [Match::of(|s: String| s)])
            .await
            .unwrap();
        assert_eq!(first, "a");
        assert_eq!(second, "b");
    }

    #[tokio::test]
    async fn test_matcher_order_decides() {
        let mailbox = Mailbox::new();
        mailbox.push(msg(&1i64));

        // Both clauses match i64; the first listed wins.
        let got = mailbox
            .receive(&mut [Match::of(|n: i64| ("first", n)), Match::of(|n: i64| ("second", n))])
            .await
            .unwrap();
        assert_eq!(got, ("first", 1));
    }

    #[tokio::test]
    async fn test_predicate_leaves_message() {
        let mailbox = Mailbox::new();
        mailbox.push(msg(&3i64));
        mailbox.push(msg(&10i64));

        let got = mailbox
            .receive(&mut [Match::when(|n: &i64| *n > 5, |n: i64| n)])
            .await
            .unwrap();
        assert_eq!(got, 10);
        assert_eq!(mailbox.len(), 1, "the 3 stays queued");
    }

    #[tokio::test]
    async fn test_wildcard_takes_head() {
        let mailbox = Mailbox::new();
        mailbox.push(msg(&"mystery".to_string()));
        mailbox.push(msg(&5i64));

        // The typed clause skips the string, the wildcard takes it first.
        let got = mailbox
            .receive(&mut [
                Match::of(|n: i64| format!("int {}", n)),
                Match::any(|m: Message| format!("raw {}", m.fingerprint())),
            ])
            .await
            .unwrap();
        assert!(got.starts_with("raw "), "wildcard caught the head: {}", got);
    }

    #[tokio::test]
    async fn test_zero_timeout_never_blocks() {
        let mailbox = Mailbox::new();
        let got = mailbox
            .receive_timeout(Duration::ZERO, &mut [Match::of(|n: i64| n)])
            .await
            .unwrap();
        assert_eq!(got, None);

        mailbox.push(msg(&4i64));
        let got = mailbox
            .receive_timeout(Duration::ZERO, &mut [Match::of(|n: i64| n)])
            .await
            .unwrap();
        assert_eq!(got, Some(4));
    }

    #[tokio::test]
    async fn test_timeout_expires() {
        let mailbox = Mailbox::new();
        let got = mailbox
            .receive_timeout(Duration::from_millis(20), &mut [Match::of(|n: i64| n)])
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_blocked_receiver_wakes_on_push() {
        let mailbox = Arc::new(Mailbox::new());

        let receiver = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.receive(&mut [Match::of(|n: i64| n)]).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.push(msg(&"noise".to_string()));
        mailbox.push(msg(&21i64));

        let got = receiver.await.unwrap().unwrap();
        assert_eq!(got, 21);
    }

    #[tokio::test]
    async fn test_decode_failure_reports_error() {
        let mailbox = Mailbox::new();
        // A message whose fingerprint claims String but whose bytes are not
        // a valid String encoding.
        let fp = <String as Remotable>::fingerprint();
        mailbox.push(Message::from_parts(fp, vec![0xff, 0xff, 0xff, 0xff, 0xff]));
        mailbox.push(msg(&1i64));

        let err = mailbox
            .receive(&mut [Match::of(|s: String| s)])
            .await
            .unwrap_err();
        assert!(matches!(err, MailboxError::Decode(_)));

        // The queue is intact apart from the poisoned message.
        let got = mailbox.receive(&mut [Match::of(|n: i64| n)]).await.unwrap();
        assert_eq!(got, 1);
    }
}
