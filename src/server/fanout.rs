//! Per-session observer fan-out.

use crate::protocol::SessionEvent;
use tokio::sync::mpsc;

/// Receiving half handed to an observer.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// The observers currently attached to one session.
///
/// Channels are unbounded so a slow observer never makes the session drop
/// or reorder events for anyone else.
#[derive(Debug, Default)]
pub struct Observers {
    senders: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl Observers {
    /// Attach a new observer.
    pub fn attach(&mut self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    /// Send an event to every observer, forgetting the ones that are gone.
    pub fn broadcast(&mut self, event: &SessionEvent) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Detach everyone. Their receivers see the stream end.
    pub fn clear(&mut self) {
        self.senders.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(data: &str) -> SessionEvent {
        SessionEvent::Output { data: data.into() }
    }

    #[test]
    fn test_broadcast_reaches_all_in_order() {
        let mut observers = Observers::default();
        let mut a = observers.attach();
        let mut b = observers.attach();

        for i in 0..10 {
            observers.broadcast(&output(&i.to_string()));
        }

        for rx in [&mut a, &mut b] {
            for i in 0..10 {
                match rx.try_recv().unwrap() {
                    SessionEvent::Output { data } => assert_eq!(data, i.to_string()),
                    other => panic!("unexpected event {other:?}"),
                }
            }
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_closed_observers_are_dropped_silently() {
        let mut observers = Observers::default();
        let kept = observers.attach();
        let gone = observers.attach();
        drop(gone);

        observers.broadcast(&output("x"));
        assert_eq!(observers.len(), 1);
        drop(kept);
        observers.broadcast(&output("y"));
        assert!(observers.is_empty());
    }

    #[test]
    fn test_clear_ends_streams() {
        let mut observers = Observers::default();
        let mut rx = observers.attach();
        observers.broadcast(&output("last"));
        observers.clear();
        assert!(rx.try_recv().is_ok());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
