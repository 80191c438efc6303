//! Multi-producer, single-consumer event queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use super::events::{Event, EventKind, SessionId};
use super::token::GenerationToken;

/// Creates a connected sender/queue pair.
pub fn event_queue() -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = EventSender {
        tx,
        next_seq: Arc::new(AtomicU64::new(1)),
    };
    (sender, EventQueue { rx })
}

/// Producer handle. Cheap to clone; each clone shares the sequence counter.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
    next_seq: Arc<AtomicU64>,
}

impl EventSender {
    /// Enqueues an event. Returns false once the consumer is gone.
    pub fn send(&self, session: SessionId, token: GenerationToken, kind: EventKind) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Event {
                seq,
                session,
                token,
                kind,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the dispatcher.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventQueue {
    /// Takes everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_returns_all_in_fifo_order() {
        let (tx, mut queue) = event_queue();
        let token = GenerationToken::new(1);
        for text in ["a", "b", "c"] {
            tx.send(
                SessionId::One,
                token,
                EventKind::StreamChunk {
                    text: text.to_string(),
                },
            );
        }

        let drained = queue.drain();
        let texts: Vec<_> = drained
            .iter()
            .map(|e| match &e.kind {
                EventKind::StreamChunk { text } => text.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(texts, ["a", "b", "c"]);
        assert!(drained.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_per_producer_order() {
        let (tx, mut queue) = event_queue();
        let mut handles = Vec::new();
        for session in SessionId::ALL {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..100u64 {
                    tx.send(
                        session,
                        GenerationToken::new(n),
                        EventKind::StreamStart,
                    );
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 200);
        for session in SessionId::ALL {
            let tokens: Vec<u64> = drained
                .iter()
                .filter(|e| e.session == session)
                .map(|e| e.token.value())
                .collect();
            assert_eq!(tokens, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_send_reports_closed_consumer() {
        let (tx, queue) = event_queue();
        drop(queue);
        assert!(tx.is_closed());
        assert!(!tx.send(SessionId::One, GenerationToken::INITIAL, EventKind::StreamStart));
    }
}
