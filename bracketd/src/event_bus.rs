//! Event bus for internal daemon communication.
//!
//! Carries three kinds of traffic:
//! - Signal layer → Position Manager (entry signals)
//! - Broker connection → Engine (trades, position changes, quotes)
//! - Engine → operators and tests (structured [`EngineEvent`]s)
//!
//! Uses tokio broadcast channels for fan-out to multiple receivers.

use bracket_domain::{EngineEvent, TradeSignal};
use bracket_exec::BrokerEvent;
use tokio::sync::broadcast;
use tracing::info;

// =============================================================================
// Event Types
// =============================================================================

/// Events that flow through the daemon event bus.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// Entry signal to execute
    Signal(TradeSignal),

    /// Push event relayed from the broker connection
    Broker(BrokerEvent),

    /// Something the engine did or refused to do
    Engine(EngineEvent),

    /// Shutdown signal
    Shutdown,
}

// =============================================================================
// Event Bus
// =============================================================================

/// Event bus for daemon-wide communication.
pub struct EventBus {
    sender: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity.
    ///
    /// Capacity determines how many events can be buffered before
    /// slow receivers start missing events (lagging).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers. Returns the number of receivers.
    pub fn send(&self, event: DaemonEvent) -> usize {
        // Err only means nobody is listening
        self.sender.send(event).unwrap_or(0)
    }

    /// Log an engine event and publish it.
    pub fn emit(&self, event: EngineEvent) {
        info!(
            event_type = event.event_type(),
            position_id = ?event.position_id(),
            event = %serde_json::to_string(&event).unwrap_or_default(),
            "Engine event"
        );
        self.send(DaemonEvent::Engine(event));
    }

    /// Subscribe to events sent after this call.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Receiver for daemon events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<DaemonEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the sender has been dropped.
    /// Returns error description if the receiver lagged (missed events).
    pub async fn recv(&mut self) -> Option<Result<DaemonEvent, String>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<Result<DaemonEvent, String>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Closed) => None,
            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            }
        }
    }

    /// Drain every engine event currently buffered.
    pub fn drain_engine_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(next) = self.try_recv() {
            if let Ok(DaemonEvent::Engine(event)) = next {
                events.push(event);
            }
        }
        events
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bracket_domain::{Price, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn signal() -> TradeSignal {
        TradeSignal {
            side: Side::Long,
            entry_price: Price::new(dec!(2650)).unwrap(),
            stop_distance_ticks: 50,
            target_distance_ticks: 100,
            risk_reward_ratio: dec!(2),
        }
    }

    #[tokio::test]
    async fn test_event_bus_send_recv() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.send(DaemonEvent::Signal(signal()));

        match receiver.recv().await.unwrap().unwrap() {
            DaemonEvent::Signal(s) => assert_eq!(s.stop_distance_ticks, 50),
            other => panic!("Expected Signal event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_bus_multiple_receivers() {
        let bus = EventBus::new(10);
        let mut receiver1 = bus.subscribe();
        let mut receiver2 = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);

        bus.send(DaemonEvent::Shutdown);

        assert!(matches!(receiver1.recv().await.unwrap().unwrap(), DaemonEvent::Shutdown));
        assert!(matches!(receiver2.recv().await.unwrap().unwrap(), DaemonEvent::Shutdown));
    }

    #[test]
    fn test_event_bus_no_receivers() {
        let bus = EventBus::new(10);
        assert_eq!(bus.send(DaemonEvent::Shutdown), 0);
    }

    #[test]
    fn test_drain_engine_events_skips_other_traffic() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.send(DaemonEvent::Signal(signal()));
        bus.emit(EngineEvent::EntryRejected {
            reason: "a position is already open".to_string(),
            timestamp: Utc::now(),
        });

        let events = receiver.drain_engine_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "entry_rejected");
        assert!(receiver.try_recv().is_none());
    }
}
