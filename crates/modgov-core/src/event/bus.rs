// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use flume::TrySendError;

/// Evict-and-retry rounds before a publish racing other publishers gives up.
const MAX_PUBLISH_ATTEMPTS: usize = 4;

/// Manages a generic, thread-safe event channel.
///
/// The bus is generic over the event type `T`, which keeps `modgov-core`
/// independent of the event enums defined by higher-level crates. A bounded
/// bus never blocks the publisher: when it is full, the oldest pending event
/// is discarded so a late subscriber reads the most recent ones.
#[derive(Debug)]
pub struct EventBus<T: Clone + Send + Sync + 'static> {
    sender: flume::Sender<T>,
    receiver: flume::Receiver<T>,
}

impl<T: Clone + Send + Sync + 'static> EventBus<T> {
    /// Creates a new EventBus with an unbounded channel.
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        log::debug!("EventBus: unbounded bus initialized.");
        Self { sender, receiver }
    }

    /// Creates a new EventBus that holds at most `capacity` pending events.
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity);
        log::debug!("EventBus: bounded bus initialized (capacity {capacity}).");
        Self { sender, receiver }
    }

    /// Publishes an event without blocking.
    ///
    /// On a full bus the oldest pending events are evicted to make room.
    /// Returns `false` when the event itself could not be queued.
    pub fn publish(&self, event: T) -> bool {
        let mut event = event;
        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            match self.sender.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Full(rejected)) => {
                    if self.receiver.try_recv().is_ok() {
                        log::trace!("EventBus: bus full, oldest event evicted.");
                    }
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::error!("EventBus: receiver disconnected, event dropped.");
                    return false;
                }
            }
        }
        log::trace!("EventBus: bus contended, event dropped.");
        false
    }

    /// Returns a clone of the sender end of the channel.
    pub fn sender(&self) -> flume::Sender<T> {
        self.sender.clone()
    }

    /// Returns a new receiver handle. Receivers compete for events.
    pub fn subscribe(&self) -> flume::Receiver<T> {
        self.receiver.clone()
    }

    /// Returns a reference to the receiver end of the channel.
    pub fn receiver(&self) -> &flume::Receiver<T> {
        &self.receiver
    }

    /// Number of events waiting to be received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Tick(u32),
        Shutdown,
    }

    #[test]
    fn test_publish_and_receive() {
        let bus = EventBus::<TestEvent>::new();
        assert!(bus.publish(TestEvent::Tick(1)));

        let received = bus.receiver().recv_timeout(Duration::from_millis(100));
        assert_eq!(received, Ok(TestEvent::Tick(1)));
    }

    #[test]
    fn test_bounded_bus_evicts_oldest_when_full() {
        let bus = EventBus::<TestEvent>::bounded(2);
        assert!(bus.publish(TestEvent::Tick(1)));
        assert!(bus.publish(TestEvent::Tick(2)));
        assert!(bus.publish(TestEvent::Tick(3)));
        assert_eq!(bus.pending(), 2);

        let drained: Vec<_> = bus.receiver().try_iter().collect();
        assert_eq!(drained, vec![TestEvent::Tick(2), TestEvent::Tick(3)]);
    }

    #[test]
    fn test_late_subscriber_sees_latest_events() {
        let bus = EventBus::<TestEvent>::bounded(4);
        for i in 0..1000 {
            assert!(bus.publish(TestEvent::Tick(i)));
        }
        bus.publish(TestEvent::Shutdown);

        let events: Vec<_> = bus.subscribe().try_iter().collect();
        assert_eq!(
            events,
            vec![
                TestEvent::Tick(997),
                TestEvent::Tick(998),
                TestEvent::Tick(999),
                TestEvent::Shutdown
            ]
        );
    }

    #[test]
    fn test_multi_threaded_publishers() {
        let bus = EventBus::<TestEvent>::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sender = bus.sender();
                thread::spawn(move || {
                    sender.send(TestEvent::Tick(i)).expect("send should succeed");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("publisher thread panicked");
        }
        bus.publish(TestEvent::Shutdown);

        let events: Vec<_> = bus.subscribe().try_iter().collect();
        assert_eq!(events.len(), 5);
        assert_eq!(events.last(), Some(&TestEvent::Shutdown));
    }
}
