use tokio::sync::broadcast;

/// Change notification published by a store.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent<T> {
    Created(T),
    Updated(T),
    Deleted(T),
}

impl<T> StoreEvent<T> {
    pub fn payload(&self) -> &T {
        match self {
            Self::Created(v) | Self::Updated(v) | Self::Deleted(v) => v,
        }
    }
}

/// Fan-out of store events to any number of subscribers.
pub struct Broker<T: Clone> {
    tx: broadcast::Sender<StoreEvent<T>>,
}

impl<T: Clone> Broker<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent<T>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StoreEvent<T>) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no store event receivers");
        }
    }
}

impl<T: Clone> Default for Broker<T> {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let broker = Broker::<u32>::default();
        let mut rx = broker.subscribe();
        broker.publish(StoreEvent::Created(1));
        broker.publish(StoreEvent::Deleted(1));
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::Created(1));
        assert_eq!(*rx.recv().await.unwrap().payload(), 1);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let broker = Broker::<u32>::new(4);
        broker.publish(StoreEvent::Updated(7));
    }
}
