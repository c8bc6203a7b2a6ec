//! In-memory broker.
//!
//! Messages handed to a reader stay "in flight" until acknowledged. Closing
//! or dropping the reader puts its in-flight messages back at the head of
//! the queue, which gives the same at-least-once behaviour as a real broker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{Acknowledger, QueueError, QueueMessage, QueueReader, QueueReaderFactory};

/// Acknowledged bodies remembered per queue; older ones are only counted.
const ACK_LOG_CAPACITY: usize = 256;

#[derive(Default)]
struct ReaderState {
    in_flight: BTreeMap<u64, String>,
    broken: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, String)>,
    readers: HashMap<u64, ReaderState>,
    recent_acks: VecDeque<String>,
    acked_total: usize,
    readers_opened: usize,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    next_reader: u64,
    unavailable: bool,
    closed: bool,
}

impl BrokerState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    /// Return a reader's in-flight messages to the head of its queue.
    fn release(&mut self, queue: &str, reader: u64) {
        let q = self.queue(queue);
        if let Some(state) = q.readers.remove(&reader) {
            for (tag, body) in state.in_flight.into_iter().rev() {
                q.ready.push_front((tag, body));
            }
            q.notify.notify_waiters();
        }
    }
}

/// In-memory [`QueueReaderFactory`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message.
    pub fn publish(&self, queue: &str, body: impl Into<String>) {
        let mut state = self.state.lock();
        let tag = state.next_tag;
        state.next_tag += 1;
        let q = state.queue(queue);
        q.ready.push_back((tag, body.into()));
        q.notify.notify_waiters();
    }

    /// Make subsequent `new_reader` calls fail, as if the broker were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Break every open reader on `queue`; their next read fails.
    pub fn interrupt(&self, queue: &str) {
        let mut state = self.state.lock();
        let q = state.queue(queue);
        for reader in q.readers.values_mut() {
            reader.broken = true;
        }
        q.notify.notify_waiters();
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state.lock().queue(queue).ready.len()
    }

    /// Messages delivered but not yet acknowledged.
    pub fn in_flight_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queue(queue)
            .readers
            .values()
            .map(|r| r.in_flight.len())
            .sum()
    }

    /// The most recently acknowledged bodies, oldest first.
    pub fn acked(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .queue(queue)
            .recent_acks
            .iter()
            .cloned()
            .collect()
    }

    /// Messages acknowledged on `queue` since the broker was created.
    pub fn acked_count(&self, queue: &str) -> usize {
        self.state.lock().queue(queue).acked_total
    }

    /// Readers currently open on `queue`.
    pub fn open_readers(&self, queue: &str) -> usize {
        self.state.lock().queue(queue).readers.len()
    }

    /// Readers ever opened on `queue`.
    pub fn readers_opened(&self, queue: &str) -> usize {
        self.state.lock().queue(queue).readers_opened
    }
}

#[async_trait]
impl QueueReaderFactory for InMemoryBroker {
    async fn new_reader(&self, queue_name: &str) -> Result<Box<dyn QueueReader>, QueueError> {
        let mut state = self.state.lock();
        if state.closed || state.unavailable {
            return Err(QueueError::RetriesExhausted {
                attempts: 1,
                last: "in-memory broker unavailable".to_string(),
            });
        }

        let id = state.next_reader;
        state.next_reader += 1;
        let q = state.queue(queue_name);
        q.readers.insert(id, ReaderState::default());
        q.readers_opened += 1;
        let notify = Arc::clone(&q.notify);

        debug!(queue = queue_name, reader = id, "Opened in-memory reader");
        Ok(Box::new(MemoryReader {
            state: Arc::clone(&self.state),
            queue: queue_name.to_string(),
            id,
            notify,
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.closed = true;
        for q in state.queues.values_mut() {
            for reader in q.readers.values_mut() {
                reader.broken = true;
            }
            q.notify.notify_waiters();
        }
        Ok(())
    }
}

struct MemoryReader {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    id: u64,
    notify: Arc<Notify>,
}

#[async_trait]
impl QueueReader for MemoryReader {
    async fn read(&mut self) -> Result<QueueMessage, QueueError> {
        loop {
            let notified = {
                let mut state = self.state.lock();
                let q = state.queue(&self.queue);
                let notified = self.notify.notified();

                let broken = match q.readers.get(&self.id) {
                    None => return Err(QueueError::Closed(self.queue.clone())),
                    Some(reader) => reader.broken,
                };
                if broken {
                    return Err(QueueError::Receive {
                        queue: self.queue.clone(),
                        message: "link detached".to_string(),
                    });
                }

                if let Some((tag, body)) = q.ready.pop_front() {
                    if let Some(reader) = q.readers.get_mut(&self.id) {
                        reader.in_flight.insert(tag, body.clone());
                    }
                    let acker = MemoryAck {
                        state: Arc::clone(&self.state),
                        queue: self.queue.clone(),
                        reader: self.id,
                        tag,
                    };
                    return Ok(QueueMessage::new(body, Box::new(acker)));
                }
                notified
            };
            notified.await;
        }
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.state.lock().release(&self.queue, self.id);
        Ok(())
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.state.lock().release(&self.queue, self.id);
    }
}

struct MemoryAck {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    reader: u64,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let q = state.queue(&self.queue);
        // The reader is gone, so the message has already been requeued.
        let Some(reader) = q.readers.get_mut(&self.reader) else {
            return Ok(());
        };
        if let Some(body) = reader.in_flight.remove(&self.tag) {
            if q.recent_acks.len() == ACK_LOG_CAPACITY {
                q.recent_acks.pop_front();
            }
            q.recent_acks.push_back(body);
            q.acked_total += 1;
        }
        Ok(())
    }
}
