//! Connected in-process transport pair.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tlsmith_types::EngineError;

use super::{closed_error, Received, Transport};

#[derive(Debug, Default)]
struct Channel {
    queue: VecDeque<Vec<u8>>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    channel: Mutex<Channel>,
    ready: Condvar,
}

impl Pipe {
    fn close(&self) {
        if let Ok(mut channel) = self.channel.lock() {
            channel.closed = true;
        }
        self.ready.notify_all();
    }
}

fn poisoned() -> EngineError {
    EngineError::TransportFailure("memory transport lock poisoned".into())
}

/// One end of an in-memory, datagram-preserving connection.
#[derive(Debug)]
pub struct MemoryTransport {
    outgoing: Arc<Pipe>,
    incoming: Arc<Pipe>,
    closed: bool,
}

impl MemoryTransport {
    /// Two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        (
            Self {
                outgoing: Arc::clone(&a_to_b),
                incoming: Arc::clone(&b_to_a),
                closed: false,
            },
            Self {
                outgoing: b_to_a,
                incoming: a_to_b,
                closed: false,
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if self.closed {
            return Err(closed_error());
        }
        let mut channel = self.outgoing.channel.lock().map_err(|_| poisoned())?;
        if channel.closed {
            return Err(EngineError::TransportFailure("peer closed".into()));
        }
        channel.queue.push_back(data.to_vec());
        drop(channel);
        self.outgoing.ready.notify_all();
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received, EngineError> {
        if self.closed {
            return Ok(Received::Closed);
        }
        let deadline = Instant::now() + timeout;
        let mut channel = self.incoming.channel.lock().map_err(|_| poisoned())?;
        loop {
            if let Some(data) = channel.queue.pop_front() {
                return Ok(Received::Data(data));
            }
            if channel.closed {
                return Ok(Received::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Received::Timeout);
            }
            let (guard, _) = self
                .incoming
                .ready
                .wait_timeout(channel, deadline - now)
                .map_err(|_| poisoned())?;
            channel = guard;
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.outgoing.close();
            self.incoming.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_datagram(&self) -> bool {
        true
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_delivers_datagrams_in_order() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();
        let t = Duration::from_millis(10);
        assert_eq!(b.receive(t).unwrap(), Received::Data(b"one".to_vec()));
        assert_eq!(b.receive(t).unwrap(), Received::Data(b"two".to_vec()));
        assert_eq!(b.receive(t).unwrap(), Received::Timeout);
    }

    #[test]
    fn test_close_is_seen_by_peer_after_pending_data() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send(b"last").unwrap();
        a.close();
        assert!(a.is_closed());
        let t = Duration::from_millis(10);
        assert_eq!(b.receive(t).unwrap(), Received::Data(b"last".to_vec()));
        assert_eq!(b.receive(t).unwrap(), Received::Closed);
        assert!(b.send(b"x").is_err());
    }

    #[test]
    fn test_receive_wakes_on_send_from_other_thread() {
        let (mut a, mut b) = MemoryTransport::pair();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            a.send(b"late").unwrap();
            a
        });
        assert_eq!(
            b.receive(Duration::from_secs(2)).unwrap(),
            Received::Data(b"late".to_vec())
        );
        handle.join().unwrap();
    }
}
