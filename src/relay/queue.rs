use std::collections::VecDeque;

use super::RelayError;

/// Outbound frames waiting for the transport.
///
/// At most one frame is in flight. The next one is released only when the
/// transport acknowledges the previous send, so frames leave in push order.
#[derive(Debug)]
pub struct CommandsQueue {
    pending: VecDeque<Vec<u8>>,
    in_flight: bool,
    capacity: usize,
}

impl CommandsQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: false,
            capacity,
        }
    }

    /// Queues `frame`. Returns it back if it can be sent right away.
    pub fn push(&mut self, frame: Vec<u8>) -> Result<Option<Vec<u8>>, RelayError> {
        if !self.in_flight {
            self.in_flight = true;
            return Ok(Some(frame));
        }
        if self.pending.len() >= self.capacity {
            return Err(RelayError::QueueFull(self.capacity));
        }
        self.pending.push_back(frame);
        Ok(None)
    }

    /// Acknowledges the in-flight frame and returns the next one to send.
    pub fn on_sent(&mut self) -> Option<Vec<u8>> {
        let next = self.pending.pop_front();
        self.in_flight = next.is_some();
        next
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && !self.in_flight
    }

    /// Drops everything, including the in-flight marker.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_released_one_at_a_time_in_order() {
        let mut queue = CommandsQueue::new(8);
        let mut wire = Vec::new();

        wire.extend(queue.push(b"C1".to_vec()).unwrap());
        assert_eq!(queue.push(b"C2".to_vec()).unwrap(), None);
        assert_eq!(queue.push(b"C3".to_vec()).unwrap(), None);
        assert_eq!(wire, vec![b"C1".to_vec()]);

        wire.extend(queue.on_sent());
        assert_eq!(wire.len(), 2);
        wire.extend(queue.on_sent());
        assert_eq!(queue.on_sent(), None);
        assert!(queue.is_empty());

        assert_eq!(wire, vec![b"C1".to_vec(), b"C2".to_vec(), b"C3".to_vec()]);
    }

    #[test]
    fn test_push_after_drain_sends_immediately() {
        let mut queue = CommandsQueue::new(8);
        assert!(queue.push(vec![1]).unwrap().is_some());
        assert_eq!(queue.on_sent(), None);
        assert!(!queue.is_in_flight());
        assert_eq!(queue.push(vec![2]).unwrap(), Some(vec![2]));
    }

    #[test]
    fn test_capacity_and_clear() {
        let mut queue = CommandsQueue::new(1);
        queue.push(vec![1]).unwrap();
        queue.push(vec![2]).unwrap();
        assert_eq!(queue.push(vec![3]), Err(RelayError::QueueFull(1)));

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.push(vec![4]).unwrap(), Some(vec![4]));
    }
}
