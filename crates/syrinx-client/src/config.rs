// Client tuning knobs. Defaults suit local development; everything is
// overridable per client.
use std::time::Duration;

use syrinx_wire::DEFAULT_MAX_FRAME_BYTES;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_QUEUE_DEPTH: usize = 4;
const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub subscription_timeout: Duration,
    pub quench_timeout: Duration,
    // Outbound queue depth; senders block when the writer falls behind.
    pub write_queue_depth: usize,
    // Per-handle delivery queue; overflow is dropped and counted.
    pub notification_queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_OP_TIMEOUT,
            disconnect_timeout: DEFAULT_OP_TIMEOUT,
            subscription_timeout: DEFAULT_OP_TIMEOUT,
            quench_timeout: DEFAULT_OP_TIMEOUT,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            notification_queue_capacity: DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let options = ClientOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.write_queue_depth, 4);
        assert!(options.notification_queue_capacity > 0);
        assert_eq!(options.max_frame_bytes, 1024 * 1024);
    }
}
