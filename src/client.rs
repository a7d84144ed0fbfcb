//! Echo client on top of a [`Link`].
//!
//! Sends text messages, logs whatever comes back, and always asks the link
//! to reconnect after a failure.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::link::{ConnectionState, Link, WriteOutcome};

pub struct EchoClient {
    link: Link,
}

impl EchoClient {
    /// Start connecting to the echo server described by `config`.
    pub fn connect(config: LinkConfig) -> Self {
        let link = Link::connect(
            config,
            |data: Bytes| {
                info!(message = %String::from_utf8_lossy(&data), "Received echo");
            },
            || true,
        );
        EchoClient { link }
    }

    /// Send one message. Empty messages are ignored; returns whether the
    /// message was queued.
    pub fn send(&self, message: &str) -> bool {
        if message.is_empty() {
            return false;
        }

        let len = message.len();
        self.link
            .write(Bytes::copy_from_slice(message.as_bytes()), move |outcome| match outcome {
                WriteOutcome::Sent => debug!(len, "Message sent"),
                WriteOutcome::Failed(payload) => {
                    warn!(message = %String::from_utf8_lossy(&payload), "Failed to send message")
                }
            });
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn close(&self) {
        self.link.close();
    }
}
