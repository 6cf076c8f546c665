//! Background keep-alive pings.

use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::remote::ServiceClient;

/// A running keep-alive task. Stopped on [`Heartbeat::stop`] or drop.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Ping `client` every `interval`. Returns `None` outside a Tokio runtime.
    pub(crate) fn start(client: Arc<dyn ServiceClient>, interval: Duration) -> Option<Self> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(_) => {
                warn!("No async runtime available; session keep-alive disabled");
                return None;
            }
        };

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match client.keep_alive().await {
                    Ok(()) => debug!("Keep-alive sent for {}", client.session_id()),
                    Err(e) => warn!("Keep-alive failed for {}: {e}", client.session_id()),
                }
            }
        });
        Some(Self { handle })
    }

    pub(crate) fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
