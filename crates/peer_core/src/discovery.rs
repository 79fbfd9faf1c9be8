//! Periodic hello announcer. Shares the session's send path; runs on its own
//! schedule, unrelated to the receive context. Announcement failures never
//! surface past this module.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::Session;

pub struct Discovery {
    session: Arc<Session>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(session: Arc<Session>, interval: Duration) -> Self {
        Self {
            session,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Fire one announcement immediately.
    pub async fn announce_now(&self) {
        self.session.announce_hello().await;
    }

    /// Begin the periodic announcement timer. Idempotent.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let session = self.session.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick is immediate and the caller already announced.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                session.announce_hello().await;
            }
        }));
        debug!("discovery announcing every {interval:?}");
    }

    /// Halt the periodic timer. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_transport::{MemoryHub, Transport};

    #[tokio::test]
    async fn periodic_announcements_reach_other_peers() {
        let hub = MemoryHub::new();
        let ta: Arc<dyn Transport> = Arc::new(hub.transport("a"));
        let tb: Arc<dyn Transport> = Arc::new(hub.transport("b"));
        let sa = Session::bind(ta.clone(), "a", false);
        let sb = Session::bind(tb.clone(), "b", false);
        ta.start().await.unwrap();
        tb.start().await.unwrap();

        sa.serve("echo", Arc::new(|_, _| serde_json::Value::Null));
        let disco = Discovery::new(sa.clone(), Duration::from_millis(30));
        disco.announce_now().await;
        disco.start().await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(sb.keys().peer_supports("a", "echo"));

        disco.stop().await;
        disco.stop().await;
    }
}
