//! Automatic reconnection around a [`RouterClient`].
//!
//! The wrapper owns the socket URL and the backoff policy. After every
//! successful reattach it replays `register -> initialize_p2p ->
//! subscribe_to_events` with the retained parameters, and publishes its
//! progress as a watchable state sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};

use weft::transport::ws::WsTransport;
use weft::{Status, Streaming};

use crate::client::RouterClient;
use crate::message::{RegisterRequest, RouterEvent};

/// How the delay between attempts grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Every wait equals the initial delay.
    Fixed,
    /// The wait grows by the initial delay per attempt.
    Linear,
    /// The wait is multiplied by the backoff multiplier per attempt.
    Exponential,
}

/// The reconnect policy: strategy, bounds, and jitter.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff_multiplier: f64,
    /// Scale each wait by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// The wait before `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = self.backoff_multiplier.powi(attempt as i32 - 1);
                self.initial_delay.mul_f64(factor.min(1e6))
            }
        };
        let base = base.min(self.max_delay);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            base.mul_f64(factor).min(self.max_delay)
        } else {
            base
        }
    }
}

/// Where the wrapper currently is in its connect cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Waiting,
    Reconnecting,
    Stopped,
}

/// A [`RouterClient`] that re-establishes itself after connection loss.
pub struct ReconnectingClient {
    url: String,
    policy: ReconnectPolicy,
    registration: RegisterRequest,
    heartbeat_interval: Option<Duration>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    current: Mutex<Option<Arc<RouterClient>>>,
    events: Mutex<Option<Streaming<RouterEvent>>>,
    stopped: AtomicBool,
}

impl ReconnectingClient {
    pub fn new(url: impl Into<String>, registration: RegisterRequest, policy: ReconnectPolicy) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        ReconnectingClient {
            url: url.into(),
            policy,
            registration,
            heartbeat_interval: None,
            state_tx,
            state_rx,
            current: Mutex::new(None),
            events: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Also start an auto-heartbeat at `interval` after each reconnect.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Watch the `{connected, disconnected, waiting, reconnecting, stopped}`
    /// sequence.
    pub fn states(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The live session, when connected.
    pub fn current(&self) -> Option<Arc<RouterClient>> {
        self.current.lock().unwrap().clone()
    }

    /// The event subscription of the live session, claimable once per
    /// reconnect.
    pub fn take_events(&self) -> Option<Streaming<RouterEvent>> {
        self.events.lock().unwrap().take()
    }

    /// Stop after the current attempt; the state sequence ends in `Stopped`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Drive the connect/reattach cycle until stopped or out of attempts.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.set_state(ConnectionState::Reconnecting);

            match self.connect_once().await {
                Ok(client) => {
                    attempt = 0;
                    info!(url = %self.url, "router connection established");
                    *self.current.lock().unwrap() = Some(client.clone());
                    self.set_state(ConnectionState::Connected);

                    client.closed().await;

                    self.current.lock().unwrap().take();
                    self.events.lock().unwrap().take();
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(status) => {
                    debug!(url = %self.url, "connect failed: {}", status);
                }
            }

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            attempt += 1;
            if matches!(self.policy.max_attempts, Some(max) if attempt > max) {
                info!("reconnect attempts exhausted");
                break;
            }

            self.set_state(ConnectionState::Waiting);
            tokio::time::sleep(self.policy.delay_for(attempt)).await;
        }

        self.current.lock().unwrap().take();
        self.set_state(ConnectionState::Stopped);
    }

    // One full session establishment: connect, then replay registration,
    // the p2p stream, and the event subscription with retained parameters.
    async fn connect_once(&self) -> Result<Arc<RouterClient>, Status> {
        let transport = WsTransport::connect(&self.url).await?;
        let client = Arc::new(RouterClient::new(Arc::new(transport)));

        client.register(self.registration.clone()).await?;
        client.initialize_p2p().await?;
        let events = client.subscribe_to_events().await?;
        *self.events.lock().unwrap() = Some(events);

        if let Some(interval) = self.heartbeat_interval {
            client.start_heartbeat(interval);
        }
        Ok(client)
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

impl std::fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("url", &self.url)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> ReconnectPolicy {
        ReconnectPolicy {
            strategy,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: None,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = policy(BackoffStrategy::Fixed);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(7), Duration::from_millis(100));
    }

    #[test]
    fn linear_backoff_grows_by_the_initial_delay() {
        let policy = policy(BackoffStrategy::Linear);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = policy(BackoffStrategy::Exponential);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let mut policy = policy(BackoffStrategy::Fixed);
        policy.jitter = true;
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
