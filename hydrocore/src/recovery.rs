use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::channel::{await_connected, ChannelClient, CONNECTED_EVENT_WAIT};
use crate::errors::ChannelError;
use crate::model::{ReconnectErrorCode, ReconnectResult};
use crate::store::StoreClient;

/// Single-shot orchestrator for a user-initiated reconnect: tears down and
/// reinitializes both backing clients and reports a structured per-service
/// outcome. Operates on the same client instances the repositories use.
pub struct ConnectionRecoveryService {
    channel: Arc<dyn ChannelClient>,
    store: Arc<dyn StoreClient>,
    in_flight: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    min_interval: Option<Duration>,
    /// The ingestion repository's retry gate; held while an attempt runs so
    /// the background loop cannot race a manual recovery.
    retry_gate: Option<Arc<AtomicBool>>,
}

impl ConnectionRecoveryService {
    pub fn new(channel: Arc<dyn ChannelClient>, store: Arc<dyn StoreClient>) -> Self {
        Self {
            channel,
            store,
            in_flight: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            min_interval: None,
            retry_gate: None,
        }
    }

    /// Enforces a minimum interval between attempts.
    pub fn with_throttle(mut self, min_interval: Duration) -> Self {
        self.min_interval = Some(min_interval);
        self
    }

    pub fn with_retry_gate(mut self, gate: Arc<AtomicBool>) -> Self {
        self.retry_gate = Some(gate);
        self
    }

    /// Runs one full recovery attempt. Never returns an error: every failure
    /// path is captured in the result.
    pub async fn reconnect(&self) -> ReconnectResult {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("reconnect requested while another attempt is in flight");
            return ReconnectResult::rejected(
                ReconnectErrorCode::ConcurrentAttemptRejected,
                "a recovery attempt is already in flight",
            );
        }

        if let Some(min) = self.min_interval {
            let last = *self.last_attempt.lock().unwrap();
            if let Some(elapsed) = last.map(|t| t.elapsed()) {
                if elapsed < min {
                    self.in_flight.store(false, Ordering::SeqCst);
                    return ReconnectResult::rejected(
                        ReconnectErrorCode::Throttled,
                        format!(
                            "reconnect throttled, try again in {:.1}s",
                            (min - elapsed).as_secs_f64()
                        ),
                    );
                }
            }
        }
        *self.last_attempt.lock().unwrap() = Some(Instant::now());

        if let Some(gate) = &self.retry_gate {
            gate.store(true, Ordering::SeqCst);
        }
        let result = self.run().await;
        if let Some(gate) = &self.retry_gate {
            gate.store(false, Ordering::SeqCst);
        }
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self) -> ReconnectResult {
        let start = Instant::now();
        let mut codes = Vec::new();
        let mut messages: Vec<String> = Vec::new();

        // Teardown is per-service; neither side can abort the other's.
        self.channel.disconnect().await;
        self.store.close().await;

        let channel_ok = match self.channel.connect().await {
            Ok(()) => {
                if await_connected(self.channel.connection_stream(), CONNECTED_EVENT_WAIT).await {
                    true
                } else {
                    codes.push(ReconnectErrorCode::ChannelConnectTimeout);
                    messages.push("channel connected event never arrived".to_string());
                    false
                }
            }
            Err(e) => {
                codes.push(match &e {
                    ChannelError::ConnectTimeout => ReconnectErrorCode::ChannelConnectTimeout,
                    ChannelError::AuthFailed(_) => ReconnectErrorCode::ChannelAuthFailed,
                    _ => ReconnectErrorCode::ChannelUnknown,
                });
                messages.push(e.to_string());
                false
            }
        };

        let store_ok = match self.store.initialize().await {
            Ok(()) => match self.store.health().await {
                Ok(()) => true,
                Err(e) => {
                    codes.push(ReconnectErrorCode::StoreUnhealthy);
                    messages.push(e.to_string());
                    false
                }
            },
            Err(e) => {
                codes.push(ReconnectErrorCode::StoreInitFailed);
                messages.push(e.to_string());
                false
            }
        };

        let result = ReconnectResult {
            channel_ok,
            store_ok,
            elapsed: start.elapsed(),
            error: if messages.is_empty() {
                None
            } else {
                Some(messages.join("; "))
            },
            error_codes: codes,
        };
        info!(
            channel_ok,
            store_ok,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "recovery attempt finished"
        );
        result
    }
}
