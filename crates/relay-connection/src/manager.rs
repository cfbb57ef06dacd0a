//! Connection manager keeping one logical relay connection alive.
//!
//! Before every connect the stored credentials are checked for expiry and,
//! if needed, refreshed through the federated identity. The manager is the
//! transport's reconnect provider; concurrent reconnect triggers share one
//! in-flight attempt. A relay that stays unreachable past the retry budget
//! gets another round later, until it connects, needs a new login, or the
//! config is cleared.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use meshrelay_protocol::AuthRequiredNotice;

use crate::refresher::{CredentialRefresher, RefreshError};
use crate::signer::{DEFAULT_EXPIRES_SECS, SignError, presign_url};
use crate::store::{ConfigStore, StoreError};
use crate::transport::{ReconnectFuture, ReconnectProvider, RelayTransport, TransportError};
use crate::types::{
    CONNECT_TIMEOUT, ConnectionEvent, ConnectionState, Credentials, REFRESH_TIMEOUT,
    ReconnectConfig, RelayEndpointConfig,
};

/// Errors from a connect or reconnect attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no relay endpoint configured")]
    NoConfig,

    #[error("credentials expired and could not be refreshed: {0}")]
    AuthRequired(#[source] RefreshError),

    #[error("cannot sign relay URL: {0}")]
    Sign(#[from] SignError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("config store error: {0}")]
    Store(#[from] StoreError),

    #[error("attempt superseded")]
    Cancelled,
}

/// Tuning for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Backoff between transport retries within one attempt.
    pub reconnect: ReconnectConfig,
    /// Validity window encoded into each presigned URL.
    pub presign_expires_secs: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            presign_expires_secs: DEFAULT_EXPIRES_SECS,
        }
    }
}

/// Keeps one authenticated relay connection alive.
pub struct ConnectionManager {
    store: Arc<dyn ConfigStore>,
    refresher: Arc<dyn CredentialRefresher>,
    transport: Arc<dyn RelayTransport>,
    config: ManagerConfig,
    state: RwLock<ConnectionState>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    /// Serializes expiry-check, refresh and connect.
    attempt_lock: Mutex<()>,
    /// Number of finished attempts; lets a waiter detect that it was coalesced.
    completed: AtomicU64,
    last_outcome: AtomicBool,
    /// Transport connects issued so far, and the one that produced the
    /// current link.
    connects: AtomicU64,
    last_connect: AtomicU64,
    /// Bumped by `connect` and `clear`; attempts from an older epoch are discarded.
    epoch: AtomicU64,
    /// Epoch a background retry is scheduled for, 0 if none.
    retry_epoch: AtomicU64,
    /// Guards store writes and provider registration against `clear`.
    lifecycle: Mutex<()>,
    this: Weak<Self>,
}

impl ConnectionManager {
    /// Creates a manager with default tuning.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        refresher: Arc<dyn CredentialRefresher>,
        transport: Arc<dyn RelayTransport>,
    ) -> Arc<Self> {
        Self::with_config(store, refresher, transport, ManagerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ConfigStore>,
        refresher: Arc<dyn CredentialRefresher>,
        transport: Arc<dyn RelayTransport>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Arc::new_cyclic(|this| Self {
            store,
            refresher,
            transport,
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            attempt_lock: Mutex::new(()),
            completed: AtomicU64::new(0),
            last_outcome: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            last_connect: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            retry_epoch: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
            this: this.clone(),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Returns the persisted endpoint config, if any.
    pub fn config(&self) -> Option<RelayEndpointConfig> {
        self.store.load()
    }

    /// Persists `config`, becomes the transport's reconnect provider and
    /// connects.
    ///
    /// Supersedes any attempt already in flight.
    pub async fn connect(&self, config: RelayEndpointConfig) -> Result<(), ConnectError> {
        let epoch = {
            let _guard = self.lifecycle.lock().await;
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            let record = config.clone();
            self.store_write(move |store| store.save(&record)).await?;
            self.install_provider();
            epoch
        };
        info!(resource = %config.resource_id, region = %config.region, "connecting relay endpoint");

        let _attempt = self.attempt_lock.lock().await;
        let result = self.renew_and_connect(epoch).await;
        self.finish_attempt(result.is_ok());
        result
    }

    /// Reconnects using the stored config.
    ///
    /// If an attempt is already running, waits for it and returns its
    /// outcome instead of starting another. A successful attempt only
    /// counts if its link was opened after this call began; an older link
    /// may be the one that just dropped.
    pub async fn attempt_reconnect(&self) -> bool {
        let seen = self.completed.load(Ordering::Acquire);
        let seen_connects = self.connects.load(Ordering::Acquire);
        let _attempt = self.attempt_lock.lock().await;
        if self.completed.load(Ordering::Acquire) != seen {
            let ok = self.last_outcome.load(Ordering::Acquire);
            if !ok || self.last_connect.load(Ordering::Acquire) > seen_connects {
                debug!("reconnect coalesced with the attempt that just finished");
                return ok;
            }
            debug!("finished attempt's link predates this trigger, reconnecting");
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let ok = match self.renew_and_connect(epoch).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "reconnect attempt failed");
                false
            }
        };
        self.finish_attempt(ok);
        ok
    }

    /// Connects with a previously stored config, if there is one.
    ///
    /// Returns `false` without doing anything when nothing is stored.
    pub async fn resume(&self) -> bool {
        {
            let _guard = self.lifecycle.lock().await;
            if self.store.load().is_none() {
                return false;
            }
            self.install_provider();
        }
        info!("resuming stored relay endpoint");
        self.attempt_reconnect().await
    }

    /// Forgets the stored config and stops reconnecting.
    ///
    /// An attempt in flight finishes its current network call, but its
    /// result is discarded.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let result = {
            let _guard = self.lifecycle.lock().await;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            self.transport.set_reconnect_provider(None);
            self.store_write(|store| store.clear()).await
        };
        self.force_state(ConnectionState::Disconnected).await;
        info!("relay endpoint cleared");
        result
    }

    fn install_provider(&self) {
        let provider: Arc<dyn ReconnectProvider> = Arc::new(ProviderHandle(self.this.clone()));
        self.transport.set_reconnect_provider(Some(provider));
    }

    /// Runs a store write on the blocking pool; file-backed stores do
    /// synchronous I/O.
    async fn store_write<F>(&self, op: F) -> Result<(), StoreError>
    where
        F: FnOnce(&dyn ConfigStore) -> Result<(), StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&*store))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    fn finish_attempt(&self, ok: bool) {
        self.last_outcome.store(ok, Ordering::Release);
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), ConnectError> {
        if self.epoch.load(Ordering::Acquire) == epoch {
            Ok(())
        } else {
            Err(ConnectError::Cancelled)
        }
    }

    /// Runs connect attempts until one succeeds, a non-retryable error
    /// occurs, or the retry budget is spent. A spent budget schedules
    /// another round in the background.
    async fn renew_and_connect(&self, epoch: u64) -> Result<(), ConnectError> {
        let max_attempts = self.config.reconnect.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match self.connect_once(epoch).await {
                Ok(()) => {
                    self.set_state(epoch, ConnectionState::Connected).await;
                    info!(attempt, "relay connected");
                    return Ok(());
                }
                Err(e) => e,
            };

            match err {
                ConnectError::Transport(e) if attempt < max_attempts => {
                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "relay connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    self.ensure_current(epoch)?;
                }
                ConnectError::Cancelled => return Err(ConnectError::Cancelled),
                ConnectError::AuthRequired(e) => return Err(ConnectError::AuthRequired(e)),
                ConnectError::Transport(e) => {
                    warn!(attempt, error = %e, "relay unreachable, retry budget spent");
                    self.set_state(epoch, ConnectionState::Disconnected).await;
                    self.schedule_retry(epoch);
                    return Err(ConnectError::Transport(e));
                }
                other => {
                    warn!(attempt, error = %other, "relay connect aborted");
                    self.set_state(epoch, ConnectionState::Disconnected).await;
                    return Err(other);
                }
            }
        }
    }

    /// One expiry check, optional refresh, sign and transport connect.
    async fn connect_once(&self, epoch: u64) -> Result<(), ConnectError> {
        let mut config = self.store.load().ok_or(ConnectError::NoConfig)?;
        self.set_state(epoch, ConnectionState::Connecting).await;

        if config.credentials.is_expired_at(Utc::now()) {
            info!("relay credentials expired, refreshing");
            let refreshed = self.refresh(&config).await;
            self.ensure_current(epoch)?;
            match refreshed {
                Ok(credentials) => {
                    config.credentials = credentials;
                    self.persist(epoch, &config).await;
                }
                Err(e) => {
                    warn!(error = %e, "credential refresh failed, re-login required");
                    self.set_state(epoch, ConnectionState::AuthRequired).await;
                    self.emit(ConnectionEvent::AuthRequired(
                        AuthRequiredNotice::credentials_expired(),
                    ));
                    return Err(ConnectError::AuthRequired(e));
                }
            }
        }

        let url = presign_url(
            &config.credentials,
            &config.region,
            &config.resource_id,
            self.config.presign_expires_secs,
        )?;

        let seq = self.connects.fetch_add(1, Ordering::AcqRel) + 1;
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, self.transport.connect(&url)).await;
        self.ensure_current(epoch)?;
        match connected {
            Ok(Ok(())) => {
                self.last_connect.store(seq, Ordering::Release);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::Timeout.into()),
        }
    }

    /// Starts another reconnect round after a pause, unless `connect` or
    /// `clear` moves on to a new epoch first.
    fn schedule_retry(&self, epoch: u64) {
        if self.retry_epoch.swap(epoch, Ordering::AcqRel) == epoch {
            return;
        }
        let this = self.this.clone();
        let delay = self
            .config
            .reconnect
            .delay_for_attempt(self.config.reconnect.max_attempts.saturating_add(1));
        info!(delay_ms = delay.as_millis() as u64, "scheduling relay reconnect");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            let _ = manager
                .retry_epoch
                .compare_exchange(epoch, 0, Ordering::AcqRel, Ordering::Acquire);
            if manager.ensure_current(epoch).is_err() {
                debug!("scheduled reconnect superseded");
                return;
            }
            if manager.state().await == ConnectionState::Connected {
                return;
            }
            manager.attempt_reconnect().await;
        });
    }

    async fn refresh(&self, config: &RelayEndpointConfig) -> Result<Credentials, RefreshError> {
        let identity = config
            .federated_identity()
            .ok_or(RefreshError::NoFederatedIdentity)?;
        // Two sequential round-trips, each bounded by REFRESH_TIMEOUT.
        tokio::time::timeout(REFRESH_TIMEOUT * 2, self.refresher.refresh(&identity))
            .await
            .unwrap_or(Err(RefreshError::Timeout))
    }

    /// Saves refreshed credentials unless the attempt was superseded.
    ///
    /// A failed write is logged; the fresh credentials are still used.
    async fn persist(&self, epoch: u64, config: &RelayEndpointConfig) {
        let _guard = self.lifecycle.lock().await;
        if self.ensure_current(epoch).is_err() {
            return;
        }
        let record = config.clone();
        if let Err(e) = self.store_write(move |store| store.save(&record)).await {
            warn!(error = %e, "failed to persist refreshed credentials");
        }
    }

    /// Updates the state unless the attempt was superseded.
    async fn set_state(&self, epoch: u64, new_state: ConnectionState) {
        let mut state = self.state.write().await;
        if self.ensure_current(epoch).is_err() || *state == new_state {
            return;
        }
        debug!(from = ?*state, to = ?new_state, "relay state changed");
        *state = new_state;
        self.emit(ConnectionEvent::StateChanged(new_state));
    }

    async fn force_state(&self, new_state: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != new_state {
            *state = new_state;
            self.emit(ConnectionEvent::StateChanged(new_state));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!("connection event dropped: {e}");
        }
    }
}

/// Registered with the transport. Holds the manager weakly so the
/// transport does not keep it alive.
struct ProviderHandle(Weak<ConnectionManager>);

impl ReconnectProvider for ProviderHandle {
    fn attempt_reconnect(&self) -> ReconnectFuture<'_> {
        Box::pin(async move {
            match self.0.upgrade() {
                Some(manager) => manager.attempt_reconnect().await,
                None => false,
            }
        })
    }
}
