//! Reconnect hook fired when a transport link drops or never comes up.
//!
//! The transport does not retry on its own: it waits one backoff step and
//! hands control to the installed [`ReconnectProvider`], which owns
//! credentials, signing and the retry policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pumps::read::LinkEnd;
use crate::transport::ReconnectProvider;
use crate::types::ReconnectConfig;

type ProviderSlot = Arc<Mutex<Option<Arc<dyn ReconnectProvider>>>>;

/// Shared by a transport and every link it spawns.
#[derive(Clone)]
pub(crate) struct ReconnectHook {
    provider: ProviderSlot,
    pending: Arc<Mutex<Option<CancellationToken>>>,
    in_flight: Arc<AtomicBool>,
    config: ReconnectConfig,
}

impl ReconnectHook {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self {
            provider: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    pub(crate) fn set_provider(&self, provider: Option<Arc<dyn ReconnectProvider>>) {
        *lock(&self.provider) = provider;
    }

    pub(crate) fn has_provider(&self) -> bool {
        lock(&self.provider).is_some()
    }

    /// Cancels a reconnect that is still waiting out its delay.
    pub(crate) fn cancel_pending(&self) {
        if let Some(token) = lock(&self.pending).take() {
            token.cancel();
        }
    }

    /// Reacts to a link ending.
    ///
    /// `link_alive` reports whether the transport currently holds an open
    /// link. It is checked after each provider call, so a link that dies
    /// while the attempt that opened it is still running is not lost.
    ///
    /// Returns the spawned reconnect task, if one was started. At most one
    /// runs at a time.
    pub(crate) fn link_lost<F>(&self, end: LinkEnd, link_alive: F) -> Option<JoinHandle<()>>
    where
        F: Fn() -> bool + Send + 'static,
    {
        if !end.is_unexpected() {
            debug!("relay link closed locally");
            return None;
        }

        if !self.has_provider() {
            info!(?end, "relay link lost, no reconnect provider installed");
            return None;
        }

        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!(?end, "reconnect already in flight");
            return None;
        }

        info!(?end, "relay link lost, reconnecting");
        let cancel = self.arm();
        let hook = self.clone();
        Some(tokio::spawn(async move { hook.run(cancel, link_alive).await }))
    }

    /// Installs a fresh cancel token for the next delay.
    fn arm(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        if let Some(old) = lock(&self.pending).replace(cancel.clone()) {
            old.cancel();
        }
        cancel
    }

    /// Drives provider calls until a link stays up, the provider gives up,
    /// or the reconnect is cancelled. Clears `in_flight` on exit.
    async fn run<F>(self, mut cancel: CancellationToken, link_alive: F)
    where
        F: Fn() -> bool,
    {
        loop {
            let Some(provider) = lock(&self.provider).clone() else {
                debug!("reconnect provider removed");
                self.in_flight.store(false, Ordering::Release);
                return;
            };

            let delay = self.config.delay_for_attempt(1);
            debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");

            let waited = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            // Only one task runs at a time, so the slot can only hold ours.
            lock(&self.pending).take();

            if !waited {
                debug!("pending reconnect cancelled");
                self.in_flight.store(false, Ordering::Release);
                return;
            }

            let reconnected = provider.attempt_reconnect().await;
            self.in_flight.store(false, Ordering::Release);
            if !reconnected {
                warn!("relay reconnect gave up");
                return;
            }
            if link_alive() {
                info!("relay reconnected");
                return;
            }

            // The new link already died. A drop reported after the flag was
            // cleared has started its own task.
            if self.in_flight.swap(true, Ordering::AcqRel) {
                return;
            }
            info!("relay link dropped right after reconnect, retrying");
            cancel = self.arm();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Notify;

    use crate::transport::ReconnectFuture;

    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
        gate: Notify,
        fail: bool,
    }

    impl ReconnectProvider for CountingProvider {
        fn attempt_reconnect(&self) -> ReconnectFuture<'_> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.gate.notified().await;
                !self.fail
            })
        }
    }

    fn hook_with(provider: &Arc<CountingProvider>) -> ReconnectHook {
        let hook = ReconnectHook::new(ReconnectConfig::default());
        hook.set_provider(Some(provider.clone() as Arc<dyn ReconnectProvider>));
        hook
    }

    fn alive() -> bool {
        true
    }

    #[tokio::test]
    async fn local_close_does_not_reconnect() {
        let provider = Arc::new(CountingProvider::default());
        let hook = hook_with(&provider);
        assert!(hook.link_lost(LinkEnd::Cancelled, alive).is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_provider_no_reconnect() {
        let hook = ReconnectHook::new(ReconnectConfig::default());
        assert!(!hook.has_provider());
        assert!(hook.link_lost(LinkEnd::Closed, alive).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_drop_invokes_provider_once() {
        let provider = Arc::new(CountingProvider::default());
        let hook = hook_with(&provider);

        let task = hook.link_lost(LinkEnd::Timeout, alive).expect("reconnect spawned");
        // A second drop while the first attempt is in flight is coalesced.
        assert!(hook.link_lost(LinkEnd::Closed, alive).is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        provider.gate.notify_one();
        task.await.unwrap();

        // Once finished, a new drop starts a new attempt.
        let again = hook.link_lost(LinkEnd::Error, alive).expect("reconnect spawned");
        provider.gate.notify_one();
        again.await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_establish_invokes_provider() {
        let provider = Arc::new(CountingProvider::default());
        let hook = hook_with(&provider);

        let task = hook.link_lost(LinkEnd::Refused, alive).expect("reconnect spawned");
        tokio::time::sleep(Duration::from_secs(1)).await;
        provider.gate.notify_one();
        task.await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn link_dying_during_reconnect_is_retried() {
        let provider = Arc::new(CountingProvider::default());
        let hook = hook_with(&provider);

        // The first reconnected link is already gone when the provider
        // returns; the second one stays up.
        let checks = Arc::new(AtomicUsize::new(0));
        let seen = checks.clone();
        let link_alive = move || seen.fetch_add(1, Ordering::SeqCst) >= 1;

        let task = hook.link_lost(LinkEnd::Closed, link_alive).expect("reconnect spawned");

        tokio::time::sleep(Duration::from_secs(1)).await;
        // The dying link reports in while the attempt is still running.
        assert!(hook.link_lost(LinkEnd::Closed, alive).is_none());
        provider.gate.notify_one();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        provider.gate.notify_one();
        task.await.unwrap();

        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert!(!hook.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_giving_up_stops_retrying() {
        let provider = Arc::new(CountingProvider {
            fail: true,
            ..CountingProvider::default()
        });
        let hook = hook_with(&provider);

        let task = hook
            .link_lost(LinkEnd::Closed, || false)
            .expect("reconnect spawned");
        tokio::time::sleep(Duration::from_secs(1)).await;
        provider.gate.notify_one();
        task.await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(!hook.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_skips_provider() {
        let provider = Arc::new(CountingProvider::default());
        let hook = hook_with(&provider);

        let task = hook.link_lost(LinkEnd::Closed, alive).expect("reconnect spawned");
        hook.cancel_pending();
        task.await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(!hook.in_flight.load(Ordering::SeqCst));
    }
}
