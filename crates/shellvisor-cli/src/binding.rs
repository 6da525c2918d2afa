//! Connection binding state machine.
//!
//! `Unbound -> Binding -> Bound`, back to `Unbound` on timeout or failure and
//! to `Disconnected` when an established channel is lost. Any request that
//! finds the machine `Unbound` or `Disconnected` starts a bind; requests that
//! find it `Binding` wait for that same attempt. Only one attempt is ever in
//! flight.
//!
//! Every attempt carries a generation number. Results and loss notifications
//! from an older generation are ignored, so a late connect or a stale loss
//! cannot overwrite a newer state.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// Slack given to waiters beyond the bind timeout before they give up on
/// their own.
const WAIT_MARGIN: Duration = Duration::from_millis(500);

/// Establishes the underlying channel.
pub trait Connector: Send + Sync + 'static {
    /// Handle used to send requests once bound.
    type Link: Clone + Send + Sync + 'static;

    /// Open a channel. The connector must call [`LossHandle::fire`] when the
    /// channel it returned later goes away.
    fn connect(
        &self,
        lost: LossHandle,
    ) -> impl Future<Output = Result<Self::Link, ConnectionError>> + Send;
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Binding,
    Bound,
    Disconnected,
}

enum Phase<L> {
    Unbound { error: Option<ConnectionError> },
    Binding { generation: u64 },
    Bound { link: L, generation: u64 },
    Disconnected,
}

impl<L> Phase<L> {
    const fn state(&self) -> ConnectionState {
        match self {
            Self::Unbound { .. } => ConnectionState::Unbound,
            Self::Binding { .. } => ConnectionState::Binding,
            Self::Bound { .. } => ConnectionState::Bound,
            Self::Disconnected => ConnectionState::Disconnected,
        }
    }
}

struct Shared<L> {
    phase: watch::Sender<Phase<L>>,
    generation: AtomicU64,
}

impl<L> Shared<L> {
    fn mark_lost(&self, generation: u64) {
        let changed = self.phase.send_if_modified(|phase| match phase {
            Phase::Bound { generation: g, .. } if *g == generation => {
                *phase = Phase::Disconnected;
                true
            }
            Phase::Binding { generation: g } if *g == generation => {
                *phase = Phase::Unbound {
                    error: Some(ConnectionError::Lost),
                };
                true
            }
            _ => false,
        });
        if changed {
            info!(generation, "Supervisor channel lost");
        } else {
            debug!(generation, "Ignoring loss of a superseded channel");
        }
    }
}

/// Reports loss of the channel produced by one bind attempt.
#[derive(Clone)]
pub struct LossHandle {
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl LossHandle {
    fn new<L: Send + Sync + 'static>(shared: Weak<Shared<L>>, generation: u64) -> Self {
        Self {
            notify: Arc::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.mark_lost(generation);
                }
            }),
        }
    }

    /// A handle that reports to nobody.
    pub fn detached() -> Self {
        Self {
            notify: Arc::new(|| {}),
        }
    }

    pub fn fire(&self) {
        (self.notify)();
    }
}

impl std::fmt::Debug for LossHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LossHandle").finish_non_exhaustive()
    }
}

/// Owns the connection state for one client.
pub struct Binder<C: Connector> {
    connector: Arc<C>,
    shared: Arc<Shared<C::Link>>,
    bind_timeout: Duration,
}

impl<C: Connector> Binder<C> {
    pub fn new(connector: C, bind_timeout: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Unbound { error: None });
        Self {
            connector: Arc::new(connector),
            shared: Arc::new(Shared {
                phase,
                generation: AtomicU64::new(0),
            }),
            bind_timeout,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub const fn bind_timeout(&self) -> Duration {
        self.bind_timeout
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.phase.borrow().state()
    }

    /// Return the bound link, binding first if needed.
    ///
    /// Waits at most about the bind timeout. Concurrent callers share one
    /// attempt and all see its outcome.
    pub async fn ensure_bound(&self) -> Result<C::Link, ConnectionError> {
        let mut started = None;
        self.shared.phase.send_if_modified(|phase| match phase {
            Phase::Unbound { .. } | Phase::Disconnected => {
                let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *phase = Phase::Binding { generation };
                started = Some(generation);
                true
            }
            Phase::Binding { .. } | Phase::Bound { .. } => false,
        });
        if let Some(generation) = started {
            self.spawn_bind(generation);
        }

        let mut rx = self.shared.phase.subscribe();
        let settled = tokio::time::timeout(
            self.bind_timeout + WAIT_MARGIN,
            rx.wait_for(|phase| !matches!(phase, Phase::Binding { .. })),
        )
        .await;

        match settled {
            Ok(Ok(phase)) => match &*phase {
                Phase::Bound { link, .. } => Ok(link.clone()),
                Phase::Unbound { error: Some(error) } => Err(error.clone()),
                Phase::Unbound { error: None } | Phase::Disconnected | Phase::Binding { .. } => {
                    Err(ConnectionError::Lost)
                }
            },
            Ok(Err(_)) => Err(ConnectionError::Lost),
            Err(_) => {
                let error = ConnectionError::BindTimeout(self.bind_timeout);
                self.shared.phase.send_if_modified(|phase| {
                    if matches!(phase, Phase::Binding { .. }) {
                        *phase = Phase::Unbound {
                            error: Some(error.clone()),
                        };
                        true
                    } else {
                        false
                    }
                });
                Err(error)
            }
        }
    }

    fn spawn_bind(&self, generation: u64) {
        let connector = Arc::clone(&self.connector);
        let shared = Arc::clone(&self.shared);
        let bind_timeout = self.bind_timeout;
        debug!(generation, "Binding to supervisor");

        tokio::spawn(async move {
            let lost = LossHandle::new(Arc::downgrade(&shared), generation);
            let outcome = match tokio::time::timeout(bind_timeout, connector.connect(lost)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ConnectionError::BindTimeout(bind_timeout)),
            };

            let ok = outcome.is_ok();
            let applied = shared.phase.send_if_modified(|phase| {
                if !matches!(phase, Phase::Binding { generation: g } if *g == generation) {
                    return false;
                }
                *phase = match outcome {
                    Ok(link) => Phase::Bound { link, generation },
                    Err(error) => {
                        warn!(generation, error = %error, "Bind failed");
                        Phase::Unbound { error: Some(error) }
                    }
                };
                true
            });

            if !applied {
                debug!(generation, "Discarding result of superseded bind");
            } else if ok {
                info!(generation, "Bound to supervisor");
            }
        });
    }

    /// Drop the current channel, whatever the state. Returns the link if one
    /// was bound.
    pub fn unbind(&self) -> Option<C::Link> {
        match self.shared.phase.send_replace(Phase::Unbound { error: None }) {
            Phase::Bound { link, .. } => Some(link),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    enum Mode {
        Immediate,
        Gated(Arc<Notify>),
        HangFirst,
        Fail(ConnectionError),
    }

    struct FakeConnector {
        mode: Mode,
        attempts: AtomicUsize,
        losses: Mutex<Vec<LossHandle>>,
    }

    impl FakeConnector {
        fn new(mode: Mode) -> Self {
            Self {
                mode,
                attempts: AtomicUsize::new(0),
                losses: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn loss(&self, attempt: usize) -> LossHandle {
            self.losses.lock().unwrap()[attempt - 1].clone()
        }
    }

    impl Connector for FakeConnector {
        type Link = usize;

        async fn connect(&self, lost: LossHandle) -> Result<usize, ConnectionError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.losses.lock().unwrap().push(lost);
            match &self.mode {
                Mode::Immediate => {}
                Mode::Gated(gate) => gate.notified().await,
                Mode::HangFirst if attempt == 1 => std::future::pending::<()>().await,
                Mode::HangFirst => {}
                Mode::Fail(error) => return Err(error.clone()),
            }
            Ok(attempt)
        }
    }

    fn binder(mode: Mode, timeout: Duration) -> Arc<Binder<FakeConnector>> {
        Arc::new(Binder::new(FakeConnector::new(mode), timeout))
    }

    #[tokio::test]
    async fn starts_unbound() {
        let b = binder(Mode::Immediate, Duration::from_secs(1));
        assert_eq!(b.state(), ConnectionState::Unbound);
        assert_eq!(b.connector().attempts(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_attempt() {
        let gate = Arc::new(Notify::new());
        let b = binder(Mode::Gated(Arc::clone(&gate)), Duration::from_secs(5));

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let b = Arc::clone(&b);
                tokio::spawn(async move { b.ensure_bound().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.state(), ConnectionState::Binding);
        gate.notify_one();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(1));
        }
        assert_eq!(b.connector().attempts(), 1);
        assert_eq!(b.state(), ConnectionState::Bound);
    }

    #[tokio::test]
    async fn binding_while_bound_is_a_no_op() {
        let b = binder(Mode::Immediate, Duration::from_secs(1));
        assert_eq!(b.ensure_bound().await, Ok(1));
        assert_eq!(b.ensure_bound().await, Ok(1));
        assert_eq!(b.connector().attempts(), 1);
    }

    #[tokio::test]
    async fn timeout_returns_to_unbound_and_allows_retry() {
        let b = binder(Mode::HangFirst, Duration::from_millis(100));

        let first = Arc::clone(&b);
        let second = Arc::clone(&b);
        let (r1, r2) = tokio::join!(first.ensure_bound(), second.ensure_bound());
        assert!(matches!(r1, Err(ConnectionError::BindTimeout(_))));
        assert!(matches!(r2, Err(ConnectionError::BindTimeout(_))));
        assert_eq!(b.state(), ConnectionState::Unbound);

        assert_eq!(b.ensure_bound().await, Ok(2));
        assert_eq!(b.connector().attempts(), 2);
    }

    #[tokio::test]
    async fn connect_failure_reaches_every_waiter() {
        let error = ConnectionError::ConnectFailed("refused".into());
        let b = binder(Mode::Fail(error.clone()), Duration::from_secs(1));

        let (r1, r2) = tokio::join!(b.ensure_bound(), b.ensure_bound());
        assert_eq!(r1, Err(error.clone()));
        assert_eq!(r2, Err(error));
        assert_eq!(b.state(), ConnectionState::Unbound);
    }

    #[tokio::test]
    async fn loss_disconnects_and_next_request_rebinds() {
        let b = binder(Mode::Immediate, Duration::from_secs(1));
        assert_eq!(b.ensure_bound().await, Ok(1));

        b.connector().loss(1).fire();
        assert_eq!(b.state(), ConnectionState::Disconnected);

        assert_eq!(b.ensure_bound().await, Ok(2));
        assert_eq!(b.state(), ConnectionState::Bound);
    }

    #[tokio::test]
    async fn stale_loss_is_ignored() {
        let b = binder(Mode::Immediate, Duration::from_secs(1));
        b.ensure_bound().await.unwrap();
        b.connector().loss(1).fire();
        b.ensure_bound().await.unwrap();

        b.connector().loss(1).fire();
        assert_eq!(b.state(), ConnectionState::Bound);
    }

    #[tokio::test]
    async fn unbind_hands_back_link() {
        let b = binder(Mode::Immediate, Duration::from_secs(1));
        assert_eq!(b.unbind(), None);

        b.ensure_bound().await.unwrap();
        assert_eq!(b.unbind(), Some(1));
        assert_eq!(b.state(), ConnectionState::Unbound);
    }

    #[test]
    fn detached_loss_handle_is_inert() {
        LossHandle::detached().fire();
    }
}
