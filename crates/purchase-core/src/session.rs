//! Payment Session Controller
//!
//! Owns one purchase attempt from intent creation to a terminal outcome.
//!
//! ```text
//! IDLE ─initiate─▶ INITIATING ─intent─▶ AWAITING_PAYMENT ─┬─▶ SUCCEEDED
//!                       │                     │           ├─▶ FAILED
//!                       └──────error──────────┼──────────▶├─▶ TIMED_OUT
//!                                             └─abandon──▶└─▶ ABANDONED
//! ```
//!
//! While awaiting payment two timers are armed: the poll interval and the
//! overall timeout. Every asynchronous resumption point (tick, poll response,
//! timeout) re-checks that its session generation is still the live one
//! before touching state, so work scheduled for a finished session is a no-op.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{GatewayError, SessionError};
use crate::gateway::{CreateIntentRequest, PaymentGateway};
use crate::license::{IssuedLicense, LicenseIssuer};
use crate::order::{OrderContext, PaymentIntent, PaymentStatus};

/// Interval between status queries
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Time allowed for the user to pay, measured from AWAITING_PAYMENT
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Session timing configuration
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub poll_interval: Duration,

    pub timeout: Duration,

    /// Ask the gateway to release the intent when the timeout fires
    pub cancel_on_timeout: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            timeout: SESSION_TIMEOUT,
            cancel_on_timeout: true,
        }
    }
}

/// Controller state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Initiating,
    AwaitingPayment,
    Succeeded,
    Failed,
    TimedOut,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded
                | SessionState::Failed
                | SessionState::TimedOut
                | SessionState::Abandoned
        )
    }

    /// States in which gateway work may still be scheduled
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Initiating | SessionState::AwaitingPayment)
    }
}

/// Terminal result surfaced to the presentation layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionOutcome {
    Succeeded { license: IssuedLicense },
    Failed { reason: String },
    TimedOut,
    Abandoned,
}

/// What the presentation layer renders
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub intent: Option<PaymentIntent>,

    /// Set once the session is fully finished (after issuance on success)
    pub outcome: Option<SessionOutcome>,
}

#[derive(Default)]
struct Timers {
    poll: Option<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
}

impl Timers {
    fn armed(&self) -> usize {
        [&self.poll, &self.timeout]
            .into_iter()
            .flatten()
            .filter(|h| !h.is_finished())
            .count()
    }

    fn take(&mut self) -> (Option<JoinHandle<()>>, Option<JoinHandle<()>>) {
        (self.poll.take(), self.timeout.take())
    }
}

struct Inner {
    state: SessionState,
    generation: u64,
    order: Option<OrderContext>,
    intent: Option<PaymentIntent>,
    deadline: Option<Instant>,
    timers: Timers,
    polls_sent: u64,
    freshest_poll: u64,
    outcome: Option<SessionOutcome>,
}

impl Inner {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            intent: self.intent.clone(),
            outcome: self.outcome.clone(),
        }
    }

    fn reference(&self) -> Option<String> {
        self.intent.as_ref().map(|i| i.external_reference.clone())
    }

    /// Succeeded but the license is still being issued
    fn issuing(&self) -> bool {
        self.state == SessionState::Succeeded && self.outcome.is_none()
    }

    fn finish(&mut self, state: SessionState, outcome: Option<SessionOutcome>) {
        self.state = state;
        self.outcome = outcome;
        self.deadline = None;
    }
}

/// Result of applying one poll response
enum Observation {
    /// Keep polling
    Continue,

    /// Session is over for this poller
    Stop,

    /// Payment confirmed; this poller owns issuance
    Paid { order: OrderContext, reference: String },
}

struct Shared {
    inner: Mutex<Inner>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl Shared {
    fn new() -> Self {
        let inner = Inner {
            state: SessionState::Idle,
            generation: 0,
            order: None,
            intent: None,
            deadline: None,
            timers: Timers::default(),
            polls_sent: 0,
            freshest_poll: 0,
            outcome: None,
        };
        let (snapshots, _) = watch::channel(inner.snapshot());

        Self {
            inner: Mutex::new(inner),
            snapshots,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.snapshots.send_replace(inner.snapshot());
    }

    fn awaiting(inner: &Inner, generation: u64) -> bool {
        inner.generation == generation && inner.state == SessionState::AwaitingPayment
    }

    /// Reserve a sequence number for the next status query
    fn begin_poll(&self, generation: u64) -> Option<u64> {
        let mut inner = self.lock();
        if !Self::awaiting(&inner, generation) {
            return None;
        }

        inner.polls_sent += 1;
        Some(inner.polls_sent)
    }

    fn observe(
        &self,
        generation: u64,
        seq: u64,
        result: Result<PaymentStatus, GatewayError>,
    ) -> Observation {
        let mut inner = self.lock();
        if !Self::awaiting(&inner, generation) {
            tracing::debug!(generation, seq, "Discarding poll response for finished session");
            return Observation::Stop;
        }

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(generation, seq, error = %e, "Status query failed, will retry");
                return Observation::Continue;
            }
        };

        if seq < inner.freshest_poll {
            tracing::debug!(generation, seq, freshest = inner.freshest_poll, "Ignoring stale poll response");
            return Observation::Continue;
        }
        inner.freshest_poll = seq;

        match status {
            PaymentStatus::Pending => Observation::Continue,
            PaymentStatus::Success => {
                // The poll task is the caller; detach its handle instead of aborting it.
                let (_poll, timeout) = inner.timers.take();
                if let Some(timeout) = timeout {
                    timeout.abort();
                }
                inner.finish(SessionState::Succeeded, None);
                self.publish(&inner);

                match (inner.order.clone(), inner.reference()) {
                    (Some(order), Some(reference)) => {
                        tracing::info!(generation, reference = %reference, "Payment confirmed");
                        Observation::Paid { order, reference }
                    }
                    _ => Observation::Stop,
                }
            }
            PaymentStatus::Failed => {
                let (_poll, timeout) = inner.timers.take();
                if let Some(timeout) = timeout {
                    timeout.abort();
                }
                inner.finish(
                    SessionState::Failed,
                    Some(SessionOutcome::Failed {
                        reason: "Payment failed, please try again".into(),
                    }),
                );
                self.publish(&inner);
                tracing::warn!(generation, reference = ?inner.reference(), "Gateway reported payment failure");
                Observation::Stop
            }
        }
    }

    /// Apply the timeout. Returns the intent reference if it fired.
    fn time_out(&self, generation: u64) -> Option<String> {
        let mut inner = self.lock();
        if !Self::awaiting(&inner, generation) {
            return None;
        }

        let (poll, _timeout) = inner.timers.take();
        if let Some(poll) = poll {
            poll.abort();
        }
        inner.finish(SessionState::TimedOut, Some(SessionOutcome::TimedOut));
        self.publish(&inner);
        inner.reference()
    }

    fn complete_issuance(&self, generation: u64, license: IssuedLicense) {
        let mut inner = self.lock();
        if inner.generation != generation || !inner.issuing() {
            return;
        }

        inner.outcome = Some(SessionOutcome::Succeeded { license });
        self.publish(&inner);
    }

    /// Move a live session to ABANDONED, stopping all scheduled work first.
    /// Returns `None` if nothing was live, otherwise the intent to release.
    fn abandon(&self) -> Option<Option<String>> {
        let mut inner = self.lock();
        if !inner.state.is_live() {
            return None;
        }

        let (poll, timeout) = inner.timers.take();
        for timer in [poll, timeout].into_iter().flatten() {
            timer.abort();
        }
        inner.finish(SessionState::Abandoned, Some(SessionOutcome::Abandoned));
        self.publish(&inner);
        Some(inner.reference())
    }
}

struct PollTask {
    shared: Arc<Shared>,
    gateway: Arc<dyn PaymentGateway>,
    issuer: Arc<LicenseIssuer>,
    generation: u64,
    reference: String,
    interval: Duration,
}

impl PollTask {
    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(seq) = self.shared.begin_poll(self.generation) else {
                        return;
                    };
                    let gateway = Arc::clone(&self.gateway);
                    let reference = self.reference.clone();
                    in_flight.push(async move { (seq, gateway.query_status(&reference).await) });
                }
                Some((seq, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    match self.shared.observe(self.generation, seq, result) {
                        Observation::Continue => {}
                        Observation::Stop => return,
                        Observation::Paid { order, reference } => {
                            let license = self.issuer.issue(&order, &reference).await;
                            self.shared.complete_issuance(self.generation, license);
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn release_intent(gateway: &dyn PaymentGateway, reference: &str) {
    match gateway.cancel_intent(reference).await {
        Ok(()) => tracing::info!(reference = %reference, "Released payment intent"),
        Err(e) => tracing::warn!(reference = %reference, error = %e, "Failed to release payment intent"),
    }
}

/// Payment Session Controller
pub struct SessionController {
    gateway: Arc<dyn PaymentGateway>,
    issuer: Arc<LicenseIssuer>,
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(gateway: Arc<dyn PaymentGateway>, issuer: Arc<LicenseIssuer>) -> Self {
        Self::with_config(gateway, issuer, SessionConfig::default())
    }

    pub fn with_config(
        gateway: Arc<dyn PaymentGateway>,
        issuer: Arc<LicenseIssuer>,
        config: SessionConfig,
    ) -> Self {
        Self {
            gateway,
            issuer,
            config,
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.lock().snapshot()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// When the running session times out, if one is awaiting payment
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.lock().deadline
    }

    /// Number of live timers (0, or 2 while awaiting payment)
    pub fn armed_timers(&self) -> usize {
        self.shared.lock().timers.armed()
    }

    /// Start a purchase attempt
    ///
    /// Rejected while another attempt is live. Any terminal state is
    /// implicitly reset, so FAILED and TIMED_OUT sessions can be retried.
    pub async fn initiate(&self, order: OrderContext) -> Result<PaymentIntent, SessionError> {
        let generation = {
            let mut inner = self.shared.lock();
            if inner.state.is_live() || inner.issuing() {
                return Err(SessionError::AlreadyActive);
            }

            inner.generation += 1;
            inner.state = SessionState::Initiating;
            inner.order = Some(order.clone());
            inner.intent = None;
            inner.outcome = None;
            inner.deadline = None;
            inner.polls_sent = 0;
            inner.freshest_poll = 0;
            self.shared.publish(&inner);
            inner.generation
        };

        tracing::info!(
            generation,
            gateway = self.gateway.name(),
            tier = %order.tier().as_str(),
            months = order.duration_months(),
            amount = order.amount_minor_units(),
            "Creating payment intent"
        );
        let result = self
            .gateway
            .create_intent(&CreateIntentRequest::for_order(&order))
            .await;

        match self.arm(generation, result) {
            Ok(intent) => Ok(intent),
            Err((err, Some(reference))) => {
                tracing::info!(generation, reference = %reference, "Intent created after abandon");
                release_intent(self.gateway.as_ref(), &reference).await;
                Err(err)
            }
            Err((err, None)) => Err(err),
        }
    }

    /// Apply the create-intent result and arm both timers on success.
    /// On error, also returns an orphaned intent that must be released.
    fn arm(
        &self,
        generation: u64,
        result: Result<PaymentIntent, GatewayError>,
    ) -> Result<PaymentIntent, (SessionError, Option<String>)> {
        let mut inner = self.shared.lock();
        if inner.generation != generation || inner.state != SessionState::Initiating {
            let orphan = result.ok().map(|intent| intent.external_reference);
            return Err((SessionError::Abandoned, orphan));
        }

        let intent = match result {
            Ok(intent) => intent,
            Err(e) => {
                inner.finish(
                    SessionState::Failed,
                    Some(SessionOutcome::Failed {
                        reason: e.user_message().into(),
                    }),
                );
                self.shared.publish(&inner);
                tracing::error!(generation, error = %e, "Failed to create payment intent");
                return Err((e.into(), None));
            }
        };

        let deadline = Instant::now() + self.config.timeout;
        inner.state = SessionState::AwaitingPayment;
        inner.intent = Some(intent.clone());
        inner.deadline = Some(deadline);
        inner.timers.poll = Some(tokio::spawn(
            PollTask {
                shared: Arc::clone(&self.shared),
                gateway: Arc::clone(&self.gateway),
                issuer: Arc::clone(&self.issuer),
                generation,
                reference: intent.external_reference.clone(),
                interval: self.config.poll_interval,
            }
            .run(),
        ));
        inner.timers.timeout = Some(tokio::spawn(Self::timeout_timer(
            Arc::clone(&self.shared),
            self.config.cancel_on_timeout.then(|| Arc::clone(&self.gateway)),
            generation,
            deadline,
        )));
        self.shared.publish(&inner);

        tracing::info!(
            generation,
            reference = %intent.external_reference,
            timeout_secs = self.config.timeout.as_secs(),
            "Awaiting payment"
        );
        Ok(intent)
    }

    async fn timeout_timer(
        shared: Arc<Shared>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        generation: u64,
        deadline: Instant,
    ) {
        tokio::time::sleep_until(deadline).await;

        let Some(reference) = shared.time_out(generation) else {
            return;
        };
        tracing::warn!(generation, reference = %reference, "Payment session timed out");

        if let Some(gateway) = gateway {
            release_intent(gateway.as_ref(), &reference).await;
        }
    }

    /// User-initiated abandonment
    ///
    /// Returns `false` if no session was live. The local transition always
    /// happens; a failing cancel call is only logged.
    pub async fn abandon(&self) -> bool {
        let Some(reference) = self.shared.abandon() else {
            return false;
        };
        tracing::info!(reference = ?reference, "Payment session abandoned");

        if let Some(reference) = reference {
            release_intent(self.gateway.as_ref(), &reference).await;
        }
        true
    }

    /// Wait until the current session reaches its final outcome
    pub async fn wait_for_outcome(&self) -> SessionOutcome {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|s| s.outcome.is_some()).await;

        match result {
            Ok(snapshot) => snapshot.outcome.clone().unwrap_or(SessionOutcome::Abandoned),
            Err(_) => SessionOutcome::Abandoned,
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let Some(reference) = self.shared.abandon() else {
            return;
        };
        tracing::info!(reference = ?reference, "Payment session dropped while live");

        if let (Some(reference), Ok(runtime)) = (reference, tokio::runtime::Handle::try_current()) {
            let gateway = Arc::clone(&self.gateway);
            runtime.spawn(async move {
                release_intent(gateway.as_ref(), &reference).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, IssuanceError, Result as GatewayResult};
    use crate::license::{LicenseBackend, LicenseOrigin, LicenseRequest, LicenseResponse};
    use crate::order::Tier;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::AbortHandle;

    struct FakeGateway {
        start: Instant,
        create_delay: Duration,
        create_error: Option<GatewayError>,
        query_delay: Duration,
        statuses: Mutex<VecDeque<GatewayResult<PaymentStatus>>>,
        cancel_error: Option<GatewayError>,
        query_times: Mutex<Vec<Duration>>,
        cancels: Mutex<Vec<String>>,
        timer_tasks: Mutex<Vec<AbortHandle>>,
        timers_finished_at_cancel: Mutex<Vec<bool>>,
    }

    impl FakeGateway {
        fn new() -> Self {
            Self {
                start: Instant::now(),
                create_delay: Duration::ZERO,
                create_error: None,
                query_delay: Duration::ZERO,
                statuses: Mutex::new(VecDeque::new()),
                cancel_error: None,
                query_times: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                timer_tasks: Mutex::new(Vec::new()),
                timers_finished_at_cancel: Mutex::new(Vec::new()),
            }
        }

        fn with_statuses(self, statuses: Vec<GatewayResult<PaymentStatus>>) -> Self {
            *self.statuses.lock().unwrap() = statuses.into();
            self
        }

        fn queries(&self) -> Vec<Duration> {
            self.query_times.lock().unwrap().clone()
        }

        fn cancels(&self) -> Vec<String> {
            self.cancels.lock().unwrap().clone()
        }

        /// Track the running session's timer tasks
        fn watch_timers(&self, controller: &SessionController) {
            let inner = controller.shared.lock();
            let handles: Vec<AbortHandle> = [&inner.timers.poll, &inner.timers.timeout]
                .into_iter()
                .flatten()
                .map(JoinHandle::abort_handle)
                .collect();
            *self.timer_tasks.lock().unwrap() = handles;
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_intent(&self, request: &CreateIntentRequest) -> GatewayResult<PaymentIntent> {
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            if let Some(e) = &self.create_error {
                return Err(e.clone());
            }

            Ok(PaymentIntent {
                external_reference: format!("T{}", request.amount_minor_units),
                redeemable_payload: "weixin://wxpay/bizpayurl?pr=abc".into(),
                qr_image: None,
                created_at: Utc::now(),
            })
        }

        async fn query_status(&self, _reference: &str) -> GatewayResult<PaymentStatus> {
            self.query_times.lock().unwrap().push(self.start.elapsed());
            let next = self.statuses.lock().unwrap().pop_front();
            if !self.query_delay.is_zero() {
                tokio::time::sleep(self.query_delay).await;
            }
            next.unwrap_or(Ok(PaymentStatus::Pending))
        }

        async fn cancel_intent(&self, reference: &str) -> GatewayResult<()> {
            if !self.timer_tasks.lock().unwrap().is_empty() {
                // Let the runtime reap aborted tasks before looking at them.
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
                let finished = self
                    .timer_tasks
                    .lock()
                    .unwrap()
                    .iter()
                    .all(AbortHandle::is_finished);
                self.timers_finished_at_cancel.lock().unwrap().push(finished);
            }
            self.cancels.lock().unwrap().push(reference.to_string());
            match &self.cancel_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl LicenseBackend for CountingBackend {
        async fn generate(&self, request: &LicenseRequest) -> std::result::Result<LicenseResponse, IssuanceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(IssuanceError::Rejected { status: 500, message: "boom".into() });
            }
            Ok(LicenseResponse {
                success: true,
                license_code: Some(format!("{}-{}M", request.license_type.as_str(), request.months)),
                message: None,
            })
        }
    }

    fn controller(
        gateway: &Arc<FakeGateway>,
        backend: &Arc<CountingBackend>,
        config: SessionConfig,
    ) -> SessionController {
        let issuer = Arc::new(LicenseIssuer::new(backend.clone()));
        SessionController::with_config(gateway.clone(), issuer, config)
    }

    fn premium_order() -> OrderContext {
        OrderContext::new(Tier::Premium, 3, 13500).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_success_issues_once() {
        let gateway = Arc::new(FakeGateway::new().with_statuses(vec![
            Ok(PaymentStatus::Pending),
            Ok(PaymentStatus::Pending),
            Ok(PaymentStatus::Pending),
            Ok(PaymentStatus::Success),
        ]));
        let backend = Arc::new(CountingBackend::default());
        let controller = controller(&gateway, &backend, SessionConfig::default());

        let intent = controller.initiate(premium_order()).await.unwrap();
        assert_eq!(intent.external_reference, "T13500");
        assert_eq!(controller.state(), SessionState::AwaitingPayment);
        assert_eq!(controller.armed_timers(), 2);

        let outcome = controller.wait_for_outcome().await;

        assert_eq!(gateway.queries(), vec![secs(3), secs(6), secs(9), secs(12)]);
        assert_eq!(gateway.start.elapsed(), secs(12));
        assert_eq!(controller.state(), SessionState::Succeeded);
        assert_eq!(controller.armed_timers(), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let SessionOutcome::Succeeded { license } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(license.origin, LicenseOrigin::Primary);
        assert_eq!(license.record.tier, Tier::Premium);
        assert_eq!(license.record.duration_months, 3);
        assert_eq!(license.code(), "PREMIUM-3M");

        tokio::time::sleep(secs(30)).await;
        assert_eq!(gateway.queries().len(), 4);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_polling() {
        let gateway = Arc::new(FakeGateway::new());
        let backend = Arc::new(CountingBackend::default());
        let controller = controller(&gateway, &backend, SessionConfig::default());

        controller.initiate(premium_order()).await.unwrap();
        assert_eq!(controller.deadline(), Some(gateway.start + secs(300)));

        let outcome = controller.wait_for_outcome().await;
        assert_eq!(outcome, SessionOutcome::TimedOut);
        assert_eq!(gateway.start.elapsed(), secs(300));
        assert_eq!(controller.armed_timers(), 0);

        tokio::time::sleep(secs(60)).await;
        assert!(gateway.queries().iter().all(|t| *t <= secs(300)));
        assert_eq!(controller.state(), SessionState::TimedOut);
        assert_eq!(gateway.cancels(), vec!["T13500".to_string()]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_cancels_timers_before_gateway() {
        let mut fake = FakeGateway::new();
        fake.cancel_error = Some(GatewayError::Transport("connection reset".into()));
        let gateway = Arc::new(fake);
        let backend = Arc::new(CountingBackend::default());
        let controller = controller(&gateway, &backend, SessionConfig::default());

        controller.initiate(premium_order()).await.unwrap();
        gateway.watch_timers(&controller);
        assert_eq!(gateway.timer_tasks.lock().unwrap().len(), 2);
        tokio::time::sleep(secs(20)).await;
        let polls_before = gateway.queries().len();
        assert_eq!(polls_before, 6);

        assert!(controller.abandon().await);
        assert_eq!(controller.state(), SessionState::Abandoned);
        assert!(controller.state().is_terminal());
        assert_eq!(*gateway.timers_finished_at_cancel.lock().unwrap(), vec![true]);
        assert_eq!(gateway.cancels(), vec!["T13500".to_string()]);

        tokio::time::sleep(secs(10)).await;
        assert_eq!(gateway.queries().len(), polls_before);
        assert_eq!(controller.wait_for_outcome().await, SessionOutcome::Abandoned);
        assert!(!controller.abandon().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_after_timeout_is_discarded() {
        let mut fake = FakeGateway::new().with_statuses(vec![
            Ok(PaymentStatus::Pending),
            Ok(PaymentStatus::Pending),
            Ok(PaymentStatus::Success),
        ]);
        fake.query_delay = secs(2);
        let gateway = Arc::new(fake);
        let backend = Arc::new(CountingBackend::default());
        let config = SessionConfig {
            poll_interval: secs(3),
            timeout: secs(10),
            cancel_on_timeout: false,
        };
        let controller = controller(&gateway, &backend, config);

        controller.initiate(premium_order()).await.unwrap();
        let outcome = controller.wait_for_outcome().await;
        assert_eq!(outcome, SessionOutcome::TimedOut);

        // The third query went out at t=9 and would have answered at t=11.
        tokio::time::sleep(secs(5)).await;
        assert_eq!(controller.state(), SessionState::TimedOut);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(gateway.cancels().is_empty());

        let generation = controller.shared.lock().generation;
        let late = controller.shared.observe(generation, 3, Ok(PaymentStatus::Success));
        assert!(matches!(late, Observation::Stop));
        assert_eq!(controller.state(), SessionState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_and_duplicate_responses() {
        let gateway = Arc::new(FakeGateway::new());
        let backend = Arc::new(CountingBackend::default());
        let config = SessionConfig {
            poll_interval: secs(1000),
            timeout: secs(2000),
            cancel_on_timeout: true,
        };
        let controller = controller(&gateway, &backend, config);
        controller.initiate(premium_order()).await.unwrap();
        let shared = controller.shared.clone();
        let generation = shared.lock().generation;

        assert!(matches!(shared.observe(generation, 2, Ok(PaymentStatus::Pending)), Observation::Continue));
        assert!(matches!(shared.observe(generation, 1, Ok(PaymentStatus::Pending)), Observation::Continue));
        assert!(matches!(shared.observe(generation, 1, Ok(PaymentStatus::Success)), Observation::Continue));
        assert_eq!(controller.state(), SessionState::AwaitingPayment);

        assert!(matches!(
            shared.observe(generation, 3, Ok(PaymentStatus::Success)),
            Observation::Paid { .. }
        ));
        assert!(matches!(shared.observe(generation, 4, Ok(PaymentStatus::Success)), Observation::Stop));
        assert_eq!(controller.state(), SessionState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_do_not_abort_polling() {
        let gateway = Arc::new(FakeGateway::new().with_statuses(vec![
            Err(GatewayError::Transport("timeout".into())),
            Err(GatewayError::Transport("dns".into())),
            Ok(PaymentStatus::Success),
        ]));
        let backend = Arc::new(CountingBackend::default());
        let controller = controller(&gateway, &backend, SessionConfig::default());

        controller.initiate(premium_order()).await.unwrap();
        let outcome = controller.wait_for_outcome().await;

        assert!(matches!(outcome, SessionOutcome::Succeeded { .. }));
        assert_eq!(gateway.queries().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_reported_failure() {
        let gateway = Arc::new(FakeGateway::new().with_statuses(vec![
            Ok(PaymentStatus::Pending),
            Ok(PaymentStatus::Failed),
        ]));
        let backend = Arc::new(CountingBackend::default());
        let controller = controller(&gateway, &backend, SessionConfig::default());

        controller.initiate(premium_order()).await.unwrap();
        let outcome = controller.wait_for_outcome().await;

        assert!(matches!(outcome, SessionOutcome::Failed { .. }));
        assert_eq!(controller.armed_timers(), 0);
        tokio::time::sleep(secs(30)).await;
        assert_eq!(gateway.queries().len(), 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_with_failing_backend_uses_fallback() {
        let gateway = Arc::new(FakeGateway::new().with_statuses(vec![Ok(PaymentStatus::Success)]));
        let backend = Arc::new(CountingBackend { fail: true, ..Default::default() });
        let controller = controller(&gateway, &backend, SessionConfig::default());

        controller.initiate(premium_order()).await.unwrap();
        let SessionOutcome::Succeeded { license } = controller.wait_for_outcome().await else {
            panic!("expected success");
        };

        assert!(license.is_fallback());
        assert!(!license.code().is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_during_issuance_keeps_license() {
        let gateway = Arc::new(FakeGateway::new().with_statuses(vec![Ok(PaymentStatus::Success)]));
        let backend = Arc::new(CountingBackend { delay: secs(10), ..Default::default() });
        let controller = controller(&gateway, &backend, SessionConfig::default());

        controller.initiate(premium_order()).await.unwrap();
        tokio::time::sleep(secs(4)).await;
        assert_eq!(controller.state(), SessionState::Succeeded);
        assert!(controller.snapshot().outcome.is_none());

        assert!(!controller.abandon().await);
        assert_eq!(controller.state(), SessionState::Succeeded);
        assert!(gateway.cancels().is_empty());

        let SessionOutcome::Succeeded { license } = controller.wait_for_outcome().await else {
            panic!("expected success");
        };
        assert_eq!(license.code(), "PREMIUM-3M");
        assert_eq!(gateway.start.elapsed(), secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_then_retry() {
        let mut fake = FakeGateway::new();
        fake.create_error = Some(GatewayError::Rejected { code: 1, message: "closed".into() });
        let gateway = Arc::new(fake);
        let backend = Arc::new(CountingBackend::default());
        let controller = controller(&gateway, &backend, SessionConfig::default());

        let err = controller.initiate(premium_order()).await.unwrap_err();
        assert!(matches!(err, SessionError::Gateway(GatewayError::Rejected { .. })));
        assert_eq!(controller.state(), SessionState::Failed);
        assert!(controller.state().is_terminal());
        assert_eq!(controller.armed_timers(), 0);
        assert!(gateway.cancels().is_empty());

        // FAILED is terminal; the next initiate starts over.
        let err = controller.initiate(premium_order()).await.unwrap_err();
        assert!(matches!(err, SessionError::Gateway(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_session_at_a_time() {
        let gateway = Arc::new(FakeGateway::new());
        let backend = Arc::new(CountingBackend::default());
        let controller = controller(&gateway, &backend, SessionConfig::default());

        controller.initiate(premium_order()).await.unwrap();
        assert_eq!(
            controller.initiate(premium_order()).await.unwrap_err(),
            SessionError::AlreadyActive
        );
        assert_eq!(controller.armed_timers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_while_initiating_releases_late_intent() {
        let mut fake = FakeGateway::new();
        fake.create_delay = secs(1);
        let gateway = Arc::new(fake);
        let backend = Arc::new(CountingBackend::default());
        let controller = Arc::new(controller(&gateway, &backend, SessionConfig::default()));

        let pending = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.initiate(premium_order()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.state(), SessionState::Initiating);

        assert!(controller.abandon().await);
        assert_eq!(pending.await.unwrap().unwrap_err(), SessionError::Abandoned);
        assert_eq!(controller.state(), SessionState::Abandoned);
        assert_eq!(gateway.cancels(), vec!["T13500".to_string()]);

        tokio::time::sleep(secs(10)).await;
        assert!(gateway.queries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_mid_session_stops_polling() {
        let gateway = Arc::new(FakeGateway::new());
        let backend = Arc::new(CountingBackend::default());
        let controller = controller(&gateway, &backend, SessionConfig::default());

        controller.initiate(premium_order()).await.unwrap();
        gateway.watch_timers(&controller);
        tokio::time::sleep(secs(7)).await;
        drop(controller);

        tokio::time::sleep(secs(10)).await;
        assert_eq!(gateway.queries().len(), 2);
        assert_eq!(gateway.cancels(), vec!["T13500".to_string()]);
        assert_eq!(*gateway.timers_finished_at_cancel.lock().unwrap(), vec![true]);
    }
}
