// Rotation controller - decides when to move to the next credential bundle
//
// All rotation state lives behind a single mutex and is only changed through
// the small guarded transitions below. A switch never runs while requests
// are in flight: triggers mark the switch pending (rejecting new requests
// with 503) and the last finalisation executes it. No suspension point
// holds the lock.

use crate::browser::Orchestrator;
use crate::credentials::CredentialStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub struct RotationConfig {
    /// Generative requests before a scheduled switch (0 = off)
    pub switch_on_uses: u32,
    /// Upstream failures before a forced switch (0 = off)
    pub failure_threshold: u32,
    /// Statuses that force a switch regardless of counters
    pub immediate_switch_status_codes: HashSet<u16>,
}

#[derive(Debug, Default)]
struct State {
    current_index: u32,
    usage_count: u32,
    failure_count: u32,
    pending_switch: bool,
    /// Explicit target from a manual trigger, consumed by the switch
    pending_target: Option<u32>,
    auth_switching: bool,
    system_busy: bool,
    /// Switch and rollback both failed; only external intervention helps
    unavailable: bool,
    active_requests: u32,
}

/// Why a request was rejected at the acceptance gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    /// A switch is pending or executing
    Rotating,
    /// The controller is in the unrecoverable state
    Unavailable,
}

/// What the caller should do after reporting a terminal upstream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// No switch was triggered; a retry is allowed
    Retryable,
    /// A switch is now pending; do not retry on this credential
    SwitchPending,
}

/// Outcome of a manual switch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched(u32),
    /// Requests are in flight; the switch runs when they drain
    Deferred,
    /// Another switch is already executing
    Busy,
    Unavailable,
    Failed(String),
}

/// Point-in-time view for the status endpoint.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub current_index: u32,
    pub usage_count: u32,
    pub failure_count: u32,
    pub pending_switch: bool,
    pub auth_switching: bool,
    pub system_busy: bool,
    pub unavailable: bool,
    pub active_requests: u32,
}

pub struct RotationController {
    cfg: RotationConfig,
    store: Arc<CredentialStore>,
    browser: Arc<dyn Orchestrator>,
    state: Mutex<State>,
}

impl RotationController {
    pub fn new(
        cfg: RotationConfig,
        store: Arc<CredentialStore>,
        browser: Arc<dyn Orchestrator>,
        initial_index: u32,
    ) -> Self {
        // An initial index that doesn't exist falls back to the first bundle
        let current_index = if store.available_indices().contains(&initial_index) {
            initial_index
        } else {
            let fallback = store.available_indices()[0];
            tracing::warn!(
                "Initial auth index {} not available, starting with {}",
                initial_index,
                fallback
            );
            fallback
        };

        Self {
            cfg,
            store,
            browser,
            state: Mutex::new(State {
                current_index,
                ..State::default()
            }),
        }
    }

    /// Acceptance gate. Counts the request as active and applies the
    /// usage-based trigger: the Nth generative request is itself accepted
    /// and marks the switch pending for everything after it.
    pub fn try_accept(&self, is_generative: bool) -> Result<(), AcceptError> {
        let mut s = self.state.lock().unwrap();
        if s.unavailable {
            return Err(AcceptError::Unavailable);
        }
        if s.pending_switch || s.auth_switching {
            return Err(AcceptError::Rotating);
        }
        s.active_requests += 1;
        if is_generative && self.cfg.switch_on_uses > 0 {
            s.usage_count += 1;
            if s.usage_count >= self.cfg.switch_on_uses {
                s.pending_switch = true;
                tracing::info!(
                    "Usage limit reached ({}/{}), rotation scheduled",
                    s.usage_count,
                    self.cfg.switch_on_uses
                );
            }
        }
        Ok(())
    }

    /// First success after a failure clears the failure streak.
    pub fn record_success(&self) {
        let mut s = self.state.lock().unwrap();
        if s.failure_count > 0 {
            tracing::debug!("Upstream recovered after {} failure(s)", s.failure_count);
            s.failure_count = 0;
        }
    }

    /// Count a terminal upstream error and classify the trigger. Client
    /// cancellations and channel losses must not be reported here.
    pub fn record_error(&self, status: Option<u16>) -> ErrorDisposition {
        let mut s = self.state.lock().unwrap();
        s.failure_count += 1;

        let immediate = status
            .map(|c| self.cfg.immediate_switch_status_codes.contains(&c))
            .unwrap_or(false);
        let over_threshold =
            self.cfg.failure_threshold > 0 && s.failure_count >= self.cfg.failure_threshold;

        if immediate || over_threshold {
            if !s.pending_switch {
                s.pending_switch = true;
                if immediate {
                    tracing::warn!(
                        "Upstream status {:?} forces rotation (failures {})",
                        status,
                        s.failure_count
                    );
                } else {
                    tracing::warn!(
                        "Failure threshold reached ({}/{}), rotation scheduled",
                        s.failure_count,
                        self.cfg.failure_threshold
                    );
                }
            }
            ErrorDisposition::SwitchPending
        } else {
            ErrorDisposition::Retryable
        }
    }

    /// Per-request finalisation: called exactly once per accepted request.
    /// When the last in-flight request drains and a switch is pending, the
    /// switch executes in the background.
    pub fn finalize(self: &Arc<Self>) {
        let should_switch = {
            let mut s = self.state.lock().unwrap();
            s.active_requests = s.active_requests.saturating_sub(1);
            s.active_requests == 0 && s.pending_switch && !s.auth_switching && !s.unavailable
        };
        if should_switch {
            let controller = self.clone();
            tokio::spawn(async move {
                if let Err(reason) = controller.execute_switch(None).await {
                    tracing::error!("Deferred rotation failed: {}", reason);
                }
            });
        }
    }

    /// Admin-triggered rotation to the next or a specific index.
    pub async fn manual_switch(self: &Arc<Self>, target: Option<u32>) -> SwitchOutcome {
        {
            let mut s = self.state.lock().unwrap();
            if s.unavailable {
                return SwitchOutcome::Unavailable;
            }
            if s.auth_switching {
                return SwitchOutcome::Busy;
            }
            if s.active_requests > 0 {
                s.pending_switch = true;
                s.pending_target = target;
                tracing::info!(
                    "Manual rotation deferred behind {} in-flight request(s)",
                    s.active_requests
                );
                return SwitchOutcome::Deferred;
            }
        }
        match self.execute_switch(target).await {
            Ok(index) => SwitchOutcome::Switched(index),
            Err(reason) => SwitchOutcome::Failed(reason),
        }
    }

    /// Load the configured bundle at startup. Failure is not fatal; the
    /// pipeline's auto-recovery retries on the next request.
    pub async fn initial_attach(self: &Arc<Self>) {
        let index = self.current_index();
        if !self.try_begin_browser_op() {
            return;
        }
        tracing::info!("Attaching browser session for auth bundle {}", index);
        if let Err(e) = self.browser.switch_to(index).await {
            tracing::warn!("Initial browser attach failed: {:#}", e);
        }
        self.end_browser_op();
    }

    /// The switch operation itself. Exactly one runs at a time; triggers
    /// arriving while it runs are no-ops.
    async fn execute_switch(self: &Arc<Self>, explicit: Option<u32>) -> Result<u32, String> {
        let (previous, target) = {
            let mut s = self.state.lock().unwrap();
            if s.auth_switching || s.unavailable {
                return Err("switch already in progress".to_string());
            }
            s.auth_switching = true;
            s.system_busy = true;
            let previous = s.current_index;
            let target = explicit
                .or(s.pending_target.take())
                .unwrap_or_else(|| self.next_index(previous));
            (previous, target)
        };

        tracing::info!("Rotating credentials: {} -> {}", previous, target);
        match self.browser.switch_to(target).await {
            Ok(()) => {
                let mut s = self.state.lock().unwrap();
                s.current_index = target;
                s.usage_count = 0;
                s.failure_count = 0;
                s.pending_switch = false;
                s.pending_target = None;
                s.auth_switching = false;
                s.system_busy = false;
                tracing::info!("Rotation complete, now on bundle {}", target);
                Ok(target)
            }
            Err(switch_err) => {
                tracing::warn!(
                    "Switch to bundle {} failed ({:#}), rolling back to {}",
                    target,
                    switch_err,
                    previous
                );
                match self.browser.switch_to(previous).await {
                    Ok(()) => {
                        let mut s = self.state.lock().unwrap();
                        s.pending_switch = false;
                        s.pending_target = None;
                        s.auth_switching = false;
                        s.system_busy = false;
                        Err(format!(
                            "switch to {} failed, rolled back to {}: {:#}",
                            target, previous, switch_err
                        ))
                    }
                    Err(rollback_err) => {
                        let mut s = self.state.lock().unwrap();
                        s.unavailable = true;
                        s.auth_switching = false;
                        s.system_busy = false;
                        tracing::error!(
                            "Rollback to bundle {} also failed ({:#}); service unavailable",
                            previous,
                            rollback_err
                        );
                        Err("switch and rollback both failed; service unavailable".to_string())
                    }
                }
            }
        }
    }

    /// Next bundle, cycling through the store's indices.
    fn next_index(&self, current: u32) -> u32 {
        let indices = self.store.available_indices();
        indices
            .iter()
            .copied()
            .find(|&i| i > current)
            .unwrap_or(indices[0])
    }

    pub fn current_index(&self) -> u32 {
        self.state.lock().unwrap().current_index
    }

    pub fn is_system_busy(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.system_busy || s.auth_switching
    }

    /// Claim the browser for a non-rotation operation (auto-recovery).
    /// Returns false when a rotation or another operation holds it.
    pub fn try_begin_browser_op(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.system_busy || s.auth_switching || s.unavailable {
            return false;
        }
        s.system_busy = true;
        true
    }

    pub fn end_browser_op(&self) {
        self.state.lock().unwrap().system_busy = false;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let s = self.state.lock().unwrap();
        StatusSnapshot {
            current_index: s.current_index,
            usage_count: s.usage_count,
            failure_count: s.failure_count,
            pending_switch: s.pending_switch,
            auth_switching: s.auth_switching,
            system_busy: s.system_busy,
            unavailable: s.unavailable,
            active_requests: s.active_requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use futures::future::BoxFuture;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeBrowser {
        fail_on: Mutex<HashSet<u32>>,
        calls: Mutex<Vec<u32>>,
    }

    impl FakeBrowser {
        fn failing_on(indices: &[u32]) -> Self {
            Self {
                fail_on: Mutex::new(indices.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Orchestrator for FakeBrowser {
        fn switch_to(&self, index: u32) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(index);
                if self.fail_on.lock().unwrap().contains(&index) {
                    bail!("switch to {} refused", index);
                }
                Ok(())
            })
        }
    }

    fn controller(
        switch_on_uses: u32,
        failure_threshold: u32,
        browser: Arc<FakeBrowser>,
    ) -> Arc<RotationController> {
        let cfg = RotationConfig {
            switch_on_uses,
            failure_threshold,
            immediate_switch_status_codes: [429, 503].into_iter().collect(),
        };
        let store = Arc::new(CredentialStore::for_tests(vec![1, 2, 3]));
        Arc::new(RotationController::new(cfg, store, browser, 1))
    }

    async fn settle() {
        // Deferred switches run on a spawned task
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_usage_trigger_fires_on_exactly_the_nth_request() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(3, 0, browser.clone());

        ctl.try_accept(true).unwrap();
        ctl.finalize();
        ctl.try_accept(true).unwrap();
        ctl.finalize();
        settle().await;
        assert!(!ctl.snapshot().pending_switch, "N-1 must not trigger");
        assert!(browser.calls().is_empty());

        ctl.try_accept(true).unwrap();
        assert!(ctl.snapshot().pending_switch, "Nth request schedules it");
        // While pending, new requests are rejected
        assert_eq!(ctl.try_accept(true).unwrap_err(), AcceptError::Rotating);

        ctl.finalize();
        settle().await;
        assert_eq!(browser.calls(), vec![2]);
        let snap = ctl.snapshot();
        assert_eq!(snap.current_index, 2);
        assert_eq!(snap.usage_count, 0);
        assert!(!snap.pending_switch);
        assert!(ctl.try_accept(true).is_ok());
    }

    #[tokio::test]
    async fn test_non_generative_requests_do_not_count_usage() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(2, 0, browser);
        for _ in 0..5 {
            ctl.try_accept(false).unwrap();
            ctl.finalize();
        }
        assert_eq!(ctl.snapshot().usage_count, 0);
        assert!(!ctl.snapshot().pending_switch);
    }

    #[tokio::test]
    async fn test_immediate_status_switches_below_threshold() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(0, 3, browser.clone());

        ctl.try_accept(true).unwrap();
        // One 429 is enough even though failure_count < failure_threshold
        assert_eq!(
            ctl.record_error(Some(429)),
            ErrorDisposition::SwitchPending
        );
        ctl.finalize();
        settle().await;
        assert_eq!(browser.calls(), vec![2]);
        assert_eq!(ctl.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_failure_threshold_trigger() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(0, 2, browser.clone());

        ctl.try_accept(true).unwrap();
        assert_eq!(ctl.record_error(Some(500)), ErrorDisposition::Retryable);
        assert_eq!(
            ctl.record_error(Some(500)),
            ErrorDisposition::SwitchPending
        );
        ctl.finalize();
        settle().await;
        assert_eq!(browser.calls(), vec![2]);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(0, 3, browser);

        ctl.try_accept(true).unwrap();
        ctl.record_error(Some(500));
        ctl.record_error(Some(500));
        ctl.record_success();
        assert_eq!(ctl.snapshot().failure_count, 0);
        // The streak starts over
        assert_eq!(ctl.record_error(Some(500)), ErrorDisposition::Retryable);
        ctl.finalize();
    }

    #[tokio::test]
    async fn test_no_rotation_while_requests_in_flight() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(0, 0, browser.clone());

        ctl.try_accept(true).unwrap();
        ctl.try_accept(true).unwrap();
        assert_eq!(ctl.manual_switch(None).await, SwitchOutcome::Deferred);
        settle().await;
        assert!(browser.calls().is_empty(), "switch must wait for drain");

        ctl.finalize();
        settle().await;
        assert!(browser.calls().is_empty(), "one request still active");

        ctl.finalize();
        settle().await;
        assert_eq!(browser.calls(), vec![2]);
    }

    #[tokio::test]
    async fn test_manual_switch_with_explicit_target() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(0, 0, browser.clone());
        assert_eq!(
            ctl.manual_switch(Some(3)).await,
            SwitchOutcome::Switched(3)
        );
        assert_eq!(ctl.current_index(), 3);
        // Cycles back to the first index
        assert_eq!(ctl.manual_switch(None).await, SwitchOutcome::Switched(1));
    }

    #[tokio::test]
    async fn test_rollback_on_switch_failure() {
        let browser = Arc::new(FakeBrowser::failing_on(&[2]));
        let ctl = controller(0, 0, browser.clone());

        match ctl.manual_switch(Some(2)).await {
            SwitchOutcome::Failed(reason) => assert!(reason.contains("rolled back")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(browser.calls(), vec![2, 1]);
        let snap = ctl.snapshot();
        assert_eq!(snap.current_index, 1);
        assert!(!snap.unavailable);
        assert!(!snap.pending_switch);
        assert!(ctl.try_accept(true).is_ok());
        ctl.finalize();
    }

    #[tokio::test]
    async fn test_unavailable_after_double_failure() {
        let browser = Arc::new(FakeBrowser::failing_on(&[1, 2]));
        let ctl = controller(0, 0, browser);

        match ctl.manual_switch(Some(2)).await {
            SwitchOutcome::Failed(reason) => assert!(reason.contains("unavailable")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(ctl.snapshot().unavailable);
        assert_eq!(ctl.try_accept(true).unwrap_err(), AcceptError::Unavailable);
        assert_eq!(ctl.manual_switch(None).await, SwitchOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_active_count_never_underflows() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(0, 0, browser);
        ctl.finalize();
        ctl.finalize();
        assert_eq!(ctl.snapshot().active_requests, 0);
    }

    #[tokio::test]
    async fn test_browser_op_excluded_during_switch() {
        let browser = Arc::new(FakeBrowser::default());
        let ctl = controller(0, 0, browser);
        assert!(ctl.try_begin_browser_op());
        assert!(!ctl.try_begin_browser_op());
        assert!(ctl.is_system_busy());
        ctl.end_browser_op();
        assert!(ctl.try_begin_browser_op());
        ctl.end_browser_op();
    }
}
