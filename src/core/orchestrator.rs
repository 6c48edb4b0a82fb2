//! Scan Orchestrator
//!
//! Fans out to every registered probe, each under its own timeout, and streams one
//! `probe_result` per probe in completion order followed by exactly one terminal
//! event (`complete` or `failed`).
//!
//! Probe tasks are detached, never aborted: a probe that outlives its timeout or
//! the session keeps running so its evidence still lands in the cache.

use alloy_primitives::Address;
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::core::probes::ProbeSet;
use crate::core::risk_score::{aggregate, summarize, RiskLevel};
use crate::models::{
    AppError, DegradedKind, DegradedProbe, ErrorCode, GuardianConfig, RiskContribution, RunningAggregate, ScanEvent,
    ScanRecord, ScanSession,
};
use crate::providers::ScanStore;
use crate::utils::telemetry::{ProbeOutcome, ScanTelemetry};

/// Events buffered per session before the driver waits on the caller
const EVENT_BUFFER: usize = 16;

/// Timing knobs for scan sessions
#[derive(Debug, Clone, Copy)]
pub struct ScanTimeouts {
    pub probe: Duration,
    /// Added to the probe timeout to cap the whole session
    pub grace: Duration,
    /// How long one event may wait for the caller before the session is dropped
    pub send: Duration,
}

impl From<&GuardianConfig> for ScanTimeouts {
    fn from(config: &GuardianConfig) -> Self {
        Self {
            probe: config.probe_timeout,
            grace: config.session_grace,
            send: config.stream_send_timeout,
        }
    }
}

impl Default for ScanTimeouts {
    fn default() -> Self {
        Self::from(&GuardianConfig::default())
    }
}

/// Caller side of a running scan
pub struct ScanHandle {
    pub session_id: String,
    pub request_id: String,
    events: mpsc::Receiver<ScanEvent>,
    cancel: watch::Sender<bool>,
}

impl ScanHandle {
    /// Next event; None after the terminal event
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Stop the session. In-flight probes are abandoned, not killed.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Drain every event up to and including the terminal one
    pub async fn collect(mut self) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }

    /// Stream of events; dropping it tears the session down
    pub fn into_stream(self) -> ReceiverStream<ScanEvent> {
        ReceiverStream::new(self.events)
    }
}

enum ProbeCompletion {
    Reported(RiskContribution),
    Errored(String),
    TimedOut,
}

enum SessionEnd {
    AllResolved,
    DeadlineExceeded,
    Cancelled,
    Disconnected,
}

/// Coordinates scan sessions
#[derive(Clone)]
pub struct ScanOrchestrator {
    probes: ProbeSet,
    store: Arc<dyn ScanStore>,
    telemetry: Arc<ScanTelemetry>,
    timeouts: ScanTimeouts,
}

impl ScanOrchestrator {
    pub fn new(
        probes: ProbeSet,
        store: Arc<dyn ScanStore>,
        telemetry: Arc<ScanTelemetry>,
        timeouts: ScanTimeouts,
    ) -> Self {
        Self {
            probes,
            store,
            telemetry,
            timeouts,
        }
    }

    pub fn probes(&self) -> &ProbeSet {
        &self.probes
    }

    /// Open a session and start every probe. Events arrive on the returned handle.
    pub fn start_scan(
        &self,
        subject: Address,
        chain_id: u64,
        request_id: impl Into<String>,
    ) -> ScanHandle {
        let session = ScanSession::new(subject, chain_id, request_id);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = ScanHandle {
            session_id: session.session_id.clone(),
            request_id: session.request_id.clone(),
            events: rx,
            cancel: cancel_tx,
        };

        let span = info_span!(
            "scan",
            request_id = %session.request_id,
            session_id = %session.session_id,
            subject = %subject,
            chain_id
        );
        let driver = self.clone();
        tokio::spawn(driver.drive(session, tx, cancel_rx).instrument(span));

        handle
    }

    async fn drive(
        self,
        mut session: ScanSession,
        tx: mpsc::Sender<ScanEvent>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        self.telemetry.record_scan_started();
        let started = Instant::now();
        let total = self.probes.len();
        info!("🔍 Scan started with {} probes", total);

        let mut pending = FuturesUnordered::new();
        for probe in self.probes.iter() {
            let probe = probe.clone();
            let name = probe.name();
            let subject = session.subject_address;
            let chain_id = session.chain_id;
            let probe_timeout = self.timeouts.probe;

            let task = tokio::spawn(
                async move { probe.evaluate(subject, chain_id).await }
                    .instrument(info_span!("probe", probe = name)),
            );
            pending.push(async move {
                // dropping a JoinHandle detaches the task
                let completion = match tokio::time::timeout(probe_timeout, task).await {
                    Ok(Ok(Ok(contribution))) => ProbeCompletion::Reported(contribution),
                    Ok(Ok(Err(e))) => ProbeCompletion::Errored(e.to_string()),
                    Ok(Err(join_error)) => {
                        ProbeCompletion::Errored(format!("probe task failed: {}", join_error))
                    }
                    Err(_) => ProbeCompletion::TimedOut,
                };
                (name, completion)
            });
        }

        let deadline = tokio::time::sleep(self.timeouts.probe + self.timeouts.grace);
        tokio::pin!(deadline);

        let mut resolved: BTreeSet<&'static str> = BTreeSet::new();
        let mut cancel_open = true;

        let end = loop {
            tokio::select! {
                biased;

                changed = cancel_rx.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel_rx.borrow() => break SessionEnd::Cancelled,
                    Ok(()) => {}
                    // handle dropped without cancelling; the event channel decides
                    Err(_) => cancel_open = false,
                },
                _ = &mut deadline => break SessionEnd::DeadlineExceeded,
                next = pending.next() => match next {
                    Some((name, completion)) => {
                        resolved.insert(name);
                        let event = self.apply(&mut session, name, completion, resolved.len(), total);
                        if !self.emit(&tx, event).await {
                            break SessionEnd::Disconnected;
                        }
                    }
                    None => break SessionEnd::AllResolved,
                },
            }
        };

        match end {
            SessionEnd::Cancelled => {
                session.fail(session_failure("scan cancelled by caller"));
                self.telemetry.record_scan_cancelled();
                info!("🛑 Scan cancelled, abandoning in-flight probes");
                let _ = tx.try_send(Self::failed_event(&session));
            }
            SessionEnd::Disconnected => {
                session.fail(session_failure("caller disconnected"));
                self.telemetry.record_scan_cancelled();
                info!("🔌 Caller went away, scan session torn down");
            }
            SessionEnd::DeadlineExceeded | SessionEnd::AllResolved => {
                if matches!(end, SessionEnd::DeadlineExceeded) {
                    warn!("⏰ Session deadline reached before every probe resolved");
                    let stragglers: Vec<&'static str> = self
                        .probes
                        .iter()
                        .map(|p| p.name())
                        .filter(|name| !resolved.contains(name))
                        .collect();
                    for name in stragglers {
                        resolved.insert(name);
                        let event = self.apply(
                            &mut session,
                            name,
                            ProbeCompletion::TimedOut,
                            resolved.len(),
                            total,
                        );
                        if !self.emit(&tx, event).await {
                            session.fail(session_failure("caller disconnected"));
                            self.telemetry.record_scan_cancelled();
                            return;
                        }
                    }
                }
                self.finish(session, &tx, started).await;
            }
        }
    }

    /// Fold one probe completion into the session and build its event
    fn apply(
        &self,
        session: &mut ScanSession,
        name: &'static str,
        completion: ProbeCompletion,
        resolved: usize,
        total: usize,
    ) -> ScanEvent {
        let (contribution, error_reason) = match completion {
            ProbeCompletion::Reported(contribution) => {
                let outcome = if contribution.from_stale_evidence {
                    ProbeOutcome::StaleFallback
                } else {
                    ProbeOutcome::Reported
                };
                self.telemetry.record_probe(name, outcome);
                debug!(probe = name, score = contribution.score, "✅ Probe reported");
                session.record_contribution(contribution.clone());
                (Some(contribution), None)
            }
            ProbeCompletion::Errored(reason) => {
                self.telemetry.record_probe(name, ProbeOutcome::Error);
                warn!(probe = name, "❌ Probe failed: {}", reason);
                session.record_degraded(DegradedProbe {
                    probe: name.to_string(),
                    kind: DegradedKind::Error,
                    reason: reason.clone(),
                });
                (None, Some(reason))
            }
            ProbeCompletion::TimedOut => {
                self.telemetry.record_probe(name, ProbeOutcome::Timeout);
                let reason = AppError::new(
                    ErrorCode::ProbeTimeout,
                    format!(
                        "{} did not respond within {}ms",
                        name,
                        self.timeouts.probe.as_millis()
                    ),
                )
                .to_string();
                warn!(probe = name, "⏱️ {}", reason);
                session.record_degraded(DegradedProbe {
                    probe: name.to_string(),
                    kind: DegradedKind::Timeout,
                    reason: reason.clone(),
                });
                (None, Some(reason))
            }
        };

        let running = aggregate(&session.contributions, self.probes.total_weight(), Utc::now());
        let degraded = contribution
            .as_ref()
            .map_or(true, |c| c.from_stale_evidence);

        ScanEvent::ProbeResult {
            probe: name.to_string(),
            contribution,
            degraded,
            error_reason,
            running_aggregate: RunningAggregate {
                score: running.score,
                confidence: running.confidence,
                resolved,
                total,
            },
            request_id: session.request_id.clone(),
        }
    }

    /// Send one event, bounded by the send timeout. False means the caller is gone.
    async fn emit(&self, tx: &mpsc::Sender<ScanEvent>, event: ScanEvent) -> bool {
        match tx.send_timeout(event, self.timeouts.send).await {
            Ok(()) => true,
            Err(SendTimeoutError::Closed(_)) => false,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    "🐌 Caller did not read an event within {}ms",
                    self.timeouts.send.as_millis()
                );
                false
            }
        }
    }

    /// Aggregate, persist and emit the terminal event
    async fn finish(&self, mut session: ScanSession, tx: &mpsc::Sender<ScanEvent>, started: Instant) {
        let result = aggregate(&session.contributions, self.probes.total_weight(), Utc::now());

        let event = match result.score {
            Some(score) => {
                session.complete(score, result.confidence);
                let level = RiskLevel::from_score(score);
                info!(
                    "Scan complete: {}, {} degraded",
                    summarize(&result),
                    session.degraded.len()
                );

                if let Some(record) = ScanRecord::from_session(&session) {
                    if let Err(e) = self.store.save(&record).await {
                        error!("💾 Failed to persist scan result: {}", e);
                    }
                }
                self.telemetry
                    .record_scan_completed(started.elapsed().as_millis() as u64);

                ScanEvent::Complete {
                    session_id: session.session_id.clone(),
                    aggregate_score: score,
                    confidence: result.confidence,
                    level: level.as_str().to_string(),
                    contributions: session.contributions.values().cloned().collect(),
                    degraded_probes: session.degraded_probes(),
                    request_id: session.request_id.clone(),
                }
            }
            None => {
                let reasons: Vec<String> =
                    session.degraded.values().map(|d| d.reason.clone()).collect();
                session.fail(session_failure(format!(
                    "no probe reported: {}",
                    reasons.join("; ")
                )));
                self.telemetry.record_scan_failed();
                warn!("💥 Scan failed: no probe reported");
                Self::failed_event(&session)
            }
        };

        if !self.emit(tx, event).await {
            debug!("Terminal event not delivered, caller already gone");
        }
    }

    fn failed_event(session: &ScanSession) -> ScanEvent {
        ScanEvent::Failed {
            session_id: session.session_id.clone(),
            reason: session
                .failure_reason
                .clone()
                .unwrap_or_else(|| "scan failed".to_string()),
            degraded_probes: session.degraded_probes(),
            request_id: session.request_id.clone(),
        }
    }
}

fn session_failure(reason: impl Into<String>) -> String {
    AppError::new(ErrorCode::SessionFailed, reason).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probes::Probe;
    use crate::models::{AppError, AppResult, Evidence};
    use crate::providers::{KvScanStore, MemoryKvStore};
    use async_trait::async_trait;

    #[derive(Clone, Copy)]
    enum Script {
        Score(f64),
        Fail,
        Hang,
    }

    struct ScriptedProbe {
        name: &'static str,
        weight: f64,
        delay: Duration,
        script: Script,
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn weight(&self) -> f64 {
            self.weight
        }

        fn score(&self, raw: &serde_json::Value) -> AppResult<(f64, Vec<String>)> {
            Ok((raw["score"].as_f64().unwrap_or_default(), vec![]))
        }

        async fn evaluate(&self, _subject: Address, _chain_id: u64) -> AppResult<RiskContribution> {
            tokio::time::sleep(self.delay).await;
            match self.script {
                Script::Score(score) => Ok(RiskContribution {
                    probe: self.name.to_string(),
                    score,
                    weight: self.weight,
                    reasons: vec![format!("scripted {}", score)],
                    evidence: Evidence::new("scripted", 300, serde_json::json!({ "score": score })),
                    from_stale_evidence: false,
                }),
                Script::Fail => Err(AppError::probe_error("scripted failure")),
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn probe(name: &'static str, weight: f64, delay_ms: u64, script: Script) -> Arc<dyn Probe> {
        Arc::new(ScriptedProbe {
            name,
            weight,
            delay: Duration::from_millis(delay_ms),
            script,
        })
    }

    fn orchestrator(probes: Vec<Arc<dyn Probe>>) -> (ScanOrchestrator, Arc<KvScanStore>) {
        let store = Arc::new(KvScanStore::new(Arc::new(MemoryKvStore::new())));
        let orchestrator = ScanOrchestrator::new(
            ProbeSet::new(probes),
            store.clone(),
            Arc::new(ScanTelemetry::new()),
            ScanTimeouts {
                probe: Duration::from_secs(5),
                grace: Duration::from_secs(1),
                send: Duration::from_secs(10),
            },
        );
        (orchestrator, store)
    }

    fn standard(reputation: Script) -> Vec<Arc<dyn Probe>> {
        vec![
            probe("approval_exposure", 0.45, 30, Script::Score(0.0)),
            probe("counterparty_reputation", 0.35, 10, reputation),
            probe("mixer_exposure", 0.20, 20, Script::Score(0.0)),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_wallet_full_confidence() {
        let (orchestrator, store) = orchestrator(standard(Script::Score(0.0)));
        let subject = Address::repeat_byte(0x11);
        let events = orchestrator.start_scan(subject, 1, "req-clean").collect().await;

        assert_eq!(events.len(), 4);
        // completion order, not registration order
        let order: Vec<_> = events[..3]
            .iter()
            .map(|e| match e {
                ScanEvent::ProbeResult { probe, .. } => probe.clone(),
                _ => panic!("unexpected terminal"),
            })
            .collect();
        assert_eq!(order, ["counterparty_reputation", "mixer_exposure", "approval_exposure"]);

        match &events[3] {
            ScanEvent::Complete {
                aggregate_score,
                confidence,
                level,
                request_id,
                ..
            } => {
                assert_eq!(*aggregate_score, 0.0);
                assert!((confidence - 1.0).abs() < 1e-9);
                assert_eq!(level, "SAFE");
                assert_eq!(request_id, "req-clean");
            }
            other => panic!("expected complete, got {:?}", other),
        }

        let record = store.latest(subject, 1).await.unwrap().unwrap();
        assert_eq!(record.request_id, "req-clean");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_degrades_confidence() {
        let (orchestrator, _) = orchestrator(standard(Script::Hang));
        let started = tokio::time::Instant::now();
        let events = orchestrator
            .start_scan(Address::repeat_byte(0x22), 1, "req-hang")
            .collect()
            .await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));

        let timed_out = events.iter().any(|e| {
            matches!(e, ScanEvent::ProbeResult { probe, contribution: None, degraded: true, .. }
                if probe == "counterparty_reputation")
        });
        assert!(timed_out);

        match events.last() {
            Some(ScanEvent::Complete {
                confidence,
                contributions,
                degraded_probes,
                ..
            }) => {
                assert!(*confidence < 1.0);
                assert_eq!(contributions.len(), 2);
                assert_eq!(degraded_probes.len(), 1);
                assert_eq!(degraded_probes[0].kind, DegradedKind::Timeout);
                assert!(degraded_probes[0].reason.starts_with("[PROBE_TIMEOUT]"));
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_events_not_held_back_by_slow_probe() {
        let (orchestrator, _) = orchestrator(standard(Script::Hang));
        let mut handle = orchestrator.start_scan(Address::repeat_byte(0x23), 1, "req-fast");
        let started = tokio::time::Instant::now();

        let first = handle.next_event().await.unwrap();
        assert!(matches!(first, ScanEvent::ProbeResult { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_probes_failing_fails_session() {
        let (orchestrator, store) = orchestrator(vec![
            probe("approval_exposure", 0.45, 0, Script::Fail),
            probe("counterparty_reputation", 0.35, 0, Script::Hang),
            probe("mixer_exposure", 0.20, 0, Script::Fail),
        ]);
        let subject = Address::repeat_byte(0x33);
        let events = orchestrator.start_scan(subject, 1, "req-fail").collect().await;

        assert_eq!(events.len(), 4);
        match events.last() {
            Some(ScanEvent::Failed {
                reason,
                degraded_probes,
                ..
            }) => {
                assert!(reason.starts_with("[SCAN_SESSION_FAILED]"));
                assert!(reason.contains("no probe reported"));
                assert_eq!(degraded_probes.len(), 3);
            }
            other => panic!("expected failed, got {:?}", other),
        }
        assert!(store.latest(subject, 1).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_score_independent_of_completion_order() {
        let scores = [40.0, 80.0, 10.0];
        let mut results = Vec::new();
        for delays in [[10, 20, 30], [30, 20, 10], [20, 30, 10]] {
            let (orchestrator, _) = orchestrator(vec![
                probe("approval_exposure", 0.45, delays[0], Script::Score(scores[0])),
                probe("counterparty_reputation", 0.35, delays[1], Script::Score(scores[1])),
                probe("mixer_exposure", 0.20, delays[2], Script::Score(scores[2])),
            ]);
            let events = orchestrator
                .start_scan(Address::repeat_byte(0x44), 1, "req-order")
                .collect()
                .await;
            match events.last() {
                Some(ScanEvent::Complete { aggregate_score, .. }) => results.push(*aggregate_score),
                other => panic!("expected complete, got {:?}", other),
            }
        }
        assert!(results.iter().all(|s| *s == results[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_emits_failed() {
        let (orchestrator, _) = orchestrator(standard(Script::Hang));
        let mut handle = orchestrator.start_scan(Address::repeat_byte(0x55), 1, "req-cancel");

        let _ = handle.next_event().await;
        handle.cancel();

        let mut last = None;
        while let Some(event) = handle.next_event().await {
            last = Some(event);
        }
        match last {
            Some(ScanEvent::Failed { reason, .. }) => {
                assert!(reason.starts_with("[SCAN_SESSION_FAILED]"));
                assert!(reason.contains("cancelled"));
            }
            other => panic!("expected failed, got {:?}", other),
        }
    }
}
