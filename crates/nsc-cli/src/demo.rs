//! Connection flow demos
//!
//! Each scenario scripts the signer and completer doubles from
//! `nsc_core::harness`, then drives a real `ConnectionController` through the
//! same entry points a front end would use. The report lists every
//! notification the controller published.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::ValueEnum;
use serde::Serialize;
use tokio::sync::broadcast;

use nsc_core::{
    auth::SignInError,
    connect_uri::ConnectionRequest,
    harness::{
        test_key, ApprovalTiming, BunkerScript, CompleterScript, ScriptedCompleter,
        ScriptedSigner, WaitScript,
    },
    signer::BunkerOutcome,
    ConnectTimings, ConnectUpdate, ConnectionController, ConnectionHandle, SessionSnapshot, Stage,
};

const DEMO_RELAY: &str = "wss://relay.nsec.app";
const DEMO_APPROVAL_URL: &str = "https://nsec.app/approve/demo";

/// Scripted connection scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Signer attaches to an advertised nostrconnect URI
    Interactive,
    /// Valid, unused bunker URL connects directly
    Approve,
    /// Signer asks for approval, then accepts the same URL
    NeedsApproval,
    /// Signer rejects the secret and never sends an approval URL
    Expired,
    /// Secret rejection followed by an approval URL inside the grace window
    LateApproval,
    /// No signer ever attaches
    Timeout,
    /// Sign-in fails once and is retried on the live connection
    AuthFails,
}

impl Scenario {
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Interactive => "interactive",
            Scenario::Approve => "approve",
            Scenario::NeedsApproval => "needs-approval",
            Scenario::Expired => "expired",
            Scenario::LateApproval => "late-approval",
            Scenario::Timeout => "timeout",
            Scenario::AuthFails => "auth-fails",
        }
    }

    fn bunker_url(&self) -> String {
        format!(
            "bunker://{}?relay={}&secret={}-secret",
            test_key(0xb0).to_hex(),
            DEMO_RELAY,
            self.name()
        )
    }
}

/// Timings compressed so every scenario finishes within a few seconds.
pub fn demo_timings() -> ConnectTimings {
    ConnectTimings {
        grace_window_ms: 600,
        settle_delay_ms: 100,
        slow_warning_ms: 800,
        signer_wait_timeout_ms: 2_000,
        auth_timeout_ms: 1_500,
        ..ConnectTimings::default()
    }
}

/// What a demo run observed.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub scenario: Scenario,
    pub stages: Vec<Stage>,
    pub approval_urls: Vec<String>,
    pub slow_warnings: usize,
    pub bunker_calls: usize,
    pub sign_in_calls: usize,
    /// Error returned when the same bunker URL was submitted again
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resubmit_refusal: Option<String>,
    pub outcome: SessionSnapshot,
}

/// Run one scenario to its end state.
pub async fn run(scenario: Scenario, timings: ConnectTimings) -> anyhow::Result<DemoReport> {
    let signer = Arc::new(ScriptedSigner::new());
    let completer = Arc::new(ScriptedCompleter::new());
    script(scenario, &timings, &signer, &completer);

    let request = ConnectionRequest::new(test_key(0xc1), vec![DEMO_RELAY.to_string()])?
        .with_name("nsc demo");
    tracing::info!(uri = %request.redacted_uri(), scenario = scenario.name(), "starting demo");

    // Generous upper bound; a stuck scenario is a bug, not a hang.
    let deadline = timings.signer_wait_timeout()
        + timings.auth_timeout()
        + timings.grace_window() * 2
        + Duration::from_secs(5);

    let handle = ConnectionController::spawn(
        request.to_uri(),
        timings.clone(),
        Arc::clone(&signer),
        Arc::clone(&completer),
    )?;
    let mut updates = handle.subscribe();
    let bunker_url = scenario.bunker_url();
    let mut resubmit_refusal = None;

    match scenario {
        Scenario::Interactive | Scenario::Timeout => {
            handle.start_interactive_connection().await?;
            let target = if scenario == Scenario::Timeout {
                Stage::Error
            } else {
                Stage::Complete
            };
            reach(&handle, target, deadline).await?;
        }
        Scenario::Approve => {
            handle.submit_bunker_url(&bunker_url).await?;
            reach(&handle, Stage::Complete, deadline).await?;
        }
        Scenario::NeedsApproval => {
            handle.submit_bunker_url(&bunker_url).await?;
            reach(&handle, Stage::AwaitingApproval, deadline).await?;
            handle.retry_after_approval().await?;
            reach(&handle, Stage::Complete, deadline).await?;
        }
        Scenario::Expired => {
            handle.submit_bunker_url(&bunker_url).await?;
            reach(&handle, Stage::Error, deadline).await?;
            if let Err(e) = handle.submit_bunker_url(&bunker_url).await {
                resubmit_refusal = Some(e.to_string());
            }
        }
        Scenario::LateApproval => {
            handle.submit_bunker_url(&bunker_url).await?;
            reach(&handle, Stage::AwaitingApproval, deadline).await?;
            // Outlive the grace window before approving.
            tokio::time::sleep(timings.grace_window() * 2).await;
            handle.retry_after_approval().await?;
            reach(&handle, Stage::Complete, deadline).await?;
        }
        Scenario::AuthFails => {
            handle.submit_bunker_url(&bunker_url).await?;
            reach(&handle, Stage::Error, deadline).await?;
            handle.retry_from_error().await?;
            reach(&handle, Stage::Complete, deadline).await?;
        }
    }

    let outcome = handle.snapshot();
    Ok(summarize(
        scenario,
        drain(&mut updates),
        signer.bunker_calls().len(),
        completer.calls().len(),
        resubmit_refusal,
        outcome,
    ))
}

fn script(
    scenario: Scenario,
    timings: &ConnectTimings,
    signer: &ScriptedSigner,
    completer: &ScriptedCompleter,
) {
    let signer_key = test_key(0x5e);
    match scenario {
        Scenario::Interactive => {
            signer.push_wait(WaitScript::connects(signer_key, Duration::from_millis(300)));
        }
        Scenario::Timeout => {
            signer.push_wait(WaitScript::Hang);
        }
        Scenario::Approve => {
            signer.push_bunker(
                BunkerScript::resolves(BunkerOutcome::Connected(signer_key))
                    .after(Duration::from_millis(200)),
            );
        }
        Scenario::NeedsApproval => {
            signer
                .push_bunker(
                    BunkerScript::resolves(BunkerOutcome::ApprovalRequired)
                        .with_approval_url(DEMO_APPROVAL_URL, ApprovalTiming::BeforeOutcome)
                        .after(Duration::from_millis(200)),
                )
                .push_bunker(BunkerScript::resolves(BunkerOutcome::Connected(signer_key)));
        }
        Scenario::Expired => {
            signer.push_bunker(BunkerScript::resolves(BunkerOutcome::SecretRejected(
                "invalid secret".into(),
            )));
        }
        Scenario::LateApproval => {
            signer
                .push_bunker(
                    BunkerScript::resolves(BunkerOutcome::SecretRejected(
                        "invalid secret".into(),
                    ))
                    .with_approval_url(
                        DEMO_APPROVAL_URL,
                        ApprovalTiming::AfterOutcome(timings.grace_window() / 3),
                    ),
                )
                .push_bunker(BunkerScript::resolves(BunkerOutcome::Connected(signer_key)));
        }
        Scenario::AuthFails => {
            signer.push_bunker(BunkerScript::resolves(BunkerOutcome::Connected(signer_key)));
            completer.push(CompleterScript::Fail(SignInError::Rejected(
                "user declined the challenge".into(),
            )));
        }
    }
}

async fn reach(handle: &ConnectionHandle, stage: Stage, deadline: Duration) -> anyhow::Result<()> {
    tokio::time::timeout(deadline, handle.wait_for_stage(stage))
        .await
        .map_err(|_| anyhow!("session did not reach {stage} within {deadline:?}"))?
        .with_context(|| format!("waiting for {stage}"))?;
    Ok(())
}

fn drain(rx: &mut broadcast::Receiver<ConnectUpdate>) -> Vec<ConnectUpdate> {
    let mut updates = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(update) => updates.push(update),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "demo update buffer overflowed");
            }
            Err(_) => break,
        }
    }
    updates
}

fn summarize(
    scenario: Scenario,
    updates: Vec<ConnectUpdate>,
    bunker_calls: usize,
    sign_in_calls: usize,
    resubmit_refusal: Option<String>,
    outcome: SessionSnapshot,
) -> DemoReport {
    let mut stages = Vec::new();
    let mut approval_urls = Vec::new();
    let mut slow_warnings = 0;
    for update in updates {
        match update {
            ConnectUpdate::StageChanged { stage, .. } => stages.push(stage),
            ConnectUpdate::ApprovalUrl { url } => approval_urls.push(url),
            ConnectUpdate::SlowOperation { .. } => slow_warnings += 1,
        }
    }
    DemoReport {
        scenario,
        stages,
        approval_urls,
        slow_warnings,
        bunker_calls,
        sign_in_calls,
        resubmit_refusal,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsc_core::{FailureKind, SecretDisposition};

    async fn run_demo(scenario: Scenario) -> DemoReport {
        run(scenario, demo_timings()).await.unwrap()
    }

    #[tokio::test]
    async fn test_demo_timings_are_valid() {
        assert!(demo_timings().validate().is_ok());
    }

    #[tokio::test]
    async fn test_approve_scenario() {
        let report = run_demo(Scenario::Approve).await;
        assert_eq!(
            report.stages,
            vec![
                Stage::WaitingForSigner,
                Stage::Connected,
                Stage::Signing,
                Stage::Syncing,
                Stage::Complete
            ]
        );
        assert_eq!(report.bunker_calls, 1);
        assert!(report.approval_urls.is_empty());
    }

    #[tokio::test]
    async fn test_needs_approval_scenario() {
        let report = run_demo(Scenario::NeedsApproval).await;
        assert_eq!(report.outcome.stage, Stage::Complete);
        assert_eq!(report.outcome.secret_disposition, SecretDisposition::Resumed);
        assert_eq!(report.approval_urls, vec![DEMO_APPROVAL_URL.to_string()]);
        assert_eq!(report.bunker_calls, 2);
    }

    #[tokio::test]
    async fn test_expired_scenario() {
        let report = run_demo(Scenario::Expired).await;
        let error = report.outcome.error.clone().unwrap();
        assert_eq!(error.kind, FailureKind::SecretExpiredOrConsumed);
        assert!(report.resubmit_refusal.is_some());
        assert_eq!(report.bunker_calls, 1);
    }

    #[tokio::test]
    async fn test_late_approval_scenario() {
        let report = run_demo(Scenario::LateApproval).await;
        assert_eq!(report.outcome.stage, Stage::Complete);
        assert!(!report.stages.contains(&Stage::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_scenario() {
        let report = run(Scenario::Timeout, ConnectTimings::default()).await.unwrap();
        assert_eq!(report.outcome.stage, Stage::Error);
        assert_eq!(report.slow_warnings, 1);
    }

    #[tokio::test]
    async fn test_auth_fails_scenario() {
        let report = run_demo(Scenario::AuthFails).await;
        assert_eq!(report.outcome.stage, Stage::Complete);
        assert_eq!(report.sign_in_calls, 2);
        assert!(report.stages.contains(&Stage::Error));
    }
}
