// Agent control integration tests
// Drives the runner through its public control verbs against the durable
// file backend, with hand-written collaborators standing in for the real
// discovery and messaging modules.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use outreach_control::agent_state::{AgentState, AgentStateManager, ControlResult};
use outreach_control::leads::{Lead, LeadLifecycleState, LeadPatch, OutreachStatus, ReviewStatus};
use outreach_control::runner::{
    AgentRunner, Collaborators, Discovery, DiscoveryRequest, FollowUp, Messenger, ReplyDetector,
    RunSummary, RunnerSettings, StopSignal, WebsiteAnalyzer,
};
use outreach_control::storage::{
    FieldUpdate, JsonFileStore, MemoryStore, RunStatePatch, StateStore, StorageRetry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Finds nothing until told to stop.
struct WaitForStop;

#[async_trait]
impl Discovery for WaitForStop {
    async fn run_once(&self, _: &DiscoveryRequest, stop: &StopSignal) -> anyhow::Result<RunSummary> {
        stop.stopped().await;
        Ok(RunSummary::default())
    }
}

/// Inserts one pending lead per run.
struct OneLeadDiscovery {
    store: Arc<dyn StateStore>,
}

#[async_trait]
impl Discovery for OneLeadDiscovery {
    async fn run_once(&self, request: &DiscoveryRequest, _: &StopSignal) -> anyhow::Result<RunSummary> {
        let mut lead = Lead::discovered(format!("{} #1", request.query))
            .with_lifecycle_state(Some(LeadLifecycleState::PendingReview));
        lead.location = Some(request.location.clone());
        self.store.insert_lead(lead).await?;
        Ok(RunSummary {
            processed: 1,
            ..RunSummary::default()
        })
    }
}

struct TimeoutDiscovery;

#[async_trait]
impl Discovery for TimeoutDiscovery {
    async fn run_once(&self, _: &DiscoveryRequest, _: &StopSignal) -> anyhow::Result<RunSummary> {
        anyhow::bail!("timeout")
    }
}

#[derive(Default)]
struct CountingNoop {
    calls: AtomicUsize,
}

#[async_trait]
impl WebsiteAnalyzer for CountingNoop {
    async fn run_once(&self, _: &StopSignal) -> anyhow::Result<RunSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RunSummary::default())
    }
}

#[async_trait]
impl FollowUp for CountingNoop {
    async fn run_once(&self, _: &StopSignal) -> anyhow::Result<RunSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RunSummary::default())
    }
}

#[async_trait]
impl ReplyDetector for CountingNoop {
    async fn run_once(&self, _: &StopSignal) -> anyhow::Result<RunSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RunSummary::default())
    }
}

/// Sends to every ready lead and records what it sent.
struct RecordingMessenger {
    store: Arc<dyn StateStore>,
    sent_to: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn run_once(&self, _: &StopSignal) -> anyhow::Result<RunSummary> {
        let ready = self
            .store
            .leads_by_lifecycle_state(LeadLifecycleState::ReadyForOutreach)
            .await?;
        let mut summary = RunSummary::default();
        for lead in ready.into_iter().filter(|l| l.is_outreach_eligible()) {
            let patch = LeadPatch {
                outreach_status: Some(OutreachStatus::SentInitial),
                last_contacted: Some(Utc::now()),
                ..LeadPatch::default()
            };
            self.store.update_lead(&lead.id, patch).await?;
            self.sent_to
                .lock()
                .map_err(|_| anyhow::anyhow!("sent_to poisoned"))?
                .push(lead.id.clone());
            summary.sent += 1;
        }
        Ok(summary)
    }
}

struct Setup {
    _dir: TempDir,
    store: Arc<dyn StateStore>,
    runner: AgentRunner,
    messenger: Arc<RecordingMessenger>,
}

async fn setup(discovery: impl FnOnce(Arc<dyn StateStore>) -> Arc<dyn Discovery>) -> Setup {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn StateStore> =
        Arc::new(JsonFileStore::open(dir.path().join("state.json")).await.unwrap());
    let manager = Arc::new(AgentStateManager::with_retry(
        store.clone(),
        StorageRetry::disabled(),
    ));
    let messenger = Arc::new(RecordingMessenger {
        store: store.clone(),
        sent_to: std::sync::Mutex::new(Vec::new()),
    });
    let collaborators = Collaborators {
        discovery: discovery(store.clone()),
        analyzer: Arc::new(CountingNoop::default()),
        messenger: messenger.clone(),
        followup: Arc::new(CountingNoop::default()),
        replies: Arc::new(CountingNoop::default()),
    };
    let runner = AgentRunner::new(manager, store.clone(), collaborators, RunnerSettings::default());
    Setup {
        _dir: dir,
        store,
        runner,
        messenger,
    }
}

async fn insert(store: &Arc<dyn StateStore>, id: &str, email: Option<&str>, review: ReviewStatus) {
    let mut lead = Lead::discovered(format!("Business {id}"))
        .with_id(id)
        .with_review_status(review)
        .with_lifecycle_state(Some(LeadLifecycleState::from_review_status(review)));
    lead.email = email.map(str::to_string);
    store.insert_lead(lead).await.unwrap();
}

#[tokio::test]
async fn discovery_start_is_recorded_and_second_start_refused() {
    let s = setup(|_| Arc::new(WaitForStop)).await;

    let first = s
        .runner
        .start_discovery("plumbers", "Austin, TX", Some(50), "user")
        .await;
    assert!(first.accepted);

    let row = s.store.get_run_state().await.unwrap();
    assert_eq!(row.state, AgentState::Discovering);
    assert_eq!(row.discovery_query.as_deref(), Some("plumbers"));
    assert_eq!(row.discovery_location.as_deref(), Some("Austin, TX"));

    let second = s
        .runner
        .start_discovery("plumbers", "Austin, TX", Some(50), "user")
        .await;
    assert!(!second.accepted);
    assert_eq!(second.message, "Cannot start discovery: agent is discovering");

    s.runner.shutdown("user").await;
    assert_eq!(s.store.get_run_state().await.unwrap().state, AgentState::Idle);
}

#[tokio::test]
async fn discovered_leads_flow_through_approval_into_outreach() {
    let s = setup(|store| Arc::new(OneLeadDiscovery { store })).await;

    assert!(s.runner.start_discovery("roofers", "Denver, CO", None, "user").await.accepted);
    s.runner.join().await;
    assert_eq!(s.store.get_run_state().await.unwrap().state, AgentState::Idle);

    let found = s
        .store
        .leads_by_lifecycle_state(LeadLifecycleState::PendingReview)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let id = found[0].id.clone();

    // Nothing approved yet: outreach refuses to start.
    let refused = s.runner.start_outreach("user").await;
    assert_eq!(refused.message, "No approved leads ready for outreach");

    let patch = LeadPatch {
        email: Some("owner@roofers.example".to_string()),
        ..LeadPatch::default()
    };
    assert!(s.store.update_lead(&id, patch).await.unwrap());
    assert!(s.runner.leads().approve_lead(&id, "reviewer", None).await.success);

    let started = s.runner.start_outreach("user").await;
    assert_eq!(started.message, "Outreach started with 1 approved leads");
    tokio::time::timeout(Duration::from_secs(5), s.runner.join())
        .await
        .expect("outreach with nothing left should not sleep a full cycle");

    assert_eq!(s.store.get_run_state().await.unwrap().state, AgentState::Idle);
    assert_eq!(*s.messenger.sent_to.lock().unwrap(), vec![id.clone()]);

    let lead = s.store.get_lead(&id).await.unwrap().unwrap();
    assert_eq!(lead.lifecycle_state, Some(LeadLifecycleState::ReadyForOutreach));
    assert_eq!(lead.outreach_status, OutreachStatus::SentInitial);
}

#[tokio::test]
async fn unapproved_and_emailless_leads_are_never_sent() {
    let s = setup(|_| Arc::new(WaitForStop)).await;
    insert(&s.store, "approved", Some("a@a.example"), ReviewStatus::Approved).await;
    insert(&s.store, "pending", Some("p@p.example"), ReviewStatus::Pending).await;
    insert(&s.store, "no-email", None, ReviewStatus::Approved).await;

    assert!(s.runner.start_outreach("user").await.accepted);
    s.runner.join().await;

    assert_eq!(*s.messenger.sent_to.lock().unwrap(), vec!["approved".to_string()]);
}

#[tokio::test]
async fn crash_then_reset_clears_error_message() {
    let s = setup(|_| Arc::new(TimeoutDiscovery)).await;

    assert!(s.runner.start_discovery("plumbers", "Austin, TX", None, "user").await.accepted);
    s.runner.join().await;

    let row = s.store.get_run_state().await.unwrap();
    assert_eq!(row.state, AgentState::Error);
    assert_eq!(row.error_message.as_deref(), Some("Discovery crashed: timeout"));

    let health = s.runner.manager().is_healthy(30).await.unwrap();
    assert!(!health.healthy);
    assert_eq!(health.reason, "Agent in error state: Discovery crashed: timeout");

    let reset = s.runner.reset_from_error("operator").await;
    assert!(reset.accepted);

    let row = s.store.get_run_state().await.unwrap();
    assert_eq!(row.state, AgentState::Idle);
    assert_eq!(row.error_message, None);
    assert_eq!(row.controlled_by, "operator");
}

#[tokio::test]
async fn stale_heartbeat_makes_running_agent_unhealthy() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let manager = AgentStateManager::with_retry(store.clone(), StorageRetry::disabled());
    manager
        .transition(AgentState::OutreachRunning, "user", None, Default::default())
        .await
        .unwrap();

    store
        .update_run_state(RunStatePatch {
            last_heartbeat: FieldUpdate::Set(Utc::now() - ChronoDuration::seconds(45)),
            ..RunStatePatch::default()
        })
        .await
        .unwrap();
    let report = manager.is_healthy(30).await.unwrap();
    assert!(!report.healthy);
    assert!(report.reason.starts_with("Heartbeat stale"));

    manager.update_heartbeat(Some("Sending initial emails")).await.unwrap();
    assert!(manager.is_healthy(30).await.unwrap().healthy);
}

#[tokio::test]
async fn every_control_attempt_is_logged_in_order() {
    let s = setup(|_| Arc::new(WaitForStop)).await;

    assert!(!s.runner.manager().transition(
        AgentState::Paused,
        "user",
        None,
        Default::default()
    )
    .await
    .unwrap()
    .accepted);
    assert!(s.runner.start_discovery("plumbers", "Austin, TX", None, "user").await.accepted);
    assert!(s.runner.pause("user").await.accepted);
    assert!(s.runner.resume("user").await.accepted);
    assert!(s.runner.stop("user").await.accepted);
    s.runner.join().await;

    let logs = s.runner.manager().get_control_logs(100).await.unwrap();
    let trail: Vec<(AgentState, ControlResult)> = logs
        .iter()
        .rev()
        .map(|entry| (entry.new_state, entry.result))
        .collect();
    assert_eq!(
        trail,
        vec![
            (AgentState::Paused, ControlResult::Rejected),
            (AgentState::Discovering, ControlResult::Success),
            (AgentState::Paused, ControlResult::Success),
            (AgentState::Discovering, ControlResult::Success),
            (AgentState::Stopping, ControlResult::Success),
            (AgentState::Idle, ControlResult::Success),
        ]
    );
}

#[tokio::test]
async fn run_state_survives_reopening_the_file_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    {
        let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::open(&path).await.unwrap());
        let manager = AgentStateManager::new(store);
        manager
            .transition(
                AgentState::OutreachRunning,
                "user",
                Some("Outreach started"),
                Default::default(),
            )
            .await
            .unwrap();
    }

    // A new process finds the orphaned run and flags it.
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::open(&path).await.unwrap());
    let manager = Arc::new(AgentStateManager::new(store.clone()));
    let collaborators = Collaborators {
        discovery: Arc::new(WaitForStop),
        analyzer: Arc::new(CountingNoop::default()),
        messenger: Arc::new(RecordingMessenger {
            store: store.clone(),
            sent_to: std::sync::Mutex::new(Vec::new()),
        }),
        followup: Arc::new(CountingNoop::default()),
        replies: Arc::new(CountingNoop::default()),
    };
    let runner = AgentRunner::new(manager, store.clone(), collaborators, RunnerSettings::default());

    assert!(runner.reconcile_on_startup().await.unwrap().accepted);
    let row = store.get_run_state().await.unwrap();
    assert_eq!(row.state, AgentState::Error);
    assert_eq!(row.error_message.as_deref(), Some("Worker lost on restart"));
    assert_eq!(store.control_logs(10).await.unwrap().len(), 2);
}
