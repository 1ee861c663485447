//! End-to-end behaviour of the flow engine against an in-memory store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use flowpost_core::{
    FlowpostError, MessageGateway, OutboundEmail, Recipient, Result, SendReceipt, SenderIdentity,
};
use flowpost_scheduler::{
    EnqueueOutcome, EnrollRequest, FlowDocument, FlowEngine, QueueWorker, Run, RunStatus,
    SchedulerDb, enqueue_next,
};
use serde_json::json;

#[derive(Default)]
struct CountingGateway {
    sent: Mutex<Vec<OutboundEmail>>,
}

impl CountingGateway {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageGateway for CountingGateway {
    fn name(&self) -> &str {
        "counting"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(SendReceipt {
            provider_message_id: Some(format!("m{}", sent.len())),
        })
    }
}

struct Harness {
    db: Arc<SchedulerDb>,
    gateway: Arc<CountingGateway>,
    engine: Arc<FlowEngine>,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()
}

fn harness() -> Harness {
    let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
    let gateway = Arc::new(CountingGateway::default());
    let engine = Arc::new(FlowEngine::new(db.clone(), gateway.clone()));
    db.set_sender(
        "U",
        &SenderIdentity {
            from_email: "hello@shop.test".into(),
            from_name: "Shop".into(),
        },
        t0(),
    )
    .unwrap();
    Harness { db, gateway, engine }
}

fn add_recipient(db: &SchedulerDb, id: &str, owner: &str, email: &str) {
    db.upsert_recipient(
        &Recipient {
            id: id.into(),
            owner_id: owner.into(),
            email: Some(email.into()),
            name: None,
        },
        t0(),
    )
    .unwrap();
}

/// trigger → delay(0 minutes) → email E
fn install_delay_email_flow(db: &SchedulerDb, flow_id: &str, owner: &str) {
    db.upsert_flow(
        &FlowDocument {
            id: flow_id.into(),
            owner_id: owner.into(),
            name: "Welcome".into(),
            nodes: json!([
                {"id": "trigger", "type": "trigger", "data": {"triggerType": "manual"}},
                {"id": "wait", "type": "delay", "data": {"amount": 0, "unit": "minutes"}},
                {"id": "E", "type": "email", "data": {"subject": "Welcome!", "html": "<p>Hi</p>"}}
            ]),
            edges: json!([
                {"source": "trigger", "target": "wait"},
                {"source": "wait", "target": "E"}
            ]),
        },
        t0(),
    )
    .unwrap();
}

fn enroll(h: &Harness, flow_id: &str, recipient_id: &str) -> String {
    let out = h
        .engine
        .enroll(&EnrollRequest {
            recipient_id: recipient_id.into(),
            flow_id: Some(flow_id.into()),
            ..Default::default()
        })
        .unwrap();
    out.run_ids[0].clone()
}

#[tokio::test]
async fn test_zero_delay_then_email_then_done() {
    let h = harness();
    install_delay_email_flow(&h.db, "F", "U");
    add_recipient(&h.db, "R", "U", "r@example.com");
    let run_id = enroll(&h, "F", "R");

    // Tick 1: trigger → delay, armed for now; nothing sent yet.
    let tick1 = h.engine.tick_at("F", None, t0()).await.unwrap();
    assert_eq!(tick1.picked, 1);
    assert_eq!(tick1.sent, 0);
    let run = h.db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.current_node_id.as_deref(), Some("wait"));
    assert_eq!(run.available_at, Some(t0()));
    assert_eq!(run.status, RunStatus::Active);

    // Tick 2: delay elapsed → email E, exactly one send, run done.
    let t2 = t0() + Duration::seconds(30);
    let tick2 = h.engine.tick_at("F", None, t2).await.unwrap();
    assert_eq!(tick2.sent, 1);
    assert_eq!(tick2.done, 1);
    assert_eq!(h.gateway.count(), 1);
    assert_eq!(h.gateway.sent.lock().unwrap()[0].to, "r@example.com");
    let run = h.db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.current_node_id.as_deref(), Some("E"));

    // Tick 3: nothing left to pick.
    let tick3 = h.engine.tick_at("F", None, t2 + Duration::minutes(1)).await.unwrap();
    assert_eq!(tick3.picked, 0);
    assert_eq!(h.gateway.count(), 1);
}

#[tokio::test]
async fn test_empty_address_fails_without_send_or_retry() {
    let h = harness();
    install_delay_email_flow(&h.db, "F", "U");
    add_recipient(&h.db, "R", "U", "   ");
    let run_id = enroll(&h, "F", "R");

    h.engine.tick_at("F", None, t0()).await.unwrap();
    let tick2 = h
        .engine
        .tick_at("F", None, t0() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(tick2.failed, 1);

    let run = h.db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error.as_deref(), Some("RECIPIENT_NO_ADDRESS"));
    assert_eq!(run.current_node_id.as_deref(), Some("E"));
    assert_eq!(h.gateway.count(), 0);

    let tick3 = h
        .engine
        .tick_at("F", None, t0() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(tick3.picked, 0);
    assert_eq!(h.gateway.count(), 0);
}

#[tokio::test]
async fn test_tenant_mismatch_never_sends() {
    let h = harness();
    install_delay_email_flow(&h.db, "F", "U");
    add_recipient(&h.db, "R", "OTHER", "r@example.com");

    // A run whose owner differs from the flow owner, created directly.
    let run = Run::new("OTHER", "F", "R", t0());
    h.db.create_run(&run).unwrap();

    let report = h.engine.tick_at("F", None, t0()).await.unwrap();
    assert_eq!(report.failed, 1);
    let stored = h.db.get_run(&run.id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("TENANT_MISMATCH"));
    assert_eq!(h.gateway.count(), 0);
}

#[tokio::test]
async fn test_recipient_owned_by_someone_else_is_tenant_mismatch() {
    let h = harness();
    install_delay_email_flow(&h.db, "F", "U");
    add_recipient(&h.db, "R", "U", "r@example.com");
    let run_id = enroll(&h, "F", "R");
    h.engine.tick_at("F", None, t0()).await.unwrap();

    // Recipient record moves to another tenant while the run is parked.
    add_recipient(&h.db, "R", "INTRUDER", "r@example.com");
    h.engine
        .tick_at("F", None, t0() + Duration::seconds(1))
        .await
        .unwrap();

    let run = h.db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.last_error.as_deref(), Some("TENANT_MISMATCH"));
    assert_eq!(h.gateway.count(), 0);
}

#[tokio::test]
async fn test_condition_routes_to_no_branch() {
    let h = harness();
    add_recipient(&h.db, "R", "U", "r@example.com");
    h.db.upsert_flow(
        &FlowDocument {
            id: "C".into(),
            owner_id: "U".into(),
            name: "Branchy".into(),
            nodes: json!([
                {"id": "t", "type": "trigger"},
                {"id": "cond", "type": "condition", "data": {"check": "opened_last_email"}},
                {"id": "yes-mail", "type": "email", "data": {"subject": "Thanks", "html": "y"}},
                {"id": "no-mail", "type": "email", "data": {"subject": "Reminder", "html": "n"}}
            ]),
            edges: json!([
                {"source": "t", "target": "cond"},
                {"source": "cond", "target": "yes-mail", "sourceHandle": "yes"},
                {"source": "cond", "target": "no-mail", "sourceHandle": "no"}
            ]),
        },
        t0(),
    )
    .unwrap();
    let run_id = enroll(&h, "C", "R");

    h.engine.tick_at("C", None, t0()).await.unwrap();

    let sent = h.gateway.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Reminder");
    assert_eq!(sent[0].tags.node_id, "no-mail");
    let run = h.db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.current_node_id.as_deref(), Some("no-mail"));
}

#[tokio::test]
async fn test_pointer_never_revisits_and_one_send_per_tick() {
    let h = harness();
    add_recipient(&h.db, "R", "U", "r@example.com");
    h.db.upsert_flow(
        &FlowDocument {
            id: "S".into(),
            owner_id: "U".into(),
            name: "Series".into(),
            nodes: json!([
                {"id": "t", "type": "trigger"},
                {"id": "m1", "type": "email", "data": {"subject": "1", "html": "1"}},
                {"id": "m2", "type": "email", "data": {"subject": "2", "html": "2"}},
                {"id": "d", "type": "delay", "data": {"amount": 2, "unit": "hours"}},
                {"id": "m3", "type": "email", "data": {"subject": "3", "html": "3"}}
            ]),
            edges: json!([
                {"source": "t", "target": "m1"},
                {"source": "m1", "target": "m2"},
                {"source": "m2", "target": "d"},
                {"source": "d", "target": "m3"}
            ]),
        },
        t0(),
    )
    .unwrap();
    let run_id = enroll(&h, "S", "R");

    let mut seen: Vec<String> = Vec::new();
    let mut now = t0();
    for _ in 0..6 {
        let report = h.engine.tick_at("S", None, now).await.unwrap();
        assert!(report.sent <= 1);
        let run = h.db.get_run(&run_id).unwrap().unwrap();
        if let Some(node) = run.current_node_id.clone()
            && seen.last() != Some(&node)
        {
            assert!(!seen.contains(&node), "pointer revisited {node}");
            seen.push(node);
        }
        now += Duration::hours(1);
    }

    // m1 goes out on entry, leaving the pointer on m2.
    assert_eq!(seen, vec!["m2", "d", "m3"]);
    assert_eq!(h.gateway.count(), 3);
    assert_eq!(h.db.get_run(&run_id).unwrap().unwrap().status, RunStatus::Done);
}

#[tokio::test]
async fn test_delay_is_honoured() {
    let h = harness();
    add_recipient(&h.db, "R", "U", "r@example.com");
    h.db.upsert_flow(
        &FlowDocument {
            id: "D".into(),
            owner_id: "U".into(),
            name: "Later".into(),
            nodes: json!([
                {"id": "t", "type": "trigger"},
                {"id": "d", "type": "delay", "data": {"delay": {"amount": 2, "unit": "hours"}}},
                {"id": "m", "type": "email", "data": {"subject": "Later", "html": "x"}}
            ]),
            edges: json!([{"source": "t", "target": "d"}, {"source": "d", "target": "m"}]),
        },
        t0(),
    )
    .unwrap();
    let run_id = enroll(&h, "D", "R");

    h.engine.tick_at("D", None, t0()).await.unwrap();
    let run = h.db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.available_at, Some(t0() + Duration::hours(2)));

    let early = h
        .engine
        .tick_at("D", None, t0() + Duration::minutes(119))
        .await
        .unwrap();
    assert_eq!(early.picked, 0);

    let due = h
        .engine
        .tick_at("D", None, t0() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(due.sent, 1);
}

#[tokio::test]
async fn test_missing_flow_and_missing_trigger_abort_tick() {
    let h = harness();
    let err = h.engine.tick_at("nope", None, t0()).await.unwrap_err();
    assert!(matches!(err, FlowpostError::FlowNotFound(_)));

    h.db.upsert_flow(
        &FlowDocument {
            id: "NT".into(),
            owner_id: "U".into(),
            name: String::new(),
            nodes: json!([{"id": "m", "type": "email"}]),
            edges: json!([]),
        },
        t0(),
    )
    .unwrap();
    let err = h.engine.tick_at("NT", None, t0()).await.unwrap_err();
    assert!(matches!(err, FlowpostError::NoTrigger(_)));
    assert_eq!(err.code(), "NO_TRIGGER");
}

#[tokio::test]
async fn test_batch_bound_and_oldest_first() {
    let h = harness();
    install_delay_email_flow(&h.db, "F", "U");
    for i in 0..5 {
        let rid = format!("R{i}");
        add_recipient(&h.db, &rid, "U", &format!("{rid}@example.com"));
        let run = Run::new("U", "F", &rid, t0() - Duration::minutes(10 - i));
        h.db.create_run(&run).unwrap();
    }

    let report = h.engine.tick_at("F", Some(2), t0()).await.unwrap();
    assert_eq!(report.picked, 2);
    let moved: Vec<_> = h
        .db
        .list_runs("F", Some(RunStatus::Active), 10)
        .unwrap()
        .into_iter()
        .filter(|r| r.current_node_id.is_some())
        .map(|r| r.recipient_id)
        .collect();
    assert_eq!(moved.len(), 2);
    assert!(moved.contains(&"R0".to_string()));
    assert!(moved.contains(&"R1".to_string()));
}

#[tokio::test]
async fn test_one_bad_run_does_not_abort_batch() {
    let h = harness();
    install_delay_email_flow(&h.db, "F", "U");
    add_recipient(&h.db, "good", "U", "g@example.com");
    // "ghost" has no recipient record.
    enroll(&h, "F", "good");
    let ghost = Run::new("U", "F", "ghost", t0());
    h.db.create_run(&ghost).unwrap();

    h.engine.tick_at("F", None, t0()).await.unwrap();
    let report = h
        .engine
        .tick_at("F", None, t0() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.picked, 2);
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 1);
    let ghost = h.db.get_run(&ghost.id).unwrap().unwrap();
    assert_eq!(ghost.last_error.as_deref(), Some("RECIPIENT_NOT_FOUND"));
}

#[tokio::test]
async fn test_tick_all_covers_due_flows_and_reports_broken_ones() {
    let h = harness();
    install_delay_email_flow(&h.db, "F1", "U");
    install_delay_email_flow(&h.db, "F2", "U");
    add_recipient(&h.db, "R", "U", "r@example.com");
    enroll(&h, "F1", "R");
    enroll(&h, "F2", "R");
    // A run pointing at a flow that does not exist.
    h.db.create_run(&Run::new("U", "missing", "R", t0()))
        .unwrap();

    let pass = h.engine.tick_all_at(None, None, t0()).await.unwrap();
    assert_eq!(pass.flows, 3);
    assert_eq!(pass.reports.len(), 2);
    assert_eq!(pass.flow_errors.len(), 1);
    assert_eq!(pass.flow_errors[0].code, "FLOW_NOT_FOUND");
}

#[tokio::test]
async fn test_idempotent_enqueue() {
    let h = harness();
    let a = enqueue_next(&h.db, "U", "F", "R", "E", t0()).unwrap();
    let b = enqueue_next(&h.db, "U", "F", "R", "E", t0()).unwrap();
    assert_eq!(a, EnqueueOutcome::Inserted);
    assert_eq!(b, EnqueueOutcome::Deduped);
    assert_eq!(h.db.list_jobs("F").unwrap().len(), 1);
}

#[tokio::test]
async fn test_queue_worker_drives_runs_through_jobs() {
    let h = harness();
    install_delay_email_flow(&h.db, "F", "U");
    add_recipient(&h.db, "R", "U", "r@example.com");
    let run_id = enroll(&h, "F", "R");
    let worker = QueueWorker::new(h.engine.clone());

    let projected = worker.project_flow("F", t0()).unwrap();
    assert_eq!(projected.inserted, 1);
    // Projecting again collapses into the same pending job.
    assert_eq!(worker.project_flow("F", t0()).unwrap().deduped, 1);

    let first = worker.run_batch_at(None, t0()).await.unwrap();
    assert_eq!(first.processed, 1);
    assert_eq!(first.enqueued, 1);
    let jobs = h.db.list_jobs("F").unwrap();
    assert!(jobs.iter().any(|j| j.next_node_id == "wait"));

    let second = worker
        .run_batch_at(None, t0() + Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(second.sent, 1);
    assert_eq!(h.db.get_run(&run_id).unwrap().unwrap().status, RunStatus::Done);

    // Nothing left; ticking the flow directly does not send again.
    let third = worker
        .run_batch_at(None, t0() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(third.claimed, 0);
    h.engine
        .tick_at("F", None, t0() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(h.gateway.count(), 1);
}

#[tokio::test]
async fn test_worker_supersedes_stale_jobs() {
    let h = harness();
    install_delay_email_flow(&h.db, "F", "U");
    add_recipient(&h.db, "R", "U", "r@example.com");
    enroll(&h, "F", "R");
    let worker = QueueWorker::new(h.engine.clone());
    worker.project_flow("F", t0()).unwrap();

    // The tick path moves the run before the worker sees its job.
    h.engine.tick_at("F", None, t0()).await.unwrap();

    let report = worker.run_batch_at(None, t0()).await.unwrap();
    assert_eq!(report.superseded, 1);
    assert_eq!(report.processed, 0);
    assert!(h.db.pending_job_id("F", "R", "wait").unwrap().is_some());
}

#[tokio::test]
async fn test_demo_welcome_series() {
    let h = harness();
    let doc: FlowDocument =
        serde_json::from_str(include_str!("../../../demos/welcome-flow.json")).unwrap();
    h.db.upsert_flow(&doc, t0()).unwrap();
    add_recipient(&h.db, "sub-1", "acct_demo", "sub@example.com");
    h.db.set_sender(
        "acct_demo",
        &SenderIdentity {
            from_email: "news@demo.test".into(),
            from_name: "Demo".into(),
        },
        t0(),
    )
    .unwrap();
    h.db.put_content("acct_demo", "tpl/nudge", "<p>nudge</p>", t0())
        .unwrap();

    let out = h
        .engine
        .enroll(&EnrollRequest {
            recipient_id: "sub-1".into(),
            event: Some("list_subscribed".into()),
            list_id: Some("newsletter".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(out.runs_created, 1);
    let run_id = out.run_ids[0].clone();

    let first = h.engine.tick_at("welcome-series", None, t0()).await.unwrap();
    assert_eq!(first.sent, 1);
    let run = h.db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.current_node_id.as_deref(), Some("wait-2d"));
    assert_eq!(run.available_at, Some(t0() + Duration::days(2)));

    let later = h
        .engine
        .tick_at("welcome-series", None, t0() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(later.sent, 1);
    assert_eq!(later.done, 1);

    let sent = h.gateway.sent.lock().unwrap();
    let subjects: Vec<_> = sent.iter().map(|e| e.subject.as_str()).collect();
    assert_eq!(subjects, vec!["Welcome aboard", "Did you miss this?"]);
    assert_eq!(sent[1].html, "<p>nudge</p>");
    assert_eq!(sent[1].from.from_email, "news@demo.test");
}

/// Gateway that takes a while to answer, so overlapping ticks interleave.
struct SlowGateway {
    inner: CountingGateway,
    delay: std::time::Duration,
}

#[async_trait]
impl MessageGateway for SlowGateway {
    fn name(&self) -> &str {
        "slow"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt> {
        tokio::time::sleep(self.delay).await;
        self.inner.send(email).await
    }
}

#[tokio::test]
async fn test_overlapping_ticks_send_once() {
    let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
    let gateway = Arc::new(SlowGateway {
        inner: CountingGateway::default(),
        delay: std::time::Duration::from_millis(50),
    });
    let engine = Arc::new(FlowEngine::new(db.clone(), gateway.clone()));
    db.set_sender(
        "U",
        &SenderIdentity {
            from_email: "hello@shop.test".into(),
            from_name: "Shop".into(),
        },
        t0(),
    )
    .unwrap();
    db.upsert_flow(
        &FlowDocument {
            id: "F".into(),
            owner_id: "U".into(),
            name: "Straight to mail".into(),
            nodes: json!([
                {"id": "trigger", "type": "trigger", "data": {"triggerType": "manual"}},
                {"id": "E", "type": "email", "data": {"subject": "Hi", "html": "<p>Hi</p>"}}
            ]),
            edges: json!([{"source": "trigger", "target": "E"}]),
        },
        t0(),
    )
    .unwrap();
    add_recipient(&db, "R", "U", "r@example.com");
    let out = engine
        .enroll(&EnrollRequest {
            recipient_id: "R".into(),
            flow_id: Some("F".into()),
            ..Default::default()
        })
        .unwrap();
    let run_id = out.run_ids[0].clone();

    // Tick, HTTP tick and queue worker all racing on the same run.
    let worker = QueueWorker::new(engine.clone());
    worker.project_flow("F", t0()).unwrap();
    let (a, b, w) = tokio::join!(
        engine.tick_at("F", None, t0()),
        engine.tick_at("F", None, t0()),
        worker.run_batch_at(None, t0()),
    );
    let (a, b, w) = (a.unwrap(), b.unwrap(), w.unwrap());

    assert_eq!(gateway.inner.count(), 1);
    assert_eq!(a.sent + b.sent + w.sent, 1);
    let run = db.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    let sends = db
        .run_events(&run_id)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == "email_sent")
        .count();
    assert_eq!(sends, 1);

    // Once the step committed the lease is gone; nothing is left to pick.
    let again = engine
        .tick_at("F", None, t0() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(again.picked, 0);
    assert_eq!(gateway.inner.count(), 1);
}
