//! Tests for the command executor
//!
//! These tests verify:
//! - Responses are matched to the session in flight
//! - Timeouts expire the session and are retried only for idempotent queries
//! - Busy and unreadable answers become protocol failures
//! - Link faults withdraw or expire the session
//! - Late frames and re-queries settle expired sessions
//! - Cancellation from another thread, and before anything is sent
//! - Concurrent callers take turns on the link

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use satcfe::classifier::Outcome;
use satcfe::config::{ConfigBuilder, JournalSync, RetryPolicy};
use satcfe::journal::{JournalEvent, JournalRecovery, SessionJournal};
use satcfe::protocol::{CommandPayload, CommandRequest};
use satcfe::transport::{Fault, MockupConfig, MockupDevice, MockupHandle, MockupTransport, Received};
use satcfe::{
    CancelToken, CommandExecutor, CommandKind, Config, ExecutionError, LinkFault, SatError,
    SessionNumber, SessionState, StatusCode, Transport,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn fast_config() -> ConfigBuilder {
    Config::builder()
        .activation_code("12345678")
        .timeout_all(Duration::from_millis(300))
        .poll_interval_ms(10)
        .idempotent_retry(RetryPolicy::new(3, Duration::from_millis(10)))
}

fn setup(config: Config) -> (MockupHandle, CommandExecutor<MockupTransport>) {
    let (handle, transport) = MockupDevice::spawn(MockupConfig::default()).unwrap();
    let executor = CommandExecutor::new(transport, config).unwrap();
    (handle, executor)
}

fn sale() -> CommandPayload {
    CommandPayload::SendSaleData {
        sale_data: "<CFe><infCFe versaoDadosEnt=\"0.07\"/></CFe>".to_string(),
    }
}

fn session(n: u32) -> SessionNumber {
    SessionNumber::new(n).unwrap()
}

fn status(code: u32) -> StatusCode {
    StatusCode::new(code).unwrap()
}

/// Link that fails every receive (and optionally every send)
struct FailingLink {
    send_fault: Option<LinkFault>,
    receive_fault: LinkFault,
    sends: Arc<AtomicU32>,
}

impl FailingLink {
    fn new(send_fault: Option<LinkFault>, receive_fault: LinkFault) -> (Self, Arc<AtomicU32>) {
        let sends = Arc::new(AtomicU32::new(0));
        let link = Self {
            send_fault,
            receive_fault,
            sends: Arc::clone(&sends),
        };
        (link, sends)
    }
}

impl Transport for FailingLink {
    fn send(&mut self, _frame: &[u8]) -> satcfe::Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        match self.send_fault {
            Some(fault) => Err(SatError::Link(fault)),
            None => Ok(()),
        }
    }

    fn receive(&mut self, _timeout: Duration) -> satcfe::Result<Received> {
        Err(SatError::Link(self.receive_fault))
    }
}

// =============================================================================
// Basic Execution
// =============================================================================

#[test]
fn test_query_sat_echoes_session() {
    let (_device, executor) = setup(fast_config().build());

    let request = CommandRequest::new(session(123456), None, CommandPayload::QuerySat);
    let response = executor.execute(request).unwrap();

    assert_eq!(response.session, session(123456));
    assert_eq!(response.status, status(8000));
    assert_eq!(
        executor.query_status(session(123456)),
        SessionState::Completed {
            kind: CommandKind::QuerySat,
            status: status(8000),
            outcome: Outcome::Success,
        }
    );
}

#[test]
fn test_sale_succeeds() {
    let (device, executor) = setup(fast_config().build());

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    let response = executor.execute(request).unwrap();

    assert_eq!(response.status, status(6000));
    assert_eq!(response.alert_code.as_deref(), Some("0000"));
    assert!(response.field("chaveConsulta").is_some());
    assert!(device.knows_session(number));
    assert!(matches!(
        executor.query_status(number),
        SessionState::Completed {
            outcome: Outcome::Success,
            ..
        }
    ));
    assert_eq!(executor.tracker().pending_count(), 0);
}

#[test]
fn test_wrong_activation_code_is_rejected() {
    let (_device, executor) = setup(fast_config().activation_code("00000000").build());

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    let err = executor.execute(request).unwrap_err();

    match &err {
        ExecutionError::Rejected { response } => {
            assert_eq!(response.status, status(6001));
            assert_eq!(response.session, number);
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
    assert_eq!(err.status(), Some(status(6001)));
    assert_eq!(
        executor.query_status(number),
        SessionState::Completed {
            kind: CommandKind::SendSaleData,
            status: status(6001),
            outcome: Outcome::FunctionalRejection(status(6001)),
        }
    );
}

#[test]
fn test_unknown_session_query_is_rejected() {
    let (_device, executor) = setup(fast_config().build());

    let request = executor
        .new_request(CommandPayload::QuerySessionNumber {
            target: session(777),
        })
        .unwrap();
    let err = executor.execute(request).unwrap_err();

    assert_eq!(err.status(), Some(status(11003)));
    assert_eq!(executor.query_status(session(777)), SessionState::NotFound);
}

#[test]
fn test_sessions_increase() {
    let (_device, executor) = setup(fast_config().build());

    let first = executor.new_request(CommandPayload::QuerySat).unwrap();
    let first_session = first.session;
    executor.execute(first).unwrap();
    let second = executor.new_request(CommandPayload::QuerySat).unwrap();

    assert_eq!(second.session, first_session.next());
}

#[test]
fn test_invalid_config_refused() {
    let (_device, transport) = MockupDevice::spawn(MockupConfig::default()).unwrap();
    let result = CommandExecutor::new(transport, fast_config().poll_interval_ms(0).build());
    assert!(matches!(result, Err(SatError::Config(_))));
}

#[test]
fn test_unbounded_timeout_refused() {
    let (_device, transport) = MockupDevice::spawn(MockupConfig::default()).unwrap();
    let config = fast_config()
        .timeout(CommandKind::SendSaleData, Duration::MAX)
        .build();
    let result = CommandExecutor::new(transport, config);
    assert!(matches!(result, Err(SatError::Config(_))));
}

#[test]
fn test_device_forgets_oldest_replies() {
    let (device, transport) = MockupDevice::spawn(MockupConfig {
        history_limit: 2,
        ..MockupConfig::default()
    })
    .unwrap();
    let executor = CommandExecutor::new(transport, fast_config().build()).unwrap();

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let request = executor.new_request(CommandPayload::QuerySat).unwrap();
        sessions.push(request.session);
        executor.execute(request).unwrap();
    }

    assert!(!device.knows_session(sessions[0]));
    assert!(device.knows_session(sessions[1]));
    assert!(device.knows_session(sessions[2]));

    let requery = executor
        .new_request(CommandPayload::QuerySessionNumber {
            target: sessions[0],
        })
        .unwrap();
    let err = executor.execute(requery).unwrap_err();
    assert_eq!(err.status(), Some(status(11003)));
}

// =============================================================================
// Busy and Unreadable Answers
// =============================================================================

#[test]
fn test_busy_query_is_retried() {
    let (device, executor) = setup(fast_config().build());
    device.inject(Fault::Busy);

    let request = executor.new_request(CommandPayload::QuerySat).unwrap();
    let first = request.session;
    let response = executor.execute(request).unwrap();

    assert_eq!(response.status, status(8000));
    assert_ne!(response.session, first);
    assert_eq!(device.requests_seen(), 2);
    assert_eq!(
        executor.query_status(first),
        SessionState::Completed {
            kind: CommandKind::QuerySat,
            status: status(8098),
            outcome: Outcome::ProtocolError,
        }
    );
}

#[test]
fn test_busy_sale_is_not_retried() {
    let (device, executor) = setup(fast_config().build());
    device.inject(Fault::Busy);

    let request = executor.new_request(sale()).unwrap();
    let err = executor.execute(request).unwrap_err();

    match err {
        ExecutionError::ProtocolFailure {
            kind,
            attempts,
            status: code,
            ..
        } => {
            assert_eq!(kind, CommandKind::SendSaleData);
            assert_eq!(attempts, 1);
            assert_eq!(code, Some(status(6098)));
        }
        other => panic!("expected a protocol failure, got {:?}", other),
    }
    assert_eq!(device.requests_seen(), 1);
}

#[test]
fn test_retries_exhausted() {
    let (device, executor) = setup(fast_config().build());
    for _ in 0..3 {
        device.inject(Fault::Busy);
    }

    let request = executor.new_request(CommandPayload::QuerySat).unwrap();
    let err = executor.execute(request).unwrap_err();

    assert!(matches!(
        err,
        ExecutionError::ProtocolFailure { attempts: 3, .. }
    ));
    assert_eq!(device.requests_seen(), 3);
}

#[test]
fn test_garbage_reply_expires_session() {
    let (device, executor) = setup(fast_config().build());
    device.inject(Fault::Garbage);

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    let err = executor.execute(request).unwrap_err();

    assert!(matches!(
        err,
        ExecutionError::ProtocolFailure { status: None, .. }
    ));
    assert_eq!(
        executor.query_status(number),
        SessionState::Expired {
            kind: CommandKind::SendSaleData
        }
    );
}

// =============================================================================
// Timeouts
// =============================================================================

#[test]
fn test_dropped_sale_times_out_without_retry() {
    let config = fast_config()
        .retry(CommandKind::SendSaleData, RetryPolicy::new(3, Duration::ZERO))
        .build();
    let (device, executor) = setup(config);
    device.inject(Fault::DropReply);

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    let err = executor.execute(request).unwrap_err();

    match err {
        ExecutionError::Timeout {
            kind,
            session: timed_out,
            attempts,
        } => {
            assert_eq!(kind, CommandKind::SendSaleData);
            assert_eq!(timed_out, number);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(device.requests_seen(), 1);
    // The device did run it
    assert!(device.knows_session(number));
    assert_eq!(
        executor.query_status(number),
        SessionState::Expired {
            kind: CommandKind::SendSaleData
        }
    );
}

#[test]
fn test_dropped_query_is_retried() {
    let (device, executor) = setup(fast_config().build());
    device.inject(Fault::DropReply);

    let request = executor.new_request(CommandPayload::QuerySat).unwrap();
    let first = request.session;
    let response = executor.execute(request).unwrap();

    assert_eq!(response.status, status(8000));
    assert_eq!(device.requests_seen(), 2);
    assert_eq!(
        executor.query_status(first),
        SessionState::Expired {
            kind: CommandKind::QuerySat
        }
    );
}

#[test]
fn test_timeout_respects_deadline() {
    let config = fast_config()
        .timeout(CommandKind::Block, Duration::from_millis(150))
        .build();
    let (device, executor) = setup(config);
    device.inject(Fault::Ignore);

    let start = Instant::now();
    let request = executor.new_request(CommandPayload::Block).unwrap();
    let err = executor.execute(request).unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, ExecutionError::Timeout { .. }));
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(2));
    assert!(!device.is_blocked());
}

// =============================================================================
// Expired Sessions
// =============================================================================

#[test]
fn test_requery_resolves_expired_sale() {
    let (device, executor) = setup(fast_config().build());
    device.inject(Fault::DropReply);

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    assert!(executor.execute(request).is_err());

    let requery = executor
        .new_request(CommandPayload::QuerySessionNumber { target: number })
        .unwrap();
    let response = executor.execute(requery).unwrap();

    assert_eq!(response.session, number);
    assert_eq!(response.command, CommandKind::SendSaleData);
    assert_eq!(
        executor.query_status(number),
        SessionState::Completed {
            kind: CommandKind::SendSaleData,
            status: status(6000),
            outcome: Outcome::Success,
        }
    );
}

#[test]
fn test_late_frame_resolves_expired_session() {
    let config = fast_config()
        .timeout(CommandKind::QuerySat, Duration::from_secs(3))
        .build();
    let (device, executor) = setup(config);
    device.inject(Fault::Delay(Duration::from_millis(600)));

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    assert!(matches!(
        executor.execute(request),
        Err(ExecutionError::Timeout { .. })
    ));

    // The delayed sale reply arrives while ConsultarSAT is in flight
    let query = executor.new_request(CommandPayload::QuerySat).unwrap();
    let response = executor.execute(query).unwrap();

    assert_eq!(response.status, status(8000));
    assert_eq!(
        executor.query_status(number),
        SessionState::Completed {
            kind: CommandKind::SendSaleData,
            status: status(6000),
            outcome: Outcome::Success,
        }
    );
}

#[test]
fn test_reconcile_settles_expired_sessions() {
    let (device, executor) = setup(fast_config().build());

    device.inject(Fault::DropReply);
    let executed = executor.new_request(sale()).unwrap();
    let executed_session = executed.session;
    assert!(executor.execute(executed).is_err());

    device.inject(Fault::Ignore);
    let lost = executor.new_request(CommandPayload::Block).unwrap();
    let lost_session = lost.session;
    assert!(executor.execute(lost).is_err());

    assert_eq!(executor.tracker().expired_sessions().len(), 2);
    assert_eq!(executor.reconcile().unwrap(), 2);

    assert!(matches!(
        executor.query_status(executed_session),
        SessionState::Completed {
            outcome: Outcome::Success,
            ..
        }
    ));
    assert_eq!(
        executor.query_status(lost_session),
        SessionState::Completed {
            kind: CommandKind::Block,
            status: status(11003),
            outcome: Outcome::FunctionalRejection(status(11003)),
        }
    );
    assert!(executor.tracker().expired_sessions().is_empty());
}

#[test]
fn test_expired_number_is_not_reissued() {
    let (device, executor) = setup(fast_config().session_history_limit(0).build());
    device.inject(Fault::DropReply);

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    assert!(executor.execute(request).is_err());

    for _ in 0..5 {
        let request = executor.new_request(CommandPayload::QuerySat).unwrap();
        assert_ne!(request.session, number);
        executor.execute(request).unwrap();
    }
    assert!(executor.query_status(number).is_in_flight());
}

// =============================================================================
// Link Faults
// =============================================================================

#[test]
fn test_send_fault_withdraws_session() {
    let (link, sends) = FailingLink::new(Some(LinkFault::NoConnect), LinkFault::NoConnect);
    let executor = CommandExecutor::new(link, fast_config().build()).unwrap();

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    let err = executor.execute(request).unwrap_err();

    assert!(matches!(
        err,
        ExecutionError::Link {
            fault: LinkFault::NoConnect,
            ..
        }
    ));
    assert_eq!(sends.load(Ordering::SeqCst), 1);
    assert_eq!(executor.query_status(number), SessionState::NotFound);
}

#[test]
fn test_send_fault_is_journaled_as_withdrawn() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("sessions.journal");
    let (link, _) = FailingLink::new(Some(LinkFault::NoConnect), LinkFault::NoConnect);
    let number = {
        let (journal, _) = SessionJournal::open(&path, JournalSync::EveryWrite).unwrap();
        let executor = CommandExecutor::with_log(link, fast_config().build(), journal).unwrap();
        let request = executor.new_request(sale()).unwrap();
        let number = request.session;
        assert!(executor.execute(request).is_err());
        number
    };

    let (entries, result) = JournalRecovery::recover(&path).unwrap();
    let events: Vec<_> = entries.iter().map(|entry| entry.event).collect();
    assert_eq!(events, vec![JournalEvent::Sent, JournalEvent::Withdrawn]);
    assert!(result.in_doubt.is_empty());
    assert_eq!(result.last_issued, Some(number));
}

#[test]
fn test_transient_receive_fault_retried_for_queries() {
    let (link, sends) = FailingLink::new(None, LinkFault::Timeout);
    let executor = CommandExecutor::new(link, fast_config().build()).unwrap();

    let request = executor.new_request(CommandPayload::QuerySat).unwrap();
    let first = request.session;
    let err = executor.execute(request).unwrap_err();

    assert!(matches!(
        err,
        ExecutionError::Link {
            fault: LinkFault::Timeout,
            ..
        }
    ));
    assert_eq!(sends.load(Ordering::SeqCst), 3);
    assert_eq!(
        executor.query_status(first),
        SessionState::Expired {
            kind: CommandKind::QuerySat
        }
    );
}

#[test]
fn test_permanent_receive_fault_not_retried() {
    let (link, sends) = FailingLink::new(None, LinkFault::NoConnect);
    let executor = CommandExecutor::new(link, fast_config().build()).unwrap();

    let request = executor.new_request(CommandPayload::QuerySat).unwrap();
    assert!(executor.execute(request).is_err());
    assert_eq!(sends.load(Ordering::SeqCst), 1);
}

#[test]
fn test_receive_fault_on_sale_not_retried() {
    let (link, sends) = FailingLink::new(None, LinkFault::ChecksumError);
    let config = fast_config()
        .retry(CommandKind::SendSaleData, RetryPolicy::new(3, Duration::ZERO))
        .build();
    let executor = CommandExecutor::new(link, config).unwrap();

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    assert!(executor.execute(request).is_err());

    assert_eq!(sends.load(Ordering::SeqCst), 1);
    assert!(executor.query_status(number).is_in_flight());
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancel_from_another_thread() {
    let config = fast_config()
        .timeout(CommandKind::SendSaleData, Duration::from_secs(10))
        .build();
    let (device, executor) = setup(config);
    device.inject(Fault::DropReply);

    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };

    let start = Instant::now();
    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    let err = executor.execute_with_cancel(request, &cancel).unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, ExecutionError::Cancelled { .. }));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(
        executor.query_status(number),
        SessionState::Expired {
            kind: CommandKind::SendSaleData
        }
    );
}

#[test]
fn test_cancel_before_start() {
    let (_device, executor) = setup(fast_config().build());
    let cancel = CancelToken::new();
    cancel.cancel();

    let request = executor.new_request(CommandPayload::QuerySat).unwrap();
    let err = executor.execute_with_cancel(request, &cancel).unwrap_err();
    assert!(matches!(err, ExecutionError::Cancelled { .. }));
}

#[test]
fn test_cancelled_sale_is_never_sent() {
    let (device, executor) = setup(fast_config().build());
    let cancel = CancelToken::new();
    cancel.cancel();

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    let err = executor.execute_with_cancel(request, &cancel).unwrap_err();

    assert!(matches!(err, ExecutionError::Cancelled { .. }));
    // Give a stray request time to reach the device thread
    thread::sleep(Duration::from_millis(50));
    assert_eq!(device.requests_seen(), 0);
    assert!(!device.knows_session(number));
    assert_eq!(executor.query_status(number), SessionState::NotFound);
    assert_eq!(executor.tracker().pending_count(), 0);
}

#[test]
fn test_cancel_while_waiting_for_the_link() {
    let config = fast_config()
        .timeout(CommandKind::SendSaleData, Duration::from_secs(2))
        .build();
    let (device, executor) = setup(config);
    device.inject(Fault::Delay(Duration::from_millis(300)));

    let cancel = CancelToken::new();
    thread::scope(|scope| {
        let first = scope.spawn(|| {
            let request = executor.new_request(sale()).unwrap();
            executor.execute(request)
        });
        thread::sleep(Duration::from_millis(50));

        let canceller = {
            let cancel = cancel.clone();
            scope.spawn(move || {
                thread::sleep(Duration::from_millis(50));
                cancel.cancel();
            })
        };
        let request = executor.new_request(sale()).unwrap();
        let waiting = request.session;
        let err = executor.execute_with_cancel(request, &cancel).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, ExecutionError::Cancelled { .. }));
        assert!(first.join().unwrap().is_ok());
        assert_eq!(device.requests_seen(), 1);
        assert!(!device.knows_session(waiting));
        assert_eq!(executor.query_status(waiting), SessionState::NotFound);
    });
}

// =============================================================================
// Concurrent Callers
// =============================================================================

#[test]
fn test_concurrent_callers_take_turns() {
    let config = fast_config()
        .timeout(CommandKind::SendSaleData, Duration::from_secs(2))
        .build();
    let (device, executor) = setup(config);
    device.inject(Fault::Delay(Duration::from_millis(300)));

    thread::scope(|scope| {
        let first = scope.spawn(|| {
            let request = executor.new_request(sale()).unwrap();
            let number = request.session;
            executor.execute(request).map(|response| (number, response))
        });
        thread::sleep(Duration::from_millis(30));
        let second = scope.spawn(|| {
            let request = executor.new_request(sale()).unwrap();
            let number = request.session;
            executor.execute(request).map(|response| (number, response))
        });

        // The second caller waits for the link while the first is answered
        thread::sleep(Duration::from_millis(100));
        assert_eq!(device.requests_seen(), 1);

        let (first_session, first_response) = first.join().unwrap().unwrap();
        let (second_session, second_response) = second.join().unwrap().unwrap();

        assert_ne!(first_session, second_session);
        assert_eq!(first_response.session, first_session);
        assert_eq!(second_response.session, second_session);
        assert_eq!(first_response.status, status(6000));
        assert_eq!(second_response.status, status(6000));
        assert_eq!(device.requests_seen(), 2);
    });
}

// =============================================================================
// Shared Tracker
// =============================================================================

#[test]
fn test_status_queries_during_execution() {
    let config = fast_config()
        .timeout(CommandKind::SendSaleData, Duration::from_secs(2))
        .build();
    let (device, executor) = setup(config);
    device.inject(Fault::Delay(Duration::from_millis(200)));

    let request = executor.new_request(sale()).unwrap();
    let number = request.session;
    let tracker = Arc::clone(executor.tracker());

    let observer = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let SessionState::Pending { kind } = tracker.query_status(number) {
                return Some(kind);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    });

    executor.execute(request).unwrap();
    assert_eq!(observer.join().unwrap(), Some(CommandKind::SendSaleData));
}
