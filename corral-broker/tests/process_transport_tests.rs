//! End-to-end tests against the `corral-echo-worker` binary.

#![cfg(unix)]

mod common;

use common::{eventually, origin, wait_for_event};
use corral_broker::transport::{ProcessConfig, ProcessTransportFactory, StandardTransportFactory};
use corral_broker::{
    BrokerConfig, BrokerError, BrokerEvent, ExecutionService, JobStatus, TerminationReason,
    TransportConfig, TransportKind,
};
use corral_types::JobId;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::time::Duration;

const WORKER: &str = env!("CARGO_BIN_EXE_corral-echo-worker");

fn worker() -> TransportConfig {
    TransportConfig::Process(ProcessConfig::new(WORKER))
}

fn config() -> BrokerConfig {
    BrokerConfig {
        init_timeout_ms: 5_000,
        call_timeout_ms: 5_000,
        ..BrokerConfig::default()
    }
}

async fn started(transport: TransportConfig) -> (ExecutionService, JobId) {
    let service = ExecutionService::new(config(), StandardTransportFactory::new()).unwrap();
    let job_id = JobId::new();
    service.initialize(job_id, &transport).await.unwrap();
    (service, job_id)
}

#[tokio::test]
async fn ping_and_echo_over_stdio() {
    let (service, job_id) = started(worker()).await;
    let caller = origin("app://process");

    assert_eq!(service.ping(job_id).await.unwrap(), json!("pong"));
    let params = json!({ "text": "héllo", "n": [1, 2, 3] });
    let echoed = service
        .execute_in_job(&caller, job_id, "echo", params.clone(), None)
        .await
        .unwrap();
    assert_eq!(echoed, params);
    assert_eq!(service.job_info(job_id).unwrap().kind, TransportKind::Process);

    service.terminate(job_id).await.unwrap();
}

#[tokio::test]
async fn unknown_method_is_an_rpc_error() {
    let (service, job_id) = started(worker()).await;
    let err = service
        .execute_in_job(&origin("app://process"), job_id, "nope", Value::Null, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Rpc(_)));
    service.terminate(job_id).await.unwrap();
}

#[tokio::test]
async fn slow_call_times_out_and_kills_worker() {
    let (service, job_id) = started(worker()).await;
    let err = service
        .execute_in_job(
            &origin("app://process"),
            job_id,
            "sleep",
            json!({ "ms": 5_000 }),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::CallTimeout { .. }));
    assert_eq!(service.job_status(job_id), Some(JobStatus::Terminated));

    let err = service.ping(job_id).await.unwrap_err();
    assert!(matches!(err, BrokerError::Terminated(_)));
}

#[tokio::test]
async fn delayed_worker_answers_within_deadline() {
    let transport = TransportConfig::Process(ProcessConfig::new(WORKER).arg("--delay-ms").arg("20"));
    let (service, job_id) = started(transport).await;
    assert_eq!(service.ping(job_id).await.unwrap(), json!("pong"));
    service.terminate(job_id).await.unwrap();
}

#[tokio::test]
async fn worker_crash_report_terminates_job() {
    let (service, job_id) = started(worker()).await;
    let mut events = service.subscribe();

    let caller = origin("app://process");
    let call = service.execute_in_job(
        &caller,
        job_id,
        "crash",
        Value::Null,
        None,
    );
    let (result, event) = tokio::join!(
        call,
        wait_for_event(&mut events, |e| matches!(e, BrokerEvent::JobTerminated { .. }))
    );
    assert!(matches!(result, Err(BrokerError::Terminated(_))));
    assert!(matches!(
        event,
        BrokerEvent::JobTerminated {
            reason: TerminationReason::UnhandledError { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn worker_exit_terminates_job() {
    let (service, job_id) = started(worker()).await;
    let mut events = service.subscribe();

    let caller = origin("app://process");
    let call = service.execute_in_job(&caller, job_id, "exit", Value::Null, None);
    let (result, event) = tokio::join!(
        call,
        wait_for_event(&mut events, |e| matches!(e, BrokerEvent::JobTerminated { .. }))
    );
    assert!(matches!(result, Err(BrokerError::Terminated(_))));
    assert_eq!(
        event,
        BrokerEvent::JobTerminated {
            job_id,
            reason: TerminationReason::TransportClosed,
            release_error: None,
        }
    );
    eventually(|| service.job_count() == 0).await;
}

#[tokio::test]
async fn worker_without_handshake_times_out() {
    let service = ExecutionService::new(
        BrokerConfig {
            init_timeout_ms: 300,
            ..config()
        },
        ProcessTransportFactory,
    )
    .unwrap();
    let transport = TransportConfig::Process(ProcessConfig::new(WORKER).arg("--no-handshake"));

    let err = service.initialize(JobId::new(), &transport).await.unwrap_err();
    assert!(matches!(err, BrokerError::HandshakeTimeout { .. }));
    assert_eq!(service.job_count(), 0);
}

#[tokio::test]
async fn missing_program_is_transport_failure() {
    let service = ExecutionService::new(config(), ProcessTransportFactory).unwrap();
    let transport =
        TransportConfig::Process(ProcessConfig::new("/nonexistent/corral-worker-binary"));
    let err = service.initialize(JobId::new(), &transport).await.unwrap_err();
    assert!(matches!(err, BrokerError::TransportFailure(_)));
}

#[tokio::test]
async fn process_factory_rejects_other_kinds() {
    let service = ExecutionService::new(config(), ProcessTransportFactory).unwrap();
    let err = service
        .initialize(
            JobId::new(),
            &TransportConfig::Custom {
                transport: TransportKind::Window,
                options: Value::Null,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::TransportFailure(_)));
}

#[test]
fn transport_config_is_tagged_by_kind() {
    let config: TransportConfig = serde_json::from_value(json!({
        "kind": "process",
        "program": "/usr/bin/plugin",
        "args": ["--fast"]
    }))
    .unwrap();
    assert_eq!(config.kind(), TransportKind::Process);
    assert_eq!(
        config,
        TransportConfig::Process(ProcessConfig::new("/usr/bin/plugin").arg("--fast"))
    );
}
