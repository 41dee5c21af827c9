//! Shared test helpers for broker tests.

#![allow(dead_code)]

use async_trait::async_trait;
use corral_broker::transport::mock::LoopbackFactory;
use corral_broker::{
    BrokerConfig, BrokerError, BrokerEvent, BrokerResult, ExecutionService, Transport,
    TransportConfig, TransportKind,
};
use corral_types::{JobId, Origin};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn origin(s: &str) -> Origin {
    Origin::new(s).unwrap()
}

/// Transport config for loopback jobs.
pub fn worker_config() -> TransportConfig {
    TransportConfig::Custom {
        transport: TransportKind::Worker,
        options: Value::Null,
    }
}

pub fn fast_config() -> BrokerConfig {
    BrokerConfig {
        init_timeout_ms: 1_000,
        call_timeout_ms: 1_000,
        ..BrokerConfig::default()
    }
}

/// Service over `factory` with an initialized job.
pub async fn service_with_job(factory: &LoopbackFactory) -> (ExecutionService, JobId) {
    let service = ExecutionService::new(fast_config(), factory.clone()).unwrap();
    let job_id = JobId::new();
    service.initialize(job_id, &worker_config()).await.unwrap();
    (service, job_id)
}

/// Waits for the first event matching `pred`, skipping others.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<BrokerEvent>,
    pred: impl Fn(&BrokerEvent) -> bool,
) -> BrokerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Polls `cond` until it holds, yielding to other tasks in between.
pub async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Transport that records everything sent through it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<VecDeque<Value>>,
    closed: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<Value> {
        self.sent.lock().unwrap().pop_front()
    }

    pub fn drain(&self) -> Vec<Value> {
        self.sent.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Window
    }

    fn send(&self, message: Value) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::TransportFailure("closed".into()));
        }
        self.sent.lock().unwrap().push_back(message);
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}
