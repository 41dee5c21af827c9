//! Child-process transport: framed JSON over the child's stdin/stdout.

use super::{ChannelTransport, OpenedTransport, Transport, TransportConfig, TransportFactory, TransportKind};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use corral_proto::{read_frame, write_message};
use corral_types::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// How to launch the plugin process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Spawns one child process per job.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTransportFactory;

#[async_trait]
impl TransportFactory for ProcessTransportFactory {
    async fn open(&self, job_id: JobId, config: &TransportConfig) -> BrokerResult<OpenedTransport> {
        let TransportConfig::Process(config) = config else {
            return Err(BrokerError::TransportFailure(format!(
                "process factory cannot open {} transports",
                config.kind()
            )));
        };

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            BrokerError::TransportFailure(format!(
                "failed to spawn '{}': {}",
                config.program.display(),
                e
            ))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(BrokerError::TransportFailure(
                "child stdio was not captured".into(),
            ));
        };

        info!(job_id = %job_id, pid = ?child.id(), program = %config.program.display(), "spawned plugin process");

        let (channel, outbound) = ChannelTransport::pair(TransportKind::Process);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(job_id, stdin, outbound));
        tokio::spawn(read_loop(job_id, stdout, inbound_tx));
        tokio::spawn(stderr_loop(job_id, stderr));

        let transport = ProcessTransport {
            job_id,
            channel,
            child: Mutex::new(Some(child)),
        };
        Ok(OpenedTransport {
            transport: Arc::new(transport),
            inbound,
        })
    }
}

/// Host handle to a running plugin process.
pub struct ProcessTransport {
    job_id: JobId,
    channel: ChannelTransport,
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    fn send(&self, message: Value) -> BrokerResult<()> {
        self.channel.send(message)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.channel.shutdown();
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        child.kill().await.map_err(|e| {
            BrokerError::TransportFailure(format!("failed to kill plugin process: {e}"))
        })?;
        debug!(job_id = %self.job_id, "plugin process killed");
        Ok(())
    }
}

async fn write_loop(job_id: JobId, mut stdin: ChildStdin, mut outbound: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_message(&mut stdin, &message).await {
            warn!(job_id = %job_id, error = %e, "write to plugin stdin failed");
            break;
        }
    }
}

async fn read_loop(job_id: JobId, mut stdout: ChildStdout, inbound: mpsc::UnboundedSender<Value>) {
    loop {
        let frame = match read_frame(&mut stdout).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(job_id = %job_id, "plugin stdout closed");
                break;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "unreadable frame from plugin");
                break;
            }
        };
        let message = match serde_json::from_slice::<Value>(&frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "dropping undecodable frame");
                continue;
            }
        };
        if inbound.send(message).is_err() {
            break;
        }
    }
}

async fn stderr_loop(job_id: JobId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(job_id = %job_id, "plugin stderr: {}", line);
    }
}
