//! Test execution in a persistent worker process.
//!
//! Parent and worker exchange one JSON message per line. The parent opens
//! with [`ParentMessage::Configure`]; the worker loads the subject itself and
//! answers [`WorkerMessage::Ready`] with enough about its registry for the
//! parent to check that both sides number code objects, predicates and lines
//! alike. Every [`ParentMessage::Execute`] then gets one
//! [`WorkerMessage::Result`].

use super::{
    ExecutionError, ExecutionResult, ExecutionSettings, InProcessExecutor, LoadedSubject,
    ModuleProvider, TestCaseExecutor,
};
use crate::config::Config;
use crate::testcase::TestCase;
use crate::tracer::{DynamicConstantPool, ExecutionTracer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::sync::Mutex;

/// Time a starting worker gets to load the subject.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    Configure {
        project: PathBuf,
        module: String,
        config: Box<Config>,
    },
    Execute {
        test_case: TestCase,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready(SubjectFingerprint),
    Result {
        result: Box<ExecutionResult>,
        constants: DynamicConstantPool,
    },
    Failed {
        message: String,
    },
}

/// What both sides must agree on before trace ids mean the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFingerprint {
    pub subject_digest: String,
    pub code_objects: usize,
    pub predicates: usize,
    pub lines: usize,
}

impl SubjectFingerprint {
    pub fn of(subject: &LoadedSubject) -> Self {
        Self {
            subject_digest: subject.module.digest.clone(),
            code_objects: subject.properties.existing_code_objects().len(),
            predicates: subject.properties.existing_predicates().len(),
            lines: subject.properties.existing_lines().len(),
        }
    }
}

/// How to start a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// This executable's hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self, ExecutionError> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["worker".to_string()],
        })
    }
}

/// One end of the line protocol.
struct Channel<R, W> {
    lines: Lines<R>,
    writer: W,
}

impl<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin> Channel<R, W> {
    fn new(reader: R, writer: W) -> Self {
        Self {
            lines: reader.lines(),
            writer,
        }
    }

    async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ExecutionError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| ExecutionError::Protocol(e.to_string()))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// The next message, or `None` once the peer closed the stream.
    async fn recv<T: for<'de> Deserialize<'de>>(&mut self) -> Result<Option<T>, ExecutionError> {
        match self.lines.next_line().await? {
            Some(line) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| ExecutionError::Protocol(format!("bad message: {}", e))),
            None => Ok(None),
        }
    }
}

/// Parent side of the handshake and of one request.
struct Session<R, W> {
    channel: Channel<R, W>,
}

impl<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin> Session<R, W> {
    async fn open(
        reader: R,
        writer: W,
        configure: &ParentMessage,
        expected: &SubjectFingerprint,
    ) -> Result<Self, ExecutionError> {
        let mut channel = Channel::new(reader, writer);
        channel.send(configure).await?;
        match channel.recv::<WorkerMessage>().await? {
            Some(WorkerMessage::Ready(fingerprint)) if &fingerprint == expected => Ok(Self { channel }),
            Some(WorkerMessage::Ready(fingerprint)) => Err(ExecutionError::WorkerMismatch(format!(
                "expected {:?}, worker has {:?}",
                expected, fingerprint
            ))),
            Some(WorkerMessage::Failed { message }) => Err(ExecutionError::Protocol(message)),
            Some(other) => Err(ExecutionError::Protocol(format!("unexpected {:?}", other))),
            None => Err(ExecutionError::Protocol("worker exited during startup".to_string())),
        }
    }

    async fn execute(
        &mut self,
        test_case: &TestCase,
    ) -> Result<(ExecutionResult, DynamicConstantPool), ExecutionError> {
        self.channel
            .send(&ParentMessage::Execute {
                test_case: test_case.clone(),
            })
            .await?;
        match self.channel.recv::<WorkerMessage>().await? {
            Some(WorkerMessage::Result { result, constants }) => Ok((*result, constants)),
            Some(WorkerMessage::Failed { message }) => Err(ExecutionError::Protocol(message)),
            Some(other) => Err(ExecutionError::Protocol(format!("unexpected {:?}", other))),
            None => Err(ExecutionError::Protocol("worker exited".to_string())),
        }
    }
}

struct Worker {
    child: Child,
    session: Session<BufReader<ChildStdout>, ChildStdin>,
}

/// Runs test cases in a worker process, restarting it whenever it dies,
/// hangs or answers garbage.
pub struct SubprocessExecutor {
    command: WorkerCommand,
    configure: ParentMessage,
    expected: SubjectFingerprint,
    settings: ExecutionSettings,
    worker: Mutex<Option<Worker>>,
    constants: std::sync::Mutex<DynamicConstantPool>,
    runtime: Handle,
}

impl SubprocessExecutor {
    pub fn new(
        command: WorkerCommand,
        project: PathBuf,
        config: &Config,
        subject: &LoadedSubject,
        runtime: Handle,
    ) -> Self {
        Self {
            command,
            configure: ParentMessage::Configure {
                project,
                module: subject.module.name.clone(),
                config: Box::new(config.clone()),
            },
            expected: SubjectFingerprint::of(subject),
            settings: ExecutionSettings::from_config(config),
            worker: Mutex::new(None),
            constants: std::sync::Mutex::new(DynamicConstantPool::default()),
            runtime,
        }
    }

    /// Start the first worker now so that a mismatch surfaces before the
    /// search begins.
    pub async fn start(&self) -> Result<(), ExecutionError> {
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            *worker = Some(self.spawn_worker().await?);
        }
        Ok(())
    }

    async fn spawn_worker(&self) -> Result<Worker, ExecutionError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ExecutionError::Protocol("worker pipes unavailable".to_string()));
        };
        let open = Session::open(BufReader::new(stdout), stdin, &self.configure, &self.expected);
        let session = match tokio::time::timeout(STARTUP_TIMEOUT, open).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(ExecutionError::Protocol(format!(
                    "worker not ready after {:?}",
                    STARTUP_TIMEOUT
                )));
            }
        };
        tracing::debug!("Worker {:?} ready", child.id());
        Ok(Worker { child, session })
    }

    pub async fn execute_async(&self, test_case: &TestCase) -> ExecutionResult {
        let mut guard = self.worker.lock().await;
        if guard.is_none() {
            match self.spawn_worker().await {
                Ok(worker) => *guard = Some(worker),
                Err(e) => {
                    tracing::error!("Failed to start worker: {}", e);
                    return ExecutionResult::timed_out();
                }
            }
        }
        let Some(worker) = guard.as_mut() else {
            return ExecutionResult::timed_out();
        };

        let budget = self.settings.test_timeout(test_case.len()) + self.settings.subprocess_slack;
        let failure = match tokio::time::timeout(budget, worker.session.execute(test_case)).await {
            Ok(Ok((result, constants))) => {
                self.constants
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .absorb(&constants);
                return result;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer after {:?}", budget),
        };
        tracing::warn!("Worker failed ({}); restarting", failure);
        if let Some(mut dead) = guard.take() {
            let _ = dead.child.kill().await;
        }
        ExecutionResult::timed_out()
    }
}

impl TestCaseExecutor for SubprocessExecutor {
    fn execute(&self, test_case: &TestCase) -> ExecutionResult {
        self.runtime.block_on(self.execute_async(test_case))
    }

    fn constant_pool(&self) -> DynamicConstantPool {
        self.constants
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Worker side: answer a parent over `reader`/`writer` until it closes the
/// stream.
pub async fn serve<R, W>(reader: R, writer: W) -> Result<(), ExecutionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut channel = Channel::new(reader, writer);
    let Some(ParentMessage::Configure {
        project,
        module,
        config,
    }) = channel.recv::<ParentMessage>().await?
    else {
        return Err(ExecutionError::Protocol("expected configure".to_string()));
    };

    let loaded = tokio::task::spawn_blocking(move || load_worker_subject(project, &module, &config))
        .await
        .map_err(|e| ExecutionError::Protocol(format!("loading task failed: {}", e)))?;
    let executor = match loaded {
        Ok(executor) => executor,
        Err(e) => {
            channel
                .send(&WorkerMessage::Failed {
                    message: e.to_string(),
                })
                .await?;
            return Err(e);
        }
    };
    channel
        .send(&WorkerMessage::Ready(SubjectFingerprint::of(executor.subject())))
        .await?;
    tracing::info!("Worker ready for {}", executor.subject().module.name);

    while let Some(message) = channel.recv::<ParentMessage>().await? {
        match message {
            ParentMessage::Execute { test_case } => {
                let result = executor.execute_async(&test_case).await;
                channel
                    .send(&WorkerMessage::Result {
                        result: Box::new(result),
                        constants: executor.constant_pool(),
                    })
                    .await?;
            }
            ParentMessage::Configure { .. } => {
                channel
                    .send(&WorkerMessage::Failed {
                        message: "already configured".to_string(),
                    })
                    .await?;
            }
        }
    }
    tracing::debug!("Parent closed the channel");
    Ok(())
}

fn load_worker_subject(
    project: PathBuf,
    module: &str,
    config: &Config,
) -> Result<InProcessExecutor, ExecutionError> {
    let provider = ModuleProvider::discover(&project)?;
    let settings = ExecutionSettings::from_config(config);
    let tracer = Arc::new(ExecutionTracer::new());
    let subject = provider.load(module, &tracer, &config.coverage, settings.checked, settings.limits)?;
    Ok(InProcessExecutor::new(
        Arc::new(subject),
        tracer,
        settings,
        Handle::current(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::{Primitive, StatementKind};
    use std::fs;

    const SUBJECT: &str = "\
def grade(score):
    if score >= 90:
        return \"A\"
    if score >= 50:
        return \"B\"
    raise ValueError(\"failed\")
";

    fn test_case(score: i64) -> TestCase {
        let mut tc = TestCase::new();
        let s = tc.push(StatementKind::Primitive(Primitive::Int(score)));
        tc.push(StatementKind::FunctionCall {
            function: "grade".to_string(),
            args: vec![s],
        });
        tc
    }

    #[test]
    fn test_messages_are_single_lines() {
        let message = ParentMessage::Execute {
            test_case: test_case(1),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains('\n'));
        assert!(json.starts_with("{\"type\":\"execute\""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_matches_in_process_execution() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("grades.sub"), SUBJECT).unwrap();
        let config = Config::default();

        let project = dir.path().to_path_buf();
        let local = tokio::task::spawn_blocking({
            let project = project.clone();
            let config = config.clone();
            move || load_worker_subject(project, "grades", &config)
        })
        .await
        .unwrap()
        .unwrap();

        let (parent_end, worker_end) = tokio::io::duplex(1 << 16);
        let (worker_read, worker_write) = tokio::io::split(worker_end);
        let server = tokio::spawn(serve(BufReader::new(worker_read), worker_write));

        let (parent_read, parent_write) = tokio::io::split(parent_end);
        let configure = ParentMessage::Configure {
            project,
            module: "grades".to_string(),
            config: Box::new(config),
        };
        let expected = SubjectFingerprint::of(local.subject());
        let mut session = Session::open(BufReader::new(parent_read), parent_write, &configure, &expected)
            .await
            .unwrap();

        for score in [95, 60, 10] {
            let (remote, _) = session.execute(&test_case(score)).await.unwrap();
            let here = local.execute_async(&test_case(score)).await;
            assert_eq!(remote.exceptions, here.exceptions);
            assert_eq!(remote.values, here.values);
            assert_eq!(remote.trace.executed_predicates, here.trace.executed_predicates);
            assert_eq!(remote.trace.checked_lines, here.trace.checked_lines);
        }

        drop(session);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_worker_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("grades.sub"), SUBJECT).unwrap();
        let (parent_end, worker_end) = tokio::io::duplex(1 << 16);
        let (worker_read, worker_write) = tokio::io::split(worker_end);
        let server = tokio::spawn(serve(BufReader::new(worker_read), worker_write));

        let (parent_read, parent_write) = tokio::io::split(parent_end);
        let configure = ParentMessage::Configure {
            project: dir.path().to_path_buf(),
            module: "grades".to_string(),
            config: Box::new(Config::default()),
        };
        let expected = SubjectFingerprint {
            subject_digest: "0".repeat(64),
            code_objects: 2,
            predicates: 2,
            lines: 4,
        };
        let err = Session::open(BufReader::new(parent_read), parent_write, &configure, &expected)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::WorkerMismatch(_)));
        server.abort();
    }

    #[tokio::test]
    async fn test_unknown_module_fails_the_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let (parent_end, worker_end) = tokio::io::duplex(1 << 16);
        let (worker_read, worker_write) = tokio::io::split(worker_end);
        let server = tokio::spawn(serve(BufReader::new(worker_read), worker_write));

        let (parent_read, parent_write) = tokio::io::split(parent_end);
        let configure = ParentMessage::Configure {
            project: dir.path().to_path_buf(),
            module: "missing".to_string(),
            config: Box::new(Config::default()),
        };
        let expected = SubjectFingerprint {
            subject_digest: String::new(),
            code_objects: 0,
            predicates: 0,
            lines: 0,
        };
        let err = Session::open(BufReader::new(parent_read), parent_write, &configure, &expected)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("missing"));
        assert!(server.await.unwrap().is_err());
    }
}
