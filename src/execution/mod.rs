//! Running test cases against the instrumented subject.
//!
//! [`ModuleProvider`] finds, compiles, instruments and imports the subject
//! once. Executors then run each test case on a worker with a wall-clock
//! timeout: [`InProcessExecutor`] on a blocking thread of the tokio runtime,
//! [`SubprocessExecutor`] in a persistent `probegen worker` process.

mod executor;
mod observers;
mod provider;
mod subprocess;

pub use executor::InProcessExecutor;
pub use provider::{LoadedSubject, ModuleProvider};
pub use subprocess::{serve, SubprocessExecutor, WorkerCommand};

use crate::bytecode::LineId;
use crate::config::Config;
use crate::instrumentation::InstrumentationError;
use crate::lang::CompileError;
use crate::testcase::{Primitive, TestCase};
use crate::tracer::{DynamicConstantPool, ExecutionTrace};
use crate::vm::value::Value;
use crate::vm::VmLimits;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to scan the project: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("module '{0}' not found in the project")]
    ModuleNotFound(String),
    #[error("module '{module}' does not compile: {source}")]
    Compile {
        module: String,
        #[source]
        source: CompileError,
    },
    #[error(transparent)]
    Instrumentation(#[from] InstrumentationError),
    #[error("importing '{module}' raised {exception}")]
    Import {
        module: String,
        exception: RaisedException,
    },
    #[error("worker protocol: {0}")]
    Protocol(String),
    #[error("worker does not match this subject: {0}")]
    WorkerMismatch(String),
    #[error("worker i/o: {0}")]
    WorkerIo(#[from] std::io::Error),
}

/// An exception a statement raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaisedException {
    pub kind: String,
    pub message: String,
}

impl RaisedException {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Exception(exc) => Self {
                kind: exc.kind.name().to_string(),
                message: exc.message.clone(),
            },
            other => Self {
                kind: other.type_name(),
                message: other.to_display(),
            },
        }
    }
}

impl std::fmt::Display for RaisedException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Checked lines of one assertion's slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionLines {
    pub statement: usize,
    pub assertion: usize,
    pub lines: BTreeSet<LineId>,
}

/// Everything one execution of a test case produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Empty when the execution timed out.
    pub trace: ExecutionTrace,
    /// Statement index -> the exception it raised. At most one entry: the
    /// first raising statement ends the test case.
    pub exceptions: BTreeMap<usize, RaisedException>,
    pub timeout: bool,
    /// Primitive values bound by statements, by statement index.
    pub values: BTreeMap<usize, Primitive>,
    /// Type names of the values bound by statements.
    pub return_types: BTreeMap<usize, String>,
    pub assertion_lines: Vec<AssertionLines>,
}

impl ExecutionResult {
    pub fn timed_out() -> Self {
        Self {
            timeout: true,
            ..Default::default()
        }
    }

    pub fn has_test_exceptions(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// Index of the statement that raised, if any.
    pub fn first_exception(&self) -> Option<usize> {
        self.exceptions.keys().next().copied()
    }

    /// Neither timed out nor raised.
    pub fn is_clean(&self) -> bool {
        !self.timeout && !self.has_test_exceptions()
    }
}

/// Runs test cases. Implementations are safe to share with the search.
pub trait TestCaseExecutor: Send + Sync {
    fn execute(&self, test_case: &TestCase) -> ExecutionResult;

    /// Everything the dynamic seeding probes collected so far.
    fn constant_pool(&self) -> DynamicConstantPool;
}

/// The execution-relevant part of the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub limits: VmLimits,
    pub timeout_per_statement: Duration,
    pub subprocess_slack: Duration,
    pub max_slicing_time: Duration,
    /// Run statements checked-instrumented and compute checked lines.
    pub checked: bool,
    /// Slice every executed assertion.
    pub assertion_lines: bool,
}

impl ExecutionSettings {
    pub fn from_config(config: &Config) -> Self {
        let assertion_lines =
            config.coverage.generate_assertions && config.coverage.minimize_assertions;
        Self {
            limits: config.vm_limits(),
            timeout_per_statement: Duration::from_millis(config.execution.timeout_per_statement_ms),
            subprocess_slack: Duration::from_millis(config.execution.subprocess_slack_ms),
            max_slicing_time: Duration::from_millis(config.coverage.max_slicing_time_ms),
            checked: config.coverage.needs_checked(),
            assertion_lines,
        }
    }

    /// Wall-clock budget of a whole test case.
    pub fn test_timeout(&self, statements: usize) -> Duration {
        self.timeout_per_statement
            .saturating_mul(statements.max(1) as u32)
    }
}
