//! One generation run: load and instrument the subject, search, add
//! assertions and write the report.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::config::{Config, CoverageMetric};
use crate::execution::{
    ExecutionSettings, InProcessExecutor, ModuleProvider, SubprocessExecutor, TestCaseExecutor, WorkerCommand,
};
use crate::ga::algorithms::algorithm_for;
use crate::ga::{generate_assertions, minimize_assertions, SearchContext, StoppingConditions};
use crate::testcase::TestFactory;
use crate::tracer::ExecutionTracer;

/// What to generate tests for.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub project: PathBuf,
    pub module: String,
    pub config: Config,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportedTest {
    pub name: String,
    pub statements: usize,
    pub assertions: usize,
    pub source: String,
}

/// The JSON report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub module: String,
    pub algorithm: String,
    pub seed: u64,
    /// RFC 3339
    pub started_at: String,
    pub finished_at: String,
    pub iterations: u64,
    pub stop_reason: Option<String>,
    pub goals: usize,
    pub coverage: BTreeMap<CoverageMetric, f64>,
    pub tests: Vec<ReportedTest>,
}

impl Report {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report directory: {:?}", parent))?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, contents).with_context(|| format!("Failed to write report to {:?}", path))?;
        Ok(())
    }
}

fn clock_seed() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}

/// Run a whole generation. Blocks; call from a blocking thread of the
/// runtime behind `runtime`.
pub fn generate(request: &GenerationRequest, runtime: Handle) -> Result<Report> {
    let config = &request.config;
    let started_at = Utc::now();

    let provider = ModuleProvider::discover(&request.project)
        .with_context(|| format!("Failed to scan project {:?}", request.project))?;
    let settings = ExecutionSettings::from_config(config);
    let tracer = Arc::new(ExecutionTracer::new());
    let subject = Arc::new(
        provider
            .load(&request.module, &tracer, &config.coverage, settings.checked, settings.limits)
            .with_context(|| format!("Failed to load module '{}'", request.module))?,
    );
    let properties = Arc::clone(&subject.properties);
    let cluster = Arc::new(subject.cluster());
    tracing::info!(
        "Module '{}': {} functions, {} classes",
        request.module,
        cluster.functions.len(),
        cluster.classes.len()
    );

    let executor: Arc<dyn TestCaseExecutor> = if config.execution.subprocess {
        let command = WorkerCommand::current_exe().context("Failed to locate the worker binary")?;
        let executor = SubprocessExecutor::new(command, request.project.clone(), config, &subject, runtime.clone());
        runtime
            .block_on(executor.start())
            .context("Failed to start the worker process")?;
        tracing::info!("Executing test cases in a worker process");
        Arc::new(executor)
    } else {
        Arc::new(InProcessExecutor::new(
            Arc::clone(&subject),
            tracer,
            settings,
            runtime,
        ))
    };

    let factory = Arc::new(TestFactory::new(cluster, config.search.clone()));
    let ctx = SearchContext::new(
        Arc::clone(&executor),
        properties,
        factory,
        config.search.clone(),
        config.mio.clone(),
        config.coverage.metrics.clone(),
    );

    let seed = config.search.seed.unwrap_or_else(clock_seed);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut stopping = StoppingConditions::from_config(&config.search);
    let mut algorithm = algorithm_for(config.search.algorithm);
    tracing::info!(
        "Starting {} with seed {} on {} goals",
        algorithm.name(),
        seed,
        ctx.goals.len()
    );
    let mut result = algorithm.generate(&ctx, &mut rng, &mut stopping);

    let mut coverage = BTreeMap::new();
    for &metric in &config.coverage.metrics {
        coverage.insert(metric, result.suite.coverage(metric, &ctx));
    }
    tracing::info!(
        "Search finished after {} iterations ({}): {} tests",
        result.iterations,
        result.stop_reason.unwrap_or("stopped"),
        result.suite.len()
    );
    for (metric, value) in &coverage {
        tracing::info!("{:?} coverage: {:.3}", metric, value);
    }

    let mut tests: Vec<_> = result
        .suite
        .into_tests()
        .into_iter()
        .map(|chromosome| chromosome.test_case().clone())
        .collect();
    if config.coverage.generate_assertions {
        generate_assertions(executor.as_ref(), &mut tests);
        if config.coverage.minimize_assertions {
            minimize_assertions(executor.as_ref(), &mut tests);
        }
    }

    let tests = tests
        .iter()
        .enumerate()
        .map(|(index, test)| {
            let name = format!("test_{}_{}", request.module, index);
            ReportedTest {
                source: test.to_source(&subject.alias, &name),
                name,
                statements: test.len(),
                assertions: test.assertion_count(),
            }
        })
        .collect();

    Ok(Report {
        module: request.module.clone(),
        algorithm: algorithm.name().to_string(),
        seed,
        started_at: started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        iterations: result.iterations,
        stop_reason: result.stop_reason.map(str::to_string),
        goals: ctx.goals.len(),
        coverage,
        tests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Algorithm;
    use std::fs;

    const SUBJECT: &str = "\
def classify(n):
    if n < 0:
        return \"negative\"
    if n == 0:
        return \"zero\"
    return \"positive\"
";

    fn request(dir: &Path, algorithm: Algorithm) -> GenerationRequest {
        let mut config = Config::default();
        config.search.algorithm = algorithm;
        config.search.seed = Some(42);
        config.search.population = 10;
        config.search.max_iterations = Some(30);
        config.search.max_search_time_seconds = 30;
        config.execution.timeout_per_statement_ms = 500;
        GenerationRequest {
            project: dir.to_path_buf(),
            module: "sign".to_string(),
            config,
        }
    }

    fn run(request: GenerationRequest) -> Report {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime
            .block_on(runtime.spawn_blocking(move || generate(&request, handle)))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_generation_produces_a_report() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sign.sub"), SUBJECT).unwrap();
        let report = run(request(dir.path(), Algorithm::DynaMosa));
        assert_eq!(report.module, "sign");
        assert_eq!(report.algorithm, "dyna-mosa");
        assert_eq!(report.seed, 42);
        assert!(!report.tests.is_empty());
        let branch = report.coverage[&CoverageMetric::Branch];
        assert!(branch > 0.0 && branch <= 1.0);
        assert!(report.tests[0].source.starts_with("def test_sign_0():"));
        assert!(chrono::DateTime::parse_from_rfc3339(&report.finished_at).is_ok());
    }

    #[test]
    fn test_report_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sign.sub"), SUBJECT).unwrap();
        let report = run(request(dir.path(), Algorithm::Random));
        let path = dir.path().join("out").join("report.json");
        report.write(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["algorithm"], "random");
        assert!(json["coverage"]["branch"].is_number());
    }

    #[test]
    fn test_missing_module_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = request(dir.path(), Algorithm::Random);
        request.module = "absent".to_string();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        let result = runtime
            .block_on(runtime.spawn_blocking(move || generate(&request, handle)))
            .unwrap();
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("absent"));
    }
}
