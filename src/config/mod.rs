use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Search algorithm and its budget
    #[serde(default)]
    pub search: SearchConfig,

    /// Test case execution
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Coverage metrics and post-processing
    #[serde(default)]
    pub coverage: CoverageConfig,

    /// MIO parameters
    #[serde(default)]
    pub mio: MioConfig,

    /// Report output
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    WholeSuite,
    Mosa,
    DynaMosa,
    Mio,
    Random,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::WholeSuite => "whole-suite",
            Algorithm::Mosa => "mosa",
            Algorithm::DynaMosa => "dyna-mosa",
            Algorithm::Mio => "mio",
            Algorithm::Random => "random",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,

    /// Random seed; drawn from the clock when absent
    #[serde(default)]
    pub seed: Option<u64>,

    /// Individuals per generation
    #[serde(default = "default_population")]
    pub population: usize,

    /// Stop after this many iterations
    #[serde(default)]
    pub max_iterations: Option<u64>,

    /// Stop after this many seconds of search
    #[serde(default = "default_max_search_time")]
    pub max_search_time_seconds: u64,

    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,

    /// Probability of inserting a new test into a suite during mutation
    #[serde(default = "default_test_insertion_probability")]
    pub test_insertion_probability: f64,

    #[serde(default = "default_third")]
    pub test_delete_probability: f64,

    #[serde(default = "default_third")]
    pub test_change_probability: f64,

    #[serde(default = "default_third")]
    pub test_insert_probability: f64,

    /// Decay of repeated statement insertion during mutation
    #[serde(default = "default_statement_insertion_probability")]
    pub statement_insertion_probability: f64,

    /// Maximum statements per test case
    #[serde(default = "default_chromosome_length")]
    pub chromosome_length: usize,

    /// Maximum tests per suite
    #[serde(default = "default_max_suite_size")]
    pub max_suite_size: usize,

    #[serde(default = "default_min_initial_tests")]
    pub min_initial_tests: usize,

    #[serde(default = "default_max_initial_tests")]
    pub max_initial_tests: usize,

    /// Individuals copied unchanged into the next generation
    #[serde(default = "default_elite")]
    pub elite: usize,

    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,

    #[serde(default = "default_rank_bias")]
    pub rank_bias: f64,

    /// Probability of passing an existing variable instead of a new value
    #[serde(default = "default_primitive_reuse_probability")]
    pub primitive_reuse_probability: f64,

    /// Probability of drawing a primitive from the dynamic constant pool
    #[serde(default = "default_seeded_primitives_reuse_probability")]
    pub seeded_primitives_reuse_probability: f64,

    /// Random integers are drawn from `-max_int..=max_int`
    #[serde(default = "default_max_int")]
    pub max_int: i64,

    #[serde(default = "default_string_length")]
    pub string_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock budget per statement of a test case
    #[serde(default = "default_timeout_per_statement_ms")]
    pub timeout_per_statement_ms: u64,

    /// Run test cases in a worker subprocess
    #[serde(default)]
    pub subprocess: bool,

    /// Extra time granted to the worker before it is killed
    #[serde(default = "default_subprocess_slack_ms")]
    pub subprocess_slack_ms: u64,

    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,

    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageMetric {
    Branch,
    Line,
    Checked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageConfig {
    /// Metrics the search optimises
    #[serde(default = "default_metrics")]
    pub metrics: Vec<CoverageMetric>,

    /// Feed comparison operands back into test generation
    #[serde(default = "default_enabled")]
    pub dynamic_seeding: bool,

    #[serde(default = "default_max_slicing_time_ms")]
    pub max_slicing_time_ms: u64,

    #[serde(default = "default_enabled")]
    pub generate_assertions: bool,

    /// Drop assertions whose slices check no new line
    #[serde(default = "default_enabled")]
    pub minimize_assertions: bool,
}

impl CoverageConfig {
    pub fn has(&self, metric: CoverageMetric) -> bool {
        self.metrics.contains(&metric)
    }

    /// Checked lines are needed for the metric itself or for minimisation.
    pub fn needs_checked(&self) -> bool {
        self.has(CoverageMetric::Checked) || (self.generate_assertions && self.minimize_assertions)
    }
}

/// Parameters of one MIO phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MioPhaseConfig {
    pub number_of_tests_per_target: usize,
    pub random_test_or_from_archive_probability: f64,
    pub number_of_mutations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MioConfig {
    #[serde(default = "default_mio_initial")]
    pub initial: MioPhaseConfig,

    #[serde(default = "default_mio_focused")]
    pub focused: MioPhaseConfig,

    /// Fraction of the search budget after which the focused phase starts
    #[serde(default = "default_exploitation_starts_at")]
    pub exploitation_starts_at_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Where the JSON report is written
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_algorithm() -> Algorithm {
    Algorithm::DynaMosa
}

fn default_population() -> usize {
    50
}

fn default_max_search_time() -> u64 {
    60
}

fn default_crossover_rate() -> f64 {
    0.75
}

fn default_test_insertion_probability() -> f64 {
    0.1
}

fn default_third() -> f64 {
    1.0 / 3.0
}

fn default_statement_insertion_probability() -> f64 {
    0.5
}

fn default_chromosome_length() -> usize {
    40
}

fn default_max_suite_size() -> usize {
    100
}

fn default_min_initial_tests() -> usize {
    1
}

fn default_max_initial_tests() -> usize {
    10
}

fn default_elite() -> usize {
    1
}

fn default_tournament_size() -> usize {
    5
}

fn default_rank_bias() -> f64 {
    1.7
}

fn default_primitive_reuse_probability() -> f64 {
    0.5
}

fn default_seeded_primitives_reuse_probability() -> f64 {
    0.2
}

fn default_max_int() -> i64 {
    2048
}

fn default_string_length() -> usize {
    20
}

fn default_timeout_per_statement_ms() -> u64 {
    1000
}

fn default_subprocess_slack_ms() -> u64 {
    2000
}

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_max_recursion_depth() -> usize {
    100
}

fn default_metrics() -> Vec<CoverageMetric> {
    vec![CoverageMetric::Branch]
}

fn default_enabled() -> bool {
    true
}

fn default_max_slicing_time_ms() -> u64 {
    2000
}

fn default_mio_initial() -> MioPhaseConfig {
    MioPhaseConfig {
        number_of_tests_per_target: 10,
        random_test_or_from_archive_probability: 0.5,
        number_of_mutations: 1,
    }
}

fn default_mio_focused() -> MioPhaseConfig {
    MioPhaseConfig {
        number_of_tests_per_target: 1,
        random_test_or_from_archive_probability: 0.0,
        number_of_mutations: 10,
    }
}

fn default_exploitation_starts_at() -> f64 {
    0.5
}

fn default_report_path() -> PathBuf {
    PathBuf::from("probegen-report.json")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            seed: None,
            population: default_population(),
            max_iterations: None,
            max_search_time_seconds: default_max_search_time(),
            crossover_rate: default_crossover_rate(),
            test_insertion_probability: default_test_insertion_probability(),
            test_delete_probability: default_third(),
            test_change_probability: default_third(),
            test_insert_probability: default_third(),
            statement_insertion_probability: default_statement_insertion_probability(),
            chromosome_length: default_chromosome_length(),
            max_suite_size: default_max_suite_size(),
            min_initial_tests: default_min_initial_tests(),
            max_initial_tests: default_max_initial_tests(),
            elite: default_elite(),
            tournament_size: default_tournament_size(),
            rank_bias: default_rank_bias(),
            primitive_reuse_probability: default_primitive_reuse_probability(),
            seeded_primitives_reuse_probability: default_seeded_primitives_reuse_probability(),
            max_int: default_max_int(),
            string_length: default_string_length(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_per_statement_ms: default_timeout_per_statement_ms(),
            subprocess: false,
            subprocess_slack_ms: default_subprocess_slack_ms(),
            max_instructions: default_max_instructions(),
            max_recursion_depth: default_max_recursion_depth(),
        }
    }
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
            dynamic_seeding: default_enabled(),
            max_slicing_time_ms: default_max_slicing_time_ms(),
            generate_assertions: default_enabled(),
            minimize_assertions: default_enabled(),
        }
    }
}

impl Default for MioConfig {
    fn default() -> Self {
        Self {
            initial: default_mio_initial(),
            focused: default_mio_focused(),
            exploitation_starts_at_percent: default_exploitation_starts_at(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            report_path: default_report_path(),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);

        let config = if let Some(ref path) = config_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(Self::default_config_path)
            .context("No config path available")?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config to {:?}", config_path))?;

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "probegen", "probegen")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Per-test-case wall-clock budget
    pub fn test_timeout(&self, statements: usize) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.execution
                .timeout_per_statement_ms
                .saturating_mul(statements.max(1) as u64),
        )
    }

    pub fn vm_limits(&self) -> crate::vm::VmLimits {
        crate::vm::VmLimits {
            max_depth: self.execution.max_recursion_depth,
            max_instructions: self.execution.max_instructions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Default value tests
    // =========================================================================

    #[test]
    fn test_default_search_config() {
        let config = SearchConfig::default();
        assert_eq!(config.algorithm, Algorithm::DynaMosa);
        assert_eq!(config.population, 50);
        assert!(config.seed.is_none());
        assert!((config.test_delete_probability - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_default_general_config() {
        let config = GeneralConfig::default();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_default_coverage_config() {
        let config = CoverageConfig::default();
        assert_eq!(config.metrics, vec![CoverageMetric::Branch]);
        assert!(config.needs_checked());
    }

    // =========================================================================
    // Config parsing tests
    // =========================================================================

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[general]
log_level = "debug"

[search]
algorithm = "mio"
seed = 42
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.search.algorithm, Algorithm::Mio);
        assert_eq!(config.search.seed, Some(42));
        // Defaults should still apply
        assert_eq!(config.search.chromosome_length, 40);
        assert_eq!(config.execution.timeout_per_statement_ms, 1000);
    }

    #[test]
    fn test_parse_coverage_and_mio() {
        let toml = r#"
[coverage]
metrics = ["branch", "line", "checked"]
minimize_assertions = false

[mio.focused]
number_of_tests_per_target = 2
random_test_or_from_archive_probability = 0.0
number_of_mutations = 5
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.coverage.has(CoverageMetric::Checked));
        assert!(!config.coverage.minimize_assertions);
        assert_eq!(config.mio.focused.number_of_mutations, 5);
        assert_eq!(config.mio.initial.number_of_tests_per_target, 10);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.search.population, 50);
        assert!(!config.execution.subprocess);
        assert_eq!(config.output.report_path, PathBuf::from("probegen-report.json"));
    }

    #[test]
    fn test_timeout_scales_with_statements() {
        let config = Config::default();
        assert_eq!(config.test_timeout(3).as_millis(), 3000);
        assert_eq!(config.test_timeout(0).as_millis(), 1000);
    }

    // =========================================================================
    // File I/O tests
    // =========================================================================

    #[test]
    fn test_config_load_nonexistent() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(temp_file.path()).unwrap();

        let config = Config::load(Some(temp_file.path())).unwrap();
        assert_eq!(config.search.population, 50);
    }

    #[test]
    fn test_config_load_valid_file() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();

        let toml_content = r#"
[search]
algorithm = "whole-suite"
population = 10

[execution]
subprocess = true
"#;

        std::fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load(Some(temp_file.path())).unwrap();
        assert_eq!(config.search.algorithm, Algorithm::WholeSuite);
        assert_eq!(config.search.population, 10);
        assert!(config.execution.subprocess);
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();

        std::fs::write(temp_file.path(), "invalid {{{{ toml").unwrap();

        let result = Config::load(Some(temp_file.path()));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_round_trips() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();

        let mut config = Config::default();
        config.search.seed = Some(7);
        config.coverage.metrics = vec![CoverageMetric::Line];

        config.save(Some(temp_file.path())).unwrap();

        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        assert!(content.contains("log_level"));
        assert!(content.contains("dyna-mosa"));

        let loaded = Config::load(Some(temp_file.path())).unwrap();
        assert_eq!(loaded.search.seed, Some(7));
        assert_eq!(loaded.coverage.metrics, vec![CoverageMetric::Line]);
    }

    #[test]
    fn test_config_save_creates_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("subdir").join("config.toml");

        let config = Config::default();
        config.save(Some(&config_path)).unwrap();

        assert!(config_path.exists());
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.is_some());
        assert!(path.unwrap().ends_with("config.toml"));
    }
}
