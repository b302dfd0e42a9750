use super::{ExecutionError, RaisedException};
use crate::config::CoverageConfig;
use crate::config::CoverageMetric;
use crate::instrumentation::{adapters_for, instrument_statement, InstrumentationTransformer};
use crate::lang::{ast, compile_module, compile_statement, is_keyword, parse_module};
use crate::testcase::TestCluster;
use crate::tracer::{CodeObjectMetaData, ExecutionTracer, SubjectProperties};
use crate::vm::value::{new_namespace, Value};
use crate::vm::{Interpreter, ModuleTable, Unwind, VmLimits};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// File extension of subject modules.
pub const SUBJECT_EXTENSION: &str = "sub";

/// Hex SHA-256 of a module source.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !is_keyword(name)
}

#[derive(Debug, Clone)]
pub struct SubjectModule {
    pub name: String,
    pub path: PathBuf,
    /// Path relative to the project root; the file name of its code objects.
    pub file_name: String,
    pub source: String,
    pub digest: String,
}

/// Modules of one project directory, by name.
#[derive(Debug, Clone)]
pub struct ModuleProvider {
    root: PathBuf,
    modules: BTreeMap<String, PathBuf>,
}

impl ModuleProvider {
    /// Find every module below `root`, skipping hidden and `target`
    /// directories.
    pub fn discover(root: &Path) -> Result<Self, ExecutionError> {
        let skip_dirs = ["target", "node_modules"];
        let mut modules: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in walkdir::WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0 || (!name.starts_with('.') && !skip_dirs.contains(&name.as_ref()))
            })
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || !path.extension().is_some_and(|ext| ext == SUBJECT_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if !is_identifier(&name) {
                tracing::warn!("Skipping {}: '{}' is not a module name", path.display(), name);
                continue;
            }
            if let Some(first) = modules.get(&name) {
                tracing::warn!(
                    "Module '{}' found at {} and {}; keeping the first",
                    name,
                    first.display(),
                    path.display()
                );
                continue;
            }
            modules.insert(name, path.to_path_buf());
        }
        tracing::debug!("Found {} modules under {}", modules.len(), root.display());
        Ok(Self {
            root: root.to_path_buf(),
            modules,
        })
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn read(&self, name: &str) -> Result<SubjectModule, ExecutionError> {
        let path = self
            .modules
            .get(name)
            .ok_or_else(|| ExecutionError::ModuleNotFound(name.to_string()))?;
        let source = std::fs::read_to_string(path).map_err(|source| ExecutionError::Read {
            path: path.clone(),
            source,
        })?;
        let file_name = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        Ok(SubjectModule {
            name: name.to_string(),
            path: path.clone(),
            file_name,
            digest: compute_hash(&source),
            source,
        })
    }

    /// Compile and instrument `subject`, register every other module
    /// uninstrumented, import the subject once and keep that import as the
    /// trace baseline.
    pub fn load(
        &self,
        subject: &str,
        tracer: &Arc<ExecutionTracer>,
        coverage: &CoverageConfig,
        checked: bool,
        limits: VmLimits,
    ) -> Result<LoadedSubject, ExecutionError> {
        let module = self.read(subject)?;
        let compile_error = |source| ExecutionError::Compile {
            module: subject.to_string(),
            source,
        };
        let ast = parse_module(&module.source).map_err(compile_error)?;
        let code = compile_module(&module.source, &module.file_name).map_err(compile_error)?;

        let adapters = adapters_for(
            coverage.has(CoverageMetric::Branch),
            coverage.has(CoverageMetric::Line),
            checked,
            coverage.dynamic_seeding,
        );
        let instrumented =
            InstrumentationTransformer::new(Arc::clone(tracer), adapters).instrument_module(&code)?;

        let modules = Arc::new(ModuleTable::new());
        modules.register(subject, Arc::new(instrumented));
        for name in self.module_names().filter(|n| *n != subject) {
            let other = self.read(name)?;
            match compile_module(&other.source, &other.file_name) {
                Ok(code) => modules.register(name, Arc::new(code)),
                Err(err) => tracing::warn!("Module '{}' does not compile, not importable: {}", name, err),
            }
        }

        let loader_code = compile_statement(&format!("import {}\n", subject)).map_err(compile_error)?;
        let loader_id = tracer.properties().existing_code_objects().len();
        let runnable = if checked {
            instrument_statement(&loader_code, loader_id)?
        } else {
            loader_code.clone()
        };

        tracer.set_current_thread();
        tracer.clear_trace();
        let namespace = new_namespace();
        let mut vm = Interpreter::new(
            Arc::clone(tracer),
            Arc::clone(&modules),
            limits,
            Arc::new(AtomicBool::new(false)),
        );
        match vm.run_code(Arc::new(runnable), &namespace) {
            Ok(_) => {}
            Err(Unwind::Raise(exc)) => {
                return Err(ExecutionError::Import {
                    module: subject.to_string(),
                    exception: RaisedException::from_value(&exc),
                })
            }
            Err(Unwind::Halt(reason)) => {
                return Err(ExecutionError::Import {
                    module: subject.to_string(),
                    exception: RaisedException {
                        kind: "Halt".to_string(),
                        message: format!("{:?}", reason),
                    },
                })
            }
        }
        tracer.store_import_trace();

        let module_value = namespace
            .lock()
            .get(subject)
            .cloned()
            .ok_or_else(|| ExecutionError::ModuleNotFound(subject.to_string()))?;
        let properties = Arc::new(tracer.properties().clone());
        tracing::info!(
            "Loaded module {} from {} (digest {})",
            subject,
            module.path.display(),
            &module.digest[..12]
        );
        Ok(LoadedSubject {
            alias: subject.to_string(),
            module,
            ast,
            modules,
            module_value,
            loader: CodeObjectMetaData::new(Arc::new(loader_code), None),
            properties,
        })
    }
}

/// The imported subject every execution starts from.
#[derive(Debug)]
pub struct LoadedSubject {
    pub module: SubjectModule,
    /// Name the module is bound to in test namespaces.
    pub alias: String,
    pub ast: ast::Module,
    pub modules: Arc<ModuleTable>,
    pub module_value: Value,
    /// The statement that imported the subject; first entry of every
    /// execution's statement registry.
    pub loader: CodeObjectMetaData,
    /// Snapshot taken after instrumentation and import.
    pub properties: Arc<SubjectProperties>,
}

impl LoadedSubject {
    pub fn cluster(&self) -> TestCluster {
        TestCluster::from_module(&self.alias, &self.ast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("calc.sub"),
            "import util\ndef double(x):\n    return util.twice(x)\n",
        )
        .unwrap();
        fs::write(dir.path().join("util.sub"), "def twice(x):\n    return x * 2\n").unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join(".hidden").join("ghost.sub"), "x = 1\n").unwrap();
        fs::write(dir.path().join("not-a-name.sub"), "x = 1\n").unwrap();
        dir
    }

    #[test]
    fn test_compute_hash_known_value() {
        assert_eq!(
            compute_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_discover_skips_hidden_and_invalid_names() {
        let dir = project();
        let provider = ModuleProvider::discover(dir.path()).unwrap();
        let names: Vec<&str> = provider.module_names().collect();
        assert_eq!(names, vec!["calc", "util"]);
        assert!(matches!(
            provider.read("ghost"),
            Err(ExecutionError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_discover_keeps_first_of_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("calc.sub"), "x = 1\n").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("calc.sub"), "x = 2\n").unwrap();
        let provider = ModuleProvider::discover(dir.path()).unwrap();
        assert_eq!(provider.module_names().count(), 1);
        let module = provider.read("calc").unwrap();
        assert_eq!(module.file_name, "calc.sub");
        assert_eq!(module.source, "x = 1\n");
    }

    #[test]
    fn test_load_instruments_only_the_subject() {
        let dir = project();
        let provider = ModuleProvider::discover(dir.path()).unwrap();
        let tracer = Arc::new(ExecutionTracer::new());
        let loaded = provider
            .load("calc", &tracer, &CoverageConfig::default(), true, VmLimits::default())
            .unwrap();
        assert!(matches!(loaded.module_value, Value::Module(_)));
        let names: Vec<&str> = loaded
            .properties
            .existing_code_objects()
            .iter()
            .map(|m| m.code_object.name.as_str())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[1], "double");
        assert!(tracer.has_import_trace());
        let trace = tracer.get_trace();
        assert!(trace.executed_code_objects.contains(&0));
        assert!(!trace.executed_instructions.is_empty());
        assert_eq!(loaded.cluster().functions[0].name, "double");
    }

    #[test]
    fn test_import_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.sub"), "x = 1 / 0\n").unwrap();
        let provider = ModuleProvider::discover(dir.path()).unwrap();
        let tracer = Arc::new(ExecutionTracer::new());
        let err = provider
            .load("broken", &tracer, &CoverageConfig::default(), false, VmLimits::default())
            .unwrap_err();
        assert!(err.to_string().contains("ZeroDivisionError"));
    }
}
