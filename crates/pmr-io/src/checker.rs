//! # Checker Invocation
//!
//! A checker decides whether one materialized image is consistent for the
//! application's on-media format. The handle is resolved once at startup and
//! reused for every candidate.
//!
//! - [`ProcessChecker`] runs `program [args...] <image>`; exit status 0 means
//!   consistent.
//! - [`LibraryChecker`] calls `int fn(const char *image)` from a shared
//!   library; 0 means consistent.
//!
//! A checker that fails, crashes, or outlives its timeout produces a failing
//! [`Verdict`]. Only problems that prevent any verdict at all (the library
//! cannot be loaded, the program cannot be spawned) are [`CheckerError`]s.

use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libloading::Library;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest slice of checker output kept in a diagnostic.
const MAX_DIAGNOSTIC_LEN: usize = 512;

/// Outcome of checking one candidate image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("failed to load checker library {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("checker library {} has no entry point '{symbol}': {source}", .path.display())]
    Symbol {
        path: PathBuf,
        symbol: String,
        #[source]
        source: libloading::Error,
    },

    #[error("the lib checker needs the name of its entry point")]
    MissingSymbol,

    #[error("failed to spawn checker {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The validation entry point shared by every checker strategy.
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    /// Validate the image at `image`.
    async fn check(&self, image: &Path) -> Result<Verdict, CheckerError>;
}

// =============================================================================
// Checker selection
// =============================================================================

/// Checker strategy, selectable by name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerKind {
    /// External program.
    #[default]
    Prog,
    /// Entry point in a shared library.
    Lib,
}

impl std::fmt::Display for CheckerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prog => write!(f, "prog"),
            Self::Lib => write!(f, "lib"),
        }
    }
}

impl std::str::FromStr for CheckerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prog" | "program" => Ok(Self::Prog),
            "lib" | "library" => Ok(Self::Lib),
            other => Err(format!("unknown checker kind '{}' (expected prog or lib)", other)),
        }
    }
}

/// Everything needed to resolve a checker handle.
#[derive(Debug, Clone)]
pub struct CheckerSpec {
    pub kind: CheckerKind,
    pub path: PathBuf,
    /// Entry point name for [`CheckerKind::Lib`].
    pub name: Option<String>,
    /// Extra arguments for [`CheckerKind::Prog`], passed before the image path.
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

/// Resolve the checker handle described by `spec`.
pub fn load_checker(spec: &CheckerSpec) -> Result<Arc<dyn Checker>, CheckerError> {
    let checker: Arc<dyn Checker> = match spec.kind {
        CheckerKind::Prog => Arc::new(ProcessChecker::new(
            spec.path.clone(),
            spec.args.clone(),
            spec.timeout,
        )),
        CheckerKind::Lib => {
            let name = spec.name.as_deref().ok_or(CheckerError::MissingSymbol)?;
            if !spec.args.is_empty() {
                tracing::warn!("Library checkers take no arguments; ignoring {:?}", spec.args);
            }
            Arc::new(LibraryChecker::open(&spec.path, name, spec.timeout)?)
        }
    };
    tracing::info!("Checker: {}", checker.describe());
    Ok(checker)
}

// =============================================================================
// Process checker
// =============================================================================

/// Runs an external program per candidate.
pub struct ProcessChecker {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessChecker {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Checker for ProcessChecker {
    fn describe(&self) -> String {
        format!("prog {} {}", self.program.display(), self.args.join(" "))
            .trim_end()
            .to_string()
    }

    async fn check(&self, image: &Path) -> Result<Verdict, CheckerError> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CheckerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => result,
                Err(_) => {
                    return Ok(Verdict::fail(format!(
                        "checker timed out after {:?}",
                        limit
                    )))
                }
            },
            None => output.await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => return Ok(Verdict::fail(format!("failed to wait for checker: {}", e))),
        };

        if output.status.success() {
            return Ok(Verdict::pass());
        }

        let mut message = format!("checker exited with {}", output.status);
        let detail = if output.stderr.is_empty() {
            &output.stdout
        } else {
            &output.stderr
        };
        let detail = String::from_utf8_lossy(detail);
        let detail = detail.trim();
        if !detail.is_empty() {
            message.push_str(": ");
            message.push_str(truncate(detail, MAX_DIAGNOSTIC_LEN));
        }
        Ok(Verdict::fail(message))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// =============================================================================
// Library checker
// =============================================================================

type CheckFn = unsafe extern "C" fn(*const c_char) -> c_int;

/// Calls a named entry point of a shared library per candidate.
///
/// The entry point runs in this process on the blocking pool. It must be
/// reentrant when candidates are checked concurrently, and a crash inside it
/// takes the whole run down; use a [`ProcessChecker`] for isolation.
pub struct LibraryChecker {
    path: PathBuf,
    symbol: String,
    func: CheckFn,
    timeout: Option<Duration>,
    // Keeps `func` valid. Every in-flight call holds a clone.
    library: Arc<Library>,
}

impl LibraryChecker {
    pub fn open(
        path: &Path,
        symbol: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, CheckerError> {
        // SAFETY: loading runs the library's initializers; the user chose
        // this library as the checker.
        let library = unsafe { Library::new(path) }.map_err(|source| CheckerError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let func = {
            // SAFETY: the entry point contract is `int fn(const char *)`.
            let symbol_ref: libloading::Symbol<CheckFn> =
                unsafe { library.get(symbol.as_bytes()) }.map_err(|source| {
                    CheckerError::Symbol {
                        path: path.to_path_buf(),
                        symbol: symbol.to_string(),
                        source,
                    }
                })?;
            *symbol_ref
        };

        Ok(Self {
            path: path.to_path_buf(),
            symbol: symbol.to_string(),
            func,
            timeout,
            library: Arc::new(library),
        })
    }
}

#[async_trait::async_trait]
impl Checker for LibraryChecker {
    fn describe(&self) -> String {
        format!("lib {}:{}", self.path.display(), self.symbol)
    }

    async fn check(&self, image: &Path) -> Result<Verdict, CheckerError> {
        let path = match CString::new(image.as_os_str().as_bytes()) {
            Ok(path) => path,
            Err(_) => return Ok(Verdict::fail("image path contains a NUL byte")),
        };
        let func = self.func;
        let library = Arc::clone(&self.library);

        // A call that outlives its timeout keeps running on the blocking
        // pool; it owns a handle on the library so the code stays mapped
        // even if the checker is dropped first.
        let call = tokio::task::spawn_blocking(move || {
            // SAFETY: `func` was resolved from `library`, which is alive for
            // the whole call.
            let status = unsafe { func(path.as_ptr()) };
            drop(library);
            status
        });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Ok(Verdict::fail(format!(
                        "checker timed out after {:?}",
                        limit
                    )))
                }
            },
            None => call.await,
        };

        Ok(match joined {
            Ok(0) => Verdict::pass(),
            Ok(code) => Verdict::fail(format!("{} returned {}", self.symbol, code)),
            Err(e) => Verdict::fail(format!("{} did not complete: {}", self.symbol, e)),
        })
    }
}

// =============================================================================
// In-process checker
// =============================================================================

/// Wraps a closure over the image bytes. Useful for embedding the engine and
/// for tests.
pub struct FnChecker<F> {
    name: String,
    func: F,
    calls: AtomicUsize,
}

impl<F> FnChecker<F>
where
    F: Fn(&[u8]) -> Verdict + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            calls: AtomicUsize::new(0),
        }
    }

    /// How many images have been checked so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl<F> Checker for FnChecker<F>
where
    F: Fn(&[u8]) -> Verdict + Send + Sync,
{
    fn describe(&self) -> String {
        format!("fn {}", self.name)
    }

    async fn check(&self, image: &Path) -> Result<Verdict, CheckerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(match std::fs::read(image) {
            Ok(bytes) => (self.func)(&bytes),
            Err(e) => Verdict::fail(format!("cannot read {}: {}", image.display(), e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Option<Duration>) -> ProcessChecker {
        ProcessChecker::new(
            PathBuf::from("sh"),
            vec!["-c".into(), script.into(), "checker".into()],
            timeout,
        )
    }

    fn image() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img");
        std::fs::write(&path, [0u8; 8]).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_process_exit_zero_passes() {
        let (_dir, path) = image();
        let verdict = sh("exit 0", None).check(&path).await.unwrap();
        assert_eq!(verdict, Verdict::pass());
    }

    #[tokio::test]
    async fn test_process_nonzero_fails_with_output() {
        let (_dir, path) = image();
        let verdict = sh("echo broken list >&2; exit 3", None)
            .check(&path)
            .await
            .unwrap();
        assert!(!verdict.passed);
        let message = verdict.message.unwrap();
        assert!(message.contains("broken list"), "{}", message);
    }

    #[tokio::test]
    async fn test_process_receives_image_path() {
        let (_dir, path) = image();
        let verdict = sh("test -f \"$1\"", None).check(&path).await.unwrap();
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn test_process_timeout_fails() {
        let (_dir, path) = image();
        let verdict = sh("sleep 5", Some(Duration::from_millis(100)))
            .check(&path)
            .await
            .unwrap();
        assert!(!verdict.passed);
        assert!(verdict.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program_is_invocation_error() {
        let (_dir, path) = image();
        let checker = ProcessChecker::new(PathBuf::from("/nonexistent/pmr-checker"), vec![], None);
        let err = checker.check(&path).await.unwrap_err();
        assert!(matches!(err, CheckerError::Spawn { .. }));
    }

    #[test]
    fn test_missing_library_is_load_error() {
        let spec = CheckerSpec {
            kind: CheckerKind::Lib,
            path: PathBuf::from("/nonexistent/libchecker.so"),
            name: Some("check_consistency".into()),
            args: vec![],
            timeout: None,
        };
        assert!(matches!(load_checker(&spec), Err(CheckerError::Load { .. })));
    }

    #[test]
    fn test_lib_checker_requires_name() {
        let spec = CheckerSpec {
            kind: CheckerKind::Lib,
            path: PathBuf::from("/nonexistent/libchecker.so"),
            name: None,
            args: vec![],
            timeout: None,
        };
        assert!(matches!(load_checker(&spec), Err(CheckerError::MissingSymbol)));
    }

    #[tokio::test]
    async fn test_fn_checker_counts_calls() {
        let (_dir, path) = image();
        let checker = FnChecker::new("zeroed", |bytes: &[u8]| {
            if bytes.iter().all(|&b| b == 0) {
                Verdict::pass()
            } else {
                Verdict::fail("dirty")
            }
        });
        assert!(checker.check(&path).await.unwrap().passed);
        assert!(checker.check(&path).await.unwrap().passed);
        assert_eq!(checker.calls(), 2);
    }

    const CHECKER_SOURCE: &str = r#"
#include <stdio.h>
#include <unistd.h>

int check_exists(const char *path) {
    FILE *f = fopen(path, "rb");
    if (!f)
        return 2;
    fclose(f);
    return 0;
}

int check_reject(const char *path) {
    (void)path;
    return 3;
}

int check_hang(const char *path) {
    (void)path;
    sleep(2);
    return 0;
}
"#;

    /// Compile the test checkers into a shared library, or `None` when no C
    /// compiler is available.
    fn build_library(dir: &Path) -> Option<PathBuf> {
        let source = dir.join("checker.c");
        std::fs::write(&source, CHECKER_SOURCE).unwrap();
        let library = dir.join("libchecker.so");
        let status = std::process::Command::new("cc")
            .args(["-shared", "-fPIC", "-o"])
            .arg(&library)
            .arg(&source)
            .status()
            .ok()?;
        status.success().then_some(library)
    }

    #[tokio::test]
    async fn test_library_checker_pass_and_fail() {
        let (dir, path) = image();
        let Some(library) = build_library(dir.path()) else {
            eprintln!("skipping: no C compiler");
            return;
        };

        let exists = LibraryChecker::open(&library, "check_exists", None).unwrap();
        assert_eq!(exists.check(&path).await.unwrap(), Verdict::pass());
        let missing = dir.path().join("missing.img");
        assert!(!exists.check(&missing).await.unwrap().passed);

        let reject = LibraryChecker::open(&library, "check_reject", None).unwrap();
        let verdict = reject.check(&path).await.unwrap();
        assert_eq!(verdict, Verdict::fail("check_reject returned 3"));
    }

    #[tokio::test]
    async fn test_library_checker_timeout_and_drop() {
        let (dir, path) = image();
        let Some(library) = build_library(dir.path()) else {
            eprintln!("skipping: no C compiler");
            return;
        };

        let checker =
            LibraryChecker::open(&library, "check_hang", Some(Duration::from_millis(200)))
                .unwrap();
        let started = std::time::Instant::now();
        let verdict = checker.check(&path).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!verdict.passed);
        assert!(verdict.message.unwrap().contains("timed out"));

        // The abandoned call still owns the library.
        drop(checker);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[test]
    fn test_missing_symbol_is_symbol_error() {
        let dir = tempfile::tempdir().unwrap();
        let Some(library) = build_library(dir.path()) else {
            eprintln!("skipping: no C compiler");
            return;
        };
        assert!(matches!(
            LibraryChecker::open(&library, "check_nothing", None),
            Err(CheckerError::Symbol { .. })
        ));
    }

    #[test]
    fn test_checker_kind_from_str() {
        assert_eq!("prog".parse::<CheckerKind>(), Ok(CheckerKind::Prog));
        assert_eq!("LIB".parse::<CheckerKind>(), Ok(CheckerKind::Lib));
        assert!("python".parse::<CheckerKind>().is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
