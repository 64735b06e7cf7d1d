use crate::error::ExecutorError;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

/// Output values of a single simulation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimValues {
    pub pvfp: f64,
    pub pvfprem: f64,
}

/// Handle that forcibly stops a session from outside the thread driving it.
#[derive(Clone)]
pub struct KillSwitch(Arc<dyn Fn() + Send + Sync>);

impl KillSwitch {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn fire(&self) {
        (self.0)()
    }
}

impl fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KillSwitch")
    }
}

/// An open executor bound to one isolated model copy.
pub trait ExecutorSession: Send {
    fn run_one(&mut self, scenario: &[f64], policy: &[f64]) -> Result<SimValues, ExecutorError>;

    /// Sessions that can hang inside `run_one` should return a switch that
    /// unblocks them; the scheduler fires it when an attempt times out.
    fn kill_switch(&self) -> Option<KillSwitch> {
        None
    }
}

/// Opens executor sessions. Implementations must never open the master model.
pub trait ExecutorBackend: Send + Sync {
    fn open(&self, resource: &Path) -> Result<Box<dyn ExecutorSession>, ExecutorError>;
}

/// Drives an external executor process per session.
///
/// The process is started as `command... <resource_path>`. For every
/// simulation it receives one JSON line on stdin
/// (`{"scenario":[..],"policy":[..]}`) and must answer with one JSON line on
/// stdout, either `{"pvfp":..,"pvfprem":..}` or
/// `{"error":{"class":"fatal"|"retryable","message":".."}}`.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    command: Vec<String>,
}

impl CommandBackend {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl ExecutorBackend for CommandBackend {
    fn open(&self, resource: &Path) -> Result<Box<dyn ExecutorSession>, ExecutorError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ExecutorError::fatal("executor command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(resource)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|e| {
            ExecutorError::retryable(format!("failed to start executor '{}': {}", program, e))
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecutorError::retryable("executor pipes unavailable"));
            }
        };
        Ok(Box::new(CommandSession {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout: BufReader::new(stdout),
        }))
    }
}

struct CommandSession {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Reply {
    Values { pvfp: f64, pvfprem: f64 },
    Failure { error: ReplyError },
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    #[serde(default)]
    class: Option<String>,
    message: String,
}

impl ExecutorSession for CommandSession {
    fn run_one(&mut self, scenario: &[f64], policy: &[f64]) -> Result<SimValues, ExecutorError> {
        let request = json!({ "scenario": scenario, "policy": policy });
        let mut line = request.to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|e| ExecutorError::retryable(format!("executor stdin closed: {}", e)))?;

        let mut reply = String::new();
        let n = self
            .stdout
            .read_line(&mut reply)
            .map_err(|e| ExecutorError::retryable(format!("executor stdout error: {}", e)))?;
        if n == 0 {
            return Err(ExecutorError::retryable("executor exited without replying"));
        }
        match serde_json::from_str::<Reply>(reply.trim()) {
            Ok(Reply::Values { pvfp, pvfprem }) => Ok(SimValues { pvfp, pvfprem }),
            Ok(Reply::Failure { error }) => match error.class.as_deref() {
                Some("fatal") => Err(ExecutorError::fatal(error.message)),
                _ => Err(ExecutorError::retryable(error.message)),
            },
            Err(e) => Err(ExecutorError::retryable(format!(
                "unparsable executor reply '{}': {}",
                reply.trim(),
                e
            ))),
        }
    }

    fn kill_switch(&self) -> Option<KillSwitch> {
        let child = Arc::clone(&self.child);
        Some(KillSwitch::new(move || {
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        }))
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
