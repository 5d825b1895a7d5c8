//! Inventory and impact services served by an external helper program.
//!
//! The helper reads one JSON command per line on stdin and answers each with
//! one line on stdout, either `{"type":"result","payload":...}` or
//! `{"type":"error","message":...}`. Anything it writes to stderr is kept and
//! attached to error messages.
//!
//! Searches and lookups share one long-lived process. Every engine session
//! spawns its own process so that no two runs share solver state; the process
//! is shut down when the session is dropped.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cancel::CallGuard;
use crate::model::ImpactCategory;
use crate::service::{
    ActivityCandidate, ActivityInfo, Database, EngineSession, ImpactEngine, InventoryService,
    Score, ServiceResult,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Program and arguments used to start the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelperCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl HelperCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HelperEnvelope {
    Result {
        #[serde(default)]
        payload: Value,
    },
    Error {
        message: String,
    },
}

enum HelperMessage {
    Response(Value),
    Error(String),
    Terminated(Option<String>),
}

#[derive(Serialize)]
struct HelperRequest<'a> {
    #[serde(rename = "type")]
    command_type: &'a str,
    #[serde(flatten)]
    payload: &'a Value,
}

struct HelperProcess {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    receiver: Receiver<HelperMessage>,
    stderr_buffer: Arc<Mutex<Vec<u8>>>,
    stdout_handle: Option<JoinHandle<()>>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl HelperProcess {
    fn spawn(command: &HelperCommand) -> ServiceResult<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("Unable to start the helper '{}': {err}", command.program))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "Unable to access the helper stdin.".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Unable to access the helper stdout.".to_string())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "Unable to access the helper stderr.".to_string())?;

        let stderr_buffer = Arc::new(Mutex::new(Vec::new()));
        let (sender, receiver) = mpsc::channel();

        let stdout_sender = sender.clone();
        let stdout_handle = std::thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => {
                        let _ = stdout_sender.send(HelperMessage::Terminated(None));
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim_end();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let message = match serde_json::from_str::<HelperEnvelope>(trimmed) {
                            Ok(HelperEnvelope::Result { payload }) => HelperMessage::Response(payload),
                            Ok(HelperEnvelope::Error { message }) => HelperMessage::Error(message),
                            Err(err) => HelperMessage::Error(format!(
                                "Unable to parse helper output: {err}. Raw: {trimmed}"
                            )),
                        };
                        if stdout_sender.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = stdout_sender.send(HelperMessage::Error(format!(
                            "Unable to read helper stdout: {err}"
                        )));
                        break;
                    }
                }
            }
        });

        let stderr_buffer_for_thread = Arc::clone(&stderr_buffer);
        let stderr_handle = std::thread::spawn(move || {
            let mut reader = BufReader::new(stderr);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Ok(mut buffer) = stderr_buffer_for_thread.lock() {
                            buffer.extend_from_slice(line.as_bytes());
                        }
                    }
                    Err(err) => {
                        let _ = sender.send(HelperMessage::Error(format!(
                            "Unable to read helper stderr: {err}"
                        )));
                        break;
                    }
                }
            }
        });

        debug!(program = %command.program, pid = child.id(), "started helper process");

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            receiver,
            stderr_buffer,
            stdout_handle: Some(stdout_handle),
            stderr_handle: Some(stderr_handle),
        })
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn request(
        &mut self,
        command_type: &str,
        payload: &Value,
        timeout: Option<Duration>,
        guard: &CallGuard,
    ) -> ServiceResult<Value> {
        if let Ok(mut buffer) = self.stderr_buffer.lock() {
            buffer.clear();
        }

        let mut data = serde_json::to_vec(&HelperRequest {
            command_type,
            payload,
        })
        .map_err(|err| format!("Unable to serialize the {command_type} request: {err}"))?;
        data.push(b'\n');

        let Some(stdin) = self.stdin.as_mut() else {
            return Err("The helper input has already been closed.".to_string());
        };
        if let Err(err) = stdin.write_all(&data) {
            return Err(self.augment_error(format!("Unable to send data to the helper: {err}")));
        }
        if let Err(err) = stdin.flush() {
            return Err(self.augment_error(format!("Unable to flush helper input: {err}")));
        }

        match self.wait_for_message(command_type, timeout, guard)? {
            HelperMessage::Response(payload) => Ok(payload),
            HelperMessage::Error(message) => Err(self.augment_error(message)),
            HelperMessage::Terminated(message) => Err(self.describe_termination(message)),
        }
    }

    /// Waits in short slices so the run deadline and cancellation are seen
    /// while the helper is still working.
    fn wait_for_message(
        &mut self,
        command_type: &str,
        timeout: Option<Duration>,
        guard: &CallGuard,
    ) -> ServiceResult<HelperMessage> {
        let call_deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            if guard.is_cancelled() {
                return Err(format!("The {command_type} request was cancelled."));
            }
            let run_left = guard.remaining();
            if run_left.is_some_and(|left| left.is_zero()) {
                return Err(format!(
                    "The {command_type} request exceeded the run time limit."
                ));
            }
            let call_left =
                call_deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if call_left.is_some_and(|left| left.is_zero()) {
                return Err(format!(
                    "The helper did not answer the {command_type} request within {:.1}s.",
                    timeout.unwrap_or_default().as_secs_f64()
                ));
            }

            let slice = [run_left, call_left]
                .into_iter()
                .flatten()
                .fold(POLL_INTERVAL, Duration::min);
            match self.receiver.recv_timeout(slice) {
                Ok(message) => return Ok(message),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.augment_error("Lost communication with the helper.".into()))
                }
            }
        }
    }

    fn call<T: DeserializeOwned>(
        &mut self,
        command_type: &str,
        payload: Value,
        timeout: Option<Duration>,
        guard: &CallGuard,
    ) -> ServiceResult<T> {
        let response = self.request(command_type, &payload, timeout, guard)?;
        serde_json::from_value(response)
            .map_err(|err| format!("Unable to parse the helper {command_type} response: {err}"))
    }

    fn augment_error(&mut self, base: String) -> String {
        let mut message = base;

        if let Ok(buffer) = self.stderr_buffer.lock() {
            let stderr_text = String::from_utf8_lossy(&buffer);
            let trimmed = stderr_text.trim();
            if !trimmed.is_empty() {
                message = format!("{message}\n\nHelper stderr:\n{trimmed}");
            }
        }

        if let Ok(Some(status)) = self.child.try_wait() {
            message = format!("{message}\n\nHelper exit status: {status}");
        }

        message
    }

    fn describe_termination(&mut self, reason: Option<String>) -> String {
        let base = reason.unwrap_or_else(|| "The helper exited unexpectedly.".into());
        self.augment_error(base)
    }

    fn send_shutdown_message(&mut self) {
        if !self.is_running() {
            return;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        let mut data = match serde_json::to_vec(&json!({ "type": "shutdown" })) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        data.push(b'\n');

        let _ = stdin.write_all(&data);
        let _ = stdin.flush();
    }

    fn join_readers(&mut self) {
        if let Some(handle) = self.stdout_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.stderr_handle.take() {
            let _ = handle.join();
        }
    }

    fn shutdown(&mut self) {
        self.send_shutdown_message();
        self.stdin = None;
        let _ = self.child.wait();
        self.join_readers();
    }

    fn kill(&mut self) {
        self.stdin = None;
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.join_readers();
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Backend that forwards every inventory and engine call to a helper program.
pub struct HelperBackend {
    command: HelperCommand,
    timeout: Option<Duration>,
    process: Mutex<Option<HelperProcess>>,
}

impl HelperBackend {
    pub fn new(command: HelperCommand) -> Self {
        Self {
            command,
            timeout: None,
            process: Mutex::new(None),
        }
    }

    /// Bounds how long any single call may wait for an answer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn call<T: DeserializeOwned>(
        &self,
        command_type: &str,
        payload: Value,
        guard: &CallGuard,
    ) -> ServiceResult<T> {
        let mut state = self
            .process
            .lock()
            .map_err(|_| "Unable to lock helper state.".to_string())?;

        if let Some(process) = state.as_mut() {
            if !process.is_running() {
                process.shutdown();
                *state = None;
            }
        }

        if state.is_none() {
            *state = Some(HelperProcess::spawn(&self.command)?);
        }
        let Some(process) = state.as_mut() else {
            return Err("The helper process is not available.".to_string());
        };

        let response = process.call(command_type, payload, self.timeout, guard);

        if let Err(err) = &response {
            warn!(command = command_type, error = %err, "helper request failed; restarting on next call");
            if let Some(mut process) = state.take() {
                process.kill();
            }
        }

        response
    }
}

impl std::fmt::Debug for HelperBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperBackend")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl InventoryService for HelperBackend {
    fn search(
        &self,
        database: Database,
        query: &str,
        limit: usize,
        guard: &CallGuard,
    ) -> ServiceResult<Vec<ActivityCandidate>> {
        self.call(
            "search",
            json!({ "database": database, "query": query, "limit": limit }),
            guard,
        )
    }

    fn get_activity(&self, id: &str, guard: &CallGuard) -> ServiceResult<ActivityInfo> {
        self.call("activity", json!({ "id": id }), guard)
    }
}

impl ImpactEngine for HelperBackend {
    fn categories(&self, framework: &str) -> ServiceResult<Vec<ImpactCategory>> {
        self.call(
            "categories",
            json!({ "framework": framework }),
            &CallGuard::unbounded(),
        )
    }

    fn new_inventory(
        &self,
        activity: &str,
        amount: f64,
        guard: &CallGuard,
    ) -> ServiceResult<Box<dyn EngineSession>> {
        let mut process = HelperProcess::spawn(&self.command)?;
        let response = process.request(
            "newInventory",
            &json!({ "activity": activity, "amount": amount }),
            self.timeout,
            guard,
        );
        if let Err(err) = response {
            process.kill();
            return Err(err);
        }
        Ok(Box::new(HelperSession {
            process,
            timeout: self.timeout,
            guard: guard.clone(),
        }))
    }
}

struct HelperSession {
    process: HelperProcess,
    timeout: Option<Duration>,
    guard: CallGuard,
}

impl HelperSession {
    fn send(&mut self, command_type: &str, payload: Value) -> ServiceResult<Value> {
        let response = self
            .process
            .request(command_type, &payload, self.timeout, &self.guard);
        // A failed call aborts the run, so the solver state is never reused.
        if response.is_err() {
            self.process.kill();
        }
        response
    }
}

impl EngineSession for HelperSession {
    fn recompute(&mut self, activity: &str, amount: f64) -> ServiceResult<()> {
        self.send("recompute", json!({ "activity": activity, "amount": amount }))
            .map(|_| ())
    }

    fn select_method(&mut self, category: &ImpactCategory) -> ServiceResult<()> {
        self.send(
            "selectMethod",
            json!({ "method": category.method(), "unit": category.unit }),
        )
        .map(|_| ())
    }

    fn compute_score(&mut self) -> ServiceResult<Score> {
        let response = self.send("score", json!({}))?;
        serde_json::from_value(response)
            .map_err(|err| format!("Unable to parse the helper score response: {err}"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::thread;

    use super::*;
    use crate::cancel::CancelHandle;

    fn script(body: &str) -> HelperCommand {
        HelperCommand::new("sh", &["-c", body])
    }

    fn answering(line: &str) -> HelperCommand {
        script(&format!("while read -r request; do echo '{line}'; done"))
    }

    #[test]
    fn lookups_decode_the_result_payload() {
        let backend = HelperBackend::new(answering(
            r#"{"type":"result","payload":{"unit":"kilogram","productionAmount":-1}}"#,
        ));
        let info = backend
            .get_activity("waste-treatment", &CallGuard::unbounded())
            .unwrap();
        assert_eq!(info.unit, "kilogram");
        assert_eq!(info.production_amount, -1.0);

        // The same process answers the next call.
        assert!(backend
            .get_activity("again", &CallGuard::unbounded())
            .is_ok());
    }

    #[test]
    fn helper_errors_are_passed_through() {
        let backend = HelperBackend::new(answering(
            r#"{"type":"error","message":"no such activity"}"#,
        ));
        let err = backend
            .get_activity("missing", &CallGuard::unbounded())
            .unwrap_err();
        assert!(err.contains("no such activity"));
    }

    #[test]
    fn silent_helpers_time_out() {
        let backend =
            HelperBackend::new(script("exec sleep 5")).with_timeout(Duration::from_millis(100));
        let err = backend
            .search(Database::Technosphere, "steel", 5, &CallGuard::unbounded())
            .unwrap_err();
        assert!(err.contains("did not answer"));
    }

    #[test]
    fn exited_helpers_are_reported() {
        let backend = HelperBackend::new(script("exit 3"));
        assert!(backend.categories("EF v3.1").is_err());
    }

    #[test]
    fn sessions_run_on_their_own_process() {
        let backend = HelperBackend::new(answering(
            r#"{"type":"result","payload":{"value":2.5,"unit":"kg CO2-Eq"}}"#,
        ));
        let mut session = backend
            .new_inventory("feed", 0.5, &CallGuard::unbounded())
            .unwrap();
        session.recompute("power", 1.0).unwrap();
        session
            .select_method(&ImpactCategory::new(
                "EF v3.1",
                "climate change",
                None,
                "kg CO2-Eq",
            ))
            .unwrap();
        let score = session.compute_score().unwrap();
        assert_eq!(score.value, 2.5);
        assert_eq!(score.unit, "kg CO2-Eq");
    }

    #[test]
    fn run_deadline_interrupts_a_hanging_helper() {
        let backend = HelperBackend::new(script("exec sleep 3"));
        let guard = CallGuard::unbounded().with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let err = match backend.new_inventory("feed", 0.5, &guard) {
            Ok(_) => panic!("expected the deadline to interrupt the call"),
            Err(err) => err,
        };
        assert!(err.contains("run time limit"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancellation_interrupts_a_pending_lookup() {
        let backend = HelperBackend::new(script("exec sleep 3"));
        let handle = CancelHandle::new();
        let guard = CallGuard::unbounded().with_cancel(handle.signal());

        let started = Instant::now();
        let err = thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                handle.cancel();
            });
            backend.get_activity("steel", &guard).unwrap_err()
        });
        assert!(err.contains("cancelled"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
