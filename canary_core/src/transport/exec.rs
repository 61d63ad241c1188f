use super::{Transport, TransportError};
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How often the child's exit status is polled during the settle window.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs the target as a local child process and feeds payloads to its stdin.
///
/// The target survived a payload if it is still running once the settle window
/// (`timeout`) has passed. A target that died is transparently respawned before
/// the next payload, so every `send` acts on a live process.
pub struct ExecTarget {
    argv: Vec<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    spawns: u64,
}

impl ExecTarget {
    /// Starts the target. Failing to start it is fatal.
    pub fn spawn(argv: Vec<String>) -> Result<Self, TransportError> {
        if argv.is_empty() {
            return Err(TransportError::EmptyCommand);
        }
        let mut target = Self {
            argv,
            child: None,
            stdin: None,
            spawns: 0,
        };
        target.start()?;
        Ok(target)
    }

    /// Number of processes started so far, including the first one.
    pub fn spawns(&self) -> u64 {
        self.spawns
    }

    /// Whether the owned process is currently running.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Respawns the target if the previous payload killed it.
    pub fn ensure_running(&mut self) -> Result<(), TransportError> {
        if self.is_running() {
            return Ok(());
        }
        self.reap();
        debug!("Target {:?} is not running, respawning", self.argv[0]);
        self.start()
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let mut cmd = Command::new(&self.argv[0]);
        if self.argv.len() > 1 {
            cmd.args(&self.argv[1..]);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: self.argv[0].clone(),
            source,
        })?;
        self.stdin = child.stdin.take();
        self.child = Some(child);
        self.spawns += 1;
        trace!("Spawned target (spawn #{})", self.spawns);
        Ok(())
    }

    fn reap(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                trace!("kill on reap: {e}");
            }
            if let Err(e) = child.wait() {
                warn!("Failed to reap target process: {e}");
            }
        }
    }

    /// Polls until the child exits or `window` elapses. Returns `true` if it is still alive.
    fn alive_after(&mut self, window: Duration) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    trace!("Target exited during settle window: {status}");
                    return false;
                }
                Ok(None) => {
                    let elapsed = start_time.elapsed();
                    if elapsed >= window {
                        return true;
                    }
                    std::thread::sleep(POLL_INTERVAL.min(window - elapsed));
                }
                Err(e) => {
                    warn!("Error polling target process: {e}");
                    return false;
                }
            }
        }
    }
}

impl Transport for ExecTarget {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn send(&mut self, payload: &[u8], timeout: Duration) -> Result<bool, TransportError> {
        self.ensure_running()?;

        let written = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(payload).and_then(|_| stdin.flush()),
            None => Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
        };
        if let Err(e) = written {
            trace!("Write to target stdin failed: {e}");
            return Ok(false);
        }

        Ok(self.alive_after(timeout))
    }

    fn close(&mut self) {
        self.reap();
    }
}

impl Drop for ExecTarget {
    fn drop(&mut self) {
        self.close();
    }
}
