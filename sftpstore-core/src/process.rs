//! Supervision of the ssh subprocess carrying the sftp session.
use crate::backend::BackendError;
use crate::config::ConfigError;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

/// The subprocess terminated, for whatever reason.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("ssh command exited: {status}")]
pub struct ClientExited {
    status: String,
    success: bool,
}

impl ClientExited {
    pub fn new<S: Into<String>>(status: S, success: bool) -> Self {
        ClientExited {
            status: status.into(),
            success,
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn success(&self) -> bool {
        self.success
    }
}

/// Write side of the exit latch. Only the first notification is kept.
pub struct ExitNotifier {
    slot: watch::Sender<Option<ClientExited>>,
}

/// Read side of the exit latch. Once set it stays set, every clone sees it.
#[derive(Clone)]
pub struct ExitSignal {
    slot: watch::Receiver<Option<ClientExited>>,
}

pub fn exit_signal() -> (ExitNotifier, ExitSignal) {
    let (slot, receiver) = watch::channel(None);
    (ExitNotifier { slot }, ExitSignal { slot: receiver })
}

impl ExitNotifier {
    /// Returns false when the latch was already set.
    pub fn notify(&self, exited: ClientExited) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(exited);
            true
        })
    }
}

impl ExitSignal {
    /// Non blocking.
    pub fn check(&self) -> Option<ClientExited> {
        self.slot.borrow().clone()
    }

    pub async fn wait(&self) -> ClientExited {
        let mut slot = self.slot.clone();
        let exited = match slot.wait_for(Option::is_some).await {
            Ok(exited) => exited.clone(),
            Err(_) => None,
        };
        // notifier gone without a word
        exited.unwrap_or_else(|| ClientExited::new("exit status unknown", false))
    }
}

/// A running ssh (or configured replacement) process.
///
/// Dropping it terminates the process.
pub struct ClientProcess {
    program: String,
    pid: Option<u32>,
    exit: ExitSignal,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl ClientProcess {
    /// Start `program` with its stdin and stdout piped back to the caller.
    ///
    /// The child is put in its own process group so that an interactive
    /// interrupt reaches us first and not the ssh session directly.
    pub fn spawn(
        program: &str,
        args: &[String],
    ) -> Result<(ClientProcess, ChildStdin, ChildStdout), BackendError> {
        let executable = lookup_program(program, std::env::var_os("PATH").as_deref())?;
        debug!("start client {} {:?}", executable.display(), args);

        let mut command = Command::new(&executable);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            BackendError::other(anyhow::Error::new(e).context(format!("unable to start {}", program)))
        })?;
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(BackendError::other(anyhow::anyhow!(
                    "{}: standard streams unavailable",
                    program
                )));
            }
        };
        let pid = child.id();

        tokio::spawn(forward_stderr(program.to_string(), stderr));
        let (notifier, exit) = exit_signal();
        let (kill, kill_requested) = oneshot::channel();
        tokio::spawn(wait_for_exit(child, notifier, kill_requested));

        Ok((
            ClientProcess {
                program: program.to_string(),
                pid,
                exit,
                kill: Mutex::new(Some(kill)),
            },
            stdin,
            stdout,
        ))
    }

    pub fn exit_signal(&self) -> ExitSignal {
        self.exit.clone()
    }

    /// Ok while the process runs, the exit once it is gone.
    pub fn client_error(&self) -> Result<(), ClientExited> {
        match self.exit.check() {
            Some(exited) => Err(exited),
            None => Ok(()),
        }
    }

    /// Ask for the process to be killed. Use the exit signal to wait for it.
    pub fn kill(&self) {
        let kill = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(kill) = kill {
            debug!("killing {} (pid {:?})", self.program, self.pid);
            let _ = kill.send(());
        }
    }
}

async fn forward_stderr(program: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        eprintln!("subprocess {}: {}", program, line);
    }
}

async fn wait_for_exit(
    mut child: Child,
    notifier: ExitNotifier,
    kill_requested: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_requested => {
            if let Err(e) = child.start_kill() {
                debug!("unable to kill client: {}", e);
            }
            child.wait().await
        }
    };
    let exited = match status {
        Ok(status) => ClientExited::new(status.to_string(), status.success()),
        Err(e) => ClientExited::new(e.to_string(), false),
    };
    debug!("{}", exited);
    notifier.notify(exited);
}

/// Resolve `program` against `search_path` the way a shell would, but refuse
/// a match found through a relative entry (`.` or an empty one) of the path.
pub fn lookup_program(program: &str, search_path: Option<&OsStr>) -> Result<PathBuf, ConfigError> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    let search_path = match search_path {
        Some(search_path) => search_path,
        None => return Ok(PathBuf::from(program)),
    };
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let found = match which::which_in(program, Some(search_path), &cwd) {
        Ok(found) => found,
        Err(e) => {
            // let spawn report it missing
            debug!("{} not found in PATH: {}", program, e);
            return Ok(PathBuf::from(program));
        }
    };
    let through_relative = std::env::split_paths(search_path)
        .filter(|dir| dir.is_relative())
        .any(|dir| found == dir.join(program) || found == cwd.join(&dir).join(program));
    if found.is_relative() || through_relative {
        return Err(ConfigError::RelativeExecutable(found.display().to_string()));
    }
    Ok(found)
}
