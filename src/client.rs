use crate::daemon::pidfile::read_running_pid;
use crate::daemon::protocol::{self, Request, Response};
use crate::domain::models::DeskStatus;
use crate::domain::settings::Config;
use anyhow::{Context, Result};
use interprocess::local_socket::{traits::Stream, GenericFilePath, Stream as LocalStream, ToFsName};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long to wait for a freshly spawned daemon to open its socket
pub const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(2);

/// Blocking connection to the daemon socket.
pub struct DaemonClient {
    socket_path: PathBuf,
    stream: Option<BufReader<LocalStream>>,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stream: None,
        }
    }

    /// Try to connect to a running daemon.
    /// If nothing is listening, returns Ok(false).
    pub fn try_connect(&mut self) -> Result<bool> {
        if self.stream.is_some() {
            return Ok(true);
        }

        let name = self.socket_path.as_path().to_fs_name::<GenericFilePath>()?;
        match LocalStream::connect(name) {
            Ok(stream) => {
                debug!(socket = %self.socket_path.display(), "Connected to daemon");
                self.stream = Some(BufReader::new(stream));
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Wait for the daemon socket to accept connections (polling)
    pub fn wait_for_daemon(&mut self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.try_connect().unwrap_or(false) {
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(false)
    }

    /// Send one request and read its one-line reply.
    pub fn send_request(&mut self, request: &Request) -> Result<Response> {
        if !self.try_connect()? {
            anyhow::bail!("Not connected to daemon at {}", self.socket_path.display());
        }
        let stream = self.stream.as_mut().context("Not connected to daemon")?;

        let line = protocol::encode_line(request)?;
        stream.get_mut().write_all(&line)?;
        stream.get_mut().flush()?;

        let mut buffer = String::new();
        if stream.read_line(&mut buffer)? == 0 {
            anyhow::bail!("Daemon closed the connection");
        }

        let response: Response = serde_json::from_str(&buffer)?;
        Ok(response)
    }

    fn expect_ack(&mut self, request: &Request) -> Result<bool> {
        match self.send_request(request)? {
            Response::Ack(ok) => Ok(ok),
            Response::Status(_) => anyhow::bail!("Unexpected status reply"),
        }
    }

    /// Helper: Move the desk and wait for it to arrive
    pub fn move_to(&mut self, position_cm: f64) -> Result<bool> {
        self.expect_ack(&Request::MoveTo { pos: position_cm })
    }

    /// Helper: Block until the daemon has a desk
    pub fn wait(&mut self) -> Result<bool> {
        self.expect_ack(&Request::Wait)
    }

    pub fn status(&mut self) -> Result<DeskStatus> {
        match self.send_request(&Request::GetStatus)? {
            Response::Status(status) => Ok(status),
            Response::Ack(_) => anyhow::bail!("Unexpected acknowledgement reply"),
        }
    }
}

/// Start `<current exe> --server` in its own process group, detached from
/// our terminal.
pub fn launch_daemon() -> Result<()> {
    let exe_path = std::env::current_exe().context("Could not locate own executable")?;
    info!("Starting daemon");

    let mut command = Command::new(exe_path);
    command
        .arg("--server")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn().context("Failed to launch daemon")?;
    Ok(())
}

fn daemon_running(pid_path: &Path) -> bool {
    read_running_pid(pid_path).is_some()
}

/// Connect to the daemon, starting one first when none is running.
pub fn ensure_daemon(config: &Config) -> Result<DaemonClient> {
    let mut client = DaemonClient::new(&config.socket_path);

    if !daemon_running(&config.pid_file_path) {
        launch_daemon()?;
    }
    if !client.wait_for_daemon(DAEMON_START_TIMEOUT)? {
        anyhow::bail!(
            "Daemon did not come up on {}",
            config.socket_path.display()
        );
    }
    Ok(client)
}
