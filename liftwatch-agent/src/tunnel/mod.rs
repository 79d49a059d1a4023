//! VPN tunnel management
//!
//! Handles:
//! - Random selection of a tunnel profile (`.ovpn`) from a directory
//! - Spawning the tunnel client and waiting for its handshake
//! - Rotation (terminate the current client, connect with a new profile)
//! - Diagnostic lookup of the public IP once connected
//!
//! At most one [`TunnelSession`] exists at a time; the poll loop owns it.

mod handshake;

pub use handshake::{classify_line, read_handshake, HandshakeOutcome, SUCCESS_MARKER};

use crate::config::{SudoMode, TunnelConfig};
use rand::seq::SliceRandom;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

const PROFILE_EXTENSION: &str = "ovpn";
/// Wait applied right after the success marker
const HANDSHAKE_SETTLE: Duration = Duration::from_secs(2);
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("no .{PROFILE_EXTENSION} profile found in {0}")]
    NoConfigFound(PathBuf),
    #[error("cannot read tunnel profile directory {path}: {source}")]
    ConfigDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start tunnel client `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("VPN connection failed: {0}")]
    ConnectFailed(String),
    #[error("VPN process exited before connection was established (exit code {code:?})")]
    ExitedEarly { code: Option<i32>, output: String },
    #[error("VPN handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("IO error while talking to the tunnel client: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TunnelError {
    /// Failures that another attempt (possibly with another profile) can fix
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::ExitedEarly { .. } | Self::HandshakeTimeout(_) | Self::Io(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Established,
}

/// One running tunnel client process
pub struct TunnelSession {
    child: Child,
    config_path: PathBuf,
    state: TunnelState,
    forwarders: Vec<AbortHandle>,
}

impl TunnelSession {
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the client: SIGTERM first, kill after a grace period
    pub async fn terminate(mut self) {
        info!("Terminating tunnel using {}", self.config_path.display());
        terminate_child(&mut self.child).await;
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

pub struct TunnelManager {
    config_dir: PathBuf,
    credentials_file: PathBuf,
    binary: String,
    use_sudo: bool,
    handshake_timeout: Option<Duration>,
    handshake_settle: Duration,
    rotation_interval: Duration,
    settle_delay: Duration,
    ip_echo_url: String,
    http: reqwest::Client,
}

impl TunnelManager {
    pub fn new(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let use_sudo = match config.sudo {
            SudoMode::Always => true,
            SudoMode::Never => false,
            SudoMode::Auto => find_on_path("sudo").is_some(),
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            config_dir: config.config_dir.clone(),
            credentials_file: config.credentials_file.clone(),
            binary: config.binary.clone(),
            use_sudo,
            handshake_timeout: config.handshake_timeout,
            handshake_settle: HANDSHAKE_SETTLE,
            rotation_interval: config.rotation_interval,
            settle_delay: config.settle_delay,
            ip_echo_url: config.ip_echo_url.clone(),
            http,
        })
    }

    /// Override the short wait applied right after the success marker
    pub fn with_handshake_settle(mut self, settle: Duration) -> Self {
        self.handshake_settle = settle;
        self
    }

    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Uniformly random `.ovpn` profile from the configured directory
    pub fn select_config(&self) -> Result<PathBuf, TunnelError> {
        select_config(&self.config_dir)
    }

    /// Connect with a freshly selected profile
    pub async fn connect_random(&self) -> Result<TunnelSession, TunnelError> {
        let profile = self.select_config()?;
        info!("Connecting to {}", display_name(&profile));
        self.connect(&profile).await
    }

    /// Replace `current` with a session on a newly selected profile
    /// The current session is terminated even when no new profile can be selected.
    pub async fn rotate(&self, current: TunnelSession) -> Result<TunnelSession, TunnelError> {
        let selected = self.select_config();
        current.terminate().await;

        let profile = selected?;
        info!("Connecting to {}", display_name(&profile));
        self.connect(&profile).await
    }

    /// Program and arguments used to launch the client for `config_path`
    pub fn command_line(&self, config_path: &Path) -> (String, Vec<OsString>) {
        let mut args: Vec<OsString> = vec![
            "--config".into(),
            config_path.as_os_str().to_owned(),
            "--auth-user-pass".into(),
            self.credentials_file.as_os_str().to_owned(),
        ];
        if self.use_sudo {
            args.insert(0, self.binary.clone().into());
            ("sudo".to_string(), args)
        } else {
            (self.binary.clone(), args)
        }
    }

    pub async fn connect(&self, config_path: &Path) -> Result<TunnelSession, TunnelError> {
        let (program, args) = self.command_line(config_path);
        info!(
            "{} {}",
            program,
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TunnelError::Io(std::io::Error::other("tunnel client stdout not captured"))
        })?;
        // stderr is kept only until the handshake is decided
        let capture_stderr = Arc::new(AtomicBool::new(true));
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(collect_lines(
                BufReader::new(stderr),
                "stderr",
                capture_stderr.clone(),
            ))
        });

        let mut session = TunnelSession {
            child,
            config_path: config_path.to_path_buf(),
            state: TunnelState::Connecting,
            forwarders: Vec::new(),
        };

        let mut reader = BufReader::new(stdout);
        let mut transcript = Vec::new();
        let handshake = read_handshake(&mut reader, &mut transcript);
        let outcome = match self.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("No handshake from tunnel client after {:?}", limit);
                    abort_task(stderr_task);
                    session.terminate().await;
                    return Err(TunnelError::HandshakeTimeout(limit));
                }
            },
            None => handshake.await,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                abort_task(stderr_task);
                session.terminate().await;
                return Err(e.into());
            }
        };

        match outcome {
            HandshakeOutcome::Established => {
                tokio::time::sleep(self.handshake_settle).await;
                info!("VPN connection established");

                session.state = TunnelState::Established;
                capture_stderr.store(false, Ordering::Relaxed);
                session
                    .forwarders
                    .push(tokio::spawn(forward_lines(reader, "stdout")).abort_handle());
                if let Some(task) = stderr_task {
                    session.forwarders.push(task.abort_handle());
                }

                self.log_public_ip().await;
                Ok(session)
            }
            HandshakeOutcome::Failed(line) => {
                abort_task(stderr_task);
                session.terminate().await;
                Err(TunnelError::ConnectFailed(line))
            }
            HandshakeOutcome::Exited => {
                let status = session.child.wait().await?;
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => Vec::new(),
                };

                let output: Vec<String> = transcript.into_iter().chain(stderr).collect();
                for line in &output {
                    error!("{}", line);
                }
                Err(TunnelError::ExitedEarly {
                    code: status.code(),
                    output: output.join("\n"),
                })
            }
        }
    }

    /// Log the address the outside world sees; failures only warn
    async fn log_public_ip(&self) {
        match self.lookup_public_ip().await {
            Ok(ip) => info!("VPN connected, current IP address: {}", ip),
            Err(e) => warn!("Could not determine public IP address: {}", e),
        }
    }

    async fn lookup_public_ip(&self) -> Result<String, reqwest::Error> {
        let body = self
            .http
            .get(&self.ip_echo_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim().to_string())
    }
}

/// Uniformly random `.ovpn` profile from `dir`
pub fn select_config(dir: &Path) -> Result<PathBuf, TunnelError> {
    let entries = std::fs::read_dir(dir).map_err(|source| TunnelError::ConfigDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let profiles: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == PROFILE_EXTENSION)
        })
        .collect();

    profiles
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| TunnelError::NoConfigFound(dir.to_path_buf()))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn abort_task<T>(task: Option<JoinHandle<T>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Log every line; keep them while `capture` is set, drop them once it is cleared
async fn collect_lines<R>(reader: R, stream: &'static str, capture: Arc<AtomicBool>) -> Vec<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut collected = Vec::new();
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("[vpn {}] {}", stream, line);
        if capture.load(Ordering::Relaxed) {
            collected.push(line);
        } else if !collected.is_empty() {
            collected = Vec::new();
        }
    }
    collected
}

async fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[vpn {}] {}", stream, line.trim());
    }
}

#[cfg(unix)]
async fn terminate_child(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return; // already reaped
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!("SIGTERM to tunnel client {} failed: {}", pid, e);
    }

    match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!("Tunnel client {} exited with {}", pid, status),
        Ok(Err(e)) => warn!("Waiting for tunnel client {} failed: {}", pid, e),
        Err(_) => {
            warn!("Tunnel client {} ignored SIGTERM, killing it", pid);
            if let Err(e) = child.kill().await {
                error!("Failed to kill tunnel client {}: {}", pid, e);
            }
        }
    }
}

#[cfg(not(unix))]
async fn terminate_child(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to stop tunnel client: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_config(dir: &Path, binary: &str) -> TunnelConfig {
        TunnelConfig {
            config_dir: dir.to_path_buf(),
            credentials_file: dir.join("auth.txt"),
            rotation_interval: Duration::from_secs(3600),
            binary: binary.to_string(),
            sudo: SudoMode::Never,
            handshake_timeout: Some(Duration::from_secs(10)),
            settle_delay: Duration::ZERO,
            ip_echo_url: "http://127.0.0.1:9/".to_string(),
        }
    }

    #[test]
    fn test_select_config_only_picks_profiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("us-west.ovpn"), "client").unwrap();
        std::fs::write(dir.path().join("us-east.ovpn"), "client").unwrap();
        std::fs::write(dir.path().join("auth.txt"), "user\npass").unwrap();
        std::fs::create_dir(dir.path().join("nested.ovpn")).unwrap();

        for _ in 0..20 {
            let chosen = select_config(dir.path()).unwrap();
            assert_eq!(chosen.extension().unwrap(), "ovpn");
            assert!(chosen.is_file());
        }
    }

    #[test]
    fn test_select_config_without_profiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.md"), "nothing").unwrap();

        let err = select_config(dir.path()).unwrap_err();
        assert!(matches!(err, TunnelError::NoConfigFound(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_select_config_missing_directory() {
        let err = select_config(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, TunnelError::ConfigDir { .. }));
    }

    #[test]
    fn test_command_line_with_and_without_sudo() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tunnel_config(dir.path(), "openvpn");
        let profile = dir.path().join("us-west.ovpn");

        let manager = TunnelManager::new(&config).unwrap();
        let (program, args) = manager.command_line(&profile);
        assert_eq!(program, "openvpn");
        assert_eq!(
            args,
            vec![
                OsString::from("--config"),
                profile.clone().into_os_string(),
                OsString::from("--auth-user-pass"),
                dir.path().join("auth.txt").into_os_string(),
            ]
        );

        config.sudo = SudoMode::Always;
        let manager = TunnelManager::new(&config).unwrap();
        let (program, args) = manager.command_line(&profile);
        assert_eq!(program, "sudo");
        assert_eq!(args[0], OsString::from("openvpn"));
        assert_eq!(args.len(), 5);
    }

    #[cfg(unix)]
    fn fake_client(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_established_then_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_client(
            dir.path(),
            "fake-openvpn",
            "echo 'OpenVPN 2.6.8 starting'\necho 'Initialization Sequence Completed'\nexec sleep 60",
        );
        let manager = TunnelManager::new(&tunnel_config(dir.path(), &binary))
            .unwrap()
            .with_handshake_settle(Duration::ZERO);

        let session = manager.connect(&dir.path().join("us-west.ovpn")).await.unwrap();
        assert_eq!(session.state(), TunnelState::Established);
        assert!(session.pid().is_some());

        session.terminate().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_error_marker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_client(
            dir.path(),
            "fake-openvpn",
            &format!(
                "echo $$ > '{}'\n\
                 echo 'AUTH: Received control message: AUTH_FAILED'\n\
                 echo 'Exiting due to fatal error'\n\
                 exec sleep 60",
                dir.path().join("client.pid").display()
            ),
        );
        let manager = TunnelManager::new(&tunnel_config(dir.path(), &binary)).unwrap();

        let err = manager
            .connect(&dir.path().join("us-west.ovpn"))
            .await
            .err()
            .unwrap();
        match err {
            TunnelError::ConnectFailed(line) => assert_eq!(line, "Exiting due to fatal error"),
            other => panic!("unexpected error: {other}"),
        }

        let pid: i32 = std::fs::read_to_string(dir.path().join("client.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!process_alive(pid), "client {pid} still running");
    }

    #[cfg(unix)]
    fn process_alive(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_early_exit_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_client(
            dir.path(),
            "fake-openvpn",
            "echo 'Note: option deprecated'\necho 'cannot open profile' >&2\nexit 3",
        );
        let manager = TunnelManager::new(&tunnel_config(dir.path(), &binary)).unwrap();

        let err = manager
            .connect(&dir.path().join("us-west.ovpn"))
            .await
            .err()
            .unwrap();
        match err {
            TunnelError::ExitedEarly { code, output } => {
                assert_eq!(code, Some(3));
                assert!(output.contains("Note: option deprecated"));
                assert!(output.contains("cannot open profile"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_times_out_on_silent_client() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_client(dir.path(), "fake-openvpn", "exec sleep 60");
        let mut config = tunnel_config(dir.path(), &binary);
        config.handshake_timeout = Some(Duration::from_millis(300));
        let manager = TunnelManager::new(&config).unwrap();

        let err = manager
            .connect(&dir.path().join("us-west.ovpn"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::HandshakeTimeout(_)));
        assert!(err.is_recoverable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotate_switches_profile_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("us-west.ovpn"), "client").unwrap();
        let binary = fake_client(
            dir.path(),
            "fake-openvpn",
            "echo 'Initialization Sequence Completed'\nexec sleep 60",
        );
        let manager = TunnelManager::new(&tunnel_config(dir.path(), &binary))
            .unwrap()
            .with_handshake_settle(Duration::ZERO);

        let first = manager.connect_random().await.unwrap();
        let first_pid = first.pid();
        let second = manager.rotate(first).await.unwrap();

        assert_eq!(second.config_path(), dir.path().join("us-west.ovpn"));
        assert_ne!(second.pid(), first_pid);
        second.terminate().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotate_without_profiles_still_terminates_current() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("us-west.ovpn");
        std::fs::write(&profile, "client").unwrap();
        let binary = fake_client(
            dir.path(),
            "fake-openvpn",
            "echo 'Initialization Sequence Completed'\nexec sleep 60",
        );
        let manager = TunnelManager::new(&tunnel_config(dir.path(), &binary))
            .unwrap()
            .with_handshake_settle(Duration::ZERO);

        let current = manager.connect_random().await.unwrap();
        let pid = current.pid().unwrap() as i32;
        std::fs::remove_file(&profile).unwrap();

        let err = manager.rotate(current).await.err().unwrap();
        assert!(matches!(err, TunnelError::NoConfigFound(_)));
        assert!(!process_alive(pid), "client {pid} still running");
    }

    #[tokio::test]
    async fn test_collect_lines_stops_keeping_output_when_released() {
        let output = "Note: cipher deprecated\n\nWARNING: no auth cache\n";

        let kept = collect_lines(
            BufReader::new(output.as_bytes()),
            "stderr",
            Arc::new(AtomicBool::new(true)),
        )
        .await;
        assert_eq!(kept, vec!["Note: cipher deprecated", "WARNING: no auth cache"]);

        let released = collect_lines(
            BufReader::new(output.as_bytes()),
            "stderr",
            Arc::new(AtomicBool::new(false)),
        )
        .await;
        assert!(released.is_empty());
    }
}
