use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::error::ResolutionError;

/// Default bound on a single `ssh -G` run.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for the pipes to close once the client has exited,
/// when the timeout is already used up.
const PIPE_GRACE: Duration = Duration::from_millis(250);

/// Fully resolved settings for one host, as printed by `ssh -G`.
/// Keys are lower-cased; repeated keys keep every value in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EffectiveConfig {
    values: BTreeMap<String, Vec<String>>,
}

impl EffectiveConfig {
    pub fn parse(output: &str) -> Self {
        let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            values
                .entry(key.to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
        Self { values }
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.get("hostname")
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    pub fn port(&self) -> Option<u16> {
        self.get("port").and_then(|p| p.parse().ok())
    }

    pub fn identity_files(&self) -> &[String] {
        self.get_all("identityfile")
    }

    pub fn proxy_jump(&self) -> Option<&str> {
        self.get("proxyjump").filter(|v| !v.eq_ignore_ascii_case("none"))
    }

    pub fn proxy_command(&self) -> Option<&str> {
        self.get("proxycommand")
            .filter(|v| !v.eq_ignore_ascii_case("none"))
    }
}

/// Shared flag for aborting an in-flight resolution from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Something that can print the effective config of a host.
pub trait ConfigDump {
    fn dump(&self, nickname: &str, cancel: &CancelToken) -> Result<String, ResolutionError>;
}

/// Resolve `nickname` through `dump`. Nothing is cached: every call asks again.
pub fn resolve<D: ConfigDump + ?Sized>(
    dump: &D,
    nickname: &str,
    cancel: &CancelToken,
) -> Result<EffectiveConfig, ResolutionError> {
    if nickname.trim().is_empty() || nickname.contains(['\n', '\r', '\0']) {
        return Err(ResolutionError::InvalidNickname(nickname.to_string()));
    }
    if cancel.is_cancelled() {
        return Err(ResolutionError::Cancelled {
            nickname: nickname.to_string(),
        });
    }
    let output = dump.dump(nickname, cancel)?;
    let config = EffectiveConfig::parse(&output);
    tracing::debug!("Resolved {} settings for {}", config.len(), nickname);
    Ok(config)
}

/// The system SSH client.
#[derive(Debug, Clone)]
pub struct SshClient {
    program: PathBuf,
    config_file: Option<PathBuf>,
    timeout: Duration,
}

impl Default for SshClient {
    fn default() -> Self {
        Self::new("ssh")
    }
}

impl SshClient {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_file: None,
            timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    /// Pass `-F <path>` on every invocation.
    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `<program> [-F <config>]`, ready for more arguments.
    pub(crate) fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(config) = &self.config_file {
            cmd.arg("-F").arg(config);
        }
        cmd
    }

    fn spawn_error(&self, err: io::Error) -> ResolutionError {
        if err.kind() == io::ErrorKind::NotFound {
            ResolutionError::ClientUnavailable {
                program: self.program.clone(),
            }
        } else {
            ResolutionError::Io(err)
        }
    }
}

/// Read `pipe` to EOF on its own thread. Anything the client spawned can
/// inherit the pipe and keep it open after the client exits, so the
/// receiving side must not wait unbounded.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl ConfigDump for SshClient {
    fn dump(&self, nickname: &str, cancel: &CancelToken) -> Result<String, ResolutionError> {
        let mut cmd = self.base_command();
        cmd.arg("-G")
            .arg("--")
            .arg(nickname)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        tracing::debug!("Running {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            if cancel.is_cancelled() {
                kill(&mut child);
                tracing::debug!("Resolution of {} cancelled", nickname);
                return Err(ResolutionError::Cancelled {
                    nickname: nickname.to_string(),
                });
            }
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                kill(&mut child);
                tracing::warn!(
                    "{} -G {} timed out after {:?}",
                    self.program.display(),
                    nickname,
                    self.timeout
                );
                return Err(ResolutionError::ResolutionTimedOut {
                    nickname: nickname.to_string(),
                    timeout: self.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let wait = self
            .timeout
            .saturating_sub(started.elapsed())
            .max(PIPE_GRACE);
        let Ok(stdout) = stdout.recv_timeout(wait) else {
            tracing::warn!(
                "{} -G {} exited but its output never closed",
                self.program.display(),
                nickname
            );
            return Err(ResolutionError::ResolutionTimedOut {
                nickname: nickname.to_string(),
                timeout: self.timeout,
            });
        };
        let stderr = stderr.recv_timeout(PIPE_GRACE).unwrap_or_default();
        if !status.success() {
            return Err(ResolutionError::ResolutionFailed {
                nickname: nickname.to_string(),
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const SAMPLE: &str = "\
host web1
hostname 10.0.0.1
user deploy
port 2222
identityfile ~/.ssh/id_ed25519
identityfile ~/.ssh/id_rsa
proxyjump none
proxycommand none
serveraliveinterval 30
sendenv LANG
sendenv LC_*
";

    struct FakeDump {
        output: String,
        calls: Cell<usize>,
    }

    impl FakeDump {
        fn new(output: &str) -> Self {
            Self {
                output: output.to_string(),
                calls: Cell::new(0),
            }
        }
    }

    impl ConfigDump for FakeDump {
        fn dump(&self, _nickname: &str, _cancel: &CancelToken) -> Result<String, ResolutionError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.output.clone())
        }
    }

    #[test]
    fn test_parse_effective_config() {
        let config = EffectiveConfig::parse(SAMPLE);
        assert_eq!(config.hostname(), Some("10.0.0.1"));
        assert_eq!(config.user(), Some("deploy"));
        assert_eq!(config.port(), Some(2222));
        assert_eq!(config.identity_files(), ["~/.ssh/id_ed25519", "~/.ssh/id_rsa"]);
        assert_eq!(config.get("ServerAliveInterval"), Some("30"));
        assert_eq!(config.get_all("sendenv"), ["LANG", "LC_*"]);
        assert_eq!(config.get("missing"), None);
        assert!(config.get_all("missing").is_empty());
    }

    #[test]
    fn test_none_proxy_is_absent() {
        let config = EffectiveConfig::parse(SAMPLE);
        assert_eq!(config.proxy_jump(), None);
        assert_eq!(config.proxy_command(), None);

        let config = EffectiveConfig::parse("proxyjump bastion\nproxycommand ssh -W %h:%p gw\n");
        assert_eq!(config.proxy_jump(), Some("bastion"));
        assert_eq!(config.proxy_command(), Some("ssh -W %h:%p gw"));
    }

    #[test]
    fn test_parse_tolerates_odd_lines() {
        let config = EffectiveConfig::parse("\n  User   root  \nbatchmode\r\n");
        assert_eq!(config.user(), Some("root"));
        assert_eq!(config.get("batchmode"), Some(""));
        assert_eq!(config.len(), 2);
    }

    #[test]
    fn test_resolve_twice_is_identical() {
        let fake = FakeDump::new(SAMPLE);
        let cancel = CancelToken::new();
        let first = resolve(&fake, "web1", &cancel).unwrap();
        let second = resolve(&fake, "web1", &cancel).unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.calls.get(), 2);
    }

    #[test]
    fn test_resolve_rejects_empty_nickname() {
        let fake = FakeDump::new(SAMPLE);
        let err = resolve(&fake, "  ", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidNickname(_)));
        assert_eq!(fake.calls.get(), 0);
    }

    #[test]
    fn test_resolve_cancelled_before_start() {
        let fake = FakeDump::new(SAMPLE);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = resolve(&fake, "web1", &cancel).unwrap_err();
        assert!(matches!(err, ResolutionError::Cancelled { .. }));
        assert_eq!(fake.calls.get(), 0);
    }

    #[test]
    fn test_base_command_adds_config_file() {
        let client = SshClient::new("ssh").with_config_file(Some(PathBuf::from("/tmp/cfg")));
        let cmd = client.base_command();
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["-F", "/tmp/cfg"]);
        assert!(SshClient::default().base_command().get_args().next().is_none());
    }

    // Every script-backed case runs in this one test so no other test forks
    // while a script is still open for writing.
    #[cfg(unix)]
    #[test]
    fn test_system_client_with_scripts() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = |name: &str, body: &str| -> PathBuf {
            let path = dir.path().join(name);
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        };

        let ok = script(
            "ok",
            "[ \"$1\" = \"-F\" ] && shift 2\nprintf 'hostname %s.example.com\\nuser tester\\n' \"$3\"",
        );
        let fail = script("fail", "echo 'bad configuration option' >&2\nexit 255");
        let slow = script("slow", "exec sleep 5");
        let lingering = script("lingering", "echo 'hostname x'\nsleep 5 &\nexit 0");

        let cancel = CancelToken::new();

        let missing = SshClient::new(dir.path().join("no-such-ssh"));
        let err = missing.dump("web1", &cancel).unwrap_err();
        assert!(matches!(err, ResolutionError::ClientUnavailable { .. }));

        let config = SshClient::new(&ok).dump("web1", &cancel).unwrap();
        let config = EffectiveConfig::parse(&config);
        assert_eq!(config.hostname(), Some("web1.example.com"));
        assert_eq!(config.user(), Some("tester"));

        let with_file = SshClient::new(&ok).with_config_file(Some(dir.path().join("config")));
        let config = resolve(&with_file, "db", &cancel).unwrap();
        assert_eq!(config.hostname(), Some("db.example.com"));

        match SshClient::new(&fail).dump("web1", &cancel) {
            Err(ResolutionError::ResolutionFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(255));
                assert_eq!(stderr, "bad configuration option");
            }
            other => panic!("expected ResolutionFailed, got {:?}", other),
        }

        let started = Instant::now();
        let client = SshClient::new(&slow).with_timeout(Duration::from_millis(200));
        let err = client.dump("web1", &cancel).unwrap_err();
        assert!(matches!(err, ResolutionError::ResolutionTimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));

        // A background child still holding stdout can't stall the caller.
        let started = Instant::now();
        let client = SshClient::new(&lingering).with_timeout(Duration::from_millis(200));
        let err = client.dump("web1", &cancel).unwrap_err();
        assert!(matches!(err, ResolutionError::ResolutionTimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));

        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });
        let started = Instant::now();
        let err = SshClient::new(&slow).dump("web1", &cancel).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, ResolutionError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
