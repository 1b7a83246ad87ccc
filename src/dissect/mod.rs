//! Bridge to the external dissector (tshark).
//!
//! Packets are written to a scratch pcap, optionally re-keyed with TLS
//! secrets through `editcap`, then fed to `tshark -T json` on stdin. Every
//! tool run races a hard timeout and a [`CancelToken`]; the child is killed
//! on any abort.

mod cancel;
pub mod secrets;

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use cancel::{cancel_pair, CancelHandle, CancelToken};

use crate::capture_file::{frames_to_pcap, packets_to_frames, RawFrame};
use crate::config::DissectorConfig;
use crate::error::{DissectError, MapError};
use crate::layers::{LayerRegistry, PacketLayers};
use crate::model::Packet;
use crate::tree::{normalize, parse_record, split_records};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_KEYLOG_ENV: &str = "SSLKEYLOGFILE";

const CAPTURE_FILE: &str = "capture.pcap";
const KEYS_FILE: &str = "found_keys.txt";
const KEYED_CAPTURE_FILE: &str = "capture_with_keys.pcapng";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WritingCapture,
    RecoveringSecrets,
    Dissecting,
    Mapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Stage(Stage),
    /// `done` of `total` records mapped.
    Mapped { done: usize, total: usize },
}

enum Outcome {
    Finished(io::Result<(Vec<u8>, Vec<u8>)>, io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct Dissector {
    tshark: PathBuf,
    editcap: PathBuf,
    timeout: Duration,
    keylog_env: String,
    scratch: PathBuf,
    registry: LayerRegistry,
    // scratch files are shared between calls
    busy: Mutex<()>,
}

impl Default for Dissector {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("vshark-{}", std::process::id()))
}

impl Dissector {
    pub fn new() -> Self {
        Dissector {
            tshark: PathBuf::from("tshark"),
            editcap: PathBuf::from("editcap"),
            timeout: DEFAULT_TIMEOUT,
            keylog_env: DEFAULT_KEYLOG_ENV.to_owned(),
            scratch: default_scratch_dir(),
            registry: LayerRegistry::standard(),
            busy: Mutex::new(()),
        }
    }

    pub fn from_config(config: &DissectorConfig) -> Self {
        let mut dissector = Self::new()
            .tshark(&config.tshark)
            .editcap(&config.editcap)
            .timeout(Duration::from_secs(config.timeout_secs))
            .keylog_env(&config.keylog_env);
        if let Some(dir) = &config.scratch_dir {
            dissector = dissector.scratch_dir(dir);
        }
        dissector
    }

    pub fn tshark(mut self, path: impl Into<PathBuf>) -> Self {
        self.tshark = path.into();
        self
    }

    pub fn editcap(mut self, path: impl Into<PathBuf>) -> Self {
        self.editcap = path.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the environment variable holding the key-log path.
    pub fn keylog_env(mut self, name: impl Into<String>) -> Self {
        self.keylog_env = name.into();
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = dir.into();
        self
    }

    pub fn registry(mut self, registry: LayerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// One dissector JSON record per packet.
    pub async fn convert(
        &self,
        packets: &[Arc<Packet>],
        cancel: &CancelToken,
        progress: impl FnMut(Progress) + Send,
    ) -> Result<Vec<String>, DissectError> {
        let frames = packets_to_frames(packets)?;
        self.convert_frames(&frames, cancel, progress).await
    }

    /// Like [`Dissector::convert`] for frames exactly as captured.
    pub async fn convert_frames(
        &self,
        frames: &[RawFrame],
        cancel: &CancelToken,
        mut progress: impl FnMut(Progress) + Send,
    ) -> Result<Vec<String>, DissectError> {
        let _guard = self.busy.lock().await;

        progress(Progress::Stage(Stage::WritingCapture));
        tokio::fs::create_dir_all(&self.scratch).await?;
        let capture = self.scratch.join(CAPTURE_FILE);
        let bytes = frames_to_pcap(frames)?;
        tokio::fs::write(&capture, &bytes).await?;

        let input = match self.read_keylog().await {
            Some(keylog) => {
                progress(Progress::Stage(Stage::RecoveringSecrets));
                match self.inject_secrets(&capture, &keylog, cancel).await {
                    Ok(Some(keyed)) => tokio::fs::read(&keyed).await?,
                    Ok(None) => bytes,
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        warn!(
                            event.name = "dissect.secrets_failed",
                            error = %err,
                            "could not inject TLS secrets, dissecting without them"
                        );
                        bytes
                    }
                }
            }
            None => bytes,
        };

        progress(Progress::Stage(Stage::Dissecting));
        let args = ["-r", "-", "-T", "json"].map(OsString::from);
        let out = self.run_tool(&self.tshark, &args, Some(input), cancel).await?;
        let text = String::from_utf8_lossy(&out);
        let records: Vec<String> = split_records(&text)?.into_iter().map(str::to_owned).collect();

        info!(
            event.name = "dissect.finished",
            frames = frames.len(),
            records = records.len(),
            "dissection finished"
        );
        Ok(records)
    }

    /// Converts, normalizes and maps the packets. A record that violates
    /// its layer contract fails alone.
    pub async fn analyze(
        &self,
        packets: &[Arc<Packet>],
        cancel: &CancelToken,
        mut progress: impl FnMut(Progress) + Send,
    ) -> Result<Vec<Result<PacketLayers, MapError>>, DissectError> {
        let records = self.convert(packets, cancel, &mut progress).await?;
        self.map_records(&records, progress)
    }

    pub async fn analyze_frames(
        &self,
        frames: &[RawFrame],
        cancel: &CancelToken,
        mut progress: impl FnMut(Progress) + Send,
    ) -> Result<Vec<Result<PacketLayers, MapError>>, DissectError> {
        let records = self.convert_frames(frames, cancel, &mut progress).await?;
        self.map_records(&records, progress)
    }

    fn map_records(
        &self,
        records: &[String],
        mut progress: impl FnMut(Progress),
    ) -> Result<Vec<Result<PacketLayers, MapError>>, DissectError> {
        progress(Progress::Stage(Stage::Mapping));
        let total = records.len();
        let mut out = Vec::with_capacity(total);
        for (i, record) in records.iter().enumerate() {
            let tree = normalize(&parse_record(record)?);
            let mapped = self.registry.map_record(&tree);
            if let Err(err) = &mapped {
                debug!(event.name = "dissect.record_rejected", record = i, error = %err);
            }
            out.push(mapped);
            progress(Progress::Mapped { done: i + 1, total });
        }
        Ok(out)
    }

    async fn read_keylog(&self) -> Option<String> {
        let path = std::env::var_os(&self.keylog_env)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Some(text),
            Err(err) => {
                debug!(
                    event.name = "dissect.keylog_unreadable",
                    path = %Path::new(&path).display(),
                    error = %err
                );
                None
            }
        }
    }

    /// Returns the secret-injected copy, or `None` when no key-log line
    /// matches the capture.
    async fn inject_secrets(
        &self,
        capture: &Path,
        keylog: &str,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>, DissectError> {
        let args: Vec<OsString> = vec![
            "-r".into(),
            capture.into(),
            "-Y".into(),
            "tls.handshake.type == 1".into(),
            "-T".into(),
            "fields".into(),
            "-e".into(),
            "tls.handshake.random".into(),
        ];
        let out = self.run_tool(&self.tshark, &args, None, cancel).await?;
        let randoms = secrets::parse_randoms(&String::from_utf8_lossy(&out));
        let lines = secrets::matching_lines(keylog, &randoms);
        if lines.is_empty() {
            debug!(
                event.name = "dissect.no_secrets",
                client_hellos = randoms.len(),
                "no key-log line matches the capture"
            );
            return Ok(None);
        }

        let keys = self.scratch.join(KEYS_FILE);
        let mut contents = lines.join("\n");
        contents.push('\n');
        tokio::fs::write(&keys, contents).await?;

        let keyed = self.scratch.join(KEYED_CAPTURE_FILE);
        let mut secrets_arg = OsString::from("tls,");
        secrets_arg.push(&keys);
        let args: Vec<OsString> = vec![
            "--discard-all-secrets".into(),
            "--inject-secrets".into(),
            secrets_arg,
            capture.into(),
            keyed.clone().into(),
        ];
        self.run_tool(&self.editcap, &args, None, cancel).await?;

        info!(
            event.name = "dissect.secrets_injected",
            lines = lines.len(),
            "injected TLS secrets"
        );
        Ok(Some(keyed))
    }

    /// Runs one tool to completion, feeding `input` on stdin while both
    /// output pipes are drained.
    async fn run_tool(
        &self,
        program: &Path,
        args: &[OsString],
        input: Option<Vec<u8>>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, DissectError> {
        let tool = program.display().to_string();
        let mut child = Command::new(program)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => DissectError::ToolMissing { tool: tool.clone() },
                _ => DissectError::Io(err),
            })?;
        debug!(event.name = "dissect.spawned", tool = %tool, pid = child.id());

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let write = async move {
            if let (Some(mut pipe), Some(data)) = (stdin, input) {
                match pipe.write_all(&data).await {
                    // the tool stopped reading; its exit status tells why
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                    res => res?,
                }
                pipe.shutdown().await.ok();
            }
            Ok::<_, io::Error>(())
        };
        let read_out = async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<_, io::Error>(buf)
        };
        let read_err = async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<_, io::Error>(buf)
        };

        let outcome = {
            let finish = async {
                let streams = tokio::try_join!(write, read_out, read_err);
                let status = child.wait().await;
                (streams.map(|((), out, err)| (out, err)), status)
            };
            tokio::select! {
                (streams, status) = finish => Outcome::Finished(streams, status),
                _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        match outcome {
            Outcome::Finished(streams, status) => {
                let status = status?;
                let (out, err) = match streams {
                    Ok(streams) => streams,
                    Err(err) => {
                        child.kill().await.ok();
                        return Err(err.into());
                    }
                };
                if !status.success() {
                    return Err(DissectError::Exit {
                        tool,
                        code: status.code(),
                        stderr: String::from_utf8_lossy(&err).trim().to_owned(),
                    });
                }
                if !err.is_empty() {
                    debug!(
                        event.name = "dissect.stderr",
                        tool = %tool,
                        stderr = %String::from_utf8_lossy(&err).trim()
                    );
                }
                Ok(out)
            }
            Outcome::TimedOut => {
                child.kill().await.ok();
                warn!(
                    event.name = "dissect.timeout",
                    tool = %tool,
                    after = ?self.timeout,
                    "tool killed after timeout"
                );
                Err(DissectError::Timeout {
                    tool,
                    after: self.timeout,
                })
            }
            Outcome::Cancelled => {
                child.kill().await.ok();
                info!(event.name = "dissect.cancelled", tool = %tool, "dissection cancelled");
                Err(DissectError::Cancelled)
            }
        }
    }
}
