//! Installer log collection
//!
//! Installers forward their logs over syslog (`inst.syslog` on the kernel
//! command line, `logger` in the kickstart). Messages arrive on UDP and TCP
//! on the same port and are appended to `{hostname}.log` under the logs
//! directory, one line per message.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Timelike};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Largest datagram we accept
const MAX_DATAGRAM_SIZE: usize = 8192;

/// Files without writes for this long are closed
const IDLE_CLOSE: Duration = Duration::from_secs(5);

/// One syslog message, RFC 3164 or RFC 5424
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub hostname: Option<String>,
    pub tag: Option<String>,
    pub timestamp: Option<NaiveTime>,
    pub content: String,
}

impl LogMessage {
    /// Parse a single message. Never fails; missing header fields are `None`
    /// and whatever cannot be recognized ends up in `content`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim_end_matches(['\r', '\n', '\0']);
        let rest = strip_priority(raw);
        match rest.strip_prefix("1 ") {
            Some(rest) => Self::parse_rfc5424(rest),
            None => Self::parse_rfc3164(rest),
        }
    }

    fn parse_rfc5424(rest: &str) -> Self {
        let mut fields = rest.splitn(6, ' ');
        let timestamp = fields
            .next()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.time());
        let hostname = fields.next().and_then(nil_value);
        let tag = fields.next().and_then(nil_value);
        // procid and msgid are not kept
        let _ = fields.next();
        let _ = fields.next();
        let content = skip_structured_data(fields.next().unwrap_or_default());

        LogMessage {
            hostname,
            tag,
            timestamp,
            content: content.trim_start_matches('\u{feff}').to_string(),
        }
    }

    fn parse_rfc3164(rest: &str) -> Self {
        // "Mmm dd hh:mm:ss "
        let timestamp = rest
            .get(7..15)
            .filter(|_| rest.as_bytes().get(15) == Some(&b' '))
            .and_then(|time| NaiveTime::parse_from_str(time, "%H:%M:%S").ok());
        let Some(timestamp) = timestamp else {
            return LogMessage {
                hostname: None,
                tag: None,
                timestamp: None,
                content: rest.to_string(),
            };
        };

        let rest = &rest[16..];
        let (hostname, rest) = rest.split_once(' ').unwrap_or((rest, ""));
        let (tag, content) = match rest.split_once(": ") {
            Some((tag, content)) if !tag.contains(' ') => (Some(tag), content),
            _ => match rest.strip_suffix(':') {
                Some(tag) if !tag.contains(' ') => (Some(tag), ""),
                _ => (None, rest),
            },
        };
        // "anaconda[1234]" is tagged "anaconda"
        let tag = tag
            .map(|tag| tag.split('[').next().unwrap_or(tag))
            .filter(|tag| !tag.is_empty());

        LogMessage {
            hostname: nil_value(hostname),
            tag: tag.map(str::to_string),
            timestamp: Some(timestamp),
            content: content.to_string(),
        }
    }

    /// The line appended to the host's log file
    pub fn line(&self) -> String {
        let time = self
            .timestamp
            .map(|t| format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second()))
            .unwrap_or_else(|| "00:00:00".to_string());
        format!(
            "{} {} t:{}\n",
            time,
            self.content,
            self.tag.as_deref().unwrap_or("-")
        )
    }
}

fn strip_priority(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix('<') else {
        return raw;
    };
    match rest.split_once('>') {
        Some((pri, rest)) if !pri.is_empty() && pri.len() <= 3 && pri.bytes().all(|b| b.is_ascii_digit()) => rest,
        _ => raw,
    }
}

fn nil_value(field: &str) -> Option<String> {
    match field {
        "" | "-" => None,
        field => Some(field.to_string()),
    }
}

fn skip_structured_data(rest: &str) -> &str {
    if let Some(msg) = rest.strip_prefix('-') {
        return msg.strip_prefix(' ').unwrap_or(msg);
    }

    let mut rest = rest;
    while rest.starts_with('[') {
        let mut escaped = false;
        let end = rest.char_indices().find_map(|(i, c)| match c {
            _ if escaped => {
                escaped = false;
                None
            }
            '\\' => {
                escaped = true;
                None
            }
            ']' => Some(i),
            _ => None,
        });
        match end {
            Some(end) => rest = &rest[end + 1..],
            None => return "",
        }
    }
    rest.strip_prefix(' ').unwrap_or(rest)
}

/// File name for a reporting host, `None` when nothing usable is left
pub fn log_file_name(hostname: &str) -> Option<String> {
    let cleaned: String = hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect::<String>()
        .to_ascii_lowercase();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        return None;
    }
    Some(format!("{}.log", cleaned))
}

/// Path of a host's log file under `dir`
pub fn log_path(dir: &Path, hostname: &str) -> Option<PathBuf> {
    log_file_name(hostname).map(|name| dir.join(name))
}

struct OpenLog {
    file: File,
    last_write: Instant,
}

/// Appends messages to per-host files, keeping recently used ones open
pub struct LogWriter {
    dir: PathBuf,
    files: HashMap<String, OpenLog>,
}

impl LogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: HashMap::new(),
        }
    }

    /// Append one message, returns the file written to
    pub async fn write(&mut self, message: &LogMessage) -> Result<Option<PathBuf>> {
        let Some(hostname) = message.hostname.as_deref() else {
            debug!("log entry does not contain a hostname, skipping");
            return Ok(None);
        };
        let Some(name) = log_file_name(hostname) else {
            debug!(hostname = %hostname, "unusable hostname in log entry, skipping");
            return Ok(None);
        };
        let path = self.dir.join(&name);

        if !self.files.contains_key(&name) {
            debug!(file = %path.display(), "opening syslog file");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("cannot open {} for appending", path.display()))?;
            self.files.insert(
                name.clone(),
                OpenLog {
                    file,
                    last_write: Instant::now(),
                },
            );
        }

        if let Some(open) = self.files.get_mut(&name) {
            open.last_write = Instant::now();
            open.file
                .write_all(message.line().as_bytes())
                .await
                .with_context(|| format!("cannot append to {}", path.display()))?;
            open.file.flush().await?;
        }
        Ok(Some(path))
    }

    /// Close files idle for longer than `idle`
    pub fn close_idle(&mut self, idle: Duration) {
        let before = self.files.len();
        self.files
            .retain(|_, open| open.last_write.elapsed() < idle);
        if self.files.len() != before {
            debug!(closed = before - self.files.len(), open = self.files.len(), "closed idle syslog files");
        }
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }
}

/// Syslog receiver on one UDP socket and one TCP listener
pub struct SyslogServer {
    udp: UdpSocket,
    tcp: TcpListener,
    dir: PathBuf,
}

impl SyslogServer {
    /// Bind UDP and TCP on `addr`. With port 0 the TCP listener takes the
    /// port the UDP socket was given.
    pub async fn bind(addr: &str, dir: impl Into<PathBuf>) -> Result<Self> {
        let udp = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("cannot listen on UDP {}", addr))?;
        let local = udp.local_addr()?;
        let tcp = TcpListener::bind(local)
            .await
            .with_context(|| format!("cannot listen on TCP {}", local))?;
        Ok(Self {
            udp,
            tcp,
            dir: dir.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.udp
            .local_addr()
            .context("failed to get local address of syslog socket")
    }

    /// Receive forever
    pub async fn run(self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("cannot create directory {}", self.dir.display()))?;
        info!(local_addr = %self.local_addr()?, dir = %self.dir.display(), "syslog server listening");

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(LogWriter::new(self.dir.clone()), receiver));

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = self.udp.recv_from(&mut buf) => match received {
                    Ok((len, _)) => {
                        let raw = String::from_utf8_lossy(&buf[..len]);
                        // a datagram may carry several messages
                        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
                            if sender.send(LogMessage::parse(line)).is_err() {
                                anyhow::bail!("syslog writer stopped");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "syslog recv_from failed"),
                },
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(remote = %peer, "syslog TCP connection");
                        tokio::spawn(read_stream(stream, peer, sender.clone()));
                    }
                    Err(e) => warn!(error = %e, "syslog accept failed"),
                },
            }
        }
    }
}

/// Newline framed messages, with an optional RFC 6587 octet count in front
async fn read_stream(stream: TcpStream, peer: SocketAddr, sender: mpsc::UnboundedSender<LogMessage>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = match line.split_once(' ') {
                    Some((count, rest)) if !count.is_empty() && count.bytes().all(|b| b.is_ascii_digit()) => rest,
                    _ => line.as_str(),
                };
                if line.trim().is_empty() {
                    continue;
                }
                if sender.send(LogMessage::parse(line)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(remote = %peer, error = %e, "syslog TCP read failed");
                return;
            }
        }
    }
}

async fn write_loop(mut writer: LogWriter, mut receiver: mpsc::UnboundedReceiver<LogMessage>) {
    let mut ticker = tokio::time::interval(IDLE_CLOSE);
    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(message) => {
                    if let Err(e) = writer.write(&message).await {
                        error!(error = %e, "cannot store syslog message");
                    }
                }
                None => return,
            },
            _ = ticker.tick() => writer.close_idle(IDLE_CLOSE),
        }
    }
}
