use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Escapes control and non-ASCII characters so peer-supplied text stays on one log line
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c == ' ' || c == '\t' => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

/// Placeholder peer for events that do not belong to a session
pub const NO_PEER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Error,
}

/// Shared log sink. Clones write to the same file; each line is written
/// and flushed under one lock.
#[derive(Clone)]
pub struct Logger {
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    verbose: bool,
    raw_display: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, verbose: bool, raw_display: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        } else {
            None
        };

        Ok(Self { writer, verbose, raw_display })
    }

    /// Console-only logger
    pub fn stdout() -> Self {
        Self { writer: None, verbose: false, raw_display: false }
    }

    async fn write(&self, level: Level, client_addr: &SocketAddr, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        let display_message = if self.raw_display {
            message.to_string()
        } else {
            safe_log_string(message)
        };

        let tag = match level {
            Level::Info => "",
            Level::Error => "ERROR ",
        };
        let log_line = format!("{} {} {}{}\n", timestamp, client_addr, tag, display_message);

        match level {
            Level::Info => print!("{}", log_line),
            Level::Error => eprint!("{}", log_line),
        }

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let file_line = format!(
                "{} {} {}{}\n",
                timestamp,
                client_addr,
                tag,
                safe_log_string(message)
            );
            let _ = writer.write_all(file_line.as_bytes());
            let _ = writer.flush();
        }
    }

    pub async fn log(&self, client_addr: &SocketAddr, message: &str) {
        self.write(Level::Info, client_addr, message).await;
    }

    pub async fn error(&self, client_addr: &SocketAddr, message: &str) {
        self.write(Level::Error, client_addr, message).await;
    }

    /// Protocol trace, only emitted with `--verbose`
    pub async fn log_verbose(&self, client_addr: &SocketAddr, direction: &str, line: &str) {
        if self.verbose {
            self.write(Level::Info, client_addr, &format!("{} {}", direction, line.trim_end()))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_log_string() {
        assert_eq!(safe_log_string("plain text"), "plain text");
        assert_eq!(safe_log_string("a\r\nb"), "a\\r\\nb");
        assert_eq!(safe_log_string("bell\x07"), "bell\\x07");
        assert_eq!(safe_log_string("caf\u{e9}"), "caf\\u{e9}");
    }

    #[tokio::test]
    async fn test_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("relay.log");
        let logger = Logger::new(Some(path.clone()), false, false).unwrap();
        let peer: SocketAddr = "192.168.0.42:40000".parse().unwrap();

        logger.log(&peer, "Connection accepted").await;
        logger.clone().error(&peer, "forward failed\r\ninjected").await;
        logger.log_verbose(&peer, ">>", "NOOP").await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("192.168.0.42:40000 Connection accepted"));
        assert!(lines[1].ends_with("ERROR forward failed\\r\\ninjected"));
    }
}
