use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn start(&self, _file: &Path, _bytes: u64, _parts: usize) {}
    fn part_done(&self, _index: u32, _bytes: u32) {}
    fn retry(&self, _index: u32, _attempt: u32, _msg: &str) {}
    fn archive_deleted(&self, _archive_id: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _archive_id: &str, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, file: &Path, bytes: u64, parts: usize) {
        self.line(&format!(
            "START file={} bytes={} parts={}",
            file.display(),
            bytes,
            parts
        ));
    }
    fn part_done(&self, index: u32, bytes: u32) {
        self.line(&format!("PART index={index} bytes={bytes}"));
    }
    fn retry(&self, index: u32, attempt: u32, msg: &str) {
        self.line(&format!("RETRY index={index} attempt={attempt} msg={msg}"));
    }
    fn archive_deleted(&self, archive_id: &str) {
        self.line(&format!("DELETE archive={archive_id}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
    fn done(&self, archive_id: &str, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE archive={archive_id} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_event_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.start(Path::new("/tmp/a.tar"), 10, 1);
        logger.retry(0, 1, "timeout");
        logger.done("archive-1", 10, 0.5);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("START file=/tmp/a.tar bytes=10 parts=1"));
        assert!(lines[1].contains("RETRY index=0 attempt=1 msg=timeout"));
        assert!(lines[2].contains("DONE archive=archive-1 bytes=10 seconds=0.500"));
        assert!(lines[0].starts_with('['));
    }
}
