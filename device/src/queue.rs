use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::types::Reading;

pub const QUEUE_FILE_NAME: &str = "gps_cache.log";
pub const MAX_BATCH_SIZE: usize = 50;

/// Records drawn from the head of the queue, not yet removed from it.
#[derive(Debug, Clone)]
pub struct Batch {
    records: Vec<String>,
    cursor: u64,
    carries_power_status: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }

    /// Byte offset just past the last line this batch consumed.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn carries_power_status(&self) -> bool {
        self.carries_power_status
    }

    /// JSON array body for the upload endpoint.
    pub fn payload(&self) -> String {
        let mut body = String::with_capacity(self.records.iter().map(|r| r.len() + 1).sum::<usize>() + 2);
        body.push('[');
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                body.push(',');
            }
            body.push_str(record);
        }
        body.push(']');
        body
    }
}

/// How a newline-terminated queue line is treated.
#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Blank,
    Record { text: &'a str, power_status: bool },
    Malformed,
}

fn parse_line(line: &[u8]) -> Line<'_> {
    let Ok(text) = std::str::from_utf8(line) else {
        return Line::Malformed;
    };
    let text = text.trim();
    if text.is_empty() {
        return Line::Blank;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => Line::Record {
            text,
            power_status: fields.get("power_status").is_some_and(|v| !v.is_null()),
        },
        _ => Line::Malformed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mount {
    Mounted,
    Unmounted,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub exists: bool,
    pub size_bytes: u64,
    pub records: usize,
}

/// Append-only newline-delimited JSON log of readings awaiting upload.
///
/// The file is absent when the queue is empty. A commit rewrites the
/// remainder into a sibling temp file and renames it over the original, so a
/// crash leaves either the old file or the advanced one.
#[derive(Debug)]
pub struct QueueFile {
    path: PathBuf,
    temp_path: PathBuf,
    mount: Mount,
}

impl QueueFile {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let temp_path = path.with_extension("tmp");
        let queue = QueueFile {
            path,
            temp_path,
            mount: Mount::Mounted,
        };
        queue.recover();
        queue
    }

    /// Queue backed by nothing: appends fail, drains find nothing.
    pub fn unmounted(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let temp_path = path.with_extension("tmp");
        QueueFile {
            path,
            temp_path,
            mount: Mount::Unmounted,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn recover(&self) {
        if !self.temp_path.exists() {
            return;
        }
        if self.path.exists() {
            // Crash before the rename: the original is still authoritative.
            warn!(path = %self.temp_path.display(), "Discarding stale queue temp file");
            if let Err(e) = fs::remove_file(&self.temp_path) {
                warn!(error = %e, "Failed to remove stale queue temp file");
            }
        } else {
            warn!(path = %self.temp_path.display(), "Promoting orphaned queue temp file");
            if let Err(e) = self.promote() {
                warn!(error = %e, "Failed to promote queue temp file");
            }
        }
    }

    fn ensure_mounted(&self) -> Result<(), QueueError> {
        match self.mount {
            Mount::Mounted => Ok(()),
            Mount::Unmounted => Err(QueueError::Unmounted),
            Mount::Closed => Err(QueueError::Closed),
        }
    }

    pub fn append(&mut self, reading: &Reading) -> Result<(), QueueError> {
        let line = serde_json::to_string(reading)?;
        self.append_line(&line)
    }

    fn append_line(&mut self, line: &str) -> Result<(), QueueError> {
        self.ensure_mounted()?;
        let mut record = Vec::with_capacity(line.len() + 2);
        if self.has_torn_tail()? {
            // Terminate the torn record so it cannot merge with this one.
            warn!(path = %self.path.display(), "Queue ends with an unterminated line");
            record.push(b'\n');
        }
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| QueueError::io(&self.path, e))?;
        file.write_all(&record)
            .and_then(|_| file.sync_data())
            .map_err(|e| QueueError::io(&self.path, e))?;
        debug!(bytes = record.len(), "Reading appended to queue");
        Ok(())
    }

    fn has_torn_tail(&self) -> Result<bool, QueueError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(QueueError::io(&self.path, e)),
        };
        let len = file.metadata().map_err(|e| QueueError::io(&self.path, e))?.len();
        if len == 0 {
            return Ok(false);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| QueueError::io(&self.path, e))?;
        Ok(last[0] != b'\n')
    }

    /// Draws up to `max` well-formed records from the head of the queue.
    ///
    /// Blank lines are skipped, lines that are not JSON objects are dropped
    /// and an unterminated final line is left alone. When nothing usable
    /// remains the file is deleted and `None` is returned.
    pub fn drain_batch(&mut self, max: usize) -> Result<Option<Batch>, QueueError> {
        match self.mount {
            Mount::Mounted => {}
            Mount::Unmounted => return Ok(None),
            Mount::Closed => return Err(QueueError::Closed),
        }
        let max = max.clamp(1, MAX_BATCH_SIZE);
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QueueError::io(&self.path, e)),
        };

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut offset = 0u64;
        let mut batch = Batch {
            records: Vec::new(),
            cursor: 0,
            carries_power_status: false,
        };

        while batch.records.len() < max {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| QueueError::io(&self.path, e))?;
            if read == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                debug!(bytes = read, "Skipping unterminated queue tail");
                break;
            }
            offset += read as u64;
            batch.cursor = offset;

            match parse_line(&line) {
                Line::Blank => {}
                Line::Record { text, power_status } => {
                    batch.carries_power_status |= power_status;
                    batch.records.push(text.to_string());
                }
                Line::Malformed => warn!(offset, "Dropping malformed queue record"),
            }
        }

        if batch.records.is_empty() {
            info!(path = %self.path.display(), "No usable records in queue, removing file");
            self.remove_file()?;
            return Ok(None);
        }
        Ok(Some(batch))
    }

    /// Removes the lines covered by `batch`, keeping everything after them,
    /// including lines appended after the batch was drawn.
    pub fn commit(&mut self, batch: &Batch) -> Result<(), QueueError> {
        self.ensure_mounted()?;
        if self.stage_remainder(batch.cursor)? {
            self.promote()?;
            debug!(records = batch.len(), "Queue advanced past committed batch");
        } else {
            self.remove_file()?;
            debug!(records = batch.len(), "Queue fully drained");
        }
        Ok(())
    }

    /// Copies everything after `cursor` into the temp file. Returns false when
    /// there is nothing left to keep.
    fn stage_remainder(&self, cursor: u64) -> Result<bool, QueueError> {
        let mut original = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(QueueError::io(&self.path, e)),
        };
        let len = original
            .metadata()
            .map_err(|e| QueueError::io(&self.path, e))?
            .len();
        if cursor >= len {
            return Ok(false);
        }
        original
            .seek(SeekFrom::Start(cursor))
            .map_err(|e| QueueError::io(&self.path, e))?;
        let mut temp = File::create(&self.temp_path).map_err(|e| QueueError::io(&self.temp_path, e))?;
        io::copy(&mut original, &mut temp)
            .and_then(|_| temp.sync_all())
            .map_err(|e| QueueError::io(&self.temp_path, e))?;
        Ok(true)
    }

    fn promote(&self) -> Result<(), QueueError> {
        fs::rename(&self.temp_path, &self.path).map_err(|e| QueueError::io(&self.path, e))?;
        self.sync_dir();
        Ok(())
    }

    /// Persists the directory entry written by a rename.
    fn sync_dir(&self) {
        let Some(dir) = self.path.parent() else {
            return;
        };
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!(dir = %dir.display(), error = %e, "Queue directory sync failed");
        }
    }

    fn remove_file(&self) -> Result<(), QueueError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::io(&self.path, e)),
        }
    }

    /// True when no line a drain would upload is queued.
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Number of records a drain would upload: terminated lines holding a
    /// JSON object.
    pub fn record_count(&self) -> usize {
        if self.mount != Mount::Mounted {
            return 0;
        }
        let Ok(file) = File::open(&self.path) else {
            return 0;
        };
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut count = 0;
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) if line.last() != Some(&b'\n') => break,
                Ok(_) => {
                    if matches!(parse_line(&line), Line::Record { .. }) {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    pub fn status(&self) -> QueueStatus {
        if self.mount != Mount::Mounted {
            return QueueStatus::default();
        }
        match fs::metadata(&self.path) {
            Ok(meta) => QueueStatus {
                exists: true,
                size_bytes: meta.len(),
                records: self.record_count(),
            },
            Err(_) => QueueStatus::default(),
        }
    }

    pub fn clear(&mut self) -> Result<(), QueueError> {
        self.ensure_mounted()?;
        info!(path = %self.path.display(), "Clearing queue");
        self.remove_file()
    }

    /// Refuses further access; used on the shutdown path.
    pub fn close(&mut self) {
        if self.mount == Mount::Mounted {
            self.mount = Mount::Closed;
            info!("Queue storage closed");
        }
    }
}

/// `QueueFile` behind the lock shared by the wake cycle, the button task and
/// the service console.
#[derive(Debug)]
pub struct PersistentQueue {
    inner: Mutex<QueueFile>,
}

impl PersistentQueue {
    pub fn new(file: QueueFile) -> Self {
        PersistentQueue {
            inner: Mutex::new(file),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, QueueFile> {
        self.inner.lock().await
    }

    pub async fn lock_within(&self, timeout: Duration) -> Result<MutexGuard<'_, QueueFile>, QueueError> {
        tokio::time::timeout(timeout, self.inner.lock())
            .await
            .map_err(|_| QueueError::Busy(timeout))
    }

    pub async fn append(&self, reading: &Reading) -> Result<(), QueueError> {
        self.lock().await.append(reading)
    }

    pub async fn is_empty(&self) -> bool {
        self.lock().await.is_empty()
    }

    pub async fn record_count(&self) -> usize {
        self.lock().await.record_count()
    }

    pub async fn status(&self) -> QueueStatus {
        self.lock().await.status()
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        self.lock().await.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reading(n: u32) -> Reading {
        Reading {
            device_id: "TESTDEV001".into(),
            name: None,
            latitude: 50.0 + n as f64 * 0.001,
            longitude: 14.0,
            speed: 0.0,
            altitude: 200.0,
            hdop: 1.0,
            satellites: n,
            timestamp: None,
            power_status: None,
        }
    }

    fn queue_in(dir: &TempDir) -> QueueFile {
        QueueFile::open(dir.path().join(QUEUE_FILE_NAME))
    }

    fn satellites_of(records: &[String]) -> Vec<u64> {
        records
            .iter()
            .map(|r| serde_json::from_str::<Value>(r).unwrap()["satellites"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn commit_keeps_remaining_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue_in(&dir);
        for n in 1..=5 {
            queue.append(&reading(n)).unwrap();
        }

        let batch = queue.drain_batch(2).unwrap().unwrap();
        assert_eq!(satellites_of(batch.records()), vec![1, 2]);
        queue.commit(&batch).unwrap();

        let rest = queue.drain_batch(MAX_BATCH_SIZE).unwrap().unwrap();
        assert_eq!(satellites_of(rest.records()), vec![3, 4, 5]);
        assert_eq!(queue.record_count(), 3);
    }

    #[test]
    fn committing_everything_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue_in(&dir);
        queue.append(&reading(1)).unwrap();
        let batch = queue.drain_batch(10).unwrap().unwrap();
        queue.commit(&batch).unwrap();
        assert!(queue.is_empty());
        assert!(!queue.path().exists());
    }

    #[test]
    fn blank_only_queue_behaves_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE_NAME);
        fs::write(&path, "\n   \n\t\n").unwrap();
        let mut queue = QueueFile::open(&path);

        assert!(queue.drain_batch(10).unwrap().is_none());
        assert!(!path.exists());
        assert!(queue.is_empty());
    }

    #[test]
    fn lines_appended_after_draw_survive_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue_in(&dir);
        queue.append(&reading(1)).unwrap();
        queue.append(&reading(2)).unwrap();

        let batch = queue.drain_batch(10).unwrap().unwrap();
        queue.append(&reading(3)).unwrap();
        queue.commit(&batch).unwrap();

        let rest = queue.drain_batch(10).unwrap().unwrap();
        assert_eq!(satellites_of(rest.records()), vec![3]);
    }

    #[test]
    fn torn_tail_is_skipped_then_terminated_by_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE_NAME);
        let good = serde_json::to_string(&reading(1)).unwrap();
        fs::write(&path, format!("{good}\n{{\"device\":\"TES")).unwrap();
        let mut queue = QueueFile::open(&path);

        let batch = queue.drain_batch(10).unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.cursor(), good.len() as u64 + 1);

        queue.append(&reading(2)).unwrap();
        queue.commit(&batch).unwrap();
        let rest = queue.drain_batch(10).unwrap().unwrap();
        assert_eq!(satellites_of(rest.records()), vec![2]);
    }

    #[test]
    fn malformed_lines_are_dropped_not_sent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE_NAME);
        let good = serde_json::to_string(&reading(4)).unwrap();
        fs::write(&path, format!("not json\n[1,2]\n\n{good}\n")).unwrap();
        let mut queue = QueueFile::open(&path);

        let batch = queue.drain_batch(10).unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.payload(), format!("[{good}]"));
        queue.commit(&batch).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn invalid_utf8_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE_NAME);
        let good = serde_json::to_string(&reading(7)).unwrap();
        let mut contents = b"{\"device\":\"A\xff\"}\n".to_vec();
        contents.extend_from_slice(format!("{good}\n").as_bytes());
        fs::write(&path, contents).unwrap();
        let mut queue = QueueFile::open(&path);
        assert_eq!(queue.record_count(), 1);

        let batch = queue.drain_batch(10).unwrap().unwrap();
        assert_eq!(batch.payload(), format!("[{good}]"));
    }

    #[test]
    fn count_matches_what_a_drain_would_send() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE_NAME);
        let good = serde_json::to_string(&reading(3)).unwrap();
        fs::write(&path, format!("\n  \nnot json\n{good}\n{{\"device\":\"TES")).unwrap();
        let queue = QueueFile::open(&path);
        assert_eq!(queue.record_count(), 1);
        assert!(!queue.is_empty());

        fs::write(&path, "\n\t\n").unwrap();
        assert_eq!(queue.record_count(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn crash_before_rename_leaves_original_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE_NAME);
        let mut queue = QueueFile::open(&path);
        for n in 1..=4 {
            queue.append(&reading(n)).unwrap();
        }
        let before = fs::read(&path).unwrap();

        let batch = queue.drain_batch(2).unwrap().unwrap();
        assert!(queue.stage_remainder(batch.cursor()).unwrap());
        drop(queue);

        let mut reopened = QueueFile::open(&path);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!path.with_extension("tmp").exists());
        let all = reopened.drain_batch(10).unwrap().unwrap();
        assert_eq!(satellites_of(all.records()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn orphaned_temp_file_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(QUEUE_FILE_NAME);
        let line = serde_json::to_string(&reading(9)).unwrap();
        fs::write(path.with_extension("tmp"), format!("{line}\n")).unwrap();

        let queue = QueueFile::open(&path);
        assert!(path.exists());
        assert_eq!(queue.record_count(), 1);
    }

    #[test]
    fn power_status_records_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue_in(&dir);
        queue.append(&reading(1)).unwrap();
        let batch = queue.drain_batch(10).unwrap().unwrap();
        assert!(!batch.carries_power_status());

        let mut report = reading(2);
        report.power_status = Some(crate::types::PowerStatus::Off);
        queue.append(&report).unwrap();
        let batch = queue.drain_batch(10).unwrap().unwrap();
        assert!(batch.carries_power_status());
    }

    #[test]
    fn batch_size_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue_in(&dir);
        for n in 0..60 {
            queue.append(&reading(n)).unwrap();
        }
        let batch = queue.drain_batch(500).unwrap().unwrap();
        assert_eq!(batch.len(), MAX_BATCH_SIZE);
    }

    #[test]
    fn closed_and_unmounted_queues_refuse_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = queue_in(&dir);
        queue.close();
        assert!(matches!(queue.append(&reading(1)), Err(QueueError::Closed)));

        let mut unmounted = QueueFile::unmounted(dir.path().join("nowhere.log"));
        assert!(matches!(unmounted.append(&reading(1)), Err(QueueError::Unmounted)));
        assert!(unmounted.drain_batch(5).unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_within_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PersistentQueue::new(queue_in(&dir));
        let _held = queue.lock().await;
        let result = queue.lock_within(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(QueueError::Busy(_))));
    }
}
