//! Polling tail of a detached process's output log.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Delivers newly appended log bytes to a callback from a background thread.
pub struct OutputMonitor;

impl OutputMonitor {
    /// Start tailing `path`, polling every `interval`.
    ///
    /// The file may not exist yet. If it shrinks, reading restarts from the
    /// beginning.
    pub fn watch<F>(path: impl Into<PathBuf>, interval: Duration, on_chunk: F) -> Result<MonitorHandle>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let path = path.into();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("stepwise-monitor".to_string())
            .spawn(move || {
                let mut tail = Tail::new(path);
                let mut on_chunk = on_chunk;
                while !thread_stop.load(Ordering::Acquire) {
                    tail.poll(&mut on_chunk);
                    thread::park_timeout(interval);
                }
                tail.poll(&mut on_chunk);
            })
            .context("spawn output monitor thread")?;
        Ok(MonitorHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Stops the monitor thread on [`MonitorHandle::close`] or drop.
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop polling after delivering anything already written. Idempotent.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        thread.thread().unpark();
        if thread.join().is_err() {
            warn!("output monitor callback panicked");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.thread.is_none()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct Tail {
    path: PathBuf,
    offset: u64,
}

impl Tail {
    fn new(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }

    fn poll(&mut self, on_chunk: &mut impl FnMut(&[u8])) {
        match read_from(&self.path, &mut self.offset) {
            Ok(Some(chunk)) => on_chunk(&chunk),
            Ok(None) => {}
            Err(err) => debug!(path = %self.path.display(), err = %format!("{err:#}"), "monitor read failed"),
        }
    }
}

/// Bytes appended since `offset`, advancing it. `None` if nothing new.
fn read_from(path: &Path, offset: &mut u64) -> Result<Option<Vec<u8>>> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
    };
    if len < *offset {
        debug!(path = %path.display(), "log shrank, rereading from start");
        *offset = 0;
    }
    if len == *offset {
        return Ok(None);
    }

    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    file.seek(SeekFrom::Start(*offset))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut chunk = Vec::new();
    file.take(len - *offset)
        .read_to_end(&mut chunk)
        .with_context(|| format!("read {}", path.display()))?;
    *offset += chunk.len() as u64;
    Ok((!chunk.is_empty()).then_some(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Instant;

    fn collector() -> (Arc<Mutex<Vec<u8>>>, impl FnMut(&[u8]) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |chunk: &[u8]| {
            sink.lock().expect("lock").extend_from_slice(chunk);
        })
    }

    fn wait_for(seen: &Arc<Mutex<Vec<u8>>>, expected: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if String::from_utf8_lossy(&seen.lock().expect("lock")) == expected {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn delivers_only_new_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        fs::write(&path, "one\n").expect("write");
        let (seen, sink) = collector();
        let mut handle =
            OutputMonitor::watch(&path, Duration::from_millis(20), sink).expect("watch");
        assert!(wait_for(&seen, "one\n"));

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        file.write_all(b"two\n").expect("append");
        assert!(wait_for(&seen, "one\ntwo\n"));
        handle.close();
    }

    #[test]
    fn tolerates_a_missing_file_until_it_appears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("later.log");
        let (seen, sink) = collector();
        let _handle =
            OutputMonitor::watch(&path, Duration::from_millis(20), sink).expect("watch");
        thread::sleep(Duration::from_millis(60));
        fs::write(&path, "ready").expect("write");
        assert!(wait_for(&seen, "ready"));
    }

    #[test]
    fn truncated_file_is_reread_from_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.log");
        let mut offset = 0;
        fs::write(&path, "abcdef").expect("write");
        assert_eq!(read_from(&path, &mut offset).expect("read"), Some(b"abcdef".to_vec()));
        assert_eq!(read_from(&path, &mut offset).expect("read"), None);
        fs::write(&path, "xy").expect("write");
        assert_eq!(read_from(&path, &mut offset).expect("read"), Some(b"xy".to_vec()));
        assert_eq!(offset, 2);
    }

    #[test]
    fn close_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (_seen, sink) = collector();
        let mut handle = OutputMonitor::watch(temp.path().join("x.log"), Duration::from_secs(60), sink)
            .expect("watch");
        handle.close();
        assert!(handle.is_closed());
        handle.close();
    }
}
