//! JSON Lines result file: one record per line, appended as results arrive.
//!
//! Each record is serialized in full and written with a single `write_all`
//! under the store's lock, so concurrent workers never interleave bytes.
//! A crash can still tear the last line; readers skip lines that do not
//! parse, and the next open terminates a torn line before appending.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{ItemId, ResultRecord};

use super::ResultStore;

pub struct JsonlStore {
    path: PathBuf,
    inner: Mutex<Writer>,
}

struct Writer {
    file: File,
    /// Identifiers present in the file, including ones appended by this process.
    written: HashSet<ItemId>,
    /// A write failed partway; the file may end mid-line.
    torn: bool,
}

impl JsonlStore {
    /// Open (or create) the results file at `path`, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        terminate_torn_line(&mut file)?;

        let written = scan(&path)?
            .into_iter()
            .map(|record| record.id)
            .collect::<HashSet<_>>();
        debug!(path = %path.display(), records = written.len(), "opened results file");

        Ok(Self {
            path,
            inner: Mutex::new(Writer {
                file,
                written,
                torn: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Writer> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ResultStore for JsonlStore {
    fn existing_identifiers(&self) -> Result<HashSet<ItemId>> {
        // Hold the lock so the scan never sees a record mid-write.
        let _guard = self.lock();
        Ok(scan(&self.path)?.into_iter().map(|r| r.id).collect())
    }

    fn append(&self, record: &ResultRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut writer = self.lock();
        if writer.written.contains(&record.id) {
            return Err(Error::DuplicateResult(record.id.to_string()));
        }
        if writer.torn {
            terminate_torn_line(&mut writer.file)?;
            writer.torn = false;
        }
        if let Err(e) = writer.file.write_all(line.as_bytes()) {
            writer.torn = true;
            return Err(e.into());
        }
        writer.file.sync_data()?;
        writer.written.insert(record.id.clone());
        Ok(())
    }

    fn records(&self) -> Result<Vec<ResultRecord>> {
        let _guard = self.lock();
        scan(&self.path)
    }
}

/// Read every parseable record. Blank and malformed lines are skipped.
fn scan(path: &Path) -> Result<Vec<ResultRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ResultRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), line = index + 1, "skipping unreadable result: {e}");
            }
        }
    }
    Ok(records)
}

/// Make sure the file ends with a newline so the next append starts a line.
fn terminate_torn_line(file: &mut File) -> Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!("results file ends mid-record, terminating the torn line");
        file.write_all(b"\n")?;
        file.flush()?;
    }
    Ok(())
}
