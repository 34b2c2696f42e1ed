//! Segmented on-disk log backing a durable queue
//!
//! One directory per endpoint group. Append-only segment files named by
//! monotonic integer hold length-prefixed record frames; a small sidecar
//! file tracks read/write positions and is rewritten atomically via
//! write-temp-and-rename.
//!
//! ```text
//! <data_dir>/<endpoint>/
//!     000000000.log     exhausted segments are deleted after their
//!     000000001.log  <- read position (head)
//!     000000002.log  <- write position (tail)
//!     meta.json         {depth, read/write segment + offset}
//! ```
//!
//! # Recovery
//!
//! On open, the tail of the write segment past the recorded write position
//! is scanned frame by frame: complete frames written after the last sync
//! are recovered, a torn final frame is truncated away. Recovered state is
//! therefore always a prefix of what was appended.
//!
//! # Corruption
//!
//! A length header that is zero, exceeds the frame limit, or runs past the
//! segment terminates reading of that segment: the reader skips to the
//! next segment (or to the write position when there is none) and a
//! counter is incremented. No heuristic resynchronization is attempted.

use crate::error::Result;
use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const META_TMP_FILE: &str = "meta.json.tmp";

/// Sidecar metadata, the durable acknowledgment pointer of the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Meta {
    depth: u64,
    read_segment: u64,
    read_pos: u64,
    write_segment: u64,
    write_pos: u64,
}

enum Frame {
    /// A complete record frame
    Record(Vec<u8>),
    /// Clean end of a closed segment
    Eof,
    /// Malformed header or torn frame
    Corrupt(String),
}

/// File-backed tier of a durable queue. Owned by a single task; all
/// methods take `&mut self` and perform blocking I/O.
pub(crate) struct DiskLog {
    dir: PathBuf,
    name: String,
    max_bytes_per_file: u64,
    /// Upper bound for a sane frame length header
    frame_limit: u32,
    meta: Meta,
    writer: Option<BufWriter<File>>,
    /// Reader over the current read segment, positioned at `read_pos`
    reader: Option<File>,
    ops_since_sync: u64,
    dirty: bool,
}

impl DiskLog {
    /// Open the log rooted at `dir`, reconciling sidecar metadata with
    /// what is actually on disk.
    pub(crate) fn open(
        dir: &Path,
        name: &str,
        max_bytes_per_file: u64,
        frame_limit: u32,
    ) -> Result<Self> {
        let meta = match fs::read(dir.join(META_FILE)) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Meta::default(),
            Err(e) => return Err(e.into()),
        };

        let mut log = Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            max_bytes_per_file,
            frame_limit,
            meta,
            writer: None,
            reader: None,
            ops_since_sync: 0,
            dirty: false,
        };
        log.reconcile_write_segment()?;

        if log.meta.depth > 0 {
            info!(
                queue = %log.name,
                depth = log.meta.depth,
                "resuming disk backlog from previous run"
            );
        }
        Ok(log)
    }

    pub(crate) fn depth(&self) -> u64 {
        self.meta.depth
    }

    pub(crate) fn dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn ops_since_sync(&self) -> u64 {
        self.ops_since_sync
    }

    /// Append one encoded record frame to the tail segment, rotating when
    /// the segment reaches its size cap.
    pub(crate) fn append(&mut self, frame: &[u8]) -> Result<()> {
        if self.writer.is_none() {
            let path = self.segment_path(self.meta.write_segment);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            self.writer = Some(BufWriter::new(file));
        }
        let writer = match self.writer.as_mut() {
            Some(w) => w,
            None => return Err(std::io::Error::other("segment writer unavailable").into()),
        };

        writer.write_all(&(frame.len() as u32).to_be_bytes())?;
        writer.write_all(frame)?;

        self.meta.write_pos += 4 + frame.len() as u64;
        self.meta.depth += 1;
        self.ops_since_sync += 1;
        self.dirty = true;

        if self.meta.write_pos >= self.max_bytes_per_file {
            self.rotate()?;
        }
        Ok(())
    }

    /// Yield the next frame in FIFO order, or `None` when the log holds no
    /// unread records. Corrupt segments are skipped with a metric; only
    /// I/O errors propagate.
    pub(crate) fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.meta.depth == 0 {
                self.sanity_check();
                return Ok(None);
            }

            if self.meta.read_segment == self.meta.write_segment {
                if self.meta.read_pos >= self.meta.write_pos {
                    // Depth claims unread records but the pointers have met;
                    // trust the pointers.
                    self.sanity_check();
                    return Ok(None);
                }
                // Reading the open segment: make buffered appends visible.
                if let Some(w) = self.writer.as_mut() {
                    w.flush()?;
                }
            }

            match self.read_frame()? {
                Frame::Record(frame) => {
                    self.meta.read_pos += 4 + frame.len() as u64;
                    self.meta.depth -= 1;
                    self.ops_since_sync += 1;
                    self.dirty = true;
                    self.advance_if_exhausted()?;
                    return Ok(Some(frame));
                }
                Frame::Eof => {
                    self.advance_read_segment()?;
                }
                Frame::Corrupt(reason) => {
                    warn!(
                        queue = %self.name,
                        segment = self.meta.read_segment,
                        pos = self.meta.read_pos,
                        reason,
                        "abandoning corrupt segment"
                    );
                    if let Some(m) = Metrics::get() {
                        m.record_corrupt_segment(&self.name);
                    }
                    if self.meta.read_segment < self.meta.write_segment {
                        self.advance_read_segment()?;
                    } else {
                        // Corrupt tail of the open segment: nothing readable
                        // remains anywhere, give up on the unread span.
                        self.meta.read_pos = self.meta.write_pos;
                        self.meta.depth = 0;
                        self.reader = None;
                        self.dirty = true;
                    }
                }
            }
        }
    }

    /// Flush and fsync the tail segment, then atomically rewrite the
    /// sidecar. Called on the sync cadence and on close.
    pub(crate) fn sync(&mut self) -> Result<()> {
        if let Some(w) = self.writer.as_mut() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        self.persist_meta()?;
        self.ops_since_sync = 0;
        self.dirty = false;
        Ok(())
    }

    /// Sync and release file handles.
    pub(crate) fn close(mut self) -> Result<()> {
        self.sync()?;
        debug!(queue = %self.name, depth = self.meta.depth, "disk log closed");
        Ok(())
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir.join(format!("{segment:09}.log"))
    }

    /// Close the current tail segment and start the next one. The closed
    /// segment is synced so rotation is also a durability point.
    fn rotate(&mut self) -> Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        self.meta.write_segment += 1;
        self.meta.write_pos = 0;
        debug!(queue = %self.name, segment = self.meta.write_segment, "rotated to new segment");
        self.persist_meta()?;
        self.ops_since_sync = 0;
        self.dirty = false;
        Ok(())
    }

    /// A closed segment whose last record was just read is done for good;
    /// move past it right away so its file can be deleted.
    fn advance_if_exhausted(&mut self) -> Result<()> {
        if self.meta.read_segment >= self.meta.write_segment {
            return Ok(());
        }
        let remaining = match self.reader.as_ref() {
            Some(file) => file.metadata()?.len().saturating_sub(self.meta.read_pos),
            None => return Ok(()),
        };
        if remaining == 0 {
            self.advance_read_segment()?;
        }
        Ok(())
    }

    fn reader(&mut self) -> Result<&mut File> {
        if self.reader.is_none() {
            let mut file = File::open(self.segment_path(self.meta.read_segment))?;
            file.seek(SeekFrom::Start(self.meta.read_pos))?;
            return Ok(self.reader.insert(file));
        }
        match self.reader.as_mut() {
            Some(file) => Ok(file),
            None => Err(std::io::Error::other("segment reader unavailable").into()),
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let in_open_segment = self.meta.read_segment == self.meta.write_segment;
        // Bytes readable in the open segment; closed segments read to EOF.
        let available = self.meta.write_pos.saturating_sub(self.meta.read_pos);
        let frame_limit = self.frame_limit;
        let reader = self.reader()?;

        let mut header = [0u8; 4];
        let mut got = 0;
        while got < header.len() {
            let n = reader.read(&mut header[got..])?;
            if n == 0 {
                if got == 0 && !in_open_segment {
                    return Ok(Frame::Eof);
                }
                return Ok(Frame::Corrupt(format!(
                    "length header cut short at {got} bytes"
                )));
            }
            got += n;
        }

        let len = u32::from_be_bytes(header);
        if len == 0 || len > frame_limit {
            return Ok(Frame::Corrupt(format!("implausible frame length {len}")));
        }
        if in_open_segment && 4 + len as u64 > available {
            return Ok(Frame::Corrupt(format!(
                "frame of {len} bytes overruns write position"
            )));
        }

        let mut frame = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < frame.len() {
            let n = reader.read(&mut frame[filled..])?;
            if n == 0 {
                return Ok(Frame::Corrupt(format!(
                    "frame truncated at {filled} of {len} bytes"
                )));
            }
            filled += n;
        }
        Ok(Frame::Record(frame))
    }

    /// Move the read side to the next segment, deleting the exhausted one.
    fn advance_read_segment(&mut self) -> Result<()> {
        let finished = self.segment_path(self.meta.read_segment);
        if let Err(e) = fs::remove_file(&finished) {
            warn!(queue = %self.name, path = %finished.display(), error = %e, "could not delete exhausted segment");
        }
        self.reader = None;
        self.meta.read_segment += 1;
        self.meta.read_pos = 0;
        self.dirty = true;
        Ok(())
    }

    /// Depth bookkeeping can drift after a skipped segment; once the read
    /// and write pointers meet, the drift is observable and corrected.
    fn sanity_check(&mut self) {
        if self.meta.read_segment == self.meta.write_segment
            && self.meta.read_pos >= self.meta.write_pos
            && self.meta.depth != 0
        {
            warn!(
                queue = %self.name,
                depth = self.meta.depth,
                "depth out of sync with pointers, resetting to 0"
            );
            self.meta.depth = 0;
            self.dirty = true;
        }
    }

    /// Reconcile the sidecar with the actual tail segment after a restart.
    ///
    /// Complete frames appended after the last sync are walked and counted
    /// back into the depth; a torn final frame is truncated away so the
    /// segment always ends on a record boundary.
    fn reconcile_write_segment(&mut self) -> Result<()> {
        let path = self.segment_path(self.meta.write_segment);
        let actual = match fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.meta.write_pos != 0 {
                    warn!(
                        queue = %self.name,
                        segment = self.meta.write_segment,
                        "write segment missing, starting it empty"
                    );
                    self.meta.write_pos = 0;
                    self.dirty = true;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if actual < self.meta.write_pos {
            warn!(
                queue = %self.name,
                expected = self.meta.write_pos,
                actual,
                "write segment shorter than recorded position, clamping"
            );
            self.meta.write_pos = actual;
            self.dirty = true;
            return Ok(());
        }

        if actual == self.meta.write_pos {
            return Ok(());
        }

        // Unsynced tail: walk complete frames, truncate the rest.
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(self.meta.write_pos))?;
        let mut recovered = 0u64;
        let mut valid_end = self.meta.write_pos;
        loop {
            let mut header = [0u8; 4];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(header);
            if len == 0 || len > self.frame_limit || valid_end + 4 + len as u64 > actual {
                break;
            }
            file.seek(SeekFrom::Current(len as i64))?;
            valid_end += 4 + len as u64;
            recovered += 1;
        }

        if valid_end < actual {
            warn!(
                queue = %self.name,
                truncated = actual - valid_end,
                "truncating torn tail of write segment"
            );
            file.set_len(valid_end)?;
            file.sync_data()?;
        }
        if recovered > 0 {
            info!(queue = %self.name, recovered, "recovered unsynced records from tail");
        }
        self.meta.write_pos = valid_end;
        self.meta.depth += recovered;
        self.dirty = true;
        Ok(())
    }

    fn persist_meta(&mut self) -> Result<()> {
        let tmp = self.dir.join(META_TMP_FILE);
        let raw = serde_json::to_vec(&self.meta)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&raw)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(META_FILE))?;
        Ok(())
    }
}
