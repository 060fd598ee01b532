//! Reassembly of incoming files.
//!
//! The receive thread only checks sequencing and forwards chunks; each
//! file has its own worker thread that stages bytes in a temp file and
//! realises the destination, so disk I/O never stalls the socket reader.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use parcelnet_frame::{Signal, TransmissionParcel, FAIL_DESTINATION};
use tempfile::NamedTempFile;

use crate::error::ConnError;
use crate::event::{Direction, TransmissionEvent, TransmissionEventKind};
use crate::transfer::{TransferContext, BREAK_IO, BREAK_NO_SPACE, BREAK_SEQUENCE};

/// Headroom required on top of a file's size before it is staged or realised.
pub const SPACE_MARGIN: u64 = 32 * 1024;

/// Reports usable space in a directory.
pub trait SpaceProbe: Send + Sync {
    fn available(&self, dir: &Path) -> io::Result<u64>;
}

/// Queries the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    #[cfg(unix)]
    fn available(&self, dir: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        // SAFETY: zeroed is a valid bit pattern for the plain-data statvfs struct.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `c_path` is NUL-terminated and `stat` is a valid writable statvfs.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }

    #[cfg(not(unix))]
    fn available(&self, _dir: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

fn has_room(probe: &dyn SpaceProbe, dir: &Path, size: u64, conn: &str) -> Result<(), ConnError> {
    let required = size.saturating_add(SPACE_MARGIN);
    match probe.available(dir) {
        Ok(available) if available < required => {
            Err(ConnError::InsufficientSpace {
                required,
                available,
            })
        }
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::debug!(conn, dir = %dir.display(), error = %err, "space probe failed, assuming room");
            Ok(())
        }
    }
}

/// Map a remote target path into `root`.
///
/// The path is taken relative to `root` (leading separators are dropped),
/// normalised lexically, and rejected if it leaves `root`, names `root`
/// itself, or has an existing ancestor that resolves outside it.
pub fn resolve_destination(root: &Path, remote: &str) -> Result<PathBuf, ConnError> {
    let root = std::fs::canonicalize(root)
        .map_err(|err| ConnError::PathRejected(format!("root {}: {err}", root.display())))?;
    let relative = remote.trim_start_matches(['/', '\\']);

    let mut resolved = root.clone();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() || !resolved.starts_with(&root) {
                    return Err(ConnError::PathRejected(remote.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ConnError::PathRejected(remote.to_string()));
            }
        }
    }
    if resolved == root || !resolved.starts_with(&root) {
        return Err(ConnError::PathRejected(remote.to_string()));
    }

    let mut ancestor = resolved.parent();
    while let Some(dir) = ancestor {
        if dir.exists() {
            let canonical = std::fs::canonicalize(dir)?;
            if !canonical.starts_with(&root) {
                return Err(ConnError::PathRejected(remote.to_string()));
            }
            break;
        }
        ancestor = dir.parent();
    }
    Ok(resolved)
}

enum FileWork {
    Chunk(Bytes),
    Finish,
    Abort(ConnError),
}

struct Incoming {
    tx: Sender<FileWork>,
    next: u32,
    count: u32,
}

/// Where incoming files go.
#[derive(Clone)]
pub(crate) struct FileSettings {
    pub(crate) temp_dir: PathBuf,
    pub(crate) root_dir: Option<PathBuf>,
    pub(crate) probe: Arc<dyn SpaceProbe>,
}

/// Incoming transfers of one connection, driven by its receive thread.
pub(crate) struct FileAgglomeration {
    conn: String,
    settings: FileSettings,
    ctx: Arc<dyn TransferContext>,
    records: HashMap<u64, Incoming>,
    workers: Vec<JoinHandle<()>>,
}

impl FileAgglomeration {
    pub(crate) fn new(conn: String, settings: FileSettings, ctx: Arc<dyn TransferContext>) -> Self {
        Self {
            conn,
            settings,
            ctx,
            records: HashMap::new(),
            workers: Vec::new(),
        }
    }

    /// Feed one FILE parcel. `Err` is connection fatal.
    pub(crate) fn accept(&mut self, parcel: TransmissionParcel) -> Result<(), ConnError> {
        let file_id = parcel.object_id;
        if parcel.sequence == 0 {
            if let Some(stale) = self.records.remove(&file_id) {
                self.abort_record(file_id, stale, 0);
            }
            return self.start(parcel);
        }

        let Some(record) = self.records.get_mut(&file_id) else {
            tracing::debug!(
                conn = %self.conn,
                file_id,
                sequence = parcel.sequence,
                marker = "orphan",
                "file parcel without reassembly record dropped"
            );
            return Ok(());
        };
        if parcel.sequence != record.next {
            let got = parcel.sequence;
            if let Some(record) = self.records.remove(&file_id) {
                self.abort_record(file_id, record, got);
            }
            return Ok(());
        }

        record.next += 1;
        let last = record.next >= record.count;
        let delivered = record.tx.send(FileWork::Chunk(parcel.payload)).is_ok();
        if last || !delivered {
            if let Some(record) = self.records.remove(&file_id) {
                let _ = record.tx.send(FileWork::Finish);
            }
        }
        Ok(())
    }

    fn start(&mut self, parcel: TransmissionParcel) -> Result<(), ConnError> {
        let file_id = parcel.object_id;
        let Some(header) = parcel.header else {
            return Err(ConnError::Protocol(format!(
                "file {file_id} started without a header"
            )));
        };
        let expected = u64::from(header.total_size);
        let remote_path = header.path;

        if let Err(err) = has_room(
            self.settings.probe.as_ref(),
            &self.settings.temp_dir,
            expected,
            &self.conn,
        ) {
            tracing::warn!(conn = %self.conn, file_id, error = %err, "refusing incoming file");
            self.refuse(file_id, expected, remote_path, BREAK_NO_SPACE, err);
            return Ok(());
        }

        let staged = tempfile::Builder::new()
            .prefix("parcelnet-")
            .suffix(".part")
            .tempfile_in(&self.settings.temp_dir);
        let file = match staged {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(conn = %self.conn, file_id, error = %err, "cannot stage incoming file");
                self.refuse(file_id, expected, remote_path, BREAK_IO, ConnError::Io(err));
                return Ok(());
            }
        };

        let started = Instant::now();
        self.ctx.emit(TransmissionEvent {
            expected_length: expected,
            path: Some(file.path().to_path_buf()),
            remote_path: remote_path.clone(),
            ..TransmissionEvent::new(TransmissionEventKind::FileIncoming, Direction::Incoming, file_id)
        });
        tracing::debug!(
            conn = %self.conn,
            file_id,
            expected,
            parcels = header.parcel_count,
            "incoming file"
        );

        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            conn: self.conn.clone(),
            file_id,
            expected,
            remote_path,
            written: 0,
            started,
            settings: self.settings.clone(),
            ctx: Arc::clone(&self.ctx),
        };
        let spawned = thread::Builder::new()
            .name(format!("parcelnet-file-{}-{file_id}", self.conn))
            .spawn(move || worker.run(file, rx));
        match spawned {
            Ok(handle) => {
                self.workers.retain(|h| !h.is_finished());
                self.workers.push(handle);
            }
            Err(err) => {
                self.ctx
                    .signal(Signal::break_transfer(file_id, BREAK_IO, false, None));
                self.ctx.emit(aborted(file_id, expected, 0, ConnError::Io(err)));
                return Ok(());
            }
        }

        let _ = tx.send(FileWork::Chunk(parcel.payload));
        if header.parcel_count <= 1 {
            let _ = tx.send(FileWork::Finish);
        } else {
            self.records.insert(
                file_id,
                Incoming {
                    tx,
                    next: 1,
                    count: header.parcel_count,
                },
            );
        }
        Ok(())
    }

    fn refuse(
        &self,
        file_id: u64,
        expected: u64,
        remote_path: Option<String>,
        cause: i32,
        err: ConnError,
    ) {
        self.ctx.signal(Signal::break_transfer(
            file_id,
            cause,
            false,
            Some(err.to_string()),
        ));
        let mut event = aborted(file_id, expected, 0, err);
        event.remote_path = remote_path;
        self.ctx.emit(event);
    }

    fn abort_record(&self, file_id: u64, record: Incoming, got: u32) {
        tracing::warn!(
            conn = %self.conn,
            file_id,
            expected = record.next,
            got,
            "file parcel out of sequence"
        );
        self.ctx
            .signal(Signal::break_transfer(file_id, BREAK_SEQUENCE, false, None));
        let _ = record.tx.send(FileWork::Abort(ConnError::OutOfSequence {
            object_id: file_id,
            expected: record.next,
            got,
        }));
    }

    /// Abort an incoming transfer on request; `false` if unknown.
    pub(crate) fn abort(&mut self, file_id: u64, err: ConnError) -> bool {
        match self.records.remove(&file_id) {
            Some(record) => {
                let _ = record.tx.send(FileWork::Abort(err));
                true
            }
            None => false,
        }
    }

    pub(crate) fn in_progress(&self) -> usize {
        self.records.len()
    }

    /// Abort everything still in flight and wait for the workers.
    pub(crate) fn shutdown(&mut self) {
        for (_, record) in self.records.drain() {
            let _ = record.tx.send(FileWork::Abort(ConnError::Closed));
        }
        for handle in self.workers.drain(..) {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn aborted(file_id: u64, expected: u64, written: u64, err: ConnError) -> TransmissionEvent {
    TransmissionEvent {
        expected_length: expected,
        transmission_length: written,
        error: Some(Arc::new(err)),
        ..TransmissionEvent::new(TransmissionEventKind::FileAborted, Direction::Incoming, file_id)
    }
}

struct Worker {
    conn: String,
    file_id: u64,
    expected: u64,
    remote_path: Option<String>,
    written: u64,
    started: Instant,
    settings: FileSettings,
    ctx: Arc<dyn TransferContext>,
}

impl Worker {
    fn run(mut self, mut file: NamedTempFile, rx: Receiver<FileWork>) {
        for work in rx.iter() {
            match work {
                FileWork::Chunk(bytes) => {
                    if self.written + bytes.len() as u64 > self.expected {
                        self.fail_local(ConnError::Protocol(format!(
                            "file {} exceeds its declared size of {} bytes",
                            self.file_id, self.expected
                        )));
                        return;
                    }
                    if let Err(err) = file.write_all(&bytes) {
                        self.fail_local(ConnError::Io(err));
                        return;
                    }
                    self.written += bytes.len() as u64;
                }
                FileWork::Finish => {
                    self.complete(file);
                    return;
                }
                FileWork::Abort(err) => {
                    tracing::debug!(conn = %self.conn, file_id = self.file_id, error = %err, "incoming file aborted");
                    self.ctx.emit(self.event_aborted(err));
                    return;
                }
            }
        }
        self.ctx.emit(self.event_aborted(ConnError::Closed));
    }

    /// The temp file is dropped (and deleted) by the caller.
    fn fail_local(&self, err: ConnError) {
        tracing::warn!(conn = %self.conn, file_id = self.file_id, error = %err, "incoming file failed");
        self.ctx
            .signal(Signal::break_transfer(self.file_id, BREAK_IO, false, Some(err.to_string())));
        self.ctx.emit(self.event_aborted(err));
    }

    fn complete(&self, mut file: NamedTempFile) {
        if let Err(err) = file.flush() {
            self.fail_local(ConnError::Io(err));
            return;
        }
        if self.written != self.expected {
            self.fail_local(ConnError::Protocol(format!(
                "file {} ended at {} bytes, header declared {}",
                self.file_id, self.written, self.expected
            )));
            return;
        }

        match self.realize(file) {
            Ok(path) => {
                tracing::info!(
                    conn = %self.conn,
                    file_id = self.file_id,
                    bytes = self.written,
                    path = %path.display(),
                    "file received"
                );
                self.ctx.signal(Signal::confirm(self.file_id));
                self.ctx.emit(TransmissionEvent {
                    path: Some(path),
                    ..self.event(TransmissionEventKind::FileReceived)
                });
            }
            Err(err) => {
                tracing::warn!(conn = %self.conn, file_id = self.file_id, error = %err, "cannot realise file");
                self.ctx.signal(Signal::fail(
                    self.file_id,
                    FAIL_DESTINATION,
                    Some(err.to_string()),
                ));
                self.ctx.emit(TransmissionEvent {
                    info: FAIL_DESTINATION,
                    error: Some(Arc::new(err)),
                    ..self.event(TransmissionEventKind::FileFailed)
                });
            }
        }
    }

    /// Move the staged file to its destination. A destination that cannot
    /// be resolved or lacks space leaves the temp file as the result.
    fn realize(&self, file: NamedTempFile) -> Result<PathBuf, ConnError> {
        let destination = match (&self.remote_path, &self.settings.root_dir) {
            (Some(remote), Some(root)) => match resolve_destination(root, remote) {
                Ok(dest) => Some(dest),
                Err(err) => {
                    tracing::warn!(conn = %self.conn, file_id = self.file_id, error = %err, "keeping file in temp directory");
                    None
                }
            },
            _ => None,
        };

        if let Some(dest) = destination {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
                if let Err(err) = has_room(self.settings.probe.as_ref(), parent, self.expected, &self.conn) {
                    tracing::warn!(conn = %self.conn, file_id = self.file_id, error = %err, "keeping file in temp directory");
                    return keep(file);
                }
            }
            return match file.persist(&dest) {
                Ok(_) => Ok(dest),
                Err(persist) => {
                    // Rename fails across filesystems.
                    std::fs::copy(persist.file.path(), &dest)?;
                    Ok(dest)
                }
            };
        }
        keep(file)
    }

    fn event(&self, kind: TransmissionEventKind) -> TransmissionEvent {
        TransmissionEvent {
            expected_length: self.expected,
            transmission_length: self.written,
            duration: self.started.elapsed(),
            remote_path: self.remote_path.clone(),
            ..TransmissionEvent::new(kind, Direction::Incoming, self.file_id)
        }
    }

    fn event_aborted(&self, err: ConnError) -> TransmissionEvent {
        TransmissionEvent {
            error: Some(Arc::new(err)),
            ..self.event(TransmissionEventKind::FileAborted)
        }
    }
}

fn keep(file: NamedTempFile) -> Result<PathBuf, ConnError> {
    file.keep()
        .map(|(_, path)| path)
        .map_err(|err| ConnError::Io(err.error))
}
