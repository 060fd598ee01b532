//! File transfer bookkeeping shared by both directions.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use parcelnet_frame::{
    parcel_count, Channel, ObjectHeader, Priority, Signal, TransmissionParcel,
};

use crate::error::{ConnError, Result};
use crate::event::{Direction, TransmissionEvent, TransmissionEventKind};
use crate::timer::TaskHandle;

/// Serialization method stamped into FILE headers; file bytes are raw.
pub const FILE_METHOD: u8 = 0;

/// BREAK cause: cancelled through the API.
pub const BREAK_CANCELLED: i32 = 1;
/// BREAK cause: the receiver lacks staging space.
pub const BREAK_NO_SPACE: i32 = 2;
/// BREAK cause: a parcel arrived out of sequence.
pub const BREAK_SEQUENCE: i32 = 3;
/// BREAK cause: a local read or write failed.
pub const BREAK_IO: i32 = 4;
/// BREAK cause: the sender gave up waiting for CONFIRM or FAIL.
pub const BREAK_CONFIRM_TIMEOUT: i32 = 5;

/// What transfer code needs from its connection.
pub(crate) trait TransferContext: Send + Sync {
    fn emit(&self, event: TransmissionEvent);
    fn signal(&self, signal: Signal);
}

/// Progress counters shared between a [`FileSend`] and its registry record.
#[derive(Debug, Clone, Default)]
pub(crate) struct FileProgress {
    cancelled: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
}

impl FileProgress {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

/// An outgoing file awaiting completion or confirmation.
pub(crate) struct OutgoingRecord {
    pub(crate) path: PathBuf,
    pub(crate) remote_path: Option<String>,
    pub(crate) size: u64,
    pub(crate) started: Instant,
    pub(crate) progress: FileProgress,
    canonical: PathBuf,
    confirm_task: Option<TaskHandle>,
}

impl OutgoingRecord {
    pub(crate) fn event(&self, kind: TransmissionEventKind, object_id: u64) -> TransmissionEvent {
        TransmissionEvent {
            expected_length: self.size,
            transmission_length: self.progress.sent(),
            duration: self.started.elapsed(),
            path: Some(self.path.clone()),
            remote_path: self.remote_path.clone(),
            ..TransmissionEvent::new(kind, Direction::Outgoing, object_id)
        }
    }
}

/// Registry of a connection's outgoing files, keyed by file id.
#[derive(Default)]
pub(crate) struct OutgoingTransfers {
    records: Mutex<HashMap<u64, OutgoingRecord>>,
}

impl OutgoingTransfers {
    /// Validate `path` and register it under `object_id`.
    pub(crate) fn register(
        &self,
        object_id: u64,
        path: &Path,
        remote_path: Option<String>,
    ) -> Result<(u64, FileProgress)> {
        let meta = std::fs::metadata(path).map_err(|_| ConnError::FileNotFound(path.to_path_buf()))?;
        if !meta.is_file() {
            return Err(ConnError::FileNotFound(path.to_path_buf()));
        }
        if meta.len() > u64::from(u32::MAX) {
            return Err(ConnError::InvalidParameter(format!(
                "{} is too large to transfer ({} bytes)",
                path.display(),
                meta.len()
            )));
        }
        let canonical = std::fs::canonicalize(path)?;

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.values().any(|r| r.canonical == canonical) {
            return Err(ConnError::TransferActive(path.to_path_buf()));
        }
        let progress = FileProgress::default();
        records.insert(
            object_id,
            OutgoingRecord {
                path: path.to_path_buf(),
                remote_path,
                size: meta.len(),
                started: Instant::now(),
                progress: progress.clone(),
                canonical,
                confirm_task: None,
            },
        );
        Ok((meta.len(), progress))
    }

    /// Attach the confirm timeout; `false` if the transfer already ended.
    pub(crate) fn set_confirm_task(&self, object_id: u64, task: TaskHandle) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(&object_id) {
            Some(record) => {
                record.confirm_task = Some(task);
                true
            }
            None => {
                task.cancel();
                false
            }
        }
    }

    /// Remove a transfer, stopping its sender and confirm timeout.
    pub(crate) fn take(&self, object_id: u64) -> Option<OutgoingRecord> {
        let record = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&object_id)?;
        stop(&record);
        Some(record)
    }

    pub(crate) fn drain(&self) -> Vec<(u64, OutgoingRecord)> {
        let drained: Vec<(u64, OutgoingRecord)> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, record) in &drained {
            stop(record);
        }
        drained
    }

    pub(crate) fn contains(&self, object_id: u64) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&object_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn stop(record: &OutgoingRecord) {
    record.progress.cancel();
    if let Some(task) = &record.confirm_task {
        task.cancel();
    }
}

/// Pending-send body of an outgoing file. The file is opened on the
/// first parcel and read one chunk per parcel.
pub(crate) struct FileSend {
    object_id: u64,
    priority: Priority,
    path: PathBuf,
    remote_path: Option<String>,
    size: u64,
    parcel_size: usize,
    count: u32,
    next: u32,
    file: Option<File>,
    progress: FileProgress,
}

impl FileSend {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        object_id: u64,
        priority: Priority,
        path: PathBuf,
        remote_path: Option<String>,
        size: u64,
        parcel_size: usize,
        progress: FileProgress,
    ) -> Self {
        Self {
            object_id,
            priority,
            path,
            remote_path,
            size,
            parcel_size,
            count: parcel_count(size as usize, parcel_size),
            next: 0,
            file: None,
            progress,
        }
    }

    pub(crate) fn object_id(&self) -> u64 {
        self.object_id
    }

    pub(crate) fn parcel_count(&self) -> u32 {
        self.count
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.progress.is_cancelled()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.next >= self.count
    }

    /// Read the next chunk into a parcel.
    pub(crate) fn next_parcel(&mut self) -> std::io::Result<TransmissionParcel> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path)?);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(std::io::Error::other("file handle unavailable"));
        };
        let offset = u64::from(self.next) * self.parcel_size as u64;
        let len = self.size.saturating_sub(offset).min(self.parcel_size as u64) as usize;
        let mut chunk = vec![0u8; len];
        file.read_exact(&mut chunk)?;

        let mut parcel = TransmissionParcel::new(
            Channel::File,
            self.priority,
            self.object_id,
            self.next,
            chunk,
        );
        if self.next == 0 {
            parcel = parcel.with_header(ObjectHeader {
                method: FILE_METHOD,
                total_size: self.size as u32,
                parcel_count: self.count,
                path: self.remote_path.clone(),
            });
        }
        self.next += 1;
        self.progress.sent.fetch_add(len as u64, Ordering::SeqCst);
        if self.is_done() {
            self.file = None;
        }
        Ok(parcel)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn file_with(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn register_rejects_missing_directory_and_duplicate() {
        let transfers = OutgoingTransfers::default();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            transfers.register(1, &dir.path().join("missing"), None),
            Err(ConnError::FileNotFound(_))
        ));
        assert!(matches!(
            transfers.register(1, dir.path(), None),
            Err(ConnError::FileNotFound(_))
        ));

        let file = file_with(10);
        let (size, _) = transfers.register(2, file.path(), None).unwrap();
        assert_eq!(size, 10);
        assert!(matches!(
            transfers.register(3, file.path(), None),
            Err(ConnError::TransferActive(_))
        ));
        assert!(transfers.take(2).is_some());
        transfers.register(4, file.path(), None).unwrap();
    }

    #[test]
    fn take_cancels_sender_and_timer() {
        let transfers = OutgoingTransfers::default();
        let file = file_with(1);
        let (_, progress) = transfers.register(1, file.path(), None).unwrap();
        let timer = crate::timer::Timer::start("transfer-test".into()).unwrap();
        let task = timer.schedule_once(std::time::Duration::from_secs(60), || {});
        assert!(transfers.set_confirm_task(1, task.clone()));

        let record = transfers.take(1).unwrap();
        assert!(progress.is_cancelled());
        assert!(task.is_cancelled());
        assert_eq!(record.size, 1);
        assert!(!transfers.contains(1));

        let late = timer.schedule_once(std::time::Duration::from_secs(60), || {});
        assert!(!transfers.set_confirm_task(1, late.clone()));
        assert!(late.is_cancelled());
    }

    #[test]
    fn file_send_chunks_with_header_on_first() {
        let file = file_with(2500);
        let progress = FileProgress::default();
        let mut send = FileSend::new(
            9,
            Priority::Low,
            file.path().to_path_buf(),
            Some("out/data.bin".into()),
            2500,
            1024,
            progress.clone(),
        );
        assert_eq!(send.parcel_count(), 3);

        let mut parcels = Vec::new();
        while !send.is_done() {
            parcels.push(send.next_parcel().unwrap());
        }
        assert_eq!(parcels.len(), 3);
        let header = parcels[0].header.as_ref().unwrap();
        assert_eq!(header.method, FILE_METHOD);
        assert_eq!(header.total_size, 2500);
        assert_eq!(header.path.as_deref(), Some("out/data.bin"));
        assert!(parcels[1].header.is_none());
        let sizes: Vec<usize> = parcels.iter().map(|p| p.payload.len()).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);
        assert_eq!(progress.sent(), 2500);
        assert_eq!(parcels[2].payload[451], ((2499) % 256) as u8);
    }

    #[test]
    fn empty_file_is_one_parcel() {
        let file = file_with(0);
        let mut send = FileSend::new(
            1,
            Priority::Normal,
            file.path().to_path_buf(),
            None,
            0,
            1024,
            FileProgress::default(),
        );
        let parcel = send.next_parcel().unwrap();
        assert!(send.is_done());
        assert!(parcel.payload.is_empty());
        assert_eq!(parcel.header.unwrap().parcel_count, 1);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let file = file_with(100);
        let mut send = FileSend::new(
            1,
            Priority::Normal,
            file.path().to_path_buf(),
            None,
            200,
            1024,
            FileProgress::default(),
        );
        assert!(send.next_parcel().is_err());
    }
}
