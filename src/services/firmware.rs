//! Firmware upload state machine
//!
//! `Idle -> Receiving -> {Committed | Failed} -> Idle`
//!
//! The HTTP layer feeds three signals per upload (start, chunks, finish) and
//! then consumes the outcome. Errors never abort the stream: the transport has
//! to drain the body anyway, so later chunks are accepted and dropped and the
//! first recorded error is reported when the outcome is taken.

use crate::services::clock::Clock;
use anyhow::{Context, Result, bail, ensure};
use log::{debug, error, info, warn};
use std::{
    fmt,
    fs::{self, File},
    io::{ErrorKind, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

/// A Receiving session without chunks for this long is discarded by the tick
pub const UPLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeclaredSize {
    Known(u64),
    Unknown,
}

impl DeclaredSize {
    /// Interpret the `size` query parameter; absent or unparsable means unknown
    pub fn from_query(value: Option<&str>) -> Self {
        value
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map_or(DeclaredSize::Unknown, DeclaredSize::Known)
    }
}

impl fmt::Display for DeclaredSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaredSize::Known(size) => write!(f, "{size} bytes"),
            DeclaredSize::Unknown => write!(f, "unknown size"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UploadError {
    Open(String),
    Write(String),
    Commit(String),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Open(e) => write!(f, "failed to open flash target: {e}"),
            UploadError::Write(e) => write!(f, "failed to write firmware: {e}"),
            UploadError::Commit(e) => write!(f, "failed to commit firmware: {e}"),
        }
    }
}

impl std::error::Error for UploadError {}

/// Returned by [`FirmwareUpdater::start`] while another session is receiving
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UploadBusy;

impl fmt::Display for UploadBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "another firmware upload is in progress")
    }
}

impl std::error::Error for UploadBusy {}

/// Storage the firmware image is written to
pub trait FlashTarget: Send {
    fn open(&mut self, size: DeclaredSize) -> Result<()>;
    fn write(&mut self, chunk: &[u8]) -> Result<()>;
    /// Finalize the image so it becomes active after the next restart
    fn commit(&mut self) -> Result<()>;
    /// Discard a partially written image
    fn abort(&mut self);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UploadState {
    Idle,
    Receiving,
    Committed,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UploadOutcome {
    Committed { bytes: u64 },
    Failed(UploadError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionId(u64);

#[derive(Debug)]
struct UploadSession {
    id: SessionId,
    declared_size: DeclaredSize,
    target_open: bool,
    bytes_written: u64,
    progress: u8,
    error: Option<UploadError>,
    finished: bool,
    last_activity: Duration,
}

impl UploadSession {
    fn record_progress(&mut self, written: u64) {
        self.bytes_written += written;

        if let DeclaredSize::Known(total) = self.declared_size {
            if total > 0 {
                let progress = (self.bytes_written.saturating_mul(100) / total).min(100) as u8;
                if progress / 10 != self.progress / 10 {
                    info!("firmware upload progress: {progress}%");
                }
                self.progress = progress;
            }
        }
    }
}

pub struct FirmwareUpdater {
    target: Box<dyn FlashTarget>,
    clock: Arc<dyn Clock>,
    session: Option<UploadSession>,
    next_id: u64,
}

impl FirmwareUpdater {
    pub fn new(target: Box<dyn FlashTarget>, clock: Arc<dyn Clock>) -> Self {
        Self {
            target,
            clock,
            session: None,
            next_id: 0,
        }
    }

    pub fn state(&self) -> UploadState {
        match &self.session {
            None => UploadState::Idle,
            Some(session) if !session.finished => UploadState::Receiving,
            Some(session) if session.error.is_some() => UploadState::Failed,
            Some(_) => UploadState::Committed,
        }
    }

    /// Progress in percent of the open session, `None` when idle
    pub fn progress(&self) -> Option<u8> {
        self.session.as_ref().map(|session| session.progress)
    }

    pub fn bytes_written(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.bytes_written)
    }

    /// Start-of-stream: open a new session and the flash target
    ///
    /// An open failure is recorded in the session, not returned; the caller
    /// keeps feeding chunks until the end of the stream.
    pub fn start(&mut self, declared_size: DeclaredSize) -> Result<SessionId, UploadBusy> {
        match self.state() {
            UploadState::Receiving => return Err(UploadBusy),
            UploadState::Committed | UploadState::Failed => {
                warn!("discarding unconsumed firmware upload outcome");
                self.session = None;
            }
            UploadState::Idle => {}
        }

        self.next_id += 1;
        let id = SessionId(self.next_id);

        info!("firmware upload started ({declared_size})");

        let mut session = UploadSession {
            id,
            declared_size,
            target_open: false,
            bytes_written: 0,
            progress: 0,
            error: None,
            finished: false,
            last_activity: self.clock.now(),
        };

        match self.target.open(declared_size) {
            Ok(()) => session.target_open = true,
            Err(e) => {
                error!("firmware upload cannot open flash target: {e:#}");
                session.error = Some(UploadError::Open(format!("{e:#}")));
            }
        }

        self.session = Some(session);
        Ok(id)
    }

    /// Chunk: write to the flash target unless the session already failed
    pub fn chunk(&mut self, id: SessionId, data: &[u8]) {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut().filter(|session| session.id == id) else {
            debug!("ignoring chunk for unknown upload session");
            return;
        };

        session.last_activity = now;

        if session.finished || session.error.is_some() {
            return;
        }

        match self.target.write(data) {
            Ok(()) => session.record_progress(data.len() as u64),
            Err(e) => {
                error!(
                    "firmware write failed after {} bytes: {e:#}",
                    session.bytes_written
                );
                session.error = Some(UploadError::Write(format!("{e:#}")));
            }
        }
    }

    /// End-of-stream: commit the image, or discard it if the session failed
    pub fn finish(&mut self, id: SessionId) {
        let Some(session) = self.session.as_mut().filter(|session| session.id == id) else {
            warn!("ignoring finish for unknown upload session");
            return;
        };

        if session.finished {
            return;
        }
        session.finished = true;

        if session.error.is_some() {
            if session.target_open {
                self.target.abort();
            }
            return;
        }

        match self.target.commit() {
            Ok(()) => info!(
                "firmware image of {} bytes committed, pending restart",
                session.bytes_written
            ),
            Err(e) => {
                error!("firmware commit failed: {e:#}");
                session.error = Some(UploadError::Commit(format!("{e:#}")));
                session.progress = 0;
            }
        }
    }

    /// Consume the outcome of a finished session, returning to Idle
    pub fn take_outcome(&mut self, id: SessionId) -> Option<UploadOutcome> {
        let finished = self
            .session
            .as_ref()
            .is_some_and(|session| session.id == id && session.finished);

        if !finished {
            return None;
        }

        let session = self.session.take()?;

        Some(match session.error {
            Some(e) => UploadOutcome::Failed(e),
            None => UploadOutcome::Committed {
                bytes: session.bytes_written,
            },
        })
    }

    /// Drop a session whose stream broke off, discarding partial data
    pub fn abort(&mut self, id: SessionId) {
        if self.session.as_ref().is_some_and(|session| session.id == id) {
            self.discard("aborted");
        }
    }

    /// Reap a Receiving session that has been silent for too long
    ///
    /// Returns whether a session was discarded.
    pub fn expire_stale(&mut self) -> bool {
        let now = self.clock.now();
        let stale = self.session.as_ref().is_some_and(|session| {
            !session.finished && now.saturating_sub(session.last_activity) > UPLOAD_IDLE_TIMEOUT
        });

        if stale {
            self.discard("timed out");
        }

        stale
    }

    fn discard(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            warn!(
                "firmware upload {reason} after {} bytes",
                session.bytes_written
            );
            if session.target_open && !session.finished {
                self.target.abort();
            }
        }
    }
}

/// Image slot on the local filesystem
///
/// The image is written to a staging file and renamed over the active image
/// on commit, so a broken upload never replaces a good image.
pub struct FileFlashTarget {
    image_path: PathBuf,
    staging_path: PathBuf,
    max_size: u64,
    file: Option<File>,
    declared_size: DeclaredSize,
    written: u64,
}

impl FileFlashTarget {
    pub fn new(image_path: impl Into<PathBuf>, staging_path: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            image_path: image_path.into(),
            staging_path: staging_path.into(),
            max_size,
            file: None,
            declared_size: DeclaredSize::Unknown,
            written: 0,
        }
    }

    fn limit(&self) -> u64 {
        match self.declared_size {
            DeclaredSize::Known(size) => size.min(self.max_size),
            DeclaredSize::Unknown => self.max_size,
        }
    }

    fn remove_staging(&self) {
        match fs::remove_file(&self.staging_path) {
            Ok(()) => debug!("removed staging image"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("failed to remove staging image: {e}"),
        }
    }
}

impl FlashTarget for FileFlashTarget {
    fn open(&mut self, size: DeclaredSize) -> Result<()> {
        if let DeclaredSize::Known(size) = size {
            ensure!(size > 0, "declared image size is zero");
            ensure!(
                size <= self.max_size,
                "image of {size} bytes exceeds slot capacity of {} bytes",
                self.max_size
            );
        }

        let file = File::create(&self.staging_path).context("failed to create staging image")?;

        self.file = Some(file);
        self.declared_size = size;
        self.written = 0;

        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let limit = self.limit();
        let Some(file) = self.file.as_mut() else {
            bail!("flash target is not open");
        };

        let len = chunk.len() as u64;
        ensure!(
            self.written + len <= limit,
            "image exceeds {limit} bytes"
        );

        file.write_all(chunk).context("failed to write staging image")?;
        self.written += len;

        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            bail!("flash target is not open");
        };

        let result = (|| {
            ensure!(self.written > 0, "no image data received");
            if let DeclaredSize::Known(size) = self.declared_size {
                ensure!(
                    self.written == size,
                    "image incomplete: received {} of {size} bytes",
                    self.written
                );
            }

            file.sync_all().context("failed to flush staging image")?;
            drop(file);

            fs::rename(&self.staging_path, &self.image_path)
                .context("failed to activate firmware image")
        })();

        if result.is_err() {
            self.remove_staging();
        }

        result
    }

    fn abort(&mut self) {
        self.file = None;
        self.remove_staging();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    };

    #[derive(Default)]
    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn advance(&self, by: Duration) {
            self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            Duration::from_millis(self.0.load(Ordering::SeqCst))
        }
    }

    #[derive(Debug, Default)]
    struct FlashLog {
        opened: Vec<DeclaredSize>,
        written: Vec<usize>,
        commits: usize,
        aborts: usize,
    }

    #[derive(Default)]
    struct ScriptedFlash {
        log: Arc<Mutex<FlashLog>>,
        fail_open: bool,
        fail_write_at: Option<usize>,
        fail_commit: bool,
        writes: usize,
    }

    impl FlashTarget for ScriptedFlash {
        fn open(&mut self, size: DeclaredSize) -> Result<()> {
            self.log.lock().unwrap().opened.push(size);
            ensure!(!self.fail_open, "no free partition");
            self.writes = 0;
            Ok(())
        }

        fn write(&mut self, chunk: &[u8]) -> Result<()> {
            self.writes += 1;
            ensure!(self.fail_write_at != Some(self.writes), "flash write error");
            self.log.lock().unwrap().written.push(chunk.len());
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            ensure!(!self.fail_commit, "image verification failed");
            self.log.lock().unwrap().commits += 1;
            Ok(())
        }

        fn abort(&mut self) {
            self.log.lock().unwrap().aborts += 1;
        }
    }

    fn updater(flash: ScriptedFlash) -> (FirmwareUpdater, Arc<ManualClock>, Arc<Mutex<FlashLog>>) {
        let clock = Arc::new(ManualClock::default());
        let log = flash.log.clone();
        (FirmwareUpdater::new(Box::new(flash), clock.clone()), clock, log)
    }

    #[test]
    fn declared_size_from_query() {
        assert_eq!(DeclaredSize::from_query(Some("1024")), DeclaredSize::Known(1024));
        assert_eq!(DeclaredSize::from_query(Some("abc")), DeclaredSize::Unknown);
        assert_eq!(DeclaredSize::from_query(Some("-5")), DeclaredSize::Unknown);
        assert_eq!(DeclaredSize::from_query(None), DeclaredSize::Unknown);
    }

    #[test]
    fn round_trip_reaches_full_progress_and_commits() {
        let (mut updater, _, log) = updater(ScriptedFlash::default());

        let id = updater.start(DeclaredSize::Known(1024)).unwrap();
        assert_eq!(updater.state(), UploadState::Receiving);

        for _ in 0..10 {
            updater.chunk(id, &[0xAB; 100]);
        }
        assert_eq!(updater.progress(), Some(97));

        updater.chunk(id, &[0xCD; 24]);
        assert_eq!(updater.progress(), Some(100));
        assert_eq!(updater.bytes_written(), Some(1024));

        updater.finish(id);
        assert_eq!(updater.state(), UploadState::Committed);
        assert_eq!(
            updater.take_outcome(id),
            Some(UploadOutcome::Committed { bytes: 1024 })
        );
        assert_eq!(updater.state(), UploadState::Idle);

        let log = log.lock().unwrap();
        assert_eq!(log.written.len(), 11);
        assert_eq!(log.commits, 1);
        assert_eq!(log.aborts, 0);
    }

    #[test]
    fn write_failure_drains_remaining_chunks() {
        let (mut updater, _, log) = updater(ScriptedFlash {
            fail_write_at: Some(3),
            ..Default::default()
        });

        let id = updater.start(DeclaredSize::Known(1000)).unwrap();
        for _ in 0..10 {
            updater.chunk(id, &[0; 100]);
        }

        assert_eq!(updater.bytes_written(), Some(200));
        assert_eq!(updater.progress(), Some(20));

        updater.finish(id);
        assert_eq!(updater.state(), UploadState::Failed);
        assert!(matches!(
            updater.take_outcome(id),
            Some(UploadOutcome::Failed(UploadError::Write(_)))
        ));

        let log = log.lock().unwrap();
        assert_eq!(log.written.len(), 2);
        assert_eq!(log.commits, 0);
        assert_eq!(log.aborts, 1);
    }

    #[test]
    fn open_failure_is_reported_at_completion() {
        let (mut updater, _, log) = updater(ScriptedFlash {
            fail_open: true,
            ..Default::default()
        });

        let id = updater.start(DeclaredSize::Known(100)).unwrap();
        updater.chunk(id, &[1; 50]);
        updater.chunk(id, &[1; 50]);
        updater.finish(id);

        let outcome = updater.take_outcome(id);
        let Some(UploadOutcome::Failed(e)) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(matches!(e, UploadError::Open(_)));
        assert!(e.to_string().contains("no free partition"));

        let log = log.lock().unwrap();
        assert!(log.written.is_empty());
        assert_eq!(log.aborts, 0);
    }

    #[test]
    fn commit_failure_resets_progress() {
        let (mut updater, _, _) = updater(ScriptedFlash {
            fail_commit: true,
            ..Default::default()
        });

        let id = updater.start(DeclaredSize::Known(10)).unwrap();
        updater.chunk(id, &[0; 10]);
        assert_eq!(updater.progress(), Some(100));

        updater.finish(id);
        assert_eq!(updater.progress(), Some(0));
        assert!(matches!(
            updater.take_outcome(id),
            Some(UploadOutcome::Failed(UploadError::Commit(_)))
        ));
    }

    #[test]
    fn unknown_size_keeps_progress_at_zero() {
        let (mut updater, _, _) = updater(ScriptedFlash::default());

        let id = updater.start(DeclaredSize::Unknown).unwrap();
        updater.chunk(id, &[0; 4096]);

        assert_eq!(updater.progress(), Some(0));
        assert_eq!(updater.bytes_written(), Some(4096));

        updater.finish(id);
        assert_eq!(
            updater.take_outcome(id),
            Some(UploadOutcome::Committed { bytes: 4096 })
        );
    }

    #[test]
    fn failed_session_does_not_leak_into_next_one() {
        let (mut updater, _, _) = updater(ScriptedFlash {
            fail_write_at: Some(3),
            ..Default::default()
        });

        let first = updater.start(DeclaredSize::Known(1000)).unwrap();
        for _ in 0..10 {
            updater.chunk(first, &[0; 100]);
        }
        updater.finish(first);
        assert!(matches!(
            updater.take_outcome(first),
            Some(UploadOutcome::Failed(_))
        ));

        let second = updater.start(DeclaredSize::Known(200)).unwrap();
        assert_ne!(first, second);
        assert_eq!(updater.progress(), Some(0));
        assert_eq!(updater.bytes_written(), Some(0));

        updater.chunk(second, &[0; 100]);
        updater.chunk(second, &[0; 100]);
        updater.finish(second);

        assert_eq!(
            updater.take_outcome(second),
            Some(UploadOutcome::Committed { bytes: 200 })
        );
    }

    #[test]
    fn second_start_while_receiving_is_rejected() {
        let (mut updater, _, _) = updater(ScriptedFlash::default());

        let id = updater.start(DeclaredSize::Known(10)).unwrap();
        assert_eq!(updater.start(DeclaredSize::Known(10)), Err(UploadBusy));

        updater.chunk(id, &[0; 10]);
        updater.finish(id);
        assert!(updater.take_outcome(id).is_some());
        assert!(updater.start(DeclaredSize::Known(10)).is_ok());
    }

    #[test]
    fn outcome_is_only_available_after_finish() {
        let (mut updater, _, _) = updater(ScriptedFlash::default());

        let id = updater.start(DeclaredSize::Unknown).unwrap();
        updater.chunk(id, &[0; 10]);

        assert_eq!(updater.take_outcome(id), None);
        assert_eq!(updater.state(), UploadState::Receiving);
    }

    #[test]
    fn chunks_for_stale_session_id_are_ignored() {
        let (mut updater, _, log) = updater(ScriptedFlash::default());

        let first = updater.start(DeclaredSize::Unknown).unwrap();
        updater.abort(first);
        let second = updater.start(DeclaredSize::Unknown).unwrap();

        updater.chunk(first, &[0; 10]);
        updater.finish(first);

        assert_eq!(updater.bytes_written(), Some(0));
        assert_eq!(updater.state(), UploadState::Receiving);
        assert_eq!(updater.take_outcome(first), None);
        assert_eq!(log.lock().unwrap().aborts, 1);

        updater.finish(second);
    }

    #[test]
    fn idle_session_expires() {
        let (mut updater, clock, log) = updater(ScriptedFlash::default());

        let id = updater.start(DeclaredSize::Known(100)).unwrap();
        clock.advance(Duration::from_secs(30));
        updater.chunk(id, &[0; 10]);

        clock.advance(UPLOAD_IDLE_TIMEOUT);
        assert!(!updater.expire_stale());

        clock.advance(Duration::from_millis(1));
        assert!(updater.expire_stale());
        assert_eq!(updater.state(), UploadState::Idle);
        assert_eq!(log.lock().unwrap().aborts, 1);
    }

    #[test]
    fn finished_session_never_expires() {
        let (mut updater, clock, _) = updater(ScriptedFlash::default());

        let id = updater.start(DeclaredSize::Unknown).unwrap();
        updater.chunk(id, &[0; 10]);
        updater.finish(id);

        clock.advance(UPLOAD_IDLE_TIMEOUT * 2);
        assert!(!updater.expire_stale());
        assert_eq!(updater.state(), UploadState::Committed);
    }

    fn file_target(dir: &tempfile::TempDir, max_size: u64) -> FileFlashTarget {
        FileFlashTarget::new(
            dir.path().join("firmware.bin"),
            dir.path().join("firmware.bin.part"),
            max_size,
        )
    }

    #[test]
    fn file_target_commits_by_rename() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut target = file_target(&dir, 1024);

        target.open(DeclaredSize::Known(6)).unwrap();
        target.write(b"abc").unwrap();
        target.write(b"def").unwrap();
        target.commit().unwrap();

        assert_eq!(fs::read(dir.path().join("firmware.bin")).unwrap(), b"abcdef");
        assert!(!dir.path().join("firmware.bin.part").exists());
    }

    #[test]
    fn file_target_rejects_oversized_declaration() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut target = file_target(&dir, 1024);

        let err = target.open(DeclaredSize::Known(2048)).unwrap_err();
        assert!(err.to_string().contains("exceeds slot capacity"));
        assert!(target.open(DeclaredSize::Known(0)).is_err());
    }

    #[test]
    fn file_target_rejects_more_data_than_declared() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut target = file_target(&dir, 1024);

        target.open(DeclaredSize::Known(4)).unwrap();
        target.write(b"abc").unwrap();
        assert!(target.write(b"de").is_err());
    }

    #[test]
    fn file_target_enforces_capacity_for_unknown_size() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut target = file_target(&dir, 4);

        target.open(DeclaredSize::Unknown).unwrap();
        target.write(b"abcd").unwrap();
        assert!(target.write(b"e").is_err());
    }

    #[test]
    fn file_target_refuses_incomplete_image() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let image = dir.path().join("firmware.bin");
        fs::write(&image, b"old").unwrap();
        let mut target = file_target(&dir, 1024);

        target.open(DeclaredSize::Known(10)).unwrap();
        target.write(b"abc").unwrap();

        let err = target.commit().unwrap_err();
        assert!(err.to_string().contains("received 3 of 10 bytes"));
        assert_eq!(fs::read(&image).unwrap(), b"old");
        assert!(!dir.path().join("firmware.bin.part").exists());
    }

    #[test]
    fn file_target_abort_removes_staging() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut target = file_target(&dir, 1024);

        target.open(DeclaredSize::Unknown).unwrap();
        target.write(b"abc").unwrap();
        target.abort();

        assert!(!dir.path().join("firmware.bin.part").exists());
        assert!(!dir.path().join("firmware.bin").exists());
        assert!(target.write(b"x").is_err());
    }
}
