//! The Tokio-driven client surface.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavftp_proto::{
    Command, Completion, Engine, EngineConfig, Error, Event, OpId, Payload, DEFAULT_RETRIES,
};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::checksum;
use crate::transport::{FrameSink, InboundFrame, OutboundFrame, AUTOPILOT_COMPONENT_ID};

/// Addressing and tuning for an [`FtpClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Our system id; a ground station by convention
    pub own_system_id: u8,
    /// Our component id
    pub own_component_id: u8,
    /// System id of the FTP server
    pub target_system_id: u8,
    /// Component id of the FTP server; the autopilot unless overridden
    pub target_component_id: Option<u8>,
    /// MAVLink network id stamped on outbound frames
    pub network_id: u8,
    /// How long to wait for a response before retransmitting
    pub response_timeout: Duration,
    /// Retransmissions per request before an operation fails
    pub retries: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            own_system_id: 245,
            own_component_id: 190,
            target_system_id: 1,
            target_component_id: None,
            network_id: 0,
            response_timeout: Duration::from_millis(500),
            retries: DEFAULT_RETRIES,
        }
    }
}

/// Transfer position handed to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes moved so far
    pub bytes_transferred: u32,
    /// Total size of the transfer
    pub total_bytes: u32,
}

type ProgressFn = Box<dyn FnMut(TransferProgress) + Send>;

struct Pending {
    progress: Option<ProgressFn>,
    done: oneshot::Sender<Result<Completion, Error>>,
}

struct State {
    engine: Engine,
    /// Bumped on every arm and cancel; a sleeping timer task whose epoch no
    /// longer matches was superseded and must not fire
    timer_epoch: u64,
    target_component: Option<u8>,
    root_dir: Option<PathBuf>,
}

struct Staged {
    dir: Option<tempfile::TempDir>,
    files: FxHashMap<String, PathBuf>,
}

struct Inner {
    state: Mutex<State>,
    ops: Mutex<FxHashMap<OpId, Pending>>,
    staged: Mutex<Staged>,
    sink: Arc<dyn FrameSink>,
    runtime: tokio::runtime::Handle,
    config: ClientConfig,
}

/// A user-facing event pulled out from under the state lock.
enum UserEvent {
    Progress(OpId, TransferProgress),
    Complete(OpId, Result<Completion, Error>),
}

/// MAVLink FTP client for one remote peer.
///
/// Operations queue behind each other and run strictly one at a time, in
/// call order. Each method resolves once with the operation's terminal
/// result; the `_with_progress` transfer variants additionally report
/// whole-percent progress along the way.
///
/// Clones are cheap and share the queue.
#[derive(Clone)]
pub struct FtpClient {
    inner: Arc<Inner>,
}

impl FtpClient {
    /// Creates a client that transmits through `sink`.
    ///
    /// Must be called within a Tokio runtime; response timers run on it.
    pub fn new(sink: Arc<dyn FrameSink>, config: ClientConfig) -> Self {
        let engine = Engine::new(EngineConfig {
            retries: config.retries,
        });
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    engine,
                    timer_epoch: 0,
                    target_component: config.target_component_id,
                    root_dir: None,
                }),
                ops: Mutex::new(FxHashMap::default()),
                staged: Mutex::new(Staged {
                    dir: None,
                    files: FxHashMap::default(),
                }),
                sink,
                runtime: tokio::runtime::Handle::current(),
                config,
            }),
        }
    }

    /// Feeds one decoded inbound frame from the transport.
    ///
    /// Frames addressed to another system or component are dropped, as are
    /// payloads that do not decode.
    pub fn receive(&self, frame: InboundFrame<'_>) {
        let config = &self.inner.config;
        if frame.target_system_id != 0 && frame.target_system_id != config.own_system_id {
            warn!(system = frame.target_system_id, "FTP frame for another system");
            return;
        }
        if frame.target_component_id != 0
            && frame.target_component_id != config.own_component_id
        {
            warn!(
                component = frame.target_component_id,
                "FTP frame for another component"
            );
            return;
        }
        let payload = match Payload::decode(frame.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "undecodable FTP payload");
                return;
            }
        };
        trace!(
            opcode = payload.opcode,
            seq = payload.seq_number,
            size = payload.size,
            offset = payload.offset,
            "inbound payload"
        );
        let mut user = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            let events = state.engine.handle_payload(&payload);
            self.pump(&mut state, events, &mut user);
        }
        self.dispatch(user);
    }

    /// Downloads `remote_path` into `local_dir`, named after its basename.
    pub async fn download(
        &self,
        remote_path: &str,
        local_dir: impl AsRef<Path>,
    ) -> Result<(), Error> {
        let local_dir = self.resolve_local(local_dir.as_ref());
        self.run(
            Command::Download {
                remote_path: remote_path.to_owned(),
                local_dir,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Like [`download`](Self::download), with transfer progress reports.
    pub async fn download_with_progress<F>(
        &self,
        remote_path: &str,
        local_dir: impl AsRef<Path>,
        on_progress: F,
    ) -> Result<(), Error>
    where
        F: FnMut(TransferProgress) + Send + 'static,
    {
        let local_dir = self.resolve_local(local_dir.as_ref());
        self.run(
            Command::Download {
                remote_path: remote_path.to_owned(),
                local_dir,
            },
            Some(Box::new(on_progress)),
        )
        .await
        .map(|_| ())
    }

    /// Uploads a local file into `remote_dir`, named after its basename.
    ///
    /// Names staged with [`write_tmp_file`](Self::write_tmp_file) are
    /// resolved to their staged content.
    pub async fn upload(
        &self,
        local_path: impl AsRef<Path>,
        remote_dir: &str,
    ) -> Result<(), Error> {
        let local_path = self.resolve_source(local_path.as_ref());
        self.run(
            Command::Upload {
                local_path,
                remote_dir: remote_dir.to_owned(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Like [`upload`](Self::upload), with transfer progress reports.
    pub async fn upload_with_progress<F>(
        &self,
        local_path: impl AsRef<Path>,
        remote_dir: &str,
        on_progress: F,
    ) -> Result<(), Error>
    where
        F: FnMut(TransferProgress) + Send + 'static,
    {
        let local_path = self.resolve_source(local_path.as_ref());
        self.run(
            Command::Upload {
                local_path,
                remote_dir: remote_dir.to_owned(),
            },
            Some(Box::new(on_progress)),
        )
        .await
        .map(|_| ())
    }

    /// Lists a remote directory.
    ///
    /// Entries keep their wire form: a type tag (`F` for files, `D` for
    /// directories) followed by the name, and for files a tab and the size.
    pub async fn list_directory(&self, remote_path: &str) -> Result<Vec<String>, Error> {
        match self
            .run(
                Command::ListDirectory {
                    remote_path: remote_path.to_owned(),
                },
                None,
            )
            .await?
        {
            Completion::Listing(entries) => Ok(entries),
            _ => Err(Error::ProtocolError),
        }
    }

    /// Creates a remote directory.
    pub async fn create_directory(&self, remote_path: &str) -> Result<(), Error> {
        self.run(
            Command::CreateDirectory {
                remote_path: remote_path.to_owned(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Removes an empty remote directory.
    pub async fn remove_directory(&self, remote_path: &str) -> Result<(), Error> {
        self.run(
            Command::RemoveDirectory {
                remote_path: remote_path.to_owned(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Removes a remote file.
    pub async fn remove_file(&self, remote_path: &str) -> Result<(), Error> {
        self.run(
            Command::RemoveFile {
                remote_path: remote_path.to_owned(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Moves or renames a remote file or directory.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        self.run(
            Command::Rename {
                from: from.to_owned(),
                to: to.to_owned(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Asks the server for a remote file's CRC32.
    pub async fn calc_file_crc32(&self, remote_path: &str) -> Result<u32, Error> {
        match self
            .run(
                Command::CalcFileCrc32 {
                    remote_path: remote_path.to_owned(),
                },
                None,
            )
            .await?
        {
            Completion::Crc32(crc) => Ok(crc),
            _ => Err(Error::ProtocolError),
        }
    }

    /// Compares a local file against a remote one by checksum.
    pub async fn are_files_identical(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> Result<bool, Error> {
        let local_path = self.resolve_source(local_path.as_ref());
        let local = checksum::file_crc32(&local_path).map_err(|err| {
            warn!("cannot checksum {}: {err}", local_path.display());
            if err.kind() == io::ErrorKind::NotFound {
                Error::FileDoesNotExist
            } else {
                Error::FileIoError
            }
        })?;
        let remote = self.calc_file_crc32(remote_path).await?;
        Ok(local == remote)
    }

    /// Drops all server-side session state.
    pub async fn reset_sessions(&self) -> Result<(), Error> {
        self.run(Command::ResetSessions, None).await.map(|_| ())
    }

    /// Overrides the component the client addresses.
    pub fn set_target_component_id(&self, component_id: u8) {
        self.inner.state.lock().unwrap().target_component = Some(component_id);
    }

    /// Sets the base directory against which relative local paths resolve.
    pub fn set_root_directory(&self, dir: impl AsRef<Path>) -> Result<(), Error> {
        let dir = dir.as_ref().canonicalize().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::FileDoesNotExist
            } else {
                Error::FileIoError
            }
        })?;
        self.inner.state.lock().unwrap().root_dir = Some(dir);
        Ok(())
    }

    /// Stages `contents` under `name` so it can be uploaded without the
    /// caller touching a filesystem.
    ///
    /// `name` must be a bare file name: separators and `..` are rejected.
    /// Passing `name` as the local path of [`upload`](Self::upload) or
    /// [`are_files_identical`](Self::are_files_identical) then refers to the
    /// staged content. Returns the staged path.
    pub fn write_tmp_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf, Error> {
        if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(Error::InvalidParameter);
        }
        let mut staged = self.inner.staged.lock().unwrap();
        if staged.dir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("mavftp-staged")
                .tempdir()
                .map_err(|err| {
                    warn!("cannot create staging directory: {err}");
                    Error::FileIoError
                })?;
            staged.dir = Some(dir);
        }
        let Some(dir) = staged.dir.as_ref() else {
            return Err(Error::FileIoError);
        };
        let path = dir.path().join(name);
        std::fs::write(&path, contents).map_err(|err| {
            warn!("writing {} failed: {err}", path.display());
            Error::FileIoError
        })?;
        staged.files.insert(name.to_owned(), path.clone());
        Ok(path)
    }

    /// Enqueues `command` and waits for its terminal result.
    async fn run(
        &self,
        command: Command,
        progress: Option<ProgressFn>,
    ) -> Result<Completion, Error> {
        let (done, result) = oneshot::channel();
        let mut user = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            let (op, events) = state.engine.push(command);
            self.inner
                .ops
                .lock()
                .unwrap()
                .insert(op, Pending { progress, done });
            self.pump(&mut state, events, &mut user);
        }
        self.dispatch(user);
        result.await.map_err(|_| Error::NoSystem)?
    }

    /// Applies engine events: transmits and timer changes happen here, under
    /// the state lock; user-facing events are deferred to [`dispatch`].
    ///
    /// [`dispatch`]: Self::dispatch
    fn pump(&self, state: &mut State, events: Vec<Event>, user: &mut Vec<UserEvent>) {
        for event in events {
            match event {
                Event::Transmit(payload) => {
                    let config = &self.inner.config;
                    let frame = OutboundFrame {
                        system_id: config.own_system_id,
                        component_id: config.own_component_id,
                        target_system_id: config.target_system_id,
                        target_component_id: state
                            .target_component
                            .unwrap_or(AUTOPILOT_COMPONENT_ID),
                        network_id: config.network_id,
                        payload: payload.encode(),
                    };
                    self.inner.sink.send(frame);
                }
                Event::SetTimer => self.arm_timer(state),
                Event::StopTimer => state.timer_epoch += 1,
                Event::Progress {
                    op,
                    bytes_transferred,
                    total_bytes,
                } => user.push(UserEvent::Progress(
                    op,
                    TransferProgress {
                        bytes_transferred,
                        total_bytes,
                    },
                )),
                Event::Complete { op, result } => user.push(UserEvent::Complete(op, result)),
            }
        }
    }

    fn arm_timer(&self, state: &mut State) {
        state.timer_epoch += 1;
        let epoch = state.timer_epoch;
        let timeout = self.inner.config.response_timeout;
        let inner = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                FtpClient { inner }.on_timer(epoch);
            }
        });
    }

    fn on_timer(&self, epoch: u64) {
        let mut user = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.timer_epoch != epoch {
                // Superseded by a later send or a completion.
                return;
            }
            trace!("response timer fired");
            let events = state.engine.handle_timeout();
            self.pump(&mut state, events, &mut user);
        }
        self.dispatch(user);
    }

    /// Delivers progress and completion to user code, off every lock.
    fn dispatch(&self, user: Vec<UserEvent>) {
        for event in user {
            match event {
                UserEvent::Progress(op, progress) => {
                    let callback = self
                        .inner
                        .ops
                        .lock()
                        .unwrap()
                        .get_mut(&op)
                        .and_then(|pending| pending.progress.take());
                    if let Some(mut callback) = callback {
                        callback(progress);
                        if let Some(pending) = self.inner.ops.lock().unwrap().get_mut(&op) {
                            pending.progress = Some(callback);
                        }
                    }
                }
                UserEvent::Complete(op, result) => {
                    if let Some(pending) = self.inner.ops.lock().unwrap().remove(&op) {
                        let _ = pending.done.send(result);
                    }
                }
            }
        }
    }

    /// Resolves an upload source, preferring staged temp files.
    fn resolve_source(&self, path: &Path) -> PathBuf {
        if let Some(name) = path.to_str() {
            if let Some(staged) = self.inner.staged.lock().unwrap().files.get(name) {
                return staged.clone();
            }
        }
        self.resolve_local(path)
    }

    fn resolve_local(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_owned();
        }
        match &self.inner.state.lock().unwrap().root_dir {
            Some(root) => root.join(path),
            None => path.to_owned(),
        }
    }
}
