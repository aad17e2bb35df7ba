// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sending half of a migration.
//!
//! The source owns the secrets, collects the websockets the sink dials,
//! and once all expected channels are attached drives the protocol:
//! header out, echo back, filesystem stream, and for a running container
//! the checkpoint dance described on [`SourceProtocol::transfer`].

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures::StreamExt;
use slog::{debug, error, info, o, warn, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use cask::checkpoint::{
    self, CheckpointAction, CheckpointArgs, CheckpointError, ACTION_SCRIPT_MIN_VERSION,
};
use cask::container::{snapshot_record, Container};
use cask::storage::rsync::{rsync_send, RsyncDriver};
use cask::storage::{FsConn, FsType, SourceDriver, StorageDriver};

use crate::migration::{CriuType, MigrationControl, MigrationHeader};
use crate::ops::{Operations, WebsocketOperation};
use crate::server::DaemonContext;

use super::{
    codec, constant_time_eq, idmap_to_wire, random_secret, snapshot_to_wire, ChannelSet,
    ControlChannel, MigrateError, MigrateRole,
};

/// A migration source operation: generated channel secrets, the slots the
/// REST layer attaches upgraded websockets into, and the engine that runs
/// once the expected set is complete.
pub struct MigrationSource<T> {
    container: Arc<dyn Container>,
    live: bool,
    secrets: Secrets,
    state: StdMutex<ConnectState<T>>,
    ready: Notify,
}

struct Secrets {
    control: String,
    fs: String,
    criu: Option<String>,
}

struct Slot<T> {
    ws: Option<WebSocketStream<T>>,
    seen: bool,
}

impl<T> Default for Slot<T> {
    fn default() -> Slot<T> {
        Slot { ws: None, seen: false }
    }
}

struct ConnectState<T> {
    control: Slot<T>,
    fs: Slot<T>,
    criu: Slot<T>,
    consumed: bool,
}

impl<T> Default for ConnectState<T> {
    fn default() -> ConnectState<T> {
        ConnectState {
            control: Slot::default(),
            fs: Slot::default(),
            criu: Slot::default(),
            consumed: false,
        }
    }
}

impl<T> MigrationSource<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Creates the source side for `container`. A running container makes
    /// the migration live, which requires the checkpoint tool locally.
    pub fn new(container: Arc<dyn Container>) -> Result<MigrationSource<T>, MigrateError> {
        let live = container.is_running();
        if live && !checkpoint::tool_available() {
            return Err(MigrateError::CheckpointToolMissing(MigrateRole::Source));
        }

        Ok(MigrationSource {
            container,
            live,
            secrets: Secrets {
                control: random_secret(),
                fs: random_secret(),
                criu: live.then(random_secret),
            },
            state: StdMutex::new(ConnectState::default()),
            ready: Notify::new(),
        })
    }

    pub fn live(&self) -> bool {
        self.live
    }

    /// The per-channel secrets, exposed through the operation metadata.
    /// The presence of `criu` tells the sink this migration is live.
    pub fn metadata(&self) -> HashMap<&'static str, String> {
        let mut secrets = HashMap::from([
            ("control", self.secrets.control.clone()),
            ("fs", self.secrets.fs.clone()),
        ]);
        if let Some(criu) = &self.secrets.criu {
            secrets.insert("criu", criu.clone());
        }
        secrets
    }

    /// Whether `secret` names a channel that is still waiting for its
    /// websocket. Used by the HTTP layer to refuse a connection before
    /// committing to the protocol upgrade.
    pub fn check_secret(&self, secret: &str) -> Result<(), MigrateError> {
        let st = self.state.lock().unwrap();
        let seen = if constant_time_eq(secret, &self.secrets.control) {
            st.control.seen
        } else if constant_time_eq(secret, &self.secrets.fs) {
            st.fs.seen
        } else if self.secrets.criu.as_deref().is_some_and(|s| constant_time_eq(secret, s)) {
            st.criu.seen
        } else {
            return Err(MigrateError::Permission);
        };
        if seen {
            return Err(MigrateError::Permission);
        }
        Ok(())
    }

    /// Attaches an upgraded websocket to the channel its secret names.
    ///
    /// Secrets are matched in constant time and are single-use: a second
    /// connection with an already-used secret is refused without touching
    /// the first. Once `control && fs && (!live || criu)` holds, the
    /// engine waiting in [`MigrationSource::run`] is released.
    pub fn connect(&self, secret: &str, ws: WebSocketStream<T>) -> Result<(), MigrateError> {
        let mut st = self.state.lock().unwrap();

        let slot = if constant_time_eq(secret, &self.secrets.control) {
            &mut st.control
        } else if constant_time_eq(secret, &self.secrets.fs) {
            &mut st.fs
        } else if self.secrets.criu.as_deref().is_some_and(|s| constant_time_eq(secret, s)) {
            &mut st.criu
        } else {
            // A bad secret on an existing operation is a permission
            // problem, not a missing resource.
            return Err(MigrateError::Permission);
        };

        if slot.seen {
            return Err(MigrateError::Permission);
        }
        slot.ws = Some(ws);
        slot.seen = true;

        if st.control.seen && st.fs.seen && (!self.live || st.criu.seen) {
            self.ready.notify_one();
        }
        Ok(())
    }

    async fn await_connected(&self) -> Result<ChannelSet<T>, MigrateError> {
        loop {
            let notified = self.ready.notified();
            {
                let mut st = self.state.lock().unwrap();
                if st.control.seen && st.fs.seen && (!self.live || st.criu.seen) {
                    if st.consumed {
                        return Err(MigrateError::Consumed);
                    }
                    st.consumed = true;
                    let control = st.control.ws.take().ok_or(MigrateError::Consumed)?;
                    let fs = st.fs.ws.take().ok_or(MigrateError::Consumed)?;
                    let criu = st.criu.ws.take();
                    return Ok(ChannelSet {
                        control: Arc::new(ControlChannel::new(control)),
                        fs,
                        criu,
                    });
                }
            }
            notified.await;
        }
    }

    /// Runs the source half of the migration to completion. Blocks until
    /// the sink has dialled every expected channel.
    pub async fn run(&self, ctx: &DaemonContext) -> Result<(), MigrateError> {
        let channels = self.await_connected().await?;
        let log = ctx.log.new(o!(
            "migrate_role" => "source",
            "container" => self.container.name(),
        ));

        let proto = SourceProtocol {
            ctx,
            log,
            container: Arc::clone(&self.container),
            live: self.live,
            control: channels.control,
        };
        proto.run(channels.fs, channels.criu).await
    }
}

impl WebsocketOperation for MigrationSource<hyper::upgrade::Upgraded> {
    fn check_secret(&self, secret: &str) -> Result<(), MigrateError> {
        MigrationSource::check_secret(self, secret)
    }

    fn connect(
        &self,
        secret: &str,
        ws: WebSocketStream<hyper::upgrade::Upgraded>,
    ) -> Result<(), MigrateError> {
        MigrationSource::connect(self, secret, ws)
    }
}

struct SourceProtocol<'a, T> {
    ctx: &'a DaemonContext,
    log: Logger,
    container: Arc<dyn Container>,
    live: bool,
    control: Arc<ControlChannel<T>>,
}

/// Handles kept alive across the final control exchange of a live
/// migration: the restore verdict feeding the action script, and the
/// dump worker's exit status.
struct LiveHandles<'a> {
    restore_tx: oneshot::Sender<bool>,
    dump_err_rx: oneshot::Receiver<Result<(), CheckpointError>>,
    _op: OpGuard<'a>,
}

/// Unregisters a sub-operation when dropped.
struct OpGuard<'a> {
    ops: &'a Operations,
    id: Uuid,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.ops.remove(&self.id);
    }
}

impl<T> SourceProtocol<'_, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(
        &self,
        fs_ws: WebSocketStream<T>,
        criu_ws: Option<WebSocketStream<T>>,
    ) -> Result<(), MigrateError> {
        info!(self.log, "entering source migration task");

        // A stopped container's filesystem is only reachable while its
        // storage is mounted; make sure the mount goes away again on
        // every exit path.
        if !self.live {
            self.container.storage_start()?;
        }
        let res = self.migrate(fs_ws, criu_ws).await;
        if !self.live {
            if let Err(e) = self.container.storage_stop() {
                warn!(self.log, "failed to stop storage after migration"; "err" => %e);
            }
        }

        match &res {
            Ok(()) => info!(self.log, "source migration successful"),
            Err(e) => error!(self.log, "source migration failed"; "err" => %e),
        }
        res
    }

    async fn migrate(
        &self,
        fs_ws: WebSocketStream<T>,
        criu_ws: Option<WebSocketStream<T>>,
    ) -> Result<(), MigrateError> {
        let idmap = self.container.idmap()?.unwrap_or_default();

        let storage = self.container.storage();
        let mut my_type = storage.fs_type();
        let driver_res = storage.migration_source(Arc::clone(&self.container), &self.log);

        let (snapshot_names, snapshots) = match &driver_res {
            Ok(driver) => {
                let mut names = Vec::new();
                let mut records = Vec::new();
                for snap in driver.snapshots() {
                    let record = snapshot_record(snap.as_ref());
                    names.push(record.name.clone());
                    records.push(snapshot_to_wire(&record));
                }
                (names, records)
            }
            Err(_) => (Vec::new(), Vec::new()),
        };

        let header = MigrationHeader {
            fs: my_type.into(),
            criu: self.live.then_some(CriuType::CriuRsync as i32),
            idmap: idmap.entries().iter().map(idmap_to_wire).collect(),
            snapshot_names,
            snapshots,
        };

        // The protocol says a header goes out no matter what, so the sink
        // is never left hanging on its first read; a storage failure
        // follows right behind it as a control failure.
        if let Err(e) = self.control.send(&header).await {
            let err = MigrateError::from(e);
            self.control.send_control(Some(&err)).await;
            return Err(err);
        }

        let mut driver = match driver_res {
            Ok(d) => d,
            Err(e) => {
                let err = MigrateError::from(e);
                self.control.send_control(Some(&err)).await;
                return Err(err);
            }
        };

        let mut fs_conn = codec::transfer_conn(fs_ws);
        let live_handles =
            match self.transfer(&mut driver, &mut my_type, &mut fs_conn, criu_ws).await {
                Ok(handles) => handles,
                Err(e) => {
                    driver.cleanup().await;
                    self.control.send_control(Some(&e)).await;
                    return Err(e);
                }
            };
        driver.cleanup().await;

        // The sink has everything it needs; wait for its verdict.
        let msg: MigrationControl = match self.control.recv().await {
            Ok(m) => m,
            Err(e) => {
                // Dropping the live handles unblocks the action script
                // with a failure, which leaves the container running; the
                // dump worker is left to terminate naturally.
                self.control.disconnect().await;
                return Err(e.into());
            }
        };

        if let Some(handles) = live_handles {
            let _ = handles.restore_tx.send(msg.success);
            if let Ok(Err(e)) = handles.dump_err_rx.await {
                // The container is already running on the sink; nothing
                // to do about a late dump failure but record it.
                error!(self.log, "dump failed after successful restore"; "err" => %e);
            }
        }

        if !msg.success {
            return Err(MigrateError::Remote(
                MigrateRole::Sink,
                msg.message.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    /// Streams the filesystem and, for a live migration, the checkpoint.
    ///
    /// The checkpoint introduces a cycle: this side cannot release the
    /// container until the sink restored, but the sink cannot restore
    /// until the dump is complete. The tool's action script breaks it: it
    /// dials a dedicated websocket (signalling "dump done" here) and then
    /// hangs inside the tool until that socket closes with the restore
    /// verdict, exiting 0 to let the tool kill the container or 1 to
    /// leave it running.
    async fn transfer(
        &self,
        driver: &mut Box<dyn SourceDriver>,
        my_type: &mut FsType,
        fs_conn: &mut FsConn,
        criu_ws: Option<WebSocketStream<T>>,
    ) -> Result<Option<LiveHandles<'_>>, MigrateError> {
        let resp: MigrationHeader = self.control.recv().await?;

        // If the sink can't take our native stream it echoes rsync, the
        // universal fallback, and both sides swap drivers.
        if resp.fs != i32::from(*my_type) {
            info!(self.log, "renegotiating filesystem transfer to rsync");
            *my_type = FsType::Rsync;
            let mut old = std::mem::replace(
                driver,
                RsyncDriver.migration_source(Arc::clone(&self.container), &self.log)?,
            );
            old.cleanup().await;
        }

        driver.send_while_running(fs_conn).await?;

        if !self.live {
            return Ok(None);
        }

        if resp.criu.is_none() {
            return Err(MigrateError::MissingCriuType);
        }
        if resp.criu != Some(CriuType::CriuRsync as i32) {
            return Err(MigrateError::UnsupportedCriuType);
        }
        let mut criu_conn = codec::transfer_conn(
            criu_ws.ok_or(MigrateError::MissingChannelSecret("criu"))?,
        );

        let state_dir = tempfile::Builder::new().prefix("caskd_checkpoint_").tempdir()?;
        let state_path = state_dir.path().to_path_buf();

        if self.container.runtime_version().at_least(ACTION_SCRIPT_MIN_VERSION) {
            let (dump_done_tx, dump_done_rx) = oneshot::channel();
            let (restore_tx, restore_rx) = oneshot::channel();
            let (dump_err_tx, mut dump_err_rx) = oneshot::channel();

            let script_secret = random_secret();
            let op = Arc::new(ActionScriptOp::new(
                script_secret.clone(),
                dump_done_tx,
                restore_rx,
                self.log.clone(),
            ));
            let op_id = self.ctx.ops.insert(op);
            let guard = OpGuard { ops: &self.ctx.ops, id: op_id };
            let op_url = self.ctx.operation_url(&op_id);

            write_action_script(&state_path, &op_url, &script_secret, self.ctx.exec_path())?;

            let args = CheckpointArgs {
                action: CheckpointAction::Dump,
                state_dir: state_path.clone(),
                stop: true,
                action_script: true,
            };
            let container = Arc::clone(&self.container);
            let worker_log = self.log.clone();
            tokio::spawn(async move {
                // Holds the tool open across dump + action-script hang;
                // the state directory lives exactly as long as the tool.
                let res = checkpoint::run(container.as_ref(), &args, &worker_log).await;
                let _ = dump_err_tx.send(res);
                drop(state_dir);
            });

            tokio::select! {
                // The checkpoint failed (or the tool bailed early).
                res = &mut dump_err_rx => {
                    return Err(match res {
                        Ok(Err(e)) => e.into(),
                        _ => CheckpointError::EarlyExit.into(),
                    });
                }
                // The dump finished; the container is frozen in the
                // action script, waiting on the restore verdict.
                res = dump_done_rx => {
                    if res.is_err() {
                        return Err(CheckpointError::EarlyExit.into());
                    }
                    debug!(self.log, "dump finished, continuing with restore");
                }
            }

            rsync_send(&state_path, &mut criu_conn, &self.log).await?;
            driver.send_after_checkpoint(fs_conn).await?;

            Ok(Some(LiveHandles { restore_tx, dump_err_rx, _op: guard }))
        } else {
            // Old runtimes can't run an action script, so the dump runs
            // to completion and the container dies before the sink has
            // restored anything.
            warn!(
                self.log,
                "runtime is older than {}.{}.{}; the live migration will probably fail",
                ACTION_SCRIPT_MIN_VERSION.major,
                ACTION_SCRIPT_MIN_VERSION.minor,
                ACTION_SCRIPT_MIN_VERSION.patch,
            );
            let args = CheckpointArgs {
                action: CheckpointAction::Dump,
                state_dir: state_path.clone(),
                stop: true,
                action_script: false,
            };
            checkpoint::run(self.container.as_ref(), &args, &self.log).await?;

            rsync_send(&state_path, &mut criu_conn, &self.log).await?;
            driver.send_after_checkpoint(fs_conn).await?;

            Ok(None)
        }
    }
}

/// The sub-operation behind the action-script websocket. Its secret is
/// distinct from the three migration secrets and, like them, single-use.
pub(crate) struct ActionScriptOp {
    secret: String,
    dump_done: StdMutex<Option<oneshot::Sender<()>>>,
    restore: StdMutex<Option<oneshot::Receiver<bool>>>,
    log: Logger,
}

impl ActionScriptOp {
    pub(crate) fn new(
        secret: String,
        dump_done: oneshot::Sender<()>,
        restore: oneshot::Receiver<bool>,
        log: Logger,
    ) -> ActionScriptOp {
        ActionScriptOp {
            secret,
            dump_done: StdMutex::new(Some(dump_done)),
            restore: StdMutex::new(Some(restore)),
            log,
        }
    }
}

impl WebsocketOperation for ActionScriptOp {
    fn check_secret(&self, secret: &str) -> Result<(), MigrateError> {
        if !constant_time_eq(secret, &self.secret) {
            return Err(MigrateError::Permission);
        }
        if self.dump_done.lock().unwrap().is_none() {
            return Err(MigrateError::Permission);
        }
        Ok(())
    }

    fn connect(
        &self,
        secret: &str,
        mut ws: WebSocketStream<hyper::upgrade::Upgraded>,
    ) -> Result<(), MigrateError> {
        if !constant_time_eq(secret, &self.secret) {
            return Err(MigrateError::Permission);
        }
        let dump_done = self
            .dump_done
            .lock()
            .unwrap()
            .take()
            .ok_or(MigrateError::Permission)?;
        let restore = self.restore.lock().unwrap().take().ok_or(MigrateError::Permission)?;

        let log = self.log.clone();
        tokio::spawn(async move {
            let _ = dump_done.send(());

            // Hold the socket open until the restore verdict arrives; a
            // dropped sender reads as failure. The close code is the
            // verdict: normal means let the tool kill the container.
            let ok = restore.await.unwrap_or(false);
            let frame = CloseFrame {
                code: if ok { CloseCode::Normal } else { CloseCode::Error },
                reason: "".into(),
            };
            if let Err(e) = ws.close(Some(frame)).await {
                debug!(log, "failed to close action-script websocket"; "err" => %e);
            }
            // Drain until the peer finishes the close handshake.
            while let Some(Ok(_)) = ws.next().await {}
        });
        Ok(())
    }
}

/// Writes the tool's action script into the checkpoint state directory.
///
/// The script re-executes this daemon, which dials the action-script
/// websocket and blocks until the restore verdict; its exit code tells
/// the checkpoint tool whether to kill the container (0) or leave it
/// running (1).
fn write_action_script(
    dir: &Path,
    op_url: &str,
    secret: &str,
    exec_path: &Path,
) -> Result<(), std::io::Error> {
    let script = format!(
        "#!/bin/sh -e\n\
         if [ \"$CRTOOLS_SCRIPT_ACTION\" = \"post-dump\" ]; then\n\
         \t{} migratedumpsuccess {} {}\n\
         fi\n",
        exec_path.display(),
        op_url,
        secret
    );

    let path = dir.join("action.sh");
    std::fs::write(&path, script)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_script_contents() {
        let dir = tempfile::tempdir().unwrap();
        write_action_script(
            dir.path(),
            "https://host:8443/1.0/operations/abc",
            "s3cret",
            Path::new("/usr/bin/caskd"),
        )
        .unwrap();

        let path = dir.path().join("action.sh");
        let script = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            script,
            "#!/bin/sh -e\n\
             if [ \"$CRTOOLS_SCRIPT_ACTION\" = \"post-dump\" ]; then\n\
             \t/usr/bin/caskd migratedumpsuccess https://host:8443/1.0/operations/abc s3cret\n\
             fi\n"
        );

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o500);
    }
}
