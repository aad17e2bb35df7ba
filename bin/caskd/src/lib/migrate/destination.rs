// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The receiving half of a migration.
//!
//! The sink dials the source's channels, echoes the negotiated header,
//! and then receives the filesystem and (live only) the checkpoint image
//! in parallel while watching the control channel for an out-of-band
//! source failure. The half-built container is exclusively ours: every
//! failure path deletes it.

use std::collections::HashMap;
use std::sync::Arc;

use slog::{debug, error, info, o, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use cask::checkpoint::{self, CheckpointAction, CheckpointArgs};
use cask::container::{snapshot_record, Container, SnapshotRecord};
use cask::storage::rsync::{rsync_recv, RsyncDriver};
use cask::storage::{FsType, SinkArgs, StorageDriver};

use crate::migration::{CriuType, MigrationControl, MigrationHeader};
use crate::server::DaemonContext;

use super::{
    codec, idmap_from_wire, snapshot_from_wire, websocket_url, ControlChannel, MigrateError,
    MigrateRole,
};

pub struct MigrationSinkArgs {
    /// The source operation URL the channel websockets hang off of.
    pub url: String,
    /// Channel secrets from the source's operation metadata.
    pub secrets: HashMap<String, String>,
    /// The half-created target container; deleted on any failure.
    pub container: Arc<dyn Container>,
}

/// The sink side of one migration: dials the source's websockets and
/// pulls the container across.
pub struct MigrationSink {
    url: String,
    container: Arc<dyn Container>,
    live: bool,
    control_secret: String,
    fs_secret: String,
    criu_secret: Option<String>,
}

impl MigrationSink {
    /// Builds a sink from the secrets handed out by the source. The
    /// presence of a `criu` secret is what makes the migration live.
    pub fn new(args: MigrationSinkArgs) -> Result<MigrationSink, MigrateError> {
        let control_secret = args
            .secrets
            .get("control")
            .cloned()
            .ok_or(MigrateError::MissingChannelSecret("control"))?;
        let fs_secret = args
            .secrets
            .get("fs")
            .cloned()
            .ok_or(MigrateError::MissingChannelSecret("fs"))?;
        let criu_secret = args.secrets.get("criu").cloned();

        let live = criu_secret.is_some();
        if live && !checkpoint::tool_available() {
            return Err(MigrateError::CheckpointToolMissing(MigrateRole::Sink));
        }

        Ok(MigrationSink {
            url: args.url,
            container: args.container,
            live,
            control_secret,
            fs_secret,
            criu_secret,
        })
    }

    pub fn live(&self) -> bool {
        self.live
    }

    async fn connect_with_secret(
        &self,
        secret: &str,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, MigrateError> {
        let url = websocket_url(&self.url, secret);
        let (ws, _) = connect_async(&url).await.map_err(|e| MigrateError::Http(e.to_string()))?;
        Ok(ws)
    }

    /// Runs the sink half of the migration: dials every expected channel,
    /// then pulls the container across.
    pub async fn run(&self, ctx: &DaemonContext) -> Result<(), MigrateError> {
        let log = self.migrate_log(ctx);

        let control = match self.connect_with_secret(&self.control_secret).await {
            Ok(ws) => Arc::new(ControlChannel::new(ws)),
            Err(e) => {
                self.delete_container(&log);
                return Err(e);
            }
        };

        let fs = match self.connect_with_secret(&self.fs_secret).await {
            Ok(ws) => ws,
            Err(e) => {
                self.delete_container(&log);
                control.send_control(Some(&e)).await;
                return Err(e);
            }
        };

        let criu = match &self.criu_secret {
            Some(secret) => match self.connect_with_secret(secret).await {
                Ok(ws) => Some(ws),
                Err(e) => {
                    self.delete_container(&log);
                    control.send_control(Some(&e)).await;
                    return Err(e);
                }
            },
            None => None,
        };

        self.migrate(log, control, fs, criu).await
    }

    /// Runs the sink protocol on already-established channels. Entry
    /// point for embedders and tests that bring their own transport.
    pub async fn run_channels<T>(
        &self,
        ctx: &DaemonContext,
        control: WebSocketStream<T>,
        fs: WebSocketStream<T>,
        criu: Option<WebSocketStream<T>>,
    ) -> Result<(), MigrateError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let log = self.migrate_log(ctx);
        self.migrate(log, Arc::new(ControlChannel::new(control)), fs, criu).await
    }

    fn migrate_log(&self, ctx: &DaemonContext) -> Logger {
        ctx.log.new(o!(
            "migrate_role" => "sink",
            "container" => self.container.name(),
        ))
    }

    fn delete_container(&self, log: &Logger) {
        if let Err(e) = self.container.delete() {
            error!(log, "failed to delete container after failed migration"; "err" => %e);
        }
    }

    async fn migrate<T>(
        &self,
        log: Logger,
        control: Arc<ControlChannel<T>>,
        fs_ws: WebSocketStream<T>,
        criu_ws: Option<WebSocketStream<T>>,
    ) -> Result<(), MigrateError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!(log, "entering sink migration task");
        let res = self.migrate_inner(&log, &control, fs_ws, criu_ws).await;

        // Session teardown: a normal close on control, raw drops on the
        // bulk channels (their owners have exited by now).
        control.disconnect().await;

        match &res {
            Ok(()) => info!(log, "sink migration successful"),
            Err(e) => error!(log, "sink migration failed"; "err" => %e),
        }
        res
    }

    async fn migrate_inner<T>(
        &self,
        log: &Logger,
        control: &Arc<ControlChannel<T>>,
        fs_ws: WebSocketStream<T>,
        criu_ws: Option<WebSocketStream<T>>,
    ) -> Result<(), MigrateError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let header: MigrationHeader = match control.recv().await {
            Ok(h) => h,
            Err(e) => {
                let err = MigrateError::from(e);
                self.delete_container(log);
                control.send_control(Some(&err)).await;
                return Err(err);
            }
        };

        // Pick the receiving driver; a format we can't take natively
        // flips our echo to rsync and the source follows.
        let storage = self.container.storage();
        let mut my_type = storage.fs_type();
        let mut sink = storage.migration_sink(log);
        if header.fs != i32::from(my_type) {
            my_type = FsType::Rsync;
            sink = RsyncDriver.migration_sink(log);
        }

        let resp = MigrationHeader {
            fs: my_type.into(),
            criu: self.live.then_some(CriuType::CriuRsync as i32),
            ..Default::default()
        };
        if let Err(e) = control.send(&resp).await {
            let err = MigrateError::from(e);
            self.delete_container(log);
            control.send_control(Some(&err)).await;
            return Err(err);
        }

        let src_idmap = match idmap_from_wire(&header.idmap) {
            Ok(set) => set,
            Err(e) => {
                let err = MigrateError::from(e);
                self.delete_container(log);
                control.send_control(Some(&err)).await;
                return Err(err);
            }
        };

        // Legacy senders only provide snapshot names; synthesize their
        // descriptors from the target container, as older daemons did.
        let snapshots: Vec<SnapshotRecord> =
            if header.snapshot_names.len() != header.snapshots.len() {
                header
                    .snapshot_names
                    .iter()
                    .map(|name| {
                        let mut base = snapshot_record(self.container.as_ref());
                        base.name = name.clone();
                        base
                    })
                    .collect()
            } else {
                header.snapshots.iter().map(snapshot_from_wire).collect()
            };

        // The filesystem and checkpoint receives run in parallel; the
        // source is smart enough to front-load filesystem bytes before it
        // seizes the container, so being dumb here still minimizes the
        // total transfer time.
        let live = self.live;
        let container = Arc::clone(&self.container);
        let task_log = log.clone();
        let mut fs_conn = codec::transfer_conn(fs_ws);
        let criu_conn = criu_ws.map(codec::transfer_conn);

        let mut restore_task = tokio::spawn(async move {
            let fs_log = task_log.clone();
            let fs_container = Arc::clone(&container);
            let fs_idmap = src_idmap.clone();
            let mut sink = sink;
            let fs_transfer = async {
                sink.receive(SinkArgs {
                    live,
                    container: Arc::clone(&fs_container),
                    snapshots,
                    conn: &mut fs_conn,
                    src_idmap: src_idmap.clone(),
                })
                .await?;

                // Re-own the received tree: host ids allocated through
                // the source's map become ids under ours. All or
                // nothing; a failure here fails the whole migration.
                if !fs_idmap.is_empty() {
                    let dst = fs_container.idmap()?.unwrap_or_default();
                    let root = fs_container.rootfs_path();
                    tokio::task::spawn_blocking(move || fs_idmap.shift_rootfs(&dst, &root))
                        .await
                        .map_err(join_error)??;
                    debug!(fs_log, "shifted received rootfs ownership");
                }
                Ok::<(), MigrateError>(())
            };

            let criu_log = task_log.clone();
            let checkpoint_recv = async {
                if !live {
                    return Ok(None);
                }
                let dir =
                    tempfile::Builder::new().prefix("caskd_restore_").tempdir()?;
                let mut conn =
                    criu_conn.ok_or(MigrateError::MissingChannelSecret("criu"))?;
                rsync_recv(dir.path(), &mut conn, &criu_log).await?;
                Ok::<_, MigrateError>(Some(dir))
            };

            let ((), images_dir) = tokio::try_join!(fs_transfer, checkpoint_recv)?;

            if let Some(dir) = &images_dir {
                let args = CheckpointArgs {
                    action: CheckpointAction::Restore,
                    state_dir: dir.path().to_path_buf(),
                    stop: false,
                    action_script: false,
                };
                checkpoint::run(container.as_ref(), &args, &task_log).await?;
            }

            Ok::<(), MigrateError>(())
        });

        // Multiplex the transfer outcome with reads of the source's
        // control channel, so an out-of-band source failure aborts us
        // promptly instead of at the next receive.
        enum Event {
            Transfer(Result<Result<(), MigrateError>, tokio::task::JoinError>),
            Control(Result<MigrationControl, codec::ProtocolError>),
        }

        let verdict: Result<(), MigrateError> = loop {
            let event = tokio::select! {
                res = &mut restore_task => Event::Transfer(res),
                msg = control.recv::<MigrationControl>() => Event::Control(msg),
            };

            match event {
                Event::Transfer(res) => {
                    break res.unwrap_or_else(|e| Err(join_error(e)));
                }
                Event::Control(Err(e)) => {
                    debug!(log, "error reading migration control socket"; "err" => %e);
                    control.disconnect().await;
                    restore_task.abort();
                    self.delete_container(log);
                    return Err(MigrateError::ControlClosed);
                }
                Event::Control(Ok(msg)) if !msg.success => {
                    control.disconnect().await;
                    restore_task.abort();
                    self.delete_container(log);
                    return Err(MigrateError::Remote(
                        MigrateRole::Source,
                        msg.message.unwrap_or_default(),
                    ));
                }
                Event::Control(Ok(msg)) => {
                    // The source can only tell us it failed; the restore
                    // verdict travels the other way. On this odd success,
                    // refresh the copied templates like a local copy
                    // would.
                    debug!(log, "unexpected message from source"; "msg" => ?msg);
                    if let Err(e) = self.container.apply_templates("copy") {
                        restore_task.abort();
                        self.delete_container(log);
                        return Err(e.into());
                    }
                }
            }
        };

        control.send_control(verdict.as_ref().err()).await;
        match verdict {
            Ok(()) => Ok(()),
            Err(e) => {
                self.delete_container(log);
                Err(e)
            }
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> MigrateError {
    MigrateError::Io(std::io::Error::other(e))
}
