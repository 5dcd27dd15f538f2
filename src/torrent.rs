//! Public engine handle
//!
//! `Torrent` is the embedder's view of one running engine: construct it
//! from an `Info` (or a magnet URI) plus a listen port and a storage
//! backend, then drive it with `start`/`stop`/`close` and observe it with
//! `stats`, `notify_complete`, and `notify_error`. Every method is safe to
//! call from any task; after `close` they all return cleanly without
//! effect.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Config;
use crate::controller::{Command, Controller, ControllerSeed};
use crate::error::{EngineError, FatalError, Result};
use crate::magnet::MagnetUri;
use crate::metainfo::Info;
use crate::resume::Resume;
use crate::stats::{Stats, TorrentState};
use crate::storage::Storage;

/// Command queue depth; commands are tiny and rare.
const COMMAND_QUEUE: usize = 16;

/// Handle to a per-torrent engine.
///
/// Dropping the handle closes the command channel, which the controller
/// treats as `close()`.
pub struct Torrent {
    cmd_tx: mpsc::Sender<Command>,
    stats_rx: watch::Receiver<Stats>,
    complete_rx: watch::Receiver<bool>,
    error_rx: watch::Receiver<Option<FatalError>>,
}

impl Torrent {
    /// Create an engine from a parsed info dictionary.
    ///
    /// Must be called from within a Tokio runtime; the controller task is
    /// spawned immediately and waits for `start()`.
    pub fn new(info: Info, listen_port: u16, storage: Arc<dyn Storage>) -> Result<Self> {
        Self::with_config(info, listen_port, storage, Vec::new(), Config::default())
    }

    /// Create an engine with announce tiers (BEP 12 `announce-list`
    /// structure; a single-tracker torrent passes one tier of one URL).
    pub fn with_trackers(
        info: Info,
        listen_port: u16,
        storage: Arc<dyn Storage>,
        tiers: Vec<Vec<String>>,
    ) -> Result<Self> {
        Self::with_config(info, listen_port, storage, tiers, Config::default())
    }

    /// Create an engine with explicit tiers and configuration.
    pub fn with_config(
        info: Info,
        listen_port: u16,
        storage: Arc<dyn Storage>,
        tiers: Vec<Vec<String>>,
        config: Config,
    ) -> Result<Self> {
        let info = Arc::new(info);
        Ok(Self::spawn(
            config,
            Some(Arc::clone(&info)),
            info.info_hash,
            info.name.clone(),
            tiers,
            listen_port,
            storage,
        ))
    }

    /// Create an engine from a magnet URI.
    ///
    /// The engine announces with the magnet's trackers and accepts
    /// connections, but cannot transfer pieces until a front-end obtains
    /// the info dictionary (BEP 9/10) and hands it over via `set_info`.
    pub fn new_magnet(uri: &str, listen_port: u16, storage: Arc<dyn Storage>) -> Result<Self> {
        Self::new_magnet_with_config(uri, listen_port, storage, Config::default())
    }

    /// Magnet construction with explicit configuration.
    pub fn new_magnet_with_config(
        uri: &str,
        listen_port: u16,
        storage: Arc<dyn Storage>,
        config: Config,
    ) -> Result<Self> {
        let magnet = MagnetUri::parse(uri)?;
        // Each magnet tracker forms its own tier, per common practice.
        let tiers = magnet.trackers.iter().map(|t| vec![t.clone()]).collect();
        Ok(Self::spawn(
            config,
            None,
            magnet.info_hash,
            magnet.name(),
            tiers,
            listen_port,
            storage,
        ))
    }

    fn spawn(
        config: Config,
        info: Option<Arc<Info>>,
        info_hash: crate::metainfo::Sha1Hash,
        name: String,
        tiers: Vec<Vec<String>>,
        listen_port: u16,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);

        let initial = Stats::initial(
            info.as_ref().map(|i| i.num_pieces()).unwrap_or(0),
            info.as_ref().map(|i| i.total_size).unwrap_or(0),
        );
        let (stats_tx, stats_rx) = watch::channel(initial);
        let (complete_tx, complete_rx) = watch::channel(false);
        let (error_tx, error_rx) = watch::channel(None);

        let controller = Controller::new(ControllerSeed {
            config,
            info,
            info_hash,
            name,
            tiers,
            listen_port,
            storage,
            cmd_rx,
            stats_tx,
            complete_tx,
            error_tx,
        });
        tokio::spawn(controller.run());

        Self {
            cmd_tx,
            stats_rx,
            complete_rx,
            error_rx,
        }
    }

    /// Attach a resume backend. May be called once, before `start`.
    pub async fn set_resume(&self, resume: Arc<dyn Resume>) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SetResume(resume, ack_tx))
            .await
            .is_err()
        {
            return Err(EngineError::Closed);
        }
        ack_rx.await.unwrap_or(Err(EngineError::Closed))
    }

    /// Hand over the info dictionary for a magnet-constructed engine
    /// (the metadata-exchange front-end extension point).
    pub async fn set_info(&self, info: Info) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SetInfo(Box::new(info), ack_tx))
            .await
            .is_err()
        {
            return Err(EngineError::Closed);
        }
        ack_rx.await.unwrap_or(Err(EngineError::Closed))
    }

    /// Start (or restart) the torrent. Idempotent.
    pub async fn start(&self) {
        let _ = self.cmd_tx.send(Command::Start).await;
    }

    /// Stop the torrent: close sessions, announce stopped, flush resume.
    /// The engine can be started again. Idempotent.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    /// Stop and release every resource. Idempotent; waits until the
    /// engine has finished closing, so no storage or resume writes happen
    /// after this returns.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
        let mut stats_rx = self.stats_rx.clone();
        // Either the state reaches Closed or the controller is gone.
        let _ = stats_rx
            .wait_for(|stats| stats.state == TorrentState::Closed)
            .await;
    }

    /// Current statistics snapshot. Keeps returning the last snapshot
    /// after close.
    pub fn stats(&self) -> Stats {
        self.stats_rx.borrow().clone()
    }

    /// Resolves once, the first time the torrent reaches 100% in this
    /// process run. Returns immediately if the engine closed first.
    pub async fn notify_complete(&self) {
        let mut complete_rx = self.complete_rx.clone();
        let _ = complete_rx.wait_for(|done| *done).await;
    }

    /// Resolves with the fatal error that auto-stopped the engine, or
    /// `None` if the engine closed without one.
    pub async fn notify_error(&self) -> Option<FatalError> {
        let mut error_rx = self.error_rx.clone();
        let result = match error_rx.wait_for(|e| e.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        result
    }
}
