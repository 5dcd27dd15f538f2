//! # tidal
//!
//! An embeddable per-torrent BitTorrent engine.
//!
//! Given an already-parsed [`Info`] dictionary, a listen port, and a
//! [`Storage`] backend, the engine drives a torrent from announce through
//! piece acquisition to seeding: tracker tiers with failover (BEP 12,
//! HTTP and UDP), peer sessions with the standard choking algorithm,
//! rarest-first piece selection with an end-game phase, SHA-1
//! verification before any piece is advertised, and resume persistence
//! through a pluggable [`Resume`] backend.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidal::{MemoryStorage, Torrent};
//!
//! # async fn example(info: tidal::Info) -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(MemoryStorage::new(info.piece_length, info.total_size));
//! let torrent = Torrent::new(info, 6881, storage)?;
//!
//! torrent.start().await;
//! torrent.notify_complete().await;
//! println!("done: {:?}", torrent.stats());
//! torrent.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Parsing .torrent files, choosing file layouts on disk, and fetching
//! metadata for magnet links are the embedding program's concerns; the
//! engine consumes their results through [`Info`], [`Storage`], and
//! [`Torrent::set_info`].

pub mod acceptor;
pub mod allocator;
pub mod bencode;
pub mod bitfield;
pub mod choker;
pub mod config;
pub mod controller;
pub mod dialer;
pub mod error;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod resume;
pub mod stats;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use bitfield::Bitfield;
pub use config::Config;
pub use error::{
    EngineError, FatalError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind,
};
pub use magnet::MagnetUri;
pub use metainfo::{FileInfo, Info, Sha1Hash};
pub use piece::BLOCK_SIZE;
pub use resume::{FileResume, MemoryResume, Resume, ResumeRecord};
pub use stats::{Stats, TorrentState};
pub use storage::{MemoryStorage, Storage};
pub use torrent::Torrent;
