//! # libs3csi - CSI driver for S3-compatible object storage
//!
//! `libs3csi` exposes buckets (or prefixes inside a shared bucket) of an
//! S3-compatible store as volumes through a lightweight
//! [Container Storage Interface][csi] layer carried over QUIC (via
//! [`quinn`]).  Volumes are mounted on nodes with a FUSE filesystem and
//! bind-mounted into workloads.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `VolumeId` codec, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`config`] | Per-request store credentials and driver options. |
//! | [`store`] | Object store client with bulk and one-by-one deletion. |
//! | [`lock`] | Per-volume in-flight registry. |
//! | [`mount`] | Stage/publish orchestration and FUSE mounters. |
//! | [`driver`] | [`S3Driver`], implementing all three CSI services. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait - plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait - volume create/delete. |
//! | [`node`] | [`CsiNode`] trait - stage, publish, unpublish, unstage. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod lock;
pub mod message;
pub mod mount;
pub mod node;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{DriverOptions, StoreConfig};
pub use controller::CsiController;
pub use driver::S3Driver;
pub use error::{CsiError, StatusCode};
pub use identity::CsiIdentity;
pub use lock::VolumeLocks;
pub use message::CsiMessage;
pub use mount::{HostMounts, MountOrchestrator, SystemMounts};
pub use node::CsiNode;
pub use store::{S3Connector, StoreConnector};
pub use types::*;
