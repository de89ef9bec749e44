#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(
        clippy::unreadable_literal,
        clippy::cognitive_complexity,
        clippy::match_like_matches_macro,
        clippy::derive_partial_eq_without_eq
    )
)]

pub mod options;

pub use ::bson;

mod bson_util;
mod client;
mod cmap;
mod compression;
mod concern;
pub mod counters;
mod cursor;
pub mod error;
pub mod event;
mod hello;
mod namespace;
mod operation;
pub mod results;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod serde_util;

pub use crate::{
    client::{
        session::{ClientSession, ClusterTime},
        Client,
    },
    cmap::conn::ConnectionInfo,
    cursor::Cursor,
    namespace::Namespace,
    sdam::public::{ServerInfo, ServerType, TopologyType},
};

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
