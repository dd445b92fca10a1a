//! Perceptual image database.
//!
//! Images are fingerprinted with a DCT hash and stored in a BK-tree so that
//! near duplicates of a new image can be found without scanning the whole
//! collection.

pub mod commands;
pub mod config;
pub mod core;
pub mod database;
pub mod services;

pub use crate::core::{BkTree, Hamming, HashSource, HashValue, Metric, Query};
pub use database::ImageDb;
