//! Core package database components
//!
//! This module contains the immutable package store, the feed-layered
//! package database, binary persistence, and the live resolution layer.

pub mod artifact;
pub mod cache;
pub mod database;
pub mod feed;
pub mod io;
pub mod live;
pub mod package;
pub mod store;
