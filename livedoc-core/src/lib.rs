//! Core types for the livedoc embedded document store.
//!
//! This crate holds everything that does not need the engine:
//!
//! - **Documents** ([`document`]) - dotted paths, ids and typed conversions
//! - **Queries** ([`query`]) - the typed query tree, its parser and find options
//! - **Modifiers** ([`modifier`]) - typed update specifications
//! - **Grouping** ([`aggregate`]) - group specifications for derived cursors
//! - **Configuration** ([`config`]) - TTL indexes and sweep interval
//! - **Persistence** ([`storage`]) - the asynchronous storage adapter trait
//! - **Error handling** ([`error`]) - error and result types
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use livedoc_core::{query::Query, modifier::Modifier};
//!
//! let query = Query::from(doc! { "age": { "$gte": 18 } });
//! let modifier = Modifier::new().set("adult", true);
//! ```

#[allow(unused_extern_crates)]
extern crate self as livedoc_core;

pub mod aggregate;
pub mod config;
pub mod document;
pub mod error;
pub mod modifier;
pub mod query;
pub mod storage;
