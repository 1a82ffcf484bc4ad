#![forbid(unsafe_code)]
#![warn(missing_docs)]
//! # charla-document
//!
//! JSON document store with secondary indexes and aggregation pipelines for
//! charla

pub mod document;
