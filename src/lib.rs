//! # Catalog Ingest
//!
//! Asynchronous bulk import of product catalog rows from CSV.
//!
//! A client submits CSV text; the API records a job and hands it to a queue.
//! A worker consumes the message, parses each row, creates any missing
//! categories and subcategories, inserts the product, and keeps the job's
//! progress current so clients can poll it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────────┐   ┌──────────┐
//! │ HTTP/CLI │──▶│ Job store │   │ Queue       │──▶│  Worker  │
//! │  submit  │──▶│  (Queued) │   │ AMQP/local  │   │ process  │
//! └──────────┘   └─────▲─────┘   └──────▲──────┘   └────┬─────┘
//!      │               │                │               │
//!      └───────────────┼── publish ─────┘               │
//!                      └────── progress / outcome ──────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! catalog-ingest init                       # create database
//! catalog-ingest serve                      # API plus in-process worker
//! catalog-ingest submit products.csv        # queue a file (AMQP broker)
//! catalog-ingest status <job-id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Jobs, messages, candidate records |
//! | [`error`] | Error taxonomy and row-level classification |
//! | [`store`] | Job and catalog persistence (SQLite, in-memory) |
//! | [`csv_row`] | Line splitting and header-driven field mapping |
//! | [`materializer`] | Category/subcategory/product creation |
//! | [`processor`] | Per-job row loop with progress reporting |
//! | [`progress`] | Progress reporter implementations |
//! | [`queue`] | Message handler plus AMQP and local transports |
//! | [`service`] | Job lifecycle operations behind the API |
//! | [`server`] | HTTP API |
//! | [`app`] | Wiring from configuration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod config;
pub mod csv_row;
pub mod db;
pub mod error;
pub mod materializer;
pub mod migrate;
pub mod models;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod server;
pub mod service;
pub mod store;
