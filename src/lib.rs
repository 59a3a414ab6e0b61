//! # Clause Haus
//!
//! Checks German rental contracts for clauses that conflict with statute
//! law and sells the analysis through an asynchronous, payment-gated job
//! protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────────────────────┐
//! │   HTTP   │──▶│ Job service │──▶│ Pipeline                     │
//! │ MIP-003  │   │ + payments  │   │ OCR▸chunk▸embed▸rank▸analyze │
//! └──────────┘   └──────┬──────┘   └──────────────┬───────────────┘
//!                       │                         │ resilient calls
//!                       ▼                         ▼
//!                 ┌───────────┐           ┌──────────────┐
//!                 │  SQLite   │           │ OpenAI /     │
//!                 │ jobs+cache│           │ Mistral APIs │
//!                 └───────────┘           └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! clause-haus init                              # create database
//! clause-haus corpus load ./bgb_sections.json   # embed statute corpus
//! clause-haus analyze ./mietvertrag.pdf         # one-off analysis
//! clause-haus serve                             # start the job server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Provider error classification |
//! | [`resilient`] | Rate limiting and retry around external calls |
//! | [`models`] | Core data types |
//! | [`store`] | Persistence trait with SQLite and in-memory backends |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`document`] | Document references and loading |
//! | [`fingerprint`] | Content fingerprints |
//! | [`cache`] | Fingerprint-keyed analysis cache |
//! | [`chunk`] | Heading-aware contract chunking |
//! | [`ranker`] | Statute similarity ranking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`chat`] | Structured chat completions |
//! | [`ocr`] | PDF text extraction |
//! | [`analyzer`] | Batch clause analysis |
//! | [`report`] | Markdown report rendering |
//! | [`pipeline`] | Pipeline orchestration |
//! | [`payment`] | Payment gateway |
//! | [`jobs`] | Job state machine |
//! | [`server`] | HTTP job protocol |
//! | [`corpus`] | Statute corpus loading |

pub mod analyzer;
pub mod cache;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod corpus;
pub mod db;
pub mod document;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod payment;
pub mod pipeline;
pub mod ranker;
pub mod report;
pub mod resilient;
pub mod server;
pub mod store;
