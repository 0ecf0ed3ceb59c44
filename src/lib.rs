//! # sync2rag
//!
//! Incrementally mirror a tree of source documents into a RAG knowledge base.
//!
//! Documents are scanned and fingerprinted, converted to markdown by a
//! conversion service, optionally enriched with image captions, and pushed to
//! an ingestion service. Every stage is driven by persisted manifests, so a
//! re-run only touches what changed and an interrupted run resumes where it
//! stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌──────────────┐   ┌─────────────┐
//! │  input/   │──▶│  Scanner  │──▶│  Conversion  │──▶│ Reconciler  │──▶ remote store
//! │  tree     │   │ + diff    │   │  + captions  │   │ plan/apply  │
//! └───────────┘   └─────┬─────┘   └──────┬───────┘   └──────┬──────┘
//!                       │                │                  │
//!                       ▼                ▼                  ▼
//!                 scan_index.json   data/markdown/…   remote_index.json
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sync2rag scan                 # fingerprint the tree, persist the manifest
//! sync2rag changes              # show what changed since the last scan
//! sync2rag run                  # scan + convert + sync
//! sync2rag sync                 # push the last converted state only
//! sync2rag clear --all          # delete remote docs, artifacts and state
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Manifests, changesets, remote operations |
//! | [`fingerprint`] | Content hashing |
//! | [`scanner`] | Tree walk and change detection |
//! | [`manifest`] | Atomic persistence and diffing |
//! | [`convert`] | Conversion driver |
//! | [`markdown`] | Image link rewriting and public URLs |
//! | [`caption`] | Vision-model captions and caption cache |
//! | [`reconcile`] | Remote sync planning and execution |
//! | [`state`] | Command coordinator, single owner of state |
//! | [`backends`] | Collaborator traits |
//! | [`docling`] | Conversion service client |
//! | [`lightrag`] | Ingestion service client |

pub mod backends;
pub mod cancel;
pub mod caption;
pub mod clear;
pub mod config;
pub mod convert;
pub mod docling;
pub mod error;
pub mod fingerprint;
pub mod lightrag;
pub mod lock;
pub mod manifest;
pub mod markdown;
pub mod models;
pub mod progress;
pub mod reconcile;
pub mod scanner;
pub mod state;
pub mod summary;
