//! docubot - upload documents and ask questions answered from their content.
//!
//! Uploaded files are split into overlapping chunks, embedded and stored in
//! a persistent vector index next to a small metadata store. Questions are
//! routed to the relevant files, answered from the best matching chunks and
//! returned with the list of source files.
//!
//! The same [`DocService`] backs the CLI, the HTTP API ([`web`]) and the MCP
//! server ([`mcp`]).
//!
//! # Quick start
//!
//! ```no_run
//! use docubot::{DataDir, DocService};
//!
//! # async fn demo() -> docubot::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let service = DocService::open(data_dir)?;
//!
//! let report = service
//!     .ingest("handbook.md", b"Vacation requests go to HR.".to_vec())
//!     .await?;
//! println!("stored {} as {}", report.filename, report.id);
//!
//! let answer = service.chat("Who handles vacation requests?", None).await?;
//! println!("{} (sources: {:?})", answer.answer, answer.sources);
//! # Ok(())
//! # }
//! ```

pub mod answerer;
pub mod blocking;
pub mod chunking;
pub mod cli;
pub mod data_dir;
pub mod deletion;
pub mod doc_id;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod filter;
pub mod ingestion;
pub mod mcp;
pub mod metadata_store;
pub mod openai;
pub mod query;
pub mod reconcile;
pub mod reset;
pub mod resilience;
pub mod service;
pub mod session;
pub mod settings;
pub mod text_util;
pub mod vector_index;
pub mod web;

pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use error::{Error, Result};
pub use filter::Filter;
pub use metadata_store::MetadataStore;
pub use service::DocService;
pub use settings::Settings;
pub use vector_index::VectorIndex;
