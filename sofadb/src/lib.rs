pub mod database;
pub mod document;
pub mod engine;
pub mod error;
pub mod reader;
pub mod sequence;
pub mod view;
pub mod writer;

pub use database::{Database, DbStat};
pub use document::{DesignDocument, DesignDocumentView, Document};
pub use engine::Engine;
pub use error::{Result, SofaError};
