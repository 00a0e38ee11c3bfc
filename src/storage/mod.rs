//! Storage layer
//!
//! # Architecture
//!
//! The gateway never talks to a document engine directly. Everything goes
//! through the [`StorageDriver`] trait, wrapped by a [`Storage`] handle that
//! bounds every call with a timeout:
//!
//! ```text
//! Storage (timeout, sessions/transactions)
//!   └─→ dyn StorageDriver
//!        └─→ Databases
//!             └─→ Collections (unique indexes)
//!                  └─→ Documents (engine-assigned DocumentId + JSON body)
//! ```
//!
//! ## Implementation
//!
//! [`MemoryDriver`] is the in-process engine used by the admin binary and
//! the test suite. Production deployments plug a network driver in behind
//! the same trait.

pub mod document;
pub mod driver;
pub mod filter;
pub mod memory;

pub use document::{strip_identity, Document, DocumentId, StoredDocument, ID_ALIASES, ID_FIELD};
pub use driver::{FindOptions, Session, Storage, StorageDriver, Transaction, UpdateResult};
pub use filter::{Filter, IdClause, Update};
pub use memory::MemoryDriver;
