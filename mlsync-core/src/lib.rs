mod error;
mod indexer;
mod item;

pub use error::{FailureKind, IndexingError, translate_upload_error};
pub use indexer::IndexerClient;
pub use item::{Identity, IdentityError, ItemId, ItemMetadata, MediaKind};
