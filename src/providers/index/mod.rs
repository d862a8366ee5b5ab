//! Search index access.
//!
//! - [`SearchIndex`] - trait the delivery pipeline writes through
//! - [`ElasticsearchIndex`] - REST implementation

mod elasticsearch;
mod traits;

pub use elasticsearch::ElasticsearchIndex;
pub use traits::{IndexDocument, IndexError, IndexResult, SearchIndex, SearchQuery};
