//! Remote storage API access
//!
//! Token lifecycle, the retrying fetcher and the storage client built on it.

pub mod errors;
pub mod fetcher;
pub mod files;
pub mod token;
pub mod transport;
pub mod types;

pub use errors::{ApiError, AuthError, StatusClass};
pub use fetcher::ResilientFetcher;
pub use files::StorageClient;
pub use token::TokenManager;
pub use transport::{ApiRequest, ApiResponse, HttpMethod, HttpTransport, ReqwestTransport};
pub use types::{EntryKind, FileEntry, SpaceUsage};
