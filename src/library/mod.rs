pub mod cache;
pub mod fetcher;
pub mod flight;
pub mod local;

pub use cache::{BookListing, BookMeta, CachedBookSummary, CachedChapter, ChapterCache};
#[cfg(feature = "remote-http")]
pub use fetcher::HttpContentFetcher;
pub use fetcher::{CanonicalChapter, ContentFetcher, StaticContentFetcher};
pub use flight::{FetchSnapshot, FetchState, FlightKey, FlightTracker};
pub use local::{group_by_root, latest_chapter, merge_progress, scan_local_library, LocalBook};
