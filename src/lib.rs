//! Paginated novel reader core: chapter detection, page layout, a
//! disk-backed chapter cache for online books and per-book reading progress.

pub mod error;
pub mod library;
pub mod progress;
pub mod reader;
pub mod settings;
pub mod text;

pub use error::{ReaderError, Result};
pub use library::{BookListing, CanonicalChapter, ChapterCache, ContentFetcher, LocalBook};
pub use progress::{
    BookSource, InMemoryProgressStore, JsonProgressStore, ProgressKey, ProgressRecord, ProgressStore,
};
#[cfg(feature = "progress-sqlite")]
pub use progress::SqliteProgressStore;
pub use reader::{Book, ReaderApp, ReaderCommand, ReaderEvent, ReaderSession, ScreenView};
pub use settings::ReaderSettings;
pub use text::Viewport;
