pub mod app;
pub mod book;
pub mod events;
pub mod prefetch;
pub mod session;

pub use app::{run, ReaderApp, ScreenView};
pub use book::{Book, ChapterIndex, LoadedChapter, TocEntry};
pub use events::{ReaderCommand, ReaderEvent};
pub use prefetch::{prefetch_window, PrefetchReport, Prefetcher};
pub use session::{ReadPosition, ReaderSession};
