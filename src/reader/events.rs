use crate::error::Result;

use super::book::Book;
use super::prefetch::PrefetchReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderCommand {
    NextPage,
    PreviousPage,
    NextChapter,
    PreviousChapter,
    /// Jump by canonical chapter index.
    JumpTo(u32),
    Resize { width: usize, height: usize },
    CheckUpdates,
    Quit,
}

/// Messages consumed by the reader loop. Background work reports back only
/// through these; it never touches reader state directly.
#[derive(Debug)]
pub enum ReaderEvent {
    Command(ReaderCommand),
    ChapterReady {
        book: String,
        canonical: u32,
        ticket: u64,
        outcome: Result<bool>,
    },
    PrefetchCompleted(PrefetchReport),
    /// A book reassembled from the cache off the loop.
    BookRebuilt {
        book: String,
        ticket: u64,
        outcome: Result<Book>,
    },
    UpdatesChecked {
        book: String,
        outcome: Result<bool>,
    },
}

impl From<ReaderCommand> for ReaderEvent {
    fn from(command: ReaderCommand) -> Self {
        ReaderEvent::Command(command)
    }
}
