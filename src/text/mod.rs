pub mod chapters;
pub mod decode;
pub mod layout;

pub use chapters::{detect_chapters, fallback_title, is_chapter_heading, ChapterRecord};
pub use decode::{decode_text, read_text_lines, split_lines};
pub use layout::{page_count, paginate, PageSlice, Viewport};
