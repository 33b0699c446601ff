use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReaderError, Result};

/// One entry of a remote book's authoritative chapter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalChapter {
    pub index: u32,
    pub link: String,
    pub title: String,
}

pub trait ContentFetcher: Send + Sync {
    /// Full chapter list for `source_ref`. `latest_hint` lets paged sources
    /// stop early once the expected newest title has been seen.
    fn fetch_chapter_list(
        &self,
        source_ref: &str,
        latest_hint: Option<&str>,
    ) -> Result<Vec<CanonicalChapter>>;

    /// Text of fragment `fragment_no` (1-based) of a chapter.
    fn fetch_fragment(&self, chapter: &CanonicalChapter, fragment_no: u32) -> Result<String>;

    fn probe_latest_title(&self, _source_ref: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Link of sub-page `fragment_no` for chapters split across several pages:
/// `.../12.html` becomes `.../12_2.html`.
pub fn fragment_link(link: &str, fragment_no: u32) -> Option<String> {
    if fragment_no <= 1 {
        return Some(link.to_string());
    }
    link.strip_suffix(".html")
        .map(|stem| format!("{stem}_{fragment_no}.html"))
}

/// In-memory catalogue that performs no network calls. Serves as the offline
/// fetcher and as the test double for the cache and prefetcher.
#[derive(Default)]
pub struct StaticContentFetcher {
    lists: Mutex<HashMap<String, Vec<CanonicalChapter>>>,
    fragments: Mutex<HashMap<String, Vec<String>>>,
    latest: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    list_calls: AtomicUsize,
    fragment_calls: AtomicUsize,
}

impl StaticContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps before every fragment fetch, to widen race windows in tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Registers a book whose chapter `i` (1-based) is `chapters[i-1]`, each
    /// given as `(title, fragments)`. Links are `{source_ref}/{i}.html`.
    pub fn with_book(self, source_ref: &str, chapters: Vec<(&str, Vec<&str>)>) -> Self {
        let mut list = Vec::with_capacity(chapters.len());
        for (pos, (title, parts)) in chapters.into_iter().enumerate() {
            let chapter = CanonicalChapter {
                index: pos as u32 + 1,
                link: format!("{source_ref}/{}.html", pos + 1),
                title: title.to_string(),
            };
            self.set_fragments(&chapter.link, parts.into_iter().map(str::to_string).collect());
            list.push(chapter);
        }
        self.set_chapter_list(source_ref, list);
        self
    }

    pub fn set_chapter_list(&self, source_ref: &str, list: Vec<CanonicalChapter>) {
        if let Ok(mut lists) = self.lists.lock() {
            lists.insert(source_ref.to_string(), list);
        }
    }

    /// Appends a chapter to an already registered book and returns it.
    pub fn push_chapter(&self, source_ref: &str, title: &str, parts: Vec<&str>) -> Option<CanonicalChapter> {
        let chapter = {
            let mut lists = self.lists.lock().ok()?;
            let list = lists.get_mut(source_ref)?;
            let index = list.last().map(|c| c.index + 1).unwrap_or(1);
            let chapter = CanonicalChapter {
                index,
                link: format!("{source_ref}/{index}.html"),
                title: title.to_string(),
            };
            list.push(chapter.clone());
            chapter
        };
        self.set_fragments(&chapter.link, parts.into_iter().map(str::to_string).collect());
        Some(chapter)
    }

    pub fn set_fragments(&self, link: &str, parts: Vec<String>) {
        if let Ok(mut fragments) = self.fragments.lock() {
            fragments.insert(link.to_string(), parts);
        }
    }

    pub fn set_latest(&self, source_ref: &str, title: &str) {
        if let Ok(mut latest) = self.latest.lock() {
            latest.insert(source_ref.to_string(), title.to_string());
        }
    }

    /// Makes every fetch of `link` fail with a network error.
    pub fn fail_link(&self, link: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(link.to_string());
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fragment_calls(&self) -> usize {
        self.fragment_calls.load(Ordering::SeqCst)
    }
}

impl ContentFetcher for StaticContentFetcher {
    fn fetch_chapter_list(
        &self,
        source_ref: &str,
        _latest_hint: Option<&str>,
    ) -> Result<Vec<CanonicalChapter>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let lists = self
            .lists
            .lock()
            .map_err(|_| ReaderError::network("catalogue lock poisoned"))?;
        lists
            .get(source_ref)
            .cloned()
            .ok_or_else(|| ReaderError::network(format!("unknown source {source_ref}")))
    }

    fn fetch_fragment(&self, chapter: &CanonicalChapter, fragment_no: u32) -> Result<String> {
        self.fragment_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let failing = self
            .failing
            .lock()
            .map(|failing| failing.contains(&chapter.link))
            .unwrap_or(false);
        if failing {
            return Err(ReaderError::network(format!("fetch failed: {}", chapter.link)));
        }
        let fragments = self
            .fragments
            .lock()
            .map_err(|_| ReaderError::network("catalogue lock poisoned"))?;
        fragments
            .get(&chapter.link)
            .and_then(|parts| parts.get(fragment_no.saturating_sub(1) as usize))
            .cloned()
            .ok_or_else(|| {
                ReaderError::network(format!("no fragment {fragment_no} for {}", chapter.link))
            })
    }

    fn probe_latest_title(&self, source_ref: &str) -> Result<Option<String>> {
        let latest = self
            .latest
            .lock()
            .map_err(|_| ReaderError::network("catalogue lock poisoned"))?;
        Ok(latest.get(source_ref).cloned())
    }
}

#[cfg(feature = "remote-http")]
pub use http::HttpContentFetcher;

#[cfg(feature = "remote-http")]
mod http {
    use std::time::Duration;

    use serde::Deserialize;
    use url::Url;

    use super::{fragment_link, CanonicalChapter, ContentFetcher};
    use crate::error::{ReaderError, Result};
    use crate::settings::ReaderSettings;
    use crate::text::chapters::clean_heading_title;
    use crate::text::decode::decode_text;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ListingPage {
        #[serde(default)]
        chapters: Vec<ListingEntry>,
        #[serde(default)]
        has_more: bool,
        #[serde(default)]
        latest: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct ListingEntry {
        title: String,
        link: String,
    }

    /// Fetches chapter listings as paged JSON and chapter text as plain bodies.
    pub struct HttpContentFetcher {
        client: reqwest::blocking::Client,
        max_list_pages: u32,
    }

    impl HttpContentFetcher {
        pub fn new(settings: &ReaderSettings) -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(settings.request_timeout_secs))
                .user_agent(settings.user_agent.clone())
                .build()?;
            Ok(Self {
                client,
                max_list_pages: settings.max_list_pages.max(1),
            })
        }

        fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
            let resp = self.client.get(url).send()?;
            if !resp.status().is_success() {
                return Err(ReaderError::network(format!("HTTP {} for {}", resp.status(), url)));
            }
            Ok(resp.bytes()?.to_vec())
        }

        fn listing_page(&self, base: &Url, page: u32) -> Result<ListingPage> {
            let mut url = base.clone();
            url.query_pairs_mut().append_pair("page", &page.to_string());
            let bytes = self.get_bytes(url.as_str())?;
            Ok(serde_json::from_slice(&bytes)?)
        }
    }

    impl ContentFetcher for HttpContentFetcher {
        fn fetch_chapter_list(
            &self,
            source_ref: &str,
            latest_hint: Option<&str>,
        ) -> Result<Vec<CanonicalChapter>> {
            let base = Url::parse(source_ref)?;
            let hint = latest_hint.map(clean_heading_title);
            let mut out: Vec<CanonicalChapter> = Vec::new();

            for page in 1..=self.max_list_pages {
                let listing = self.listing_page(&base, page)?;
                let reached_hint = match (&hint, listing.chapters.last()) {
                    (Some(hint), Some(last)) => clean_heading_title(&last.title) == *hint,
                    _ => false,
                };
                let empty = listing.chapters.is_empty();
                for entry in listing.chapters {
                    let link = base.join(&entry.link)?;
                    out.push(CanonicalChapter {
                        index: out.len() as u32 + 1,
                        link: link.to_string(),
                        title: clean_heading_title(&entry.title),
                    });
                }
                if !listing.has_more || reached_hint || empty {
                    break;
                }
                if page == self.max_list_pages {
                    log::warn!("[fetcher] listing for {} truncated at {} pages", source_ref, page);
                }
            }
            Ok(out)
        }

        fn fetch_fragment(&self, chapter: &CanonicalChapter, fragment_no: u32) -> Result<String> {
            let url = fragment_link(&chapter.link, fragment_no).ok_or_else(|| {
                ReaderError::not_found(format!("{} has no sub-pages", chapter.link))
            })?;
            let bytes = self.get_bytes(&url)?;
            Ok(decode_text(&bytes))
        }

        fn probe_latest_title(&self, source_ref: &str) -> Result<Option<String>> {
            let base = Url::parse(source_ref)?;
            let listing = self.listing_page(&base, 1)?;
            Ok(listing.latest.map(|title| clean_heading_title(&title)))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_link_numbers_html_pages() {
        assert_eq!(fragment_link("http://x/b/3.html", 1).as_deref(), Some("http://x/b/3.html"));
        assert_eq!(fragment_link("http://x/b/3.html", 2).as_deref(), Some("http://x/b/3_2.html"));
        assert_eq!(fragment_link("http://x/b/3", 2), None);
    }

    #[test]
    fn static_fetcher_serves_registered_books() {
        let fetcher = StaticContentFetcher::new().with_book(
            "mem://novel",
            vec![("第1章", vec!["one", "one-b"]), ("第2章", vec!["two"])],
        );
        let list = fetcher.fetch_chapter_list("mem://novel", None).expect("list");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].link, "mem://novel/2.html");
        assert_eq!(fetcher.fetch_fragment(&list[0], 2).expect("fragment"), "one-b");
        assert!(fetcher.fetch_fragment(&list[1], 2).is_err());
        assert_eq!(fetcher.list_calls(), 1);
        assert_eq!(fetcher.fragment_calls(), 2);
    }

    #[test]
    fn static_fetcher_can_fail_and_grow() {
        let fetcher = StaticContentFetcher::new().with_book("mem://b", vec![("第1章", vec!["x"])]);
        let added = fetcher.push_chapter("mem://b", "第2章", vec!["y"]).expect("push");
        assert_eq!(added.index, 2);
        fetcher.fail_link(&added.link);
        assert!(matches!(
            fetcher.fetch_fragment(&added, 1),
            Err(ReaderError::Network(_))
        ));
        assert!(fetcher.fetch_chapter_list("mem://missing", None).is_err());
    }
}
