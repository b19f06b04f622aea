use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::models::RawRecord;
use crate::normalize::parse_played_at;

/// A user's recent play history, oldest first.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_history(&self, limit_per_page: u32) -> Result<Vec<RawRecord>, IngestError>;
}

#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub items: Vec<RawRecord>,
    /// Cursor for the following page; `None` on the last page.
    pub next: Option<String>,
}

/// One request against the upstream feed.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&str>, limit: u32) -> Result<HistoryPage, IngestError>;
}

/// Walks every page a `PageFetcher` exposes and hands back the whole window
/// sorted by play time.
///
/// The provider caps the window to a small recent history, so materialising
/// it all before sorting is fine. A streaming merge would be needed if that
/// cap ever went away.
pub struct PagedHistory<F> {
    fetcher: F,
    max_pages: usize,
}

impl<F: PageFetcher> PagedHistory<F> {
    pub fn new(fetcher: F, max_pages: usize) -> Self {
        Self { fetcher, max_pages }
    }
}

#[async_trait]
impl<F: PageFetcher> HistorySource for PagedHistory<F> {
    async fn fetch_history(&self, limit_per_page: u32) -> Result<Vec<RawRecord>, IngestError> {
        let mut items = Vec::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = self
                .fetcher
                .fetch_page(cursor.as_deref(), limit_per_page)
                .await?;
            pages += 1;
            tracing::debug!("page {} returned {} items", pages, page.items.len());
            items.extend(page.items);

            let Some(next) = page.next else {
                break;
            };
            if !seen_cursors.insert(next.clone()) {
                tracing::warn!("upstream repeated cursor {}, stopping pagination", next);
                break;
            }
            if pages >= self.max_pages {
                tracing::warn!(
                    "stopping after {} pages with a cursor still pending",
                    self.max_pages
                );
                break;
            }
            cursor = Some(next);
        }

        sort_chronologically(&mut items);
        tracing::info!("fetched {} plays across {} pages", items.len(), pages);

        Ok(items)
    }
}

/// Ascending by play time. Items whose stamp does not parse go first, in raw
/// string order, and will be rejected by the normalizer anyway.
pub fn sort_chronologically(items: &mut [RawRecord]) {
    items.sort_by_cached_key(|item| {
        let raw = item.played_at().unwrap_or_default().to_string();
        (parse_played_at(&raw).ok(), raw)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{play, FakePages};

    #[tokio::test]
    async fn follows_every_page_until_no_cursor() {
        let fetcher = FakePages::generated(3, 50);
        let history = PagedHistory::new(fetcher.clone(), 20);

        let items = history.fetch_history(50).await.unwrap();

        assert_eq!(items.len(), 150);
        assert_eq!(
            fetcher.requests(),
            vec![None, Some("page-1".to_string()), Some("page-2".to_string())]
        );
        assert_eq!(fetcher.limits(), vec![50, 50, 50]);
    }

    #[tokio::test]
    async fn result_is_sorted_ascending() {
        let fetcher = FakePages::new(vec![
            vec![
                play("c", "2024-01-01T10:00:02.000Z"),
                play("b", "2024-01-01T10:00:01.000Z"),
            ],
            vec![play("a", "2024-01-01T10:00:00.000Z")],
        ]);
        let items = PagedHistory::new(fetcher, 20).fetch_history(2).await.unwrap();

        let stamps: Vec<_> = items.iter().map(|i| i.played_at().unwrap()).collect();
        assert_eq!(
            stamps,
            vec![
                "2024-01-01T10:00:00.000Z",
                "2024-01-01T10:00:01.000Z",
                "2024-01-01T10:00:02.000Z"
            ]
        );
    }

    #[test]
    fn sorting_uses_time_not_string_when_fraction_widths_differ() {
        let mut items = vec![
            play("later", "2024-01-01T10:00:00.1Z"),
            play("earlier", "2024-01-01T10:00:00.05Z"),
            play("bad", "not-a-time"),
        ];
        sort_chronologically(&mut items);

        let ids: Vec<_> = items
            .iter()
            .map(|i| i.get_str(&["track", "id"]).unwrap())
            .collect();
        assert_eq!(ids, vec!["bad", "earlier", "later"]);
    }

    #[tokio::test]
    async fn stops_at_page_cap() {
        let fetcher = FakePages::generated(5, 2);
        let items = PagedHistory::new(fetcher.clone(), 2)
            .fetch_history(2)
            .await
            .unwrap();

        assert_eq!(items.len(), 4);
        assert_eq!(fetcher.requests().len(), 2);
    }

    #[tokio::test]
    async fn stops_on_repeated_cursor() {
        let fetcher = FakePages::looping(vec![play("a", "2024-01-01T10:00:00.000Z")]);
        let items = PagedHistory::new(fetcher.clone(), 20)
            .fetch_history(1)
            .await
            .unwrap();

        assert_eq!(fetcher.requests().len(), 2);
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn authentication_failure_propagates() {
        let fetcher = FakePages::failing(IngestError::Authentication("token expired".into()));
        let err = PagedHistory::new(fetcher, 20)
            .fetch_history(50)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Authentication(_)));
    }
}
