use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::bounded;
use super::models::{EntryCursor, HistoryRange, LedgerEntry};
use super::store::LedgerStore;
use crate::error::AppResult;

pub const DEFAULT_PAGE_SIZE: i64 = 200;

/// Restartable view over a client's entries in `(created_at, id)` order.
///
/// Nothing is read until the stream is polled. The stream ends at the first
/// page shorter than the page size, or after the first error.
#[derive(Clone)]
pub struct History {
    store: Arc<dyn LedgerStore>,
    client_id: Uuid,
    range: HistoryRange,
    start_after: Option<EntryCursor>,
    page_size: i64,
    timeout: Duration,
}

struct Pager {
    history: History,
    after: Option<EntryCursor>,
    done: bool,
}

impl History {
    pub(crate) fn new(
        store: Arc<dyn LedgerStore>,
        client_id: Uuid,
        range: HistoryRange,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            client_id,
            range,
            start_after: None,
            page_size: DEFAULT_PAGE_SIZE,
            timeout,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Same history, restarted right after a previously seen entry.
    pub fn resume_after(&self, cursor: EntryCursor) -> Self {
        Self {
            start_after: Some(cursor),
            ..self.clone()
        }
    }

    pub fn stream(&self) -> BoxStream<'static, AppResult<LedgerEntry>> {
        let pager = Pager {
            history: self.clone(),
            after: self.start_after,
            done: false,
        };

        stream::unfold(pager, |mut pager| async move {
            if pager.done {
                return None;
            }

            let h = &pager.history;
            let page = bounded(
                h.timeout,
                h.store.entries_page(h.client_id, h.range, pager.after, h.page_size),
            )
            .await;

            match page {
                Ok(page) => {
                    pager.done = (page.len() as i64) < pager.history.page_size;
                    pager.after = page.last().map(LedgerEntry::cursor).or(pager.after);
                    if page.is_empty() {
                        return None;
                    }
                    let items: Vec<AppResult<LedgerEntry>> = page.into_iter().map(Ok).collect();
                    Some((items, pager))
                }
                Err(e) => {
                    pager.done = true;
                    Some((vec![Err(e)], pager))
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    /// Drains the stream; convenient for small ranges.
    pub async fn collect(&self) -> AppResult<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        let mut stream = self.stream();
        while let Some(entry) = stream.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }
}
