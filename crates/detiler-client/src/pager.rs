//! Cancellable page-by-page iteration over search results.
//!
//! Each page is one request. The cancel token is checked before a fetch
//! starts and raced against the fetch while it is in flight; either way a
//! cancelled pager yields `ClientError::Cancelled` once and then ends.

use detiler_core::config::DEFAULT_PAGE_SIZE;
use detiler_core::{Cooldown, CooldownQuery, TileQuery, TileRecord};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::client::DetilerClient;
use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TileCursor {
    Start,
    At(u64),
    Done,
}

/// Tile search pages, following the server-side cursor.
pub struct TilePager {
    client: DetilerClient,
    query: TileQuery,
    cancel: CancelToken,
    cursor: TileCursor,
}

impl TilePager {
    pub(crate) fn new(client: DetilerClient, query: TileQuery, cancel: CancelToken) -> Self {
        Self {
            client,
            query,
            cancel,
            cursor: TileCursor::Start,
        }
    }

    /// The next page, `None` once the results are exhausted.
    pub async fn next_page(&mut self) -> Option<ClientResult<Vec<TileRecord>>> {
        let cursor = self.cursor;
        if cursor == TileCursor::Done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.cursor = TileCursor::Done;
            return Some(Err(ClientError::Cancelled));
        }

        let fetch = async {
            match cursor {
                TileCursor::At(id) => self.client.read_tile_cursor(id, self.query.size).await,
                _ => self.client.query_tiles(&self.query).await,
            }
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            page = fetch => page,
        };

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.cursor = TileCursor::Done;
                return Some(Err(e));
            }
        };

        // A page shorter than an explicit size is the last one.
        let short = self.query.size.is_some_and(|size| page.tiles.len() < size);
        self.cursor = match page.cursor {
            Some(next) if next != 0 && !short => TileCursor::At(next),
            _ => TileCursor::Done,
        };
        debug!(tiles = page.tiles.len(), cursor = ?self.cursor, "tile page fetched");

        if page.tiles.is_empty() && self.cursor == TileCursor::Done {
            return None;
        }
        Some(Ok(page.tiles))
    }

    /// Drain every remaining page in arrival order.
    pub async fn collect_all(mut self) -> ClientResult<Vec<TileRecord>> {
        let mut tiles = Vec::new();
        while let Some(page) = self.next_page().await {
            tiles.extend(page?);
        }
        Ok(tiles)
    }
}

/// Cooldown search pages, advancing `from` by the page size.
pub struct CooldownPager {
    client: DetilerClient,
    query: CooldownQuery,
    cancel: CancelToken,
    done: bool,
}

impl CooldownPager {
    pub(crate) fn new(client: DetilerClient, mut query: CooldownQuery, cancel: CancelToken) -> Self {
        query.from = Some(query.from.unwrap_or(0));
        query.size = Some(query.size.unwrap_or(DEFAULT_PAGE_SIZE));
        Self {
            client,
            query,
            cancel,
            done: false,
        }
    }

    pub async fn next_page(&mut self) -> Option<ClientResult<Vec<Cooldown>>> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(ClientError::Cancelled));
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            page = self.client.query_cooldowns(&self.query) => page,
        };
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let size = self.query.size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page.len() < size {
            self.done = true;
        }
        self.query.from = Some(self.query.from.unwrap_or(0) + page.len());
        debug!(cooldowns = page.len(), from = ?self.query.from, "cooldown page fetched");

        if page.is_empty() {
            return None;
        }
        Some(Ok(page))
    }

    pub async fn collect_all(mut self) -> ClientResult<Vec<Cooldown>> {
        let mut cooldowns = Vec::new();
        while let Some(page) = self.next_page().await {
            cooldowns.extend(page?);
        }
        Ok(cooldowns)
    }
}
