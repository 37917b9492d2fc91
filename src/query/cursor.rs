use std::collections::VecDeque;

use super::result::{ResultPage, RowCodec};
use super::session::QuerySession;
use crate::error::DriverError;

/// Forward-only reader over a paged result table
///
/// Pages after the first are fetched through the owning session when the
/// buffered rows run out.
pub struct ResultCursor<'s, C: RowCodec> {
    session: &'s mut QuerySession,
    codec: C,
    rows: VecDeque<C::Row>,
    query_id: i64,
    following: bool,
    pages: usize,
}

impl<'s, C: RowCodec> ResultCursor<'s, C> {
    pub(crate) fn new(
        session: &'s mut QuerySession,
        codec: C,
        page: ResultPage,
        query_id: i64,
    ) -> Result<Self, DriverError> {
        let rows = codec.decode_page(&page)?.into();
        Ok(Self {
            session,
            codec,
            rows,
            query_id,
            following: page.following_exists,
            pages: 1,
        })
    }

    pub fn next_row(&mut self) -> Result<Option<C::Row>, DriverError> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Ok(Some(row));
            }
            if !self.following {
                return Ok(None);
            }
            let page = match self.session.fetch_following(self.query_id) {
                Ok(page) => page,
                Err(e) => {
                    self.following = false;
                    return Err(e);
                }
            };
            self.following = page.following_exists;
            self.pages += 1;
            self.rows.extend(self.codec.decode_page(&page)?);
        }
    }

    pub fn query_id(&self) -> i64 {
        self.query_id
    }

    /// Pages received so far, including the first
    pub fn page_count(&self) -> usize {
        self.pages
    }

    pub fn is_exhausted(&self) -> bool {
        self.rows.is_empty() && !self.following
    }
}

impl<C: RowCodec> Iterator for ResultCursor<'_, C> {
    type Item = Result<C::Row, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}
