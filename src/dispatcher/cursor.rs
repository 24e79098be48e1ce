use std::sync::Arc;

use crate::middleware::{Chain, MiddlewareEntry};

/// Which half of a chain the cursor walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Normal,
    Error,
}

/// Position of a request inside its chain.
///
/// The cursor only moves forward: within a segment by [`Cursor::advance`],
/// and from the normal segment into the error segment by [`Cursor::divert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    segment: Segment,
    index: usize,
}

impl Cursor {
    pub(crate) fn start() -> Self {
        Self {
            segment: Segment::Normal,
            index: 0,
        }
    }

    #[must_use]
    pub fn segment(&self) -> Segment {
        self.segment
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn in_error_segment(&self) -> bool {
        self.segment == Segment::Error
    }

    /// Entry under the cursor, `None` once the current segment is exhausted.
    pub(crate) fn entry<'c>(&self, chain: &'c Chain) -> Option<&'c Arc<MiddlewareEntry>> {
        match self.segment {
            Segment::Normal => chain.normal(self.index),
            Segment::Error => chain.error_handler(self.index),
        }
    }

    /// Move to the next entry of the current segment.
    pub(crate) fn advance(&mut self) {
        self.index += 1;
    }

    /// React to an error raised at the current position.
    ///
    /// From the normal segment this jumps to the first error handler. Inside
    /// the error segment the walk continues with the handler after the one
    /// that failed, so a faulty handler can never loop.
    pub(crate) fn divert(&mut self) {
        match self.segment {
            Segment::Normal => {
                self.segment = Segment::Error;
                self.index = 0;
            }
            Segment::Error => self.index += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RequestContext;
    use crate::middleware::{Flow, MiddlewareRegistry};

    fn chain() -> Arc<Chain> {
        let registry = MiddlewareRegistry::new();
        registry.use_all("a", |_: &mut RequestContext| Flow::Next).unwrap();
        registry.use_all("b", |_: &mut RequestContext| Flow::Next).unwrap();
        registry.use_error("e1", |_: &mut RequestContext| Flow::Next).unwrap();
        registry.use_error("e2", |_: &mut RequestContext| Flow::Next).unwrap();
        registry.compile("/")
    }

    #[test]
    fn test_walks_normal_segment_then_exhausts() {
        let chain = chain();
        let mut cursor = Cursor::start();
        assert_eq!(cursor.entry(&chain).map(|e| &*e.name), Some("a"));
        cursor.advance();
        assert_eq!(cursor.entry(&chain).map(|e| &*e.name), Some("b"));
        cursor.advance();
        assert!(cursor.entry(&chain).is_none());
        assert!(!cursor.in_error_segment());
    }

    #[test]
    fn test_divert_from_normal_starts_error_segment() {
        let chain = chain();
        let mut cursor = Cursor::start();
        cursor.divert();
        assert_eq!(cursor.segment(), Segment::Error);
        assert_eq!(cursor.entry(&chain).map(|e| &*e.name), Some("e1"));
    }

    #[test]
    fn test_divert_inside_error_segment_moves_past_failing_handler() {
        let chain = chain();
        let mut cursor = Cursor::start();
        cursor.advance();
        cursor.divert();
        cursor.divert();
        assert_eq!(cursor.index(), 1);
        assert_eq!(cursor.entry(&chain).map(|e| &*e.name), Some("e2"));
        cursor.divert();
        assert!(cursor.entry(&chain).is_none());
    }
}
