//! Compiled matcher
//!
//! Matching runs one reachability pass over the id: `reach[k]` holds every
//! input position that the first `k` elements can consume exactly. From
//! that table:
//!
//! ```text
//!   id = /cal/long/100:112
//!        |--- dir ---|name|
//!
//!   complete match     the whole id is reachable after the last element
//!   path matched       "dir/" is reachable, and no remaining element
//!                      needs another separator
//!   path prefix match  "dir/" is reachable at all
//! ```
//!
//! Each flag is defined to include the stronger ones, so
//! `complete => path => prefix` always holds.

use crate::element::Element;
use crate::parser;
use filestore_common::{DataType, FsId, Result};
use std::fmt;
use tracing::debug;

/// Outcome of matching one [`FsId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub complete_match: bool,
    pub path_matched: bool,
    pub path_prefix_matched: bool,
    pub data_type: DataType,
}

/// Outcome of matching a directory while walking the id tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryMatch {
    /// Names directly inside this directory can match
    pub path_matched: bool,
    /// Some descendant of this directory can match
    pub path_prefix_matched: bool,
}

/// An immutable, compiled id pattern
#[derive(Clone)]
pub struct Matcher {
    pattern: String,
    data_type: DataType,
    elements: Vec<Element>,
    /// `tail_needs_separator[k]`: some element in `elements[k..]` must
    /// consume a separator
    tail_needs_separator: Vec<bool>,
}

impl Matcher {
    /// Compile `tag@/pattern/path`. A malformed pattern is a
    /// [`filestore_common::Error::QueryParse`].
    pub fn compile(pattern: &str) -> Result<Self> {
        let (data_type, elements) = parser::parse(pattern)?;
        let mut tail_needs_separator = vec![false; elements.len() + 1];
        for k in (0..elements.len()).rev() {
            tail_needs_separator[k] =
                tail_needs_separator[k + 1] || elements[k] == Element::Separator;
        }
        debug!(pattern, %data_type, elements = elements.len(), "compiled pattern");
        Ok(Self {
            pattern: pattern.to_string(),
            data_type,
            elements,
            tail_needs_separator,
        })
    }

    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.data_type
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Classify an id against this pattern
    #[must_use]
    pub fn matches(&self, id: &FsId) -> MatchResult {
        let input = id.as_str().as_bytes();
        let reach = self.reach(input);
        let complete_match = reach.get(self.elements.len(), input.len());
        let dir = self.classify_prefix(&reach, id.path().len() + 1);
        MatchResult {
            complete_match,
            path_matched: complete_match || dir.path_matched,
            path_prefix_matched: complete_match || dir.path_prefix_matched,
            data_type: self.data_type,
        }
    }

    /// Shorthand for `matches(id).complete_match`
    #[must_use]
    pub fn is_match(&self, id: &FsId) -> bool {
        self.matches(id).complete_match
    }

    /// Classify a directory of the id tree, given as `/a/b` or `""` for
    /// the namespace root.
    #[must_use]
    pub fn matches_directory(&self, dir: &str) -> DirectoryMatch {
        let mut input = String::with_capacity(dir.len() + 1);
        input.push_str(dir.trim_end_matches('/'));
        input.push('/');
        let reach = self.reach(input.as_bytes());
        self.classify_prefix(&reach, input.len())
    }

    fn classify_prefix(&self, reach: &Reach, prefix_len: usize) -> DirectoryMatch {
        let n = self.elements.len();
        let mut result = DirectoryMatch {
            path_matched: false,
            path_prefix_matched: false,
        };
        for k in 0..n {
            // a `*` can still be consuming input when the prefix ends
            let live = reach.get(k, prefix_len)
                || (self.elements[k] == Element::Any && reach.any_at_or_before(k, prefix_len));
            if live {
                result.path_prefix_matched = true;
                if !self.tail_needs_separator[k] {
                    result.path_matched = true;
                    break;
                }
            }
        }
        result
    }

    fn reach(&self, input: &[u8]) -> Reach {
        let n = self.elements.len();
        let mut reach = Reach::new(n + 1, input.len() + 1);
        reach.set(0, 0);
        let mut ends = Vec::new();
        for (k, element) in self.elements.iter().enumerate() {
            for at in 0..=input.len() {
                if !reach.get(k, at) {
                    continue;
                }
                ends.clear();
                element.ends(input, at, &mut ends);
                for &q in &ends {
                    reach.set(k + 1, q);
                }
            }
        }
        reach
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("pattern", &self.pattern)
            .field("data_type", &self.data_type)
            .finish_non_exhaustive()
    }
}

/// Row-major bit table of reachable (element, position) pairs
struct Reach {
    width: usize,
    bits: Vec<bool>,
}

impl Reach {
    fn new(rows: usize, width: usize) -> Self {
        Self {
            width,
            bits: vec![false; rows * width],
        }
    }

    fn get(&self, k: usize, at: usize) -> bool {
        at < self.width && self.bits[k * self.width + at]
    }

    fn set(&mut self, k: usize, at: usize) {
        self.bits[k * self.width + at] = true;
    }

    fn any_at_or_before(&self, k: usize, at: usize) -> bool {
        let row = &self.bits[k * self.width..(k + 1) * self.width];
        row[..=at.min(self.width - 1)].iter().any(|&b| b)
    }
}
