//! File store query - FsId pattern matching
//!
//! Patterns look like `b@/cal/[lc,sc]/\d:[100-1110]`: a data type tag, an
//! `@`, then a `/`-separated path of segment patterns. A compiled
//! [`Matcher`] classifies ids as complete, path, or path-prefix matches so
//! that a directory walk can prune subtrees that cannot contain a match.
//!
//! | Syntax        | Matches                                           |
//! |---------------|---------------------------------------------------|
//! | `abc`         | the literal text                                  |
//! | `*`           | zero or more characters, across `/`               |
//! | `[a,b,c]`     | one alternative, longest preferred                |
//! | `[1-5,9]`     | an integer in the union of the ranges             |
//! | `[3.0-4.5]`   | a number (integer or decimal) in the ranges       |
//! | `\d`          | any number                                        |
//! | `\w`          | letters, digits and `_`                           |
//! | `\c`          | a cadence name (`lc`, `sc`, `long`, `short`, ...) |

pub mod element;
pub mod matcher;
pub mod parser;

pub use matcher::{DirectoryMatch, MatchResult, Matcher};
