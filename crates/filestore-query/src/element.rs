//! Compiled pattern elements
//!
//! A pattern compiles to a flat sequence of [`Element`]s. Each element
//! knows every way it can consume input starting at a given position;
//! the matcher combines those spans.

/// Cadence names recognized by `\c`, longest first so that listing
/// candidates prefers the greediest alias.
pub const CADENCE_ALIASES: [&str; 8] = [
    "long_cadence",
    "short_cadence",
    "shortcadence",
    "longcadence",
    "short",
    "long",
    "lc",
    "sc",
];

/// One compiled piece of a pattern
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// Exact text, never containing the separator
    Literal(String),
    /// The `/` between segments
    Separator,
    /// `*`: zero or more characters, crossing separators
    Any,
    /// `[a,b,c]`: one of several literal alternatives, longest first
    Choice(Vec<String>),
    /// `[1-5,9]` or `[3.0-4.0]`: a number inside a set of intervals
    Numeric(NumericSet),
    /// `\d`: any unsigned number, with an optional fraction
    Number,
    /// `\w`: a run of letters, digits and underscores
    Word,
    /// `\c`: a cadence name such as `lc` or `short`
    Cadence,
}

/// Union of closed intervals
#[derive(Debug, Clone, PartialEq)]
pub enum NumericSet {
    /// Only integers match
    Integer(Vec<(i64, i64)>),
    /// Integers and decimals match
    Decimal(Vec<(f64, f64)>),
}

impl NumericSet {
    fn contains(&self, token: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(token) else {
            return false;
        };
        match self {
            Self::Integer(ranges) => {
                if token.contains(&b'.') {
                    return false;
                }
                text.parse::<i64>()
                    .is_ok_and(|v| ranges.iter().any(|&(lo, hi)| lo <= v && v <= hi))
            }
            Self::Decimal(ranges) => text
                .parse::<f64>()
                .is_ok_and(|v| ranges.iter().any(|&(lo, hi)| lo <= v && v <= hi)),
        }
    }
}

impl Element {
    /// True if this element can consume a `/`
    #[must_use]
    pub const fn spans_separator(&self) -> bool {
        matches!(self, Self::Separator | Self::Any)
    }

    /// Push every end position `q` such that this element matches
    /// `input[at..q]`. Positions are pushed longest first.
    pub fn ends(&self, input: &[u8], at: usize, out: &mut Vec<usize>) {
        let rest = &input[at..];
        match self {
            Self::Literal(text) => {
                if rest.starts_with(text.as_bytes()) {
                    out.push(at + text.len());
                }
            }
            Self::Separator => {
                if rest.first() == Some(&b'/') {
                    out.push(at + 1);
                }
            }
            Self::Any => out.extend((at..=input.len()).rev()),
            Self::Choice(alternatives) => {
                for alt in alternatives {
                    if rest.starts_with(alt.as_bytes()) {
                        out.push(at + alt.len());
                    }
                }
            }
            Self::Number => {
                out.extend(number_ends(rest).into_iter().rev().map(|n| at + n));
            }
            Self::Numeric(set) => {
                for n in number_ends(rest).into_iter().rev() {
                    if set.contains(&rest[..n]) {
                        out.push(at + n);
                    }
                }
            }
            Self::Word => {
                let run = rest
                    .iter()
                    .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
                    .count();
                out.extend((1..=run).rev().map(|n| at + n));
            }
            Self::Cadence => {
                for alias in CADENCE_ALIASES {
                    if rest.len() >= alias.len()
                        && rest[..alias.len()].eq_ignore_ascii_case(alias.as_bytes())
                    {
                        out.push(at + alias.len());
                    }
                }
            }
        }
    }
}

/// Lengths of every prefix of `s` that is a complete number
/// (`digits` or `digits.digits`), shortest first.
fn number_ends(s: &[u8]) -> Vec<usize> {
    let int_len = s.iter().take_while(|b| b.is_ascii_digit()).count();
    let mut ends: Vec<usize> = (1..=int_len).collect();
    if int_len > 0 && s.get(int_len) == Some(&b'.') {
        let frac = s[int_len + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        ends.extend((1..=frac).map(|n| int_len + 1 + n));
    }
    ends
}
