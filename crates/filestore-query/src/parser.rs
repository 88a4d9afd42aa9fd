//! Pattern parser
//!
//! ```text
//! pattern  := tag '@' path
//! tag      := data type name or its first letter, any case
//! path     := ('/' segment)+
//! segment  := atom+
//! atom     := literal | '*' | '[' item (',' item)* ']' | '\d' | '\w' | '\c'
//! item     := literal | number | number '-' number
//! ```
//!
//! A bracket whose items are all numbers, at least one of them a range,
//! becomes a numeric set (decimal if any bound has a fraction). Any other
//! bracket is a choice between literal alternatives.

use crate::element::{Element, NumericSet};
use filestore_common::{DataType, Error, Result, is_id_char};

/// Parse a pattern into its declared data type and element sequence
pub fn parse(pattern: &str) -> Result<(DataType, Vec<Element>)> {
    Parser::new(pattern).parse()
}

struct Parser<'a> {
    pattern: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(pattern: &'a str) -> Self {
        Self {
            pattern,
            chars: pattern.char_indices().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        let at = self
            .chars
            .get(self.pos)
            .map_or(self.pattern.len(), |&(i, _)| i);
        Error::query_parse(self.pattern, at, message)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, c)| c)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn parse(mut self) -> Result<(DataType, Vec<Element>)> {
        let data_type = self.parse_tag()?;
        let mut elements = Vec::new();

        if self.peek() != Some('/') {
            return Err(self.error("path must start with '/'"));
        }
        while self.peek() == Some('/') {
            self.bump();
            elements.push(Element::Separator);
            let before = elements.len();
            self.parse_segment(&mut elements)?;
            if elements.len() == before {
                return Err(if self.peek().is_none() {
                    self.error("trailing '/'")
                } else {
                    self.error("empty path segment")
                });
            }
        }
        if let Some(c) = self.peek() {
            return Err(self.error(format!("unexpected character {c:?}")));
        }
        Ok((data_type, elements))
    }

    fn parse_tag(&mut self) -> Result<DataType> {
        let Some(at) = self.pattern.find('@') else {
            return Err(Error::query_parse(self.pattern, 0, "missing '@' after type tag"));
        };
        let tag = &self.pattern[..at];
        let data_type = tag.parse::<DataType>().map_err(|_| {
            Error::query_parse(self.pattern, 0, format!("unknown data type tag {tag:?}"))
        })?;
        self.pos = self.pattern[..=at].chars().count();
        Ok(data_type)
    }

    /// Parse atoms until the next '/' or the end of input
    fn parse_segment(&mut self, elements: &mut Vec<Element>) -> Result<()> {
        while let Some(c) = self.peek() {
            match c {
                '/' => break,
                '*' => {
                    if elements.last() == Some(&Element::Any) {
                        return Err(self.error("'**' is not allowed"));
                    }
                    self.bump();
                    elements.push(Element::Any);
                }
                '[' => {
                    self.bump();
                    let element = self.parse_bracket()?;
                    elements.push(element);
                }
                '\\' => {
                    self.bump();
                    let element = match self.bump() {
                        Some('d') => Element::Number,
                        Some('w') => Element::Word,
                        Some('c') => Element::Cadence,
                        Some(other) => {
                            self.pos -= 1;
                            return Err(self.error(format!("unknown escape '\\{other}'")));
                        }
                        None => return Err(self.error("dangling '\\'")),
                    };
                    elements.push(element);
                }
                ']' => return Err(self.error("']' without '['")),
                ',' => return Err(self.error("',' outside brackets")),
                c if is_id_char(c) => {
                    let text = self.take_literal();
                    if let Some(Element::Literal(prev)) = elements.last_mut() {
                        prev.push_str(&text);
                    } else {
                        elements.push(Element::Literal(text));
                    }
                }
                other => return Err(self.error(format!("unexpected character {other:?}"))),
            }
        }
        Ok(())
    }

    fn take_literal(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek().filter(|&c| is_id_char(c)) {
            text.push(c);
            self.bump();
        }
        text
    }

    /// Parse the inside of `[...]`, the opening bracket already consumed
    fn parse_bracket(&mut self) -> Result<Element> {
        let mut items = Vec::new();
        loop {
            let start = self.pos;
            let item = self.take_literal();
            if item.is_empty() {
                return Err(match self.peek() {
                    None => self.error("unclosed '['"),
                    Some(',' | ']') => self.error("empty alternative"),
                    Some(c) => self.error(format!("unexpected character {c:?} in brackets")),
                });
            }
            items.push((start, item));
            match self.bump() {
                Some(',') => {}
                Some(']') => break,
                None => return Err(self.error("unclosed '['")),
                Some(c) => {
                    self.pos -= 1;
                    return Err(self.error(format!("unexpected character {c:?} in brackets")));
                }
            }
        }

        let numeric: Option<Vec<NumItem>> = items.iter().map(|(_, s)| NumItem::parse(s)).collect();
        match numeric {
            Some(nums) if nums.iter().any(|n| n.is_range) => self.numeric_set(&items, &nums),
            _ => {
                let mut alternatives: Vec<String> = items.into_iter().map(|(_, s)| s).collect();
                alternatives.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
                alternatives.dedup();
                Ok(Element::Choice(alternatives))
            }
        }
    }

    fn numeric_set(&mut self, items: &[(usize, String)], nums: &[NumItem]) -> Result<Element> {
        for ((start, _), n) in items.iter().zip(nums) {
            if n.lo_value > n.hi_value {
                self.pos = *start;
                return Err(self.error("range end precedes range start"));
            }
        }
        if nums.iter().any(|n| n.decimal) {
            return Ok(Element::Numeric(NumericSet::Decimal(
                nums.iter().map(|n| (n.lo_value, n.hi_value)).collect(),
            )));
        }
        let mut ranges = Vec::with_capacity(nums.len());
        for ((start, _), n) in items.iter().zip(nums) {
            let (Ok(lo), Ok(hi)) = (n.lo.parse::<i64>(), n.hi.parse::<i64>()) else {
                self.pos = *start;
                return Err(self.error("integer bound out of range"));
            };
            ranges.push((lo, hi));
        }
        Ok(Element::Numeric(NumericSet::Integer(ranges)))
    }
}

/// A bracket item that is a number or a `lo-hi` range
struct NumItem<'s> {
    lo: &'s str,
    hi: &'s str,
    lo_value: f64,
    hi_value: f64,
    is_range: bool,
    decimal: bool,
}

impl<'s> NumItem<'s> {
    fn parse(item: &'s str) -> Option<Self> {
        let (lo, hi, is_range) = match item.split_once('-') {
            Some((lo, hi)) => (lo, hi, true),
            None => (item, item, false),
        };
        if !is_number(lo) || !is_number(hi) {
            return None;
        }
        Some(Self {
            lo,
            hi,
            lo_value: lo.parse().ok()?,
            hi_value: hi.parse().ok()?,
            is_range,
            decimal: lo.contains('.') || hi.contains('.'),
        })
    }
}

fn is_number(s: &str) -> bool {
    let (int, frac) = s.split_once('.').unwrap_or((s, "0"));
    !int.is_empty()
        && !frac.is_empty()
        && int.bytes().all(|b| b.is_ascii_digit())
        && frac.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(s: &str) -> Element {
        Element::Literal(s.to_string())
    }

    #[test]
    fn test_simple_path() {
        let (t, elements) = parse("b@/a*/b").unwrap();
        assert_eq!(t, DataType::Blob);
        assert_eq!(
            elements,
            vec![
                Element::Separator,
                lit("a"),
                Element::Any,
                Element::Separator,
                lit("b")
            ]
        );
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(parse("TimeSeries@/x").unwrap().0, DataType::TimeSeries);
        assert_eq!(parse("M@/x").unwrap().0, DataType::MjdTimeSeries);
    }

    #[test]
    fn test_choice_sorted_longest_first() {
        let (_, elements) = parse("m@/[cal,calibration,cali]/blah").unwrap();
        assert_eq!(
            elements[1],
            Element::Choice(vec!["calibration".into(), "cali".into(), "cal".into()])
        );
    }

    #[test]
    fn test_numeric_brackets() {
        let (_, e) = parse("b@/cal/long/100:[100-1110]").unwrap();
        assert_eq!(e.last(), Some(&Element::Numeric(NumericSet::Integer(vec![(100, 1110)]))));

        let (_, e) = parse(r"t@/x/\d:[3.0-4.0,7.0-16.0]").unwrap();
        assert_eq!(
            e[3..],
            [
                Element::Number,
                lit(":"),
                Element::Numeric(NumericSet::Decimal(vec![(3.0, 4.0), (7.0, 16.0)]))
            ]
        );

        // no range among the items: plain alternatives
        let (_, e) = parse("b@/x/[1,22]").unwrap();
        assert_eq!(e[3], Element::Choice(vec!["22".into(), "1".into()]));

        // not every item is numeric: literal text
        let (_, e) = parse("b@/x/[1-2,abc]").unwrap();
        assert_eq!(e[3], Element::Choice(vec!["1-2".into(), "abc".into()]));
    }

    #[test]
    fn test_classes() {
        let (_, e) = parse(r"b@/\w/\c/\d").unwrap();
        assert_eq!(
            e,
            vec![
                Element::Separator,
                Element::Word,
                Element::Separator,
                Element::Cadence,
                Element::Separator,
                Element::Number
            ]
        );
    }

    #[test]
    fn test_malformed_patterns() {
        for bad in [
            "/a/b",
            "q@/a",
            "b@a/b",
            "b@",
            "b@/",
            "b@/a//b",
            "b@/a/",
            "b@/a/[b",
            "b@/a/b]",
            "b@/a/[b,,c]",
            "b@/a/[]",
            r"b@/a/\q",
            r"b@/a/\",
            "b@/a/[9-1]",
            "b@/a/**",
            "b@/a,b",
            "b@/a?b",
            "b@/a b",
            "b@/**?[/(x)|{y}$^",
            "b@/[99999999999999999999-1]",
        ] {
            let err = parse(bad).unwrap_err();
            assert!(matches!(err, Error::QueryParse { .. }), "{bad:?}: {err}");
        }
    }

    #[test]
    fn test_error_position() {
        let Error::QueryParse { position, .. } = parse("b@/ab/c?d").unwrap_err() else {
            panic!("expected parse error");
        };
        assert_eq!(position, 7);
    }
}
