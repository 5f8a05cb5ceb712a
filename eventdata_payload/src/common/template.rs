//! Time-based index name templates.
//!
//! `logs-<yyyy>-<mm>-<dd>` resolves against a [`TimestampStruct`] to
//! `logs-2019-01-05`. Placeholders are case-insensitive, tolerate whitespace
//! inside the brackets and may also be written `{{yyyy}}`.

use std::{fmt::Write, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::timestamp::TimestampStruct;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*(yyyy|yy|mm|dd|hh)\s*>|\{\{\s*(yyyy|yy|mm|dd|hh)\s*\}\}")
        .expect("Invalid regex pattern provided")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Yyyy,
    Yy,
    Mm,
    Dd,
    Hh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// A parsed index name template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTemplate {
    segments: Vec<Segment>,
}

impl IndexTemplate {
    /// Parse `template`. Text outside of placeholders is kept verbatim.
    #[must_use]
    pub fn parse(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let whole = caps.get(0).expect("capture 0 always present");
            if whole.start() > last {
                segments.push(Segment::Literal(template[last..whole.start()].to_string()));
            }
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .expect("one alternative always matches")
                .as_str()
                .to_ascii_lowercase();
            let field = match name.as_str() {
                "yyyy" => Field::Yyyy,
                "yy" => Field::Yy,
                "mm" => Field::Mm,
                "dd" => Field::Dd,
                _ => Field::Hh,
            };
            segments.push(Segment::Field(field));
            last = whole.end();
        }
        if last < template.len() {
            segments.push(Segment::Literal(template[last..].to_string()));
        }
        Self { segments }
    }

    /// True if the template contains at least one time placeholder.
    #[must_use]
    pub fn is_time_based(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Field(_)))
    }

    /// Render the template for the timestamp `ts`.
    #[must_use]
    pub fn render(&self, ts: &TimestampStruct) -> Arc<str> {
        let mut name = String::with_capacity(32);
        for segment in &self.segments {
            let _ = match segment {
                Segment::Literal(s) => name.write_str(s),
                Segment::Field(Field::Yyyy) => name.write_str(ts.yyyy()),
                Segment::Field(Field::Yy) => name.write_str(ts.yy()),
                Segment::Field(Field::Mm) => name.write_str(ts.mm()),
                Segment::Field(Field::Dd) => name.write_str(ts.dd()),
                Segment::Field(Field::Hh) => name.write_str(ts.hh()),
            };
        }
        Arc::from(name)
    }
}

#[cfg(test)]
mod test {
    use rand::{SeedableRng, rngs::SmallRng};
    use time::{OffsetDateTime, macros::datetime};

    use super::IndexTemplate;
    use crate::timestamp::{TimestampClock, WallClock};

    struct Fixed(OffsetDateTime);

    impl WallClock for Fixed {
        fn now(&mut self) -> OffsetDateTime {
            self.0
        }
    }

    fn render(template: &str) -> String {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut clock =
            TimestampClock::with_clock("now", None, 1.0, Fixed(datetime!(2019-01-05 07:00:00 UTC)))
                .expect("valid");
        IndexTemplate::parse(template)
            .render(clock.next_timestamp(&mut rng))
            .to_string()
    }

    #[test]
    fn hourly_index() {
        assert_eq!(render("test-<yyyy>-<mm>-<dd>-<hh>"), "test-2019-01-05-07");
        assert_eq!(render("logs-<yyyy><mm><dd>"), "logs-20190105");
    }

    #[test]
    fn case_and_whitespace_insensitive() {
        assert_eq!(render("x-< YY >.<MM>.< dD>"), "x-19.01.05");
        assert_eq!(render("samples-{{yyyy}}-{{ MM }}"), "samples-2019-01");
    }

    #[test]
    fn static_names() {
        let template = IndexTemplate::parse("elasticlogs");
        assert!(!template.is_time_based());
        assert_eq!(render("elasticlogs"), "elasticlogs");
        assert_eq!(render("odd-<yyy>-<mm"), "odd-<yyy>-<mm");
    }
}
