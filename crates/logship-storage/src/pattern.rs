//! Naming templates for rotated files
//!
//! A template is a relative path with placeholders:
//!
//! | placeholder | value |
//! |---|---|
//! | `{yyyy}` `{MM}` `{dd}` `{HH}` | date of the bucket start (UTC) |
//! | `{mm}` | minute the bucket starts at |
//! | `{version}` | file version within the bucket |
//! | `{log_type}` | log type |
//! | `{host}` | client hostname |
//! | `{p:<key>}` | caller-supplied property `<key>` |
//!
//! The format extension is appended to every rendered name.

use chrono::{DateTime, Datelike, Timelike, Utc};
use logship_common::{Error, Result};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Version,
    LogType,
    Host,
    Property(String),
}

/// Values substituted into a template besides time and version
#[derive(Debug, Clone, Copy)]
pub struct NameFields<'a> {
    pub log_type: &'a str,
    pub host: &'a str,
    pub properties: &'a BTreeMap<String, String>,
    pub extension: &'a str,
}

/// Parsed naming template bound to a bucket length
#[derive(Debug, Clone)]
pub struct NamingTemplate {
    source: String,
    segments: Vec<Segment>,
    bucket_minutes: u32,
}

impl NamingTemplate {
    /// Parse a template for buckets of `bucket_interval`
    pub fn parse(template: &str, bucket_interval: Duration) -> Result<Self> {
        let bucket_minutes = u32::try_from(bucket_interval.as_secs() / 60).unwrap_or(0);
        if bucket_minutes == 0 || 60 % bucket_minutes != 0 {
            return Err(Error::configuration(format!(
                "bucket interval of {}s does not divide an hour",
                bucket_interval.as_secs()
            )));
        }
        if template.is_empty() || template.starts_with('/') {
            return Err(Error::configuration(format!(
                "naming template {template:?} must be a non-empty relative path"
            )));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                Error::configuration(format!("unclosed placeholder in {template:?}"))
            })?;
            let segment = match &after[..close] {
                "yyyy" => Segment::Year,
                "MM" => Segment::Month,
                "dd" => Segment::Day,
                "HH" => Segment::Hour,
                "mm" => Segment::Minute,
                "version" => Segment::Version,
                "log_type" => Segment::LogType,
                "host" => Segment::Host,
                other => match other.strip_prefix("p:") {
                    Some(key) if !key.is_empty() => Segment::Property(key.to_string()),
                    _ => {
                        return Err(Error::configuration(format!(
                            "unknown placeholder {{{other}}} in {template:?}"
                        )));
                    }
                },
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(segment);
            rest = &after[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
            bucket_minutes,
        })
    }

    /// Reject templates that cannot rotate
    ///
    /// The template must carry `{version}`, and names rendered for two
    /// consecutive buckets must differ.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.segments.contains(&Segment::Version) {
            return Err(Error::configuration(format!(
                "naming template {:?} has no {{version}} placeholder",
                self.source
            )));
        }

        let properties = BTreeMap::new();
        let fields = NameFields {
            log_type: "validate",
            host: "validate",
            properties: &properties,
            extension: "",
        };
        let earlier = now - self.bucket_interval() - chrono::Duration::seconds(1);
        if self.render(&fields, now, 1) == self.render(&fields, earlier, 1) {
            return Err(Error::configuration(format!(
                "naming template {:?} renders the same name for consecutive {}-minute buckets",
                self.source, self.bucket_minutes
            )));
        }
        Ok(())
    }

    fn bucket_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.bucket_minutes))
    }

    /// Start of the bucket containing `t`
    pub fn bucket_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let width = i64::from(self.bucket_minutes) * 60;
        let secs = t.timestamp();
        DateTime::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(t)
    }

    /// Render the file name for time `t` and `version`
    pub fn render(&self, fields: &NameFields<'_>, t: DateTime<Utc>, version: u32) -> String {
        let start = self.bucket_start(t);
        let mut out = String::with_capacity(self.source.len() + 32);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Year => out.push_str(&format!("{:04}", start.year())),
                Segment::Month => out.push_str(&format!("{:02}", start.month())),
                Segment::Day => out.push_str(&format!("{:02}", start.day())),
                Segment::Hour => out.push_str(&format!("{:02}", start.hour())),
                Segment::Minute => out.push_str(&format!("{:02}", start.minute())),
                Segment::Version => out.push_str(&version.to_string()),
                Segment::LogType => out.push_str(&sanitize(fields.log_type)),
                Segment::Host => out.push_str(&sanitize(fields.host)),
                Segment::Property(key) => {
                    let value = fields.properties.get(key).map_or("", String::as_str);
                    out.push_str(&sanitize(value));
                }
            }
        }
        if !fields.extension.is_empty() {
            out.push('.');
            out.push_str(fields.extension);
        }
        out
    }
}

/// Keep substituted values inside their path component
fn sanitize(value: &str) -> Cow<'_, str> {
    if value == "." || value == ".." {
        return Cow::Owned("_".repeat(value.len()));
    }
    if value.contains(['/', '\\', '\0']) {
        return Cow::Owned(value.replace(['/', '\\', '\0'], "_"));
    }
    Cow::Borrowed(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, h, m, s).unwrap()
    }

    fn fields<'a>(props: &'a BTreeMap<String, String>) -> NameFields<'a> {
        NameFields {
            log_type: "access",
            host: "web-1",
            properties: props,
            extension: "tsv",
        }
    }

    #[test]
    fn test_render_uses_bucket_start() {
        let props = BTreeMap::from([("shard".to_string(), "3".to_string())]);
        let template = NamingTemplate::parse(
            "{log_type}/{yyyy}/{MM}/{dd}/{HH}{mm}-{host}-s{p:shard}.v{version}",
            FIVE_MINUTES,
        )
        .unwrap();

        assert_eq!(
            template.render(&fields(&props), at(1, 3, 59), 1),
            "access/2024/03/09/0100-web-1-s3.v1.tsv"
        );
        assert_eq!(
            template.render(&fields(&props), at(1, 16, 0), 2),
            "access/2024/03/09/0115-web-1-s3.v2.tsv"
        );
    }

    #[test]
    fn test_values_cannot_escape_directory() {
        let props = BTreeMap::new();
        let template = NamingTemplate::parse("{host}/{HH}{mm}.{version}", FIVE_MINUTES).unwrap();
        let f = NameFields {
            host: "../etc",
            ..fields(&props)
        };
        assert_eq!(template.render(&f, at(0, 0, 0), 1), ".._etc/0000.1.tsv");
        let f = NameFields { host: "..", ..f };
        assert_eq!(template.render(&f, at(0, 0, 0), 1), "__/0000.1.tsv");
    }

    #[test]
    fn test_validation() {
        let now = at(10, 42, 7);
        let ok = NamingTemplate::parse("{yyyy}{MM}{dd}{HH}{mm}.{version}", FIVE_MINUTES).unwrap();
        assert!(ok.validate(now).is_ok());

        let no_version = NamingTemplate::parse("{yyyy}{MM}{dd}{HH}{mm}", FIVE_MINUTES).unwrap();
        assert!(no_version.validate(now).is_err());

        let too_coarse = NamingTemplate::parse("{yyyy}{MM}{dd}{HH}.{version}", FIVE_MINUTES).unwrap();
        assert!(too_coarse.validate(now).is_err());

        let hourly =
            NamingTemplate::parse("{yyyy}{MM}{dd}{HH}.{version}", Duration::from_secs(3600)).unwrap();
        assert!(hourly.validate(now).is_ok());
    }

    #[test]
    fn test_parse_errors() {
        assert!(NamingTemplate::parse("{HH}{mm", FIVE_MINUTES).is_err());
        assert!(NamingTemplate::parse("{hour}.{version}", FIVE_MINUTES).is_err());
        assert!(NamingTemplate::parse("{p:}.{version}", FIVE_MINUTES).is_err());
        assert!(NamingTemplate::parse("/abs/{version}", FIVE_MINUTES).is_err());
        assert!(NamingTemplate::parse("{version}", Duration::from_secs(7 * 60)).is_err());
    }
}
