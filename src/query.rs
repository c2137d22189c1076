//! List query layer: ordering, time-range filtering and page-number pagination
//! over an already caller-scoped, id-ordered record set.

use axum::extract::{FromRequestParts, Query};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use url::Url;
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, FieldErrors};
use crate::models::{Usage, UsageType};

pub const TIMESTAMP_FORMAT_ERROR: &str = "Datetime has wrong format. Use one of these formats instead: YYYY-MM-DDThh:mm[:ss[.uuuuuu]][+HH:MM|-HH:MM|Z].";

/// Records that can be ordered by a fixed set of named fields.
pub trait Sortable {
    type Field: Copy;

    /// Map a query-string field name to a field, `None` if it is not orderable.
    fn sort_field(name: &str) -> Option<Self::Field>;

    fn compare_by(&self, other: &Self, field: Self::Field) -> Ordering;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingTerm<F> {
    pub field: F,
    pub descending: bool,
}

/// Parse `ordering=field,-other`. Unknown fields are dropped; an empty result
/// means the default ascending-id order.
pub fn parse_ordering<T: Sortable>(raw: Option<&str>) -> Vec<OrderingTerm<T::Field>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter_map(|term| {
            let (descending, name) = match term.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, term),
            };
            T::sort_field(name).map(|field| OrderingTerm { field, descending })
        })
        .collect()
}

/// Stable sort, so records comparing equal keep their id order.
pub fn sort_records<T: Sortable>(records: &mut [T], terms: &[OrderingTerm<T::Field>]) {
    if terms.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        terms
            .iter()
            .map(|term| {
                let ordering = a.compare_by(b, term.field);
                if term.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

/// Parse an ISO-8601 timestamp.
///
/// A space is accepted as the date/time separator, and a space where the
/// offset sign belongs is read as `+` (an unencoded `+` in a query string
/// arrives decoded as a space). Values without an offset are local times in
/// `default_tz`.
pub fn parse_timestamp(raw: &str, default_tz: Tz) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed);
    }

    let mut normalized = raw.to_string();
    if normalized.as_bytes().get(10) == Some(&b' ') {
        normalized.replace_range(10..11, "T");
    }
    let normalized = normalized.replace(' ', "+");
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized)
        .or_else(|_| DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M%:z"))
    {
        return Some(parsed);
    }

    let naive = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M"))
        .ok()?;
    // Ambiguous local times (DST fall-back) take the earlier instant; skipped ones are invalid
    default_tz
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.fixed_offset())
}

#[derive(Debug, Default, Clone, Deserialize, IntoParams, FromRequestParts)]
#[into_params(parameter_in = Query)]
#[from_request(via(Query), rejection(ApiError))]
pub struct ListParams {
    /// 1-based page number, or `last`
    pub page: Option<String>,
    /// Comma-separated field names, `-` prefix for descending order
    pub ordering: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, IntoParams, FromRequestParts)]
#[into_params(parameter_in = Query)]
#[from_request(via(Query), rejection(ApiError))]
pub struct TimeRangeParams {
    /// Only include usages at or after this instant
    pub timerange_start: Option<String>,
    /// Only include usages at or before this instant
    pub timerange_end: Option<String>,
}

/// Inclusive instant bounds; a missing bound is open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
}

impl TimeRange {
    pub fn contains(&self, at: &DateTime<FixedOffset>) -> bool {
        self.start.map_or(true, |start| *at >= start) && self.end.map_or(true, |end| *at <= end)
    }
}

impl TimeRangeParams {
    pub fn parse(&self, default_tz: Tz) -> Result<TimeRange, ApiError> {
        let mut errors = FieldErrors::default();
        let mut bound = |field: &str, raw: Option<&str>| {
            let raw = raw?;
            let parsed = parse_timestamp(raw, default_tz);
            if parsed.is_none() {
                errors.add(field, TIMESTAMP_FORMAT_ERROR);
            }
            parsed
        };
        let start = bound("timerange_start", self.timerange_start.as_deref());
        let end = bound("timerange_end", self.timerange_end.as_deref());
        errors.into_result()?;
        Ok(TimeRange { start, end })
    }
}

/// One page of a list response.
#[derive(Debug, Serialize, PartialEq, ToSchema)]
#[aliases(UsageTypePage = Page<UsageType>, UsagePage = Page<Usage>)]
pub struct Page<T> {
    pub count: usize,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// Cut `records` into fixed-size pages and return the requested one with
/// absolute links to its neighbours, built from the request URL.
pub fn paginate<T>(
    records: Vec<T>,
    page: Option<&str>,
    page_size: usize,
    request_url: &Url,
) -> Result<Page<T>, ApiError> {
    let page_size = page_size.max(1);
    let count = records.len();
    let last = count.div_ceil(page_size).max(1);

    let number = match page.map(str::trim) {
        None => 1,
        Some("last") => last,
        Some(raw) => raw.parse::<usize>().map_err(|_| ApiError::InvalidPage)?,
    };
    if number == 0 || number > last {
        return Err(ApiError::InvalidPage);
    }

    let results = records
        .into_iter()
        .skip((number - 1) * page_size)
        .take(page_size)
        .collect();
    let next = (number < last).then(|| page_link(request_url, Some(number + 1)));
    // The first page is addressed without a `page` parameter
    let previous =
        (number > 1).then(|| page_link(request_url, (number > 2).then_some(number - 1)));

    Ok(Page {
        count,
        next,
        previous,
        results,
    })
}

fn page_link(request_url: &Url, page: Option<usize>) -> String {
    let retained: Vec<(String, String)> = request_url
        .query_pairs()
        .filter(|(key, _)| key != "page")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut link = request_url.clone();
    if retained.is_empty() && page.is_none() {
        link.set_query(None);
    } else {
        let mut pairs = link.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(retained.iter());
        if let Some(number) = page {
            pairs.append_pair("page", &number.to_string());
        }
    }
    link.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageField;
    use chrono::Utc;

    fn usage(id: u64, usage_type: u64, hour: u32) -> Usage {
        Usage {
            id,
            user: "alice".into(),
            usage_type,
            usage_at: Utc
                .with_ymd_and_hms(2021, 4, 5, hour, 0, 0)
                .unwrap()
                .fixed_offset(),
        }
    }

    #[test]
    fn test_parse_ordering_ignores_unknown_fields() {
        let terms = parse_ordering::<Usage>(Some("-usage_at, bogus,usage_type,"));
        assert_eq!(
            terms,
            vec![
                OrderingTerm {
                    field: UsageField::UsageAt,
                    descending: true
                },
                OrderingTerm {
                    field: UsageField::UsageType,
                    descending: false
                },
            ]
        );
        assert!(parse_ordering::<Usage>(Some("id")).is_empty());
        assert!(parse_ordering::<UsageType>(None).is_empty());
    }

    #[test]
    fn test_sort_by_timestamp_both_directions() {
        let mut records = vec![usage(1, 1, 12), usage(2, 1, 8), usage(3, 2, 10)];

        sort_records(&mut records, &parse_ordering::<Usage>(Some("usage_at")));
        assert!(records
            .windows(2)
            .all(|pair| pair[0].usage_at <= pair[1].usage_at));

        sort_records(&mut records, &parse_ordering::<Usage>(Some("-usage_at")));
        assert!(records
            .windows(2)
            .all(|pair| pair[0].usage_at >= pair[1].usage_at));
    }

    #[test]
    fn test_sort_ties_keep_id_order() {
        let mut records = vec![usage(1, 2, 8), usage(2, 1, 9), usage(3, 2, 10)];
        sort_records(&mut records, &parse_ordering::<Usage>(Some("-usage_type")));
        let ids: Vec<u64> = records.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = DateTime::parse_from_rfc3339("2021-04-05T18:55:06.212829+02:00").unwrap();
        let utc = Tz::UTC;
        assert_eq!(parse_timestamp("2021-04-05T18:55:06.212829+02:00", utc), Some(expected));
        assert_eq!(parse_timestamp("2021-04-05 18:55:06.212829+02:00", utc), Some(expected));
        assert_eq!(parse_timestamp("2021-04-05T18:55:06.212829 02:00", utc), Some(expected));
        assert!(parse_timestamp("2021-04-05T16:55:06Z", utc).is_some());
        assert!(parse_timestamp("2021-04-05T18:55+02:00", utc).is_some());
        assert_eq!(parse_timestamp("yesterday", utc), None);
        assert_eq!(parse_timestamp("2021-04-05", utc), None);
    }

    #[test]
    fn test_naive_timestamps_take_the_default_zone() {
        let parsed = parse_timestamp("2021-04-05 18:55:06.212829", Tz::UTC).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2021-04-05T18:55:06.212829+00:00");

        let parsed = parse_timestamp("2021-04-05T18:55", Tz::Europe__Paris).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2021-04-05T18:55:00+02:00");

        let parsed = parse_timestamp("2021-01-05T18:55:06", Tz::Europe__Paris).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 3600);

        // 02:30 does not exist in Paris on the spring-forward night
        assert_eq!(parse_timestamp("2021-03-28T02:30:00", Tz::Europe__Paris), None);
    }

    #[test]
    fn test_time_range_bounds_are_inclusive() {
        let params = TimeRangeParams {
            timerange_start: Some("2021-04-05T08:00:00+00:00".into()),
            timerange_end: Some("2021-04-05T12:00:00+02:00".into()),
        };
        let range = params.parse(Tz::UTC).unwrap();
        assert!(range.contains(&usage(1, 1, 8).usage_at));
        assert!(range.contains(&usage(1, 1, 10).usage_at));
        assert!(!range.contains(&usage(1, 1, 7).usage_at));
        assert!(!range.contains(&usage(1, 1, 11).usage_at));
        assert!(TimeRange::default().contains(&usage(1, 1, 0).usage_at));
    }

    #[test]
    fn test_time_range_rejects_malformed_bound() {
        let params = TimeRangeParams {
            timerange_start: None,
            timerange_end: Some("not-a-date".into()),
        };
        match params.parse(Tz::UTC) {
            Err(ApiError::Validation(errors)) => {
                assert!(errors.get("timerange_end").is_some());
                assert!(errors.get("timerange_start").is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_paginate_links_and_bounds() {
        let url = Url::parse("http://localhost/carbon_usage/usage/?ordering=-usage_at&page=2")
            .unwrap();
        let records: Vec<u32> = (1..=25).collect();

        let page = paginate(records.clone(), Some("2"), 10, &url).unwrap();
        assert_eq!(page.count, 25);
        assert_eq!(page.results, (11..=20).collect::<Vec<_>>());
        assert_eq!(
            page.next.as_deref(),
            Some("http://localhost/carbon_usage/usage/?ordering=-usage_at&page=3")
        );
        assert_eq!(
            page.previous.as_deref(),
            Some("http://localhost/carbon_usage/usage/?ordering=-usage_at")
        );

        let last = paginate(records.clone(), Some("last"), 10, &url).unwrap();
        assert_eq!(last.results, vec![21, 22, 23, 24, 25]);
        assert!(last.next.is_none());

        assert!(matches!(
            paginate(records.clone(), Some("4"), 10, &url),
            Err(ApiError::InvalidPage)
        ));
        assert!(matches!(
            paginate(records, Some("zero"), 10, &url),
            Err(ApiError::InvalidPage)
        ));
    }

    #[test]
    fn test_paginate_empty_set_has_a_first_page() {
        let url = Url::parse("http://localhost/carbon_usage/usage_type/").unwrap();
        let page = paginate(Vec::<u32>::new(), None, 10, &url).unwrap();
        assert_eq!(page.count, 0);
        assert!(page.next.is_none() && page.previous.is_none());
        assert!(page.results.is_empty());
    }
}
