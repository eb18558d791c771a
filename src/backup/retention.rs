use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::cmp::Reverse;
use std::result;
use validator::{Validate, ValidationError, ValidationErrors};

/// Bounds on how many backups of one target are kept, and for how long.
///
/// An artifact is deleted when it violates either bound, but the newest
/// artifact is never deleted: a target always keeps at least one backup.
#[skip_serializing_none]
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_count: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<std::time::Duration>,
}

impl Validate for RetentionPolicy {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        if self.max_count.is_none() && self.max_age.is_none() {
            let mut errors = ValidationErrors::new();
            errors.add(
                "retention",
                ValidationError::new("EmptyRetention")
                    .with_message("set max_count, max_age or both".into()),
            );
            return Err(errors);
        }
        Ok(())
    }
}

/// Anything that has a creation time the retention rules can rank.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for DateTime<Utc> {
    fn timestamp(&self) -> DateTime<Utc> {
        *self
    }
}

impl RetentionPolicy {
    pub fn new(max_count: Option<usize>, max_age: Option<std::time::Duration>) -> Self {
        Self { max_count, max_age }
    }

    /// Returns the items to delete, newest first.
    ///
    /// Items are ranked by creation time, newest at rank 0. Rank 0 is always
    /// kept; any other item goes when its rank reaches `max_count` or its age
    /// exceeds `max_age`.
    pub fn get_delete<T, I>(&self, items: I, now: DateTime<Utc>) -> Vec<T>
    where
        T: Timestamped,
        I: IntoIterator<Item = T>,
    {
        let max_age = self.max_age.and_then(|d| Duration::from_std(d).ok());

        items
            .into_iter()
            .sorted_by_key(|item| Reverse(item.timestamp()))
            .enumerate()
            .skip(1)
            .filter(|(rank, item)| {
                let over_count = self.max_count.is_some_and(|max| *rank >= max);
                let over_age = max_age.is_some_and(|max| now - item.timestamp() > max);
                over_count || over_age
            })
            .map(|(_, item)| item)
            .collect()
    }
}
