//! Reconcile directives and their ordered accumulator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the scheduler should do with the resource once the current item is processed.
///
/// `requeue_after` of zero with `requeue` set means "retry immediately".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    pub requeue: bool,
    #[serde(with = "duration_secs")]
    pub requeue_after: Duration,
}

impl Directive {
    /// Terminal: nothing left to do for this item.
    pub const fn done() -> Self {
        Self { requeue: false, requeue_after: Duration::ZERO }
    }

    pub const fn requeue() -> Self {
        Self { requeue: true, requeue_after: Duration::ZERO }
    }

    pub const fn requeue_after(after: Duration) -> Self {
        Self { requeue: true, requeue_after: after }
    }

    /// A directive asks for a retry if either field is set.
    pub fn is_terminal(&self) -> bool {
        !self.requeue && self.requeue_after.is_zero()
    }
}

/// Ordered directives collected from independent sub-operations.
///
/// Never collapsed here; the caller decides the effective policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Results {
    directives: Vec<Directive>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one directive.
    pub fn with_result(&mut self, d: Directive) -> &mut Self {
        self.directives.push(d);
        self
    }

    /// Append everything from `other`, preserving order.
    pub fn with_results(&mut self, other: Results) -> &mut Self {
        self.directives.extend(other.directives);
        self
    }

    /// `a` followed by `b`.
    pub fn combine(mut a: Results, b: Results) -> Results {
        a.with_results(b);
        a
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Directive> {
        self.directives.iter()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

impl From<Vec<Directive>> for Results {
    fn from(directives: Vec<Directive>) -> Self {
        Self { directives }
    }
}

impl FromIterator<Directive> for Results {
    fn from_iter<I: IntoIterator<Item = Directive>>(iter: I) -> Self {
        Self { directives: iter.into_iter().collect() }
    }
}

impl<'a> IntoIterator for &'a Results {
    type Item = &'a Directive;
    type IntoIter = std::slice::Iter<'a, Directive>;

    fn into_iter(self) -> Self::IntoIter {
        self.directives.iter()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("requeueAfter must be a non-negative number of seconds"));
        }
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
