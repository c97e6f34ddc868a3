//! Query trees evaluated against attribute indexes.

use std::ops::Bound;

use crate::search::AttributeValue;

// == Predicate ==
/// Comparison applied to one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(AttributeValue),
    Ne(AttributeValue),
    Lt(AttributeValue),
    Le(AttributeValue),
    Gt(AttributeValue),
    Ge(AttributeValue),
    /// Inclusive on both ends
    Between(AttributeValue, AttributeValue),
}

impl Predicate {
    /// Returns true if an attribute value satisfies this predicate.
    ///
    /// Ordering comparisons never match values of a different kind.
    pub fn matches(&self, value: &AttributeValue) -> bool {
        use std::cmp::Ordering::*;

        match self {
            Predicate::Eq(v) => value == v,
            Predicate::Ne(v) => value != v,
            Predicate::Lt(v) => value.compare(v) == Some(Less),
            Predicate::Le(v) => matches!(value.compare(v), Some(Less | Equal)),
            Predicate::Gt(v) => value.compare(v) == Some(Greater),
            Predicate::Ge(v) => matches!(value.compare(v), Some(Greater | Equal)),
            Predicate::Between(lo, hi) => {
                matches!(value.compare(lo), Some(Greater | Equal))
                    && matches!(value.compare(hi), Some(Less | Equal))
            }
        }
    }

    /// Key bounds for an ordered scan, or None when the predicate needs a full scan.
    pub(crate) fn bounds(&self) -> Option<(Bound<&AttributeValue>, Bound<&AttributeValue>)> {
        match self {
            Predicate::Eq(v) => Some((Bound::Included(v), Bound::Included(v))),
            Predicate::Ne(_) => None,
            Predicate::Lt(v) => Some((Bound::Unbounded, Bound::Excluded(v))),
            Predicate::Le(v) => Some((Bound::Unbounded, Bound::Included(v))),
            Predicate::Gt(v) => Some((Bound::Excluded(v), Bound::Unbounded)),
            Predicate::Ge(v) => Some((Bound::Included(v), Bound::Unbounded)),
            Predicate::Between(lo, hi) => {
                if lo > hi {
                    None
                } else {
                    Some((Bound::Included(lo), Bound::Included(hi)))
                }
            }
        }
    }
}

// == Query ==
/// Immutable predicate tree over attributes.
///
/// ```ignore
/// let query = Query::eq("city", "Paris").and(Query::gt("age", 30));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Compare {
        attribute: String,
        predicate: Predicate,
    },
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
}

impl Query {
    pub fn compare(attribute: impl Into<String>, predicate: Predicate) -> Self {
        Query::Compare {
            attribute: attribute.into(),
            predicate,
        }
    }

    pub fn eq(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, Predicate::Eq(value.into()))
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, Predicate::Ne(value.into()))
    }

    pub fn lt(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, Predicate::Lt(value.into()))
    }

    pub fn le(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, Predicate::Le(value.into()))
    }

    pub fn gt(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, Predicate::Gt(value.into()))
    }

    pub fn ge(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, Predicate::Ge(value.into()))
    }

    pub fn between(
        attribute: impl Into<String>,
        low: impl Into<AttributeValue>,
        high: impl Into<AttributeValue>,
    ) -> Self {
        Self::compare(attribute, Predicate::Between(low.into(), high.into()))
    }

    pub fn and(self, other: Query) -> Self {
        Query::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Query) -> Self {
        Query::Or(Box::new(self), Box::new(other))
    }

    /// Evaluates the query against one value's attributes.
    pub fn matches<F>(&self, attribute_of: &F) -> bool
    where
        F: Fn(&str) -> Option<AttributeValue>,
    {
        match self {
            Query::Compare {
                attribute,
                predicate,
            } => attribute_of(attribute).map_or(false, |value| predicate.matches(&value)),
            Query::And(left, right) => left.matches(attribute_of) && right.matches(attribute_of),
            Query::Or(left, right) => left.matches(attribute_of) || right.matches(attribute_of),
        }
    }

    /// Attribute names referenced by this query, left to right.
    pub fn attributes(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_attributes(&mut names);
        names
    }

    fn collect_attributes<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Query::Compare { attribute, .. } => names.push(attribute),
            Query::And(left, right) | Query::Or(left, right) => {
                left.collect_attributes(names);
                right.collect_attributes(names);
            }
        }
    }
}
