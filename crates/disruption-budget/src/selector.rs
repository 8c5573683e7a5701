use std::{collections::BTreeMap, fmt};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use snafu::Snafu;

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values"))]
    BinaryOperatorWithoutValues { operator: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values"))]
    UnaryOperatorWithValues { operator: String },

    #[snafu(display("label selector has an invalid operator {operator:?}"))]
    InvalidOperator { operator: String },
}

/// A single validated term of a [`LabelSelector`].
#[derive(Clone, Debug, PartialEq)]
enum Requirement<'a> {
    Equals { key: &'a str, value: &'a str },
    In { key: &'a str, values: &'a [String] },
    NotIn { key: &'a str, values: &'a [String] },
    Exists { key: &'a str },
    DoesNotExist { key: &'a str },
}

impl Requirement<'_> {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals { key, value } => labels.get(*key).is_some_and(|actual| actual.as_str() == *value),
            Self::In { key, values } => labels.get(*key).is_some_and(|actual| values.contains(actual)),
            Self::NotIn { key, values } => labels.get(*key).is_none_or(|actual| !values.contains(actual)),
            Self::Exists { key } => labels.contains_key(*key),
            Self::DoesNotExist { key } => !labels.contains_key(*key),
        }
    }
}

impl fmt::Display for Requirement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals { key, value } => write!(f, "{key}={value}"),
            Self::In { key, values } => write!(f, "{key} in ({})", values.join(", ")),
            Self::NotIn { key, values } => write!(f, "{key} notin ({})", values.join(", ")),
            Self::Exists { key } => write!(f, "{key}"),
            Self::DoesNotExist { key } => write!(f, "!{key}"),
        }
    }
}

/// This trait extends the functionality of [`LabelSelector`].
pub trait LabelSelectorExt {
    /// Converts the selector into the query string format of the Kubernetes API, e.g.
    /// `app=web,tier in (frontend, edge),!canary`.
    fn to_query_string(&self) -> Result<String>;

    /// Whether a set of labels satisfies every term of the selector.
    ///
    /// An empty selector matches nothing: budgets must name the pods they govern.
    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool>;

    /// Whether the selector has neither `matchLabels` nor `matchExpressions`.
    fn is_empty(&self) -> bool;
}

impl LabelSelectorExt for LabelSelector {
    fn to_query_string(&self) -> Result<String> {
        Ok(requirements(self)?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","))
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        if LabelSelectorExt::is_empty(self) {
            return Ok(false);
        }
        Ok(requirements(self)?
            .iter()
            .all(|requirement| requirement.matches(labels)))
    }

    fn is_empty(&self) -> bool {
        self.match_labels.as_ref().is_none_or(BTreeMap::is_empty)
            && self.match_expressions.as_ref().is_none_or(Vec::is_empty)
    }
}

fn requirements(selector: &LabelSelector) -> Result<Vec<Requirement<'_>>> {
    // matchLabels are the equivalent of single valued "In" expressions
    let labels = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(key, value)| Ok(Requirement::Equals { key, value }));

    let expressions = selector
        .match_expressions
        .iter()
        .flatten()
        .map(|requirement| {
            let key = requirement.key.as_str();
            let values = requirement.values.as_deref().unwrap_or_default();
            let operator = requirement.operator.as_str();
            match operator {
                "In" | "NotIn" if values.is_empty() => BinaryOperatorWithoutValuesSnafu { operator }.fail(),
                "In" => Ok(Requirement::In { key, values }),
                "NotIn" => Ok(Requirement::NotIn { key, values }),
                "Exists" | "DoesNotExist" if !values.is_empty() => {
                    UnaryOperatorWithValuesSnafu { operator }.fail()
                }
                "Exists" => Ok(Requirement::Exists { key }),
                "DoesNotExist" => Ok(Requirement::DoesNotExist { key }),
                operator => InvalidOperatorSnafu { operator }.fail(),
            }
        });

    labels.chain(expressions).collect()
}
