// ============================================================================
// Subscription Filter Expression
// ============================================================================
//
// Tag filter in the usual broker syntax:
//   ""  or "*"      -> every message, tagged or not
//   "a"             -> only messages tagged "a"
//   "a || b || c"   -> messages tagged with any of the listed tags
//
// ============================================================================

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpression {
    All,
    Tags(Vec<String>),
}

impl FilterExpression {
    pub fn parse(expression: &str) -> Self {
        let trimmed = expression.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return FilterExpression::All;
        }

        let tags: Vec<String> = trimmed
            .split("||")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        if tags.is_empty() || tags.iter().any(|t| t == "*") {
            FilterExpression::All
        } else {
            FilterExpression::Tags(tags)
        }
    }

    pub fn matches(&self, tag: Option<&str>) -> bool {
        match self {
            FilterExpression::All => true,
            FilterExpression::Tags(tags) => match tag {
                Some(tag) => tags.iter().any(|t| t == tag),
                None => false,
            },
        }
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpression::All => write!(f, "*"),
            FilterExpression::Tags(tags) => write!(f, "{}", tags.join(" || ")),
        }
    }
}
