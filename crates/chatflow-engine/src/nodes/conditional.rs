use regex::RegexBuilder;
use tracing::debug;

use chatflow_core::flow::{ConditionOperator, ConditionTest, ConditionalProps, OutputKey};

use super::{NodeContext, NodeResult};

pub(super) fn evaluate(ctx: &mut NodeContext<'_>, props: &ConditionalProps) -> NodeResult {
    let subject = ctx.lookup(&props.variable).unwrap_or_default();
    match first_match(&subject, &props.tests, props.case_sensitive) {
        Some(i) => {
            debug!(node_id = %ctx.node.id, variable = %props.variable, test = i, "Condition matched");
            NodeResult::Next(OutputKey::Match(i))
        }
        None => NodeResult::Next(OutputKey::Default),
    }
}

/// Index of the first test `subject` satisfies.
pub fn first_match(subject: &str, tests: &[ConditionTest], case_sensitive: bool) -> Option<usize> {
    tests
        .iter()
        .position(|test| test_matches(subject, test, case_sensitive))
}

fn test_matches(subject: &str, test: &ConditionTest, case_sensitive: bool) -> bool {
    if test.operator == ConditionOperator::Regex {
        return RegexBuilder::new(&test.value)
            .case_insensitive(!case_sensitive)
            .build()
            .map(|re| re.is_match(subject))
            .unwrap_or(false);
    }

    let (subject, value) = if case_sensitive {
        (subject.trim().to_string(), test.value.trim().to_string())
    } else {
        (subject.trim().to_lowercase(), test.value.trim().to_lowercase())
    };
    match test.operator {
        ConditionOperator::Equals => subject == value,
        ConditionOperator::Contains => subject.contains(&value),
        ConditionOperator::StartsWith => subject.starts_with(&value),
        ConditionOperator::EndsWith => subject.ends_with(&value),
        ConditionOperator::Regex => false,
    }
}
