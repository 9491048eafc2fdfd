use chatflow_core::flow::{MenuOption, MenuProps, OutputKey, QuestionProps};
use chatflow_core::types::{MessageType, OutgoingMessage};
use chatflow_core::validation::validate;

use super::{NodeContext, NodeResult};

pub(super) fn present_menu(ctx: &mut NodeContext<'_>, props: &MenuProps, prompt: &str) -> NodeResult {
    let content = ctx.render(prompt);
    let options = props.options.iter().map(|o| ctx.render(&o.label)).collect();
    let mut message = OutgoingMessage::text(&ctx.state.contact_id, &ctx.state.channel_id, content);
    message.message_type = MessageType::Options;
    message.options = options;
    ctx.emit(message);
    NodeResult::Suspend
}

/// Pick the option a reply selects.
///
/// In order: a case-insensitive exact match on a trigger, a 1-based option
/// number, then the first trigger contained in the reply.
pub fn match_option(options: &[MenuOption], reply: &str) -> Option<usize> {
    let reply = reply.trim().to_lowercase();
    if reply.is_empty() {
        return None;
    }
    let triggers: Vec<String> = options.iter().map(|o| o.trigger().trim().to_lowercase()).collect();

    if let Some(i) = triggers.iter().position(|t| *t == reply) {
        return Some(i);
    }
    if let Ok(n) = reply.parse::<usize>() {
        if (1..=options.len()).contains(&n) {
            return Some(n - 1);
        }
    }
    triggers.iter().position(|t| !t.is_empty() && reply.contains(t.as_str()))
}

pub(super) fn choose(props: &MenuProps, reply: &str) -> NodeResult {
    match match_option(&props.options, reply) {
        Some(i) => NodeResult::Next(OutputKey::Option(i)),
        None => NodeResult::Next(OutputKey::Default),
    }
}

pub(super) fn ask(ctx: &mut NodeContext<'_>, prompt: &str) -> NodeResult {
    let text = ctx.render(prompt);
    ctx.say(text);
    NodeResult::Suspend
}

pub(super) fn answer(ctx: &mut NodeContext<'_>, props: &QuestionProps, reply: &str) -> NodeResult {
    let outcome = validate(&props.input_type, reply);
    if !outcome.ok {
        return NodeResult::Next(OutputKey::ValidationError);
    }
    let value = outcome.normalized.unwrap_or_else(|| reply.trim().into());
    ctx.state.set_var(props.variable.clone(), value);
    NodeResult::Next(OutputKey::Default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(labels: &[&str]) -> Vec<MenuOption> {
        labels.iter().map(|l| MenuOption::new(*l)).collect()
    }

    #[test]
    fn test_exact_match() {
        let opts = options(&["Support", "Sales"]);
        assert_eq!(match_option(&opts, "Sales"), Some(1));
        assert_eq!(match_option(&opts, "  support "), Some(0));
        assert_eq!(match_option(&opts, "xyz"), None);
        assert_eq!(match_option(&opts, ""), None);
    }

    #[test]
    fn test_index_match() {
        let opts = options(&["Support", "Sales"]);
        assert_eq!(match_option(&opts, "2"), Some(1));
        assert_eq!(match_option(&opts, "3"), None);
        assert_eq!(match_option(&opts, "0"), None);
    }

    #[test]
    fn test_substring_first_wins() {
        let opts = options(&["Sales", "Sales support"]);
        // exact beats substring
        assert_eq!(match_option(&opts, "sales support"), Some(1));
        // otherwise first option in order
        assert_eq!(match_option(&opts, "I want sales support please"), Some(0));
    }

    #[test]
    fn test_trigger_overrides_label() {
        let opts = vec![MenuOption {
            label: "Talk to a human".into(),
            trigger: Some("agent".into()),
        }];
        assert_eq!(match_option(&opts, "AGENT"), Some(0));
        assert_eq!(match_option(&opts, "talk to a human"), None);
    }
}
