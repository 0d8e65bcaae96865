//! Interactive yes/no confirmation on the controlling terminal.

use console::Term;
use owo_colors::OwoColorize;
use scanstack_core::deps::Prompter;

pub struct TerminalPrompter {
    term: Term,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

/// Only an explicit yes counts; an empty line means no.
fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

impl Prompter for TerminalPrompter {
    fn confirm(&self, question: &str) -> bool {
        // Nobody to ask in a pipe or under cron
        if !console::user_attended_stderr() {
            tracing::warn!("No terminal to confirm '{}', answering no", question);
            return false;
        }

        let prompt = format!("{} {} ", question.bold(), "[y/N]".dimmed());
        if self.term.write_str(&prompt).is_err() {
            return false;
        }
        match self.term.read_line() {
            Ok(answer) => is_yes(&answer),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_explicit_yes_confirms() {
        assert!(is_yes("y"));
        assert!(is_yes(" YES \n"));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }

    #[test]
    fn test_default_prompter_usable_as_trait_object() {
        let prompter: Box<dyn Prompter> = Box::<TerminalPrompter>::default();
        drop(prompter);
    }
}
