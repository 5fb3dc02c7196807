use anyhow::Result;
use colored::Colorize;
use inquire::{Confirm, Text};

use crets_core::{BatchPrompt, Confirmer, Requirement};

/// Asks on the terminal before applying a batch
pub struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn confirm(&mut self, prompt: &BatchPrompt) -> bool {
        println!(
            "{} {} requirement(s) from {}:",
            "Pending batch:".blue(),
            prompt.count,
            if prompt.source_tag.is_empty() {
                "unknown source"
            } else {
                prompt.source_tag.as_str()
            }
        );
        for req in &prompt.requirements {
            println!("  {} {}", req.code().bold(), req.attrs.detail);
        }

        let question = format!(
            "Apply {} sustainability requirement(s) to work item {}?",
            prompt.count, prompt.scope
        );
        match Confirm::new(&question).with_default(true).prompt() {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("confirmation prompt failed ({}), declining", e);
                false
            }
        }
    }
}

/// Answers every prompt the same way (`--yes` / `--decline`)
pub struct FixedAnswer(pub bool);

impl Confirmer for FixedAnswer {
    fn confirm(&mut self, prompt: &BatchPrompt) -> bool {
        log::info!(
            "{} batch of {} for {} without prompting",
            if self.0 { "accepting" } else { "declining" },
            prompt.count,
            prompt.scope
        );
        self.0
    }
}

/// Prompts the user for a new catalog entry
pub fn prompt_new_requirement(
    id: Option<String>,
    detail: Option<String>,
    parent: Option<String>,
) -> Result<Requirement> {
    let id = match id {
        Some(id) => id,
        None => Text::new("Id (e.g. Mod.1.5):").prompt()?,
    };
    let detail = match detail {
        Some(detail) => detail,
        None => Text::new("Detail:").prompt()?,
    };

    let mut req = Requirement::new(id.trim(), detail.trim());

    let parent = match parent {
        Some(parent) => Some(parent),
        None => {
            let input = Text::new("Parent id (blank for none):").prompt()?;
            (!input.trim().is_empty()).then(|| input.trim().to_string())
        }
    };
    if let Some(parent) = parent {
        req = req.with_parent(parent);
    }

    if Confirm::new("Add a justification?")
        .with_default(false)
        .prompt()?
    {
        let justification = inquire::Editor::new("Justification:").prompt()?;
        req.attrs.justification = Some(justification.trim().to_string());
    }

    Ok(req)
}

/// Asks before a destructive action
pub fn confirm_action(message: &str) -> Result<bool> {
    Ok(Confirm::new(message).with_default(false).prompt()?)
}
