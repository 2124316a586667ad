//! Operator decisions for interactive runs.

use std::io::{BufRead, IsTerminal, Write};

use tracing::warn;

use templar_hypervisor::{StoragePool, VmSummary};
use templar_lifecycle::{DecisionStrategy, LinkedClone, TemplateSpec};

/// Asks on the terminal unless a flag already answered the question.
///
/// Without a terminal on stdin every open question is answered "no".
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptDecisions {
    pub update_existing: Option<bool>,
    pub convert_clones: Option<bool>,
    pub allow_unknown_storage: Option<bool>,
}

impl PromptDecisions {
    fn answer(&self, fixed: Option<bool>, question: &str) -> bool {
        if let Some(answer) = fixed {
            return answer;
        }
        if !std::io::stdin().is_terminal() {
            warn!(question = %question, "No terminal to ask on, answering no");
            return false;
        }
        // Decisions are synchronous; keep the runtime's other workers free.
        tokio::task::block_in_place(|| ask(question))
    }
}

fn ask(question: &str) -> bool {
    ask_on(question, std::io::stdin().lock(), std::io::stderr())
}

/// Write the question and read one answer line. Any I/O failure answers "no".
fn ask_on(question: &str, mut input: impl BufRead, mut output: impl Write) -> bool {
    if let Err(e) = write!(output, "{} [y/N] ", question).and_then(|_| output.flush()) {
        warn!(error = %e, "Failed to write prompt, assuming no");
        return false;
    }

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(_) => parse_answer(&line),
        Err(e) => {
            warn!(error = %e, "Failed to read answer, assuming no");
            false
        }
    }
}

fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

impl DecisionStrategy for PromptDecisions {
    fn should_update(&self, spec: &TemplateSpec, existing: &VmSummary) -> bool {
        let question = format!(
            "VM {} ({}) already exists. Destroy it and rebuild template '{}'?",
            existing.vm_id, existing.name, spec.name
        );
        self.answer(self.update_existing, &question)
    }

    fn should_convert_clones(&self, spec: &TemplateSpec, clones: &[LinkedClone]) -> bool {
        let list: Vec<String> = clones
            .iter()
            .map(|c| format!("{} ({}, {})", c.vm_id, c.name, if c.run_state.is_running() { "running" } else { "stopped" }))
            .collect();
        let question = format!(
            "Template '{}' has linked clones: {}. Convert them to full clones? Running clones are stopped and restarted.",
            spec.name,
            list.join(", ")
        );
        self.answer(self.convert_clones, &question)
    }

    fn confirm_unknown_storage(&self, pool: &StoragePool) -> bool {
        let question = format!(
            "Layout of storage pool '{}' could not be determined. Use it anyway?",
            pool.name
        );
        self.answer(self.allow_unknown_storage, &question)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use templar_hypervisor::{StorageKind, VmId, VmRunState};

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("y\n"));
        assert!(parse_answer(" YES "));
        assert!(!parse_answer("\n"));
        assert!(!parse_answer("nope"));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ask_on_reads_answer() {
        let mut shown = Vec::new();
        assert!(ask_on("Destroy VM 9000?", "yes\n".as_bytes(), &mut shown));
        assert_eq!(String::from_utf8(shown).unwrap(), "Destroy VM 9000? [y/N] ");
    }

    #[test]
    fn test_unwritable_prompt_answers_no() {
        // A "yes" waiting on input must not be consumed when the question was never shown.
        let mut input = "yes\n".as_bytes();
        assert!(!ask_on("Destroy VM 9000?", &mut input, BrokenPipe));
        assert_eq!(input, b"yes\n");
    }

    #[test]
    fn test_flags_answer_without_prompting() {
        let decisions = PromptDecisions {
            update_existing: Some(true),
            convert_clones: Some(false),
            allow_unknown_storage: Some(true),
        };
        let spec = TemplateSpec::new("ubuntu", 9000, "https://x/u.img", "u.img");
        let existing = VmSummary {
            vm_id: VmId(9000),
            name: "ubuntu".into(),
            run_state: VmRunState::Stopped,
        };
        assert!(decisions.should_update(&spec, &existing));
        assert!(!decisions.should_convert_clones(&spec, &[]));
        assert!(decisions.confirm_unknown_storage(&StoragePool::new("nas", StorageKind::Unknown)));
    }
}
