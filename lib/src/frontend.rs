//! Frontend adapters: how a transaction talks to a human (or doesn't).
//!
//! The engine calls *into* the frontend through this closed trait; the
//! frontend never calls back into the engine. The interactive adapter
//! renders tables and progress bars; the quiet adapter is a drop-in for
//! preinstall sync, repair re-materialization and noninteractive runs.

use std::cell::RefCell;
use std::io::BufRead;

use comfy_table::Table;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

use crate::resolve::{OpKind, Operation, Plan};
use crate::store::pull::PullProgress;

/// Response to [`Frontend::ready`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Run the plan.
    Continue,
    /// Abort the transaction.
    Abort,
}

/// Answer to a yes/no question.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Answer {
    /// Proceed.
    Yes,
    /// Skip the operation in question.
    No,
    /// Abort the transaction.
    Abort,
}

/// Non-fatal conditions surfaced to the user.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WarningKind {
    /// A ref is end-of-life with no successor.
    EndOfLife,
    /// A ref is end-of-life and names a successor.
    EndOfLifeRebased,
    /// A remote is missing or disabled.
    RemoteMissing,
    /// A related ref could not be resolved.
    RelatedRef,
}

/// How one operation ended.
#[derive(Debug, Clone)]
pub enum OpOutcome {
    /// Completed.
    Done,
    /// Not run: an upstream dependency failed, or the user declined.
    Skipped {
        /// Why it did not run.
        reason: String,
    },
    /// Ran and failed.
    Failed {
        /// The rendered error.
        message: String,
    },
}

/// The closed interface a transaction drives its user interface by.
pub trait Frontend: std::fmt::Debug {
    /// The plan is resolved; returning [`Readiness::Abort`] cancels.
    fn ready(&self, plan: &Plan) -> Readiness;
    /// An operation is about to run.
    fn op_begin(&self, op: &Operation);
    /// Pull progress for the running operation.
    fn progress(&self, op: &Operation, progress: &PullProgress);
    /// An operation finished.
    fn op_end(&self, op: &Operation, outcome: &OpOutcome);
    /// Pick one of several candidates; `None` aborts the resolution.
    fn choose_one(&self, prompt: &str, options: &[String]) -> Option<usize>;
    /// Ask a yes/no question.
    fn confirm(&self, prompt: &str) -> Answer;
    /// Surface a non-fatal condition.
    fn warn(&self, kind: WarningKind, detail: &str);
}

fn read_input_line() -> Option<String> {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

fn outcome_line(op: &Operation, outcome: &OpOutcome) -> String {
    match outcome {
        OpOutcome::Done => match &op.kind {
            OpKind::Install { remote, .. } => {
                format!("Installed {} from {remote}", op.refname)
            }
            OpKind::Update { remote, .. } => format!("Updated {} from {remote}", op.refname),
            OpKind::InstallBundle { path, .. } => {
                format!("Installed {} from bundle {path}", op.refname)
            }
            OpKind::Uninstall { .. } => format!("Uninstalled {}", op.refname),
        },
        OpOutcome::Skipped { reason } => format!("Skipped {}: {reason}", op.refname),
        OpOutcome::Failed { message } => {
            format!("Failed to {} {}: {message}", op.kind.verb(), op.refname)
        }
    }
}

/// The interactive terminal adapter.
#[derive(Debug, Default)]
pub struct InteractiveFrontend {
    /// Answer yes to every confirmation.
    pub assume_yes: bool,
    bar: RefCell<Option<ProgressBar>>,
}

impl InteractiveFrontend {
    /// Create one, optionally pre-answering confirmations.
    pub fn new(assume_yes: bool) -> Self {
        Self {
            assume_yes,
            bar: RefCell::new(None),
        }
    }

    fn render_plan(plan: &Plan) {
        let mut table = Table::new();
        table.load_preset(comfy_table::presets::UTF8_BORDERS_ONLY);
        table.set_header(vec!["", "Ref", "Remote", "Download", "Installed"]);
        for op in &plan.ops {
            table.add_row(vec![
                op.kind.verb().to_string(),
                op.refname.to_string(),
                op.kind.remote().unwrap_or("-").to_string(),
                HumanBytes(op.download_size).to_string(),
                HumanBytes(op.installed_size).to_string(),
            ]);
        }
        println!("{table}");
    }
}

impl Frontend for InteractiveFrontend {
    fn ready(&self, plan: &Plan) -> Readiness {
        if plan.is_empty() {
            return Readiness::Continue;
        }
        Self::render_plan(plan);
        println!(
            "Total download: {}, total installed: {}",
            HumanBytes(plan.download_total()),
            HumanBytes(plan.installed_total())
        );
        if self.assume_yes {
            return Readiness::Continue;
        }
        match self.confirm("Proceed with these changes?") {
            Answer::Yes => Readiness::Continue,
            _ => Readiness::Abort,
        }
    }

    fn op_begin(&self, op: &Operation) {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{msg:40} [{bar:24}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(format!("{} {}", op.kind.verb(), op.refname));
        *self.bar.borrow_mut() = Some(bar);
    }

    fn progress(&self, _op: &Operation, progress: &PullProgress) {
        if let Some(bar) = self.bar.borrow().as_ref() {
            bar.set_length(progress.total_objects);
            bar.set_position(progress.fetched_objects);
        }
    }

    fn op_end(&self, op: &Operation, outcome: &OpOutcome) {
        if let Some(bar) = self.bar.borrow_mut().take() {
            bar.finish_and_clear();
        }
        println!("{}", outcome_line(op, outcome));
    }

    fn choose_one(&self, prompt: &str, options: &[String]) -> Option<usize> {
        println!("{prompt}");
        for (i, opt) in options.iter().enumerate() {
            println!("  {}) {opt}", i + 1);
        }
        loop {
            print!("Which do you want to use ({}-{})? ", 1, options.len());
            use std::io::Write as _;
            let _ = std::io::stdout().flush();
            let line = read_input_line()?;
            if line.is_empty() {
                return None;
            }
            match line.parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => return Some(n - 1),
                _ => println!("Please enter a number between 1 and {}", options.len()),
            }
        }
    }

    fn confirm(&self, prompt: &str) -> Answer {
        if self.assume_yes {
            return Answer::Yes;
        }
        loop {
            print!("{prompt} [y/n/?] ");
            use std::io::Write as _;
            let _ = std::io::stdout().flush();
            let Some(line) = read_input_line() else {
                return Answer::Abort;
            };
            match line.to_lowercase().as_str() {
                "y" | "yes" => return Answer::Yes,
                "n" | "no" => return Answer::No,
                "?" => {
                    println!("y - proceed");
                    println!("n - skip this operation");
                    println!("EOF (Ctrl-D) - abort the transaction");
                }
                _ => {}
            }
        }
    }

    fn warn(&self, _kind: WarningKind, detail: &str) {
        eprintln!("Warning: {detail}");
    }
}

/// The quiet adapter: no prompts, one line per operation, warnings to
/// the log stream.
#[derive(Debug, Default)]
pub struct QuietFrontend;

impl Frontend for QuietFrontend {
    fn ready(&self, _plan: &Plan) -> Readiness {
        Readiness::Continue
    }

    fn op_begin(&self, op: &Operation) {
        tracing::debug!("begin {} {}", op.kind.verb(), op.refname);
    }

    fn progress(&self, _op: &Operation, _progress: &PullProgress) {}

    fn op_end(&self, op: &Operation, outcome: &OpOutcome) {
        println!("{}", outcome_line(op, outcome));
    }

    fn choose_one(&self, _prompt: &str, options: &[String]) -> Option<usize> {
        // Anything genuinely ambiguous has to abort without a human
        if options.len() == 1 {
            Some(0)
        } else {
            None
        }
    }

    fn confirm(&self, _prompt: &str) -> Answer {
        Answer::Yes
    }

    fn warn(&self, _kind: WarningKind, detail: &str) {
        tracing::warn!("{detail}");
    }
}
