//! Terminal rendering for the CLI. Command results go to stdout, notices and
//! progress to stderr.

use colored::*;

use crate::models::{
    DocumentInfo, DocumentStatus, Flow, KnowledgeBase, Message, Role, ThreadInfo,
};
use crate::poller::{PollEvent, PollOutcome};
use crate::views::Banner;
use crate::views::knowledge::KbTurn;

pub struct VisualOutput;

impl VisualOutput {
    pub fn success(text: &str) {
        eprintln!("{} {}", "✓".bright_green(), text.green());
    }

    pub fn notice(text: &str) {
        eprintln!("{} {}", "•".bright_blue(), text);
    }

    pub fn banner(banner: &Banner) {
        eprintln!("{} {}", "✗".bright_red(), banner.text.red().bold());
        if banner.needs_login() {
            eprintln!("   {}", "Run `flowchat login <email>` first.".yellow());
        }
    }

    pub fn flows(flows: &[Flow]) {
        if flows.is_empty() {
            Self::notice("No flows yet.");
            return;
        }
        for flow in flows {
            println!(
                "{}  {}  {}",
                flow.id.dimmed(),
                flow.name.bright_white().bold(),
                flow.model.cyan()
            );
        }
    }

    pub fn flow(flow: &Flow) {
        println!("{} {}", "Flow:".bright_cyan(), flow.name.bright_white().bold());
        println!("   {} {}", "id:".dimmed(), flow.id);
        if let Some(description) = &flow.description {
            println!("   {} {}", "description:".dimmed(), description);
        }
        println!("   {} {}", "model:".dimmed(), flow.model.cyan());
        println!("   {} {}", "creator:".dimmed(), flow.creator_email);
        println!("   {} {}", "updated:".dimmed(), flow.updated_at.to_rfc3339());
        println!("   {}", "system prompt:".dimmed());
        for line in flow.system_prompt.lines() {
            println!("      {line}");
        }
    }

    pub fn models(models: &[(&str, &str)]) {
        for (id, name) in models {
            println!("{}  {}", id.cyan(), name);
        }
    }

    pub fn threads(threads: &[ThreadInfo], active: Option<&str>) {
        if threads.is_empty() {
            Self::notice("No threads for this flow.");
            return;
        }
        for thread in threads {
            let marker = if Some(thread.id.as_str()) == active {
                "▶".bright_yellow()
            } else {
                " ".normal()
            };
            println!(
                "{} {}  {}  {}",
                marker,
                thread.id.dimmed(),
                thread.title.bright_white(),
                format!("({} messages)", thread.message_count).dimmed()
            );
        }
    }

    pub fn transcript(title: &str, messages: &[Message]) {
        if !title.is_empty() {
            println!("{}", title.bright_white().bold());
        }
        for message in messages {
            Self::message(message);
        }
    }

    pub fn message(message: &Message) {
        let who = match message.role {
            Role::User => "you".bright_blue().bold(),
            Role::Assistant => "assistant".bright_magenta().bold(),
        };
        println!("{} {}", who, message.timestamp.format("%H:%M").to_string().dimmed());
        for line in message.content.lines() {
            println!("   {line}");
        }
    }

    pub fn knowledge_bases(kbs: &[KnowledgeBase]) {
        if kbs.is_empty() {
            Self::notice("No knowledge bases yet.");
            return;
        }
        for kb in kbs {
            println!(
                "{}  {}  {}",
                kb.id.dimmed(),
                kb.name.bright_white().bold(),
                format!("{} documents", kb.documents.len()).dimmed()
            );
        }
    }

    pub fn knowledge_base(kb: &KnowledgeBase) {
        println!("{} {}", "Knowledge base:".bright_cyan(), kb.name.bright_white().bold());
        if let Some(description) = &kb.description {
            println!("   {description}");
        }
        Self::documents(&kb.documents);
    }

    pub fn documents(docs: &[DocumentInfo]) {
        for doc in docs {
            println!(
                "   {} {}  {}  {}",
                status_label(doc.status),
                doc.file_name.bright_white(),
                human_size(doc.size_bytes).dimmed(),
                doc.doc_id.dimmed()
            );
        }
    }

    pub fn poll_event(event: &PollEvent) {
        match event {
            PollEvent::Observed { doc, attempt, .. } => {
                eprintln!(
                    "   {} {} {}",
                    status_label(doc.status),
                    doc.file_name,
                    format!("(check {})", attempt + 1).dimmed()
                );
            }
            PollEvent::Finished {
                doc_id, outcome, ..
            } => match outcome {
                PollOutcome::Terminal(_) => {}
                PollOutcome::AttemptsExhausted => eprintln!(
                    "   {} {}",
                    "Still processing, stopped checking".yellow(),
                    doc_id.dimmed()
                ),
                PollOutcome::Aborted => eprintln!(
                    "   {} {}",
                    "Gave up after repeated errors".red(),
                    doc_id.dimmed()
                ),
                PollOutcome::Cancelled => {}
            },
        }
    }

    pub fn kb_turn(turn: &KbTurn) {
        println!("{}", turn.content);
        if !turn.citations.is_empty() {
            println!("{}", "Sources:".bright_cyan());
            for (i, citation) in turn.citations.iter().enumerate() {
                let page = citation
                    .page_number
                    .map(|p| format!(" p.{p}"))
                    .unwrap_or_default();
                println!(
                    "   {}. {}{} {}",
                    (i + 1).to_string().cyan(),
                    citation.file_name.bright_white(),
                    page,
                    format!("({:.0}%)", citation.score * 100.0).dimmed()
                );
                println!("      {}", citation.text.italic());
            }
        }
    }
}

fn status_label(status: DocumentStatus) -> ColoredString {
    match status {
        DocumentStatus::Processing => "processing".yellow(),
        DocumentStatus::Ready => "ready".green(),
        DocumentStatus::Failed => "failed".red(),
        DocumentStatus::Unknown => "unknown".dimmed(),
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024 + 512 * 1024), "5.5 MB");
    }
}
