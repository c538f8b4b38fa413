use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, reload};

use flowchat::FlowChat;
use flowchat::config::Config;
use flowchat::models::{AVAILABLE_MODELS, DocumentUpload, FlowUpdate, KnowledgeBaseUpdate};
use flowchat::transcript::Location;
use flowchat::views::Banner;
use flowchat::views::flows::FlowDraft;
use flowchat::visual::VisualOutput;

#[derive(Parser)]
#[command(name = "flowchat", version)]
#[command(about = "Chat with prompt flows and document knowledge bases")]
#[command(
    after_help = "Environment:\n  FLOWCHAT_API_URL       Service base URL\n  FLOWCHAT_CONFIG_PATH   YAML config file (default flowchat.yaml)\n  RUST_LOG               Log filter"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with an email address
    Login { email: String },
    Logout,
    /// Show the signed-in email
    Whoami,
    Flows {
        #[command(subcommand)]
        command: FlowsCommand,
    },
    Chat {
        #[command(subcommand)]
        command: ChatCommand,
    },
    /// Knowledge bases and their documents
    Kb {
        #[command(subcommand)]
        command: KbCommand,
    },
}

#[derive(Subcommand)]
enum FlowsCommand {
    List {
        /// Only flows you created
        #[arg(long)]
        mine: bool,
    },
    Show {
        id: String,
    },
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        system_prompt: String,
        #[arg(long, default_value = AVAILABLE_MODELS[0].0)]
        model: String,
        #[arg(long)]
        description: Option<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        id: String,
    },
    /// Models a flow can use
    Models,
}

#[derive(Subcommand)]
enum ChatCommand {
    /// Send a message, starting a new thread unless one is given
    Send {
        #[arg(long)]
        flow: String,
        #[arg(long)]
        thread: Option<String>,
        message: String,
    },
    Threads {
        #[arg(long)]
        flow: String,
    },
    Show {
        #[arg(long)]
        flow: String,
        thread: String,
    },
    Rename {
        #[arg(long)]
        flow: String,
        thread: String,
        title: String,
    },
    Delete {
        #[arg(long)]
        flow: String,
        thread: String,
    },
}

#[derive(Subcommand)]
enum KbCommand {
    List,
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        id: String,
    },
    Show {
        id: String,
        /// Keep checking documents that are still processing
        #[arg(long)]
        watch: bool,
    },
    Upload {
        id: String,
        path: PathBuf,
        /// Return as soon as the upload is accepted
        #[arg(long)]
        no_wait: bool,
    },
    /// Ask a question answered from the knowledge base's documents
    Ask {
        id: String,
        question: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The subscriber goes up before the config loads so its diagnostics are
    // kept; the configured level is swapped in afterwards.
    let from_env = EnvFilter::try_from_default_env().ok();
    let explicit = from_env.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = Config::load();
    if !explicit {
        match config.logging.level.parse::<EnvFilter>() {
            Ok(level) => {
                if let Err(e) = filter_handle.reload(level) {
                    tracing::warn!("Failed to apply log level: {}", e);
                }
            }
            Err(e) => tracing::warn!(
                "Log level '{}' is not a valid tracing filter ({}); keeping 'info'",
                config.logging.level,
                e
            ),
        }
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<Banner>() {
                Some(banner) => VisualOutput::banner(banner),
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let mut app = FlowChat::new(config)?;

    match cli.command {
        Commands::Login { email } => {
            let identity = app.login(&email).await?;
            VisualOutput::success(&format!("Signed in as {}", identity.email()));
        }
        Commands::Logout => {
            app.logout()?;
            VisualOutput::success("Signed out");
        }
        Commands::Whoami => match app.identity() {
            Some(identity) => println!("{}", identity.email()),
            None => VisualOutput::notice("Not signed in"),
        },
        Commands::Flows { command } => run_flows(&app, command).await?,
        Commands::Chat { command } => run_chat(&app, command).await?,
        Commands::Kb { command } => run_kb(&app, command).await?,
    }
    Ok(())
}

async fn run_flows(app: &FlowChat, command: FlowsCommand) -> Result<()> {
    let mut view = app.flows_view();
    match command {
        FlowsCommand::List { mine } => {
            if mine {
                view.load_own().await?;
            } else {
                view.load_all().await?;
            }
            VisualOutput::flows(view.flows());
        }
        FlowsCommand::Show { id } => VisualOutput::flow(&view.show(&id).await?),
        FlowsCommand::Create {
            name,
            system_prompt,
            model,
            description,
        } => {
            let mut draft = FlowDraft::new(name, system_prompt);
            draft.model = model;
            draft.description = description;
            let flow = view.create(draft).await?;
            VisualOutput::success(&format!("Created flow {} ({})", flow.name, flow.id));
        }
        FlowsCommand::Update {
            id,
            name,
            system_prompt,
            model,
            description,
        } => {
            let update = FlowUpdate {
                name,
                description,
                system_prompt,
                model,
            };
            let flow = view.update(&id, update).await?;
            VisualOutput::flow(&flow);
        }
        FlowsCommand::Delete { id } => {
            view.delete(&id).await?;
            VisualOutput::success(&format!("Deleted flow {id}"));
        }
        FlowsCommand::Models => VisualOutput::models(flowchat::views::FlowsView::models()),
    }
    Ok(())
}

async fn run_chat(app: &FlowChat, command: ChatCommand) -> Result<()> {
    let mut view = app.chat_view();
    match command {
        ChatCommand::Send {
            flow,
            thread,
            message,
        } => {
            view.restore(&Location {
                flow: Some(flow),
                thread,
            })
            .await?;
            view.send(&message).await?;
            let transcript = view.transcript();
            if let Some(reply) = transcript.messages().last() {
                VisualOutput::message(reply);
            }
            VisualOutput::notice(&format!(
                "thread {} \"{}\"",
                transcript.session_id().unwrap_or("-"),
                transcript.title()
            ));
        }
        ChatCommand::Threads { flow } => {
            view.select_flow(&flow).await?;
            VisualOutput::threads(view.transcript().threads(), None);
        }
        ChatCommand::Show { flow, thread } => {
            view.restore(&Location {
                flow: Some(flow),
                thread: Some(thread),
            })
            .await?;
            let transcript = view.transcript();
            VisualOutput::transcript(transcript.title(), transcript.messages());
        }
        ChatCommand::Rename {
            flow,
            thread,
            title,
        } => {
            view.select_flow(&flow).await?;
            if view.rename(&thread, &title).await? {
                VisualOutput::threads(view.transcript().threads(), Some(&thread));
            } else {
                VisualOutput::notice("Title is empty; nothing changed");
            }
        }
        ChatCommand::Delete { flow, thread } => {
            view.select_flow(&flow).await?;
            view.delete_thread(&thread).await?;
            VisualOutput::success(&format!("Deleted thread {thread}"));
        }
    }
    Ok(())
}

async fn run_kb(app: &FlowChat, command: KbCommand) -> Result<()> {
    match command {
        KbCommand::List => {
            let mut view = app.knowledge_bases_view();
            view.load().await?;
            VisualOutput::knowledge_bases(view.knowledge_bases());
        }
        KbCommand::Create { name, description } => {
            let mut view = app.knowledge_bases_view();
            let kb = view.create(&name, description.as_deref()).await?;
            VisualOutput::success(&format!("Created knowledge base {} ({})", kb.name, kb.id));
        }
        KbCommand::Update {
            id,
            name,
            description,
        } => {
            let mut view = app.knowledge_bases_view();
            let kb = view
                .update(&id, KnowledgeBaseUpdate { name, description })
                .await?;
            VisualOutput::knowledge_base(&kb);
        }
        KbCommand::Delete { id } => {
            let mut view = app.knowledge_bases_view();
            view.delete(&id).await?;
            VisualOutput::success(&format!("Deleted knowledge base {id}"));
        }
        KbCommand::Show { id, watch } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_poll_events(rx));
            let mut view = app.knowledge_base_view(Some(tx));
            let polling = view.load(&id).await?;
            if let Some(kb) = view.snapshot().await {
                VisualOutput::knowledge_base(&kb);
            }
            if watch && polling > 0 {
                VisualOutput::notice(&format!("Watching {polling} document(s)"));
                view.wait_for_polls().await;
            }
            drop(view);
            let _ = printer.await;
        }
        KbCommand::Upload { id, path, no_wait } => {
            let upload = DocumentUpload::from_path(&path).await?;
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_poll_events(rx));
            let mut view = app.knowledge_base_view(Some(tx));
            view.load(&id).await?;
            let doc = view.upload(upload).await?;
            VisualOutput::success(&format!("Uploaded {} ({})", doc.file_name, doc.doc_id));
            if !no_wait {
                view.wait_for_polls().await;
                if let Some(kb) = view.snapshot().await {
                    VisualOutput::documents(&kb.documents);
                }
            }
            drop(view);
            let _ = printer.await;
        }
        KbCommand::Ask { id, question } => {
            let mut view = app.knowledge_base_view(None);
            view.load(&id).await?;
            let answer = view.ask(&question).await?;
            VisualOutput::kb_turn(&answer);
        }
    }
    Ok(())
}

async fn print_poll_events(mut rx: mpsc::UnboundedReceiver<flowchat::poller::PollEvent>) {
    while let Some(event) = rx.recv().await {
        VisualOutput::poll_event(&event);
    }
}
