use anyhow::Context;
use clap::{Parser, Subcommand};
use flowdock_client::{ClientEvent, FlowId, Message, StreamMessage};
use flowdock_config::{load as load_config, ClientConfig};
use flowdock_runtime::{telemetry, ClientServices};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "flowdock-tail")]
#[command(about = "Flowdock client (tails joined flows by default)")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow joined flows and log every client event (default)
    Tail,
    /// List the flows visible to the configured user
    Flows,
    /// Post a chat message to a flow
    Send {
        /// Flow id to post into
        #[arg(long)]
        flow: String,
        /// Message text
        content: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing().context("failed to initialise tracing")?;
    let config = load_config().context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Tail) {
        Commands::Tail => run_tail(config).await,
        Commands::Flows => list_flows(config).await,
        Commands::Send { flow, content } => send_message(config, flow, content).await,
    }
}

async fn run_tail(config: ClientConfig) -> anyhow::Result<()> {
    let services = ClientServices::connect(&config)?;
    let mut events = services.client.subscribe();
    services
        .client
        .init()
        .await
        .context("failed to initialise flowdock client")?;

    info!(client = %services.client.summary().await, "tailing flows");

    let shutdown = flowdock_runtime::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event receiver lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    services.shutdown().await;
    Ok(())
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::JoinedFlow(flow) => info!(flow = %flow.id, name = %flow.name, "joined flow"),
        ClientEvent::LeftFlow(flow) => info!(flow = %flow.id, name = %flow.name, "left flow"),
        ClientEvent::JoinedFlows(flows) | ClientEvent::LeftFlows(flows) => {
            info!(event = event.name(), count = flows.len())
        }
        ClientEvent::FlowsRefreshed | ClientEvent::UsersRefreshed => info!(event = event.name()),
        ClientEvent::NewUsers(users) => {
            for user in users {
                info!(user = %user.id, name = %user.display_name(), "new user");
            }
        }
        ClientEvent::Message(message) => log_message(message),
        ClientEvent::Error { source, message } => warn!(%source, %message, "client error"),
    }
}

fn log_message(frame: &StreamMessage) {
    let message = &frame.message;
    let flow = message
        .flow
        .as_ref()
        .map(|flow| flow.name.as_str())
        .unwrap_or_default();
    let user = message
        .user
        .as_ref()
        .map(|user| user.display_name())
        .or(message.external_user_name.as_deref())
        .unwrap_or_default();

    match message.content_text() {
        Some(text) => info!(kind = %frame.kind, flow, user, "{text}"),
        None => info!(kind = %frame.kind, flow, user, content = %message.content),
    }
}

async fn list_flows(mut config: ClientConfig) -> anyhow::Result<()> {
    config.sync.update_joined_flows = false;
    config.sync.update_users = false;
    config.sync.auto_listen_for_messages = false;

    let services = ClientServices::initialise(&config).await?;
    let client = &services.client;
    let flows = client.flows().await;

    if flows.is_empty() {
        println!("No flows visible");
    } else {
        println!("Found {} flows:", flows.len());
        println!(
            "{:<40} {:<30} {:<8} {:<8} {:<8}",
            "ID", "Name", "Joined", "Open", "Users"
        );
        println!("{}", "-".repeat(98));

        for flow in flows {
            println!(
                "{:<40} {:<30} {:<8} {:<8} {:<8}",
                flow.id,
                flow.name,
                flow.joined,
                flow.open,
                flow.users.len()
            );
        }
    }

    services.shutdown().await;
    Ok(())
}

async fn send_message(config: ClientConfig, flow: String, content: String) -> anyhow::Result<()> {
    let services = ClientServices::connect(&config)?;
    let message = Message::chat(FlowId::from(flow), content);

    let response = services
        .client
        .send_message(&message)
        .await
        .context("failed to send message")?;

    match response.get("id") {
        Some(id) => println!("Sent message {id}"),
        None => println!("Sent message"),
    }
    Ok(())
}
