//! Basic pipeline example for a chat moderation bot.
//!
//! Wires the four queues to a handful of handlers, sends some traffic
//! through them (including a failing command and a failing event
//! subscriber), runs a bulk role assignment with retry and finally drains.
//!
//! Run with `RUST_LOG=herald=debug,pipeline_basic=info cargo run --example pipeline_basic`.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use herald::*;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum CommandKind {
    Ban,
    Define,
}

impl MessageKind for CommandKind {
    fn all() -> &'static [Self] {
        &[CommandKind::Ban, CommandKind::Define]
    }

    fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Ban => "ban",
            CommandKind::Define => "define",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
enum Command {
    Ban { user: String },
    Define { term: String },
}

impl Message for Command {
    type Kind = CommandKind;

    fn kind(&self) -> CommandKind {
        match self {
            Command::Ban { .. } => CommandKind::Ban,
            Command::Define { .. } => CommandKind::Define,
        }
    }
}

impl RequestMessage for Command {
    type Response = String;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum GatewayKind {
    MemberJoined,
}

impl MessageKind for GatewayKind {
    fn all() -> &'static [Self] {
        &[GatewayKind::MemberJoined]
    }

    fn as_str(&self) -> &'static str {
        "member_joined"
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct MemberJoined {
    user: String,
}

impl Message for MemberJoined {
    type Kind = GatewayKind;

    fn kind(&self) -> GatewayKind {
        GatewayKind::MemberJoined
    }
}

struct Moderation;

#[async_trait]
impl CommandHandler<Command> for Moderation {
    async fn handle(&self, command: &Command, cx: &HandlerContext) -> Result<(), HandlerError> {
        match command {
            Command::Ban { user } if user.is_empty() => Err(HandlerError::validation("Who should be banned?")),
            Command::Ban { user } => {
                tracing::info!(message_id = %cx.meta().id, "banned {user}");
                cx.reply(&format!("{user} has been banned"))
                    .await
                    .map_err(HandlerError::transient)?;
                Ok(())
            }
            Command::Define { term } => Err(HandlerError::unhandled(anyhow::anyhow!(
                "dictionary backend unreachable while defining {term}"
            ))),
        }
    }
}

#[async_trait]
impl RequestHandler<Command> for Moderation {
    async fn handle(&self, command: &Command, _cx: &HandlerContext) -> Result<String, HandlerError> {
        match command {
            Command::Define { term } => Ok(format!("{term}: a word worth looking up")),
            Command::Ban { .. } => Err(HandlerError::validation("bans are commands, not lookups")),
        }
    }
}

struct Welcome;

#[async_trait]
impl EventHandler<MemberJoined> for Welcome {
    fn name(&self) -> &str {
        "welcome"
    }

    async fn handle(&self, event: &MemberJoined, _cx: &HandlerContext) -> Result<(), HandlerError> {
        tracing::info!("welcome, {}!", event.user);
        Ok(())
    }
}

struct Autorole;

#[async_trait]
impl EventHandler<MemberJoined> for Autorole {
    fn name(&self) -> &str {
        "autorole"
    }

    async fn handle(&self, event: &MemberJoined, _cx: &HandlerContext) -> Result<(), HandlerError> {
        Err(HandlerError::transient(anyhow::anyhow!(
            "role service timed out for {}",
            event.user
        )))
    }
}

/// Prints replies instead of posting them to a channel.
struct ConsoleReply;

#[async_trait]
impl ReplyContext for ConsoleReply {
    async fn reply(&self, text: &str) -> anyhow::Result<()> {
        println!("[REPLY] {text}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let moderation = Arc::new(Moderation);
    let (reporter, mut reports) = ChannelReporter::new();
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            println!("[OPS LOG] {:?}: {}", report.origin, report.summary);
        }
    });

    let pipeline: Pipeline<Command, Command, Command, MemberJoined> = Pipeline::builder()
        .with_config(PipelineConfig::default().with_max_parallel_commands(4))
        .with_commands(Arc::new(
            CommandRegistry::<Command>::builder(MessageCategory::Command)
                .register(CommandKind::Ban, moderation.clone())
                .register(CommandKind::Define, moderation.clone())
                .build()?,
        ))
        .with_parallel_commands(Arc::new(
            CommandRegistry::<Command>::builder(MessageCategory::ParallelCommand)
                .register(CommandKind::Ban, moderation.clone())
                .register(CommandKind::Define, moderation.clone())
                .build()?,
        ))
        .with_requests(Arc::new(
            RequestRegistry::<Command>::builder(MessageCategory::Request)
                .register(CommandKind::Ban, moderation.clone())
                .register(CommandKind::Define, moderation)
                .build()?,
        ))
        .with_events(Arc::new(
            EventRegistry::<MemberJoined>::builder(MessageCategory::Event)
                .register(GatewayKind::MemberJoined, Arc::new(Welcome))
                .register(GatewayKind::MemberJoined, Arc::new(Autorole))
                .build()?,
        ))
        .with_reporter(Arc::new(reporter))
        .build()?;

    pipeline.start().await?;
    pipeline.readiness().mark_ready();

    let reply: Arc<dyn ReplyContext> = Arc::new(ConsoleReply);
    pipeline.enqueue_command(Command::Ban { user: "spammer".into() }, Some(reply.clone()))?;
    pipeline.enqueue_command(Command::Ban { user: String::new() }, Some(reply.clone()))?;
    pipeline.enqueue_parallel_command(Command::Define { term: "ferris".into() }, Some(reply.clone()))?;
    pipeline.publish_event(MemberJoined { user: "newcomer".into() })?;

    let definition = pipeline
        .send_request(Command::Define { term: "crab".into() }, None)?
        .recv()
        .await?;
    println!("[RESPONSE] {definition}");

    // Bulk role assignment where every third call is rate limited once.
    let calls = AtomicU32::new(0);
    let (progress, mut updates) = tokio::sync::mpsc::unbounded_channel();
    let outcome = execute_with_retry(
        (1..=20_u64).collect(),
        |member| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call % 3 == 2 {
                    return Err(HandlerError::transient(anyhow::anyhow!("429 for member {member}")));
                }
                Ok(())
            }
        },
        &RetryConfig::new("assign_role").with_base_delay(50),
        &pipeline.shutdown_token(),
        Some(&progress),
    )
    .await;
    while let Ok(update) = updates.try_recv() {
        println!("[PROGRESS] {}% ({}/{})", update.percent, update.completed, update.total);
    }
    println!(
        "[BULK] succeeded={} failed={} cancelled={}",
        outcome.succeeded, outcome.failed, outcome.cancelled
    );

    for snapshot in pipeline.queue_snapshots() {
        println!("[QUEUE] {} depth={} closed={}", snapshot.name, snapshot.depth, snapshot.closed);
    }

    pipeline.drain().await?;
    Ok(())
}
