use anyhow::Context;
use celeste_agent::{
    calculate_target_tokens, ChatCompletionResult, ClientConfig, LlmClient, SimulatedStream,
    SimulatedStreamConfig, StreamState, Summarizer,
};
use celeste_core::ChatMessage;
use celeste_session::{
    estimate_tokens, format_cost, format_number, format_token_count, truncate_to_limit,
    ContextTracker, Session, UsageMetrics,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PERSONA: &str = "You are Celeste, a playful and helpful AI assistant.";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Parser)]
#[command(name = "celeste", about = "Celeste, a streaming LLM chat client with context management")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "celeste.toml")]
    config: PathBuf,

    /// Session file to resume and save
    #[arg(short, long, default_value = "celeste-session.json")]
    session: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and stream the reply
    Chat { message: String },
    /// Summarize older messages now
    Compact,
    /// Show context and usage for the session
    Status,
    /// Forget the session history
    Clear,
}

#[derive(Deserialize)]
struct CelesteConfig {
    llm: ClientConfig,
    #[serde(default = "default_persona")]
    persona: String,
}

fn default_persona() -> String {
    DEFAULT_PERSONA.to_string()
}

impl Default for CelesteConfig {
    fn default() -> Self {
        Self {
            llm: ClientConfig::new(DEFAULT_MODEL, ""),
            persona: default_persona(),
        }
    }
}

async fn load_config(path: &Path) -> anyhow::Result<CelesteConfig> {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(text) => toml::from_str(&text)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file, using defaults");
            CelesteConfig::default()
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read config file '{}'", path.display()));
        }
    };
    config.llm = config.llm.with_env_overrides();
    Ok(config)
}

async fn load_session(path: &Path, model: &str) -> anyhow::Result<Session> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("Corrupt session file '{}'", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Session::new().with_model(model)),
        Err(e) => Err(e).with_context(|| format!("Failed to read session '{}'", path.display())),
    }
}

async fn save_session(path: &Path, session: &Session) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(session)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write session '{}'", path.display()))
}

/// Cancels in-flight exchanges on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

async fn compact(
    client: &LlmClient,
    cancel: &CancellationToken,
    session: &mut Session,
    tracker: &mut ContextTracker,
) {
    // The summarizer reads the session's count, which may predate the tracker.
    tracker.persist(session);
    let target = calculate_target_tokens(tracker.max_tokens);
    match Summarizer::new(client).compact(cancel, session, target).await {
        Ok(report) if report.is_noop() => {}
        Ok(report) => {
            tracker.record_compaction(&session.messages);
            eprintln!("{}", report.summary_line());
        }
        Err(e) => warn!(error = %e, "Auto-compaction failed, continuing with full history"),
    }
}

/// Saves the assistant turn and its usage. A reply with no text and no tool
/// calls is not saved; its usage still counts. Returns whether it was saved.
fn record_reply(
    session: &mut Session,
    tracker: &mut ContextTracker,
    result: ChatCompletionResult,
) -> bool {
    let reply = ChatMessage::assistant_with_tools(result.content, result.tool_calls);
    let saved = !reply.is_blank();
    let (prompt, completion) = result
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    if saved {
        session.add_message_with_tokens(reply, prompt, completion);
    } else {
        warn!(
            finish_reason = %result.finish_reason,
            "Empty reply from model, not saved to the session"
        );
        if prompt > 0 || completion > 0 {
            session.update_usage_metrics(prompt, completion);
        }
    }

    match result.usage {
        Some(usage) => tracker.update_tokens(prompt, completion, usage.total_tokens),
        None => tracker.update_from_estimate(&session.messages),
    }
    saved
}

async fn chat(
    config: &CelesteConfig,
    client: &LlmClient,
    session: &mut Session,
    tracker: &mut ContextTracker,
    message: String,
) -> anyhow::Result<()> {
    let cancel = cancel_on_interrupt();
    session.add_message_with_tokens(ChatMessage::user(message), 0, 0);
    tracker.update_from_estimate(&session.messages);

    if tracker.should_compact() {
        compact(client, &cancel, session, tracker).await;
    }

    let mut outgoing = session.messages.clone();
    if tracker.current_tokens > tracker.max_tokens {
        outgoing = truncate_to_limit(&outgoing, &session.model, estimate_tokens(&config.persona));
        tracker.record_truncation(&outgoing);
        session
            .usage_metrics
            .get_or_insert_with(UsageMetrics::new)
            .truncation_count += 1;
    }

    let state = StreamState::new();
    let live = !config.llm.simulate_typing;
    let mut stdout = std::io::stdout();
    let result = client
        .send_stream(&cancel, &outgoing, &[], |chunk| {
            state.observe(&chunk);
            if live && !chunk.content_delta.is_empty() {
                print!("{}", chunk.content_delta);
                let _ = stdout.flush();
            }
        })
        .await?;

    if !live {
        if state.is_dump() {
            let pacing = SimulatedStreamConfig::with_speed(config.llm.typing_speed);
            let mut replay = SimulatedStream::new(&result.content, pacing);
            loop {
                let tick = replay.next_tick();
                print!("{}", tick.chunk);
                let _ = std::io::stdout().flush();
                if tick.done {
                    break;
                }
                tokio::time::sleep(tick.delay).await;
            }
        } else {
            print!("{}", result.content);
        }
    }
    println!();

    record_reply(session, tracker, result);

    if tracker.should_warn() {
        if let Some(msg) = tracker.warning_message() {
            eprintln!("{} {msg}", tracker.status_indicator());
        }
        tracker.mark_warning_shown();
    }
    Ok(())
}

fn print_status(session: &Session, tracker: &ContextTracker) {
    println!("Model:    {}", session.model);
    println!("Messages: {}", session.message_count());
    println!(
        "Context:  {} {}",
        tracker.status_indicator(),
        tracker.context_summary()
    );
    println!(
        "Room for ~{} more messages before warnings",
        tracker.estimate_messages_until_limit(0)
    );
    if let Some(metrics) = &session.usage_metrics {
        println!(
            "Usage:    {} in / {} out tokens, {} ({} per message)",
            format_number(metrics.total_input_tokens),
            format_number(metrics.total_output_tokens),
            format_cost(metrics.estimated_cost),
            format_cost(metrics.cost_per_message()),
        );
        println!(
            "History:  {} compactions, {} truncations, {} remaining tokens",
            tracker.compaction_count,
            tracker.truncation_count,
            format_token_count(tracker.remaining_tokens()),
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    let mut session = load_session(&cli.session, &config.llm.model).await?;
    let model = config.llm.model.clone();
    session.model.clone_from(&model);

    let mut client = LlmClient::new(config.llm.clone());
    client.set_system_prompt(config.persona.clone());
    info!(model = %model, backend = %client.backend_kind(), "Celeste ready");

    let mut tracker = ContextTracker::for_session(&session, &model, config.llm.context_limit);

    match cli.command {
        Commands::Chat { message } => {
            chat(&config, &client, &mut session, &mut tracker, message).await?;
        }
        Commands::Compact => {
            let cancel = cancel_on_interrupt();
            compact(&client, &cancel, &mut session, &mut tracker).await;
        }
        Commands::Status => {
            print_status(&session, &tracker);
            client.close();
            return Ok(());
        }
        Commands::Clear => {
            session.clear_messages();
            tracker = ContextTracker::for_session(&session, &model, config.llm.context_limit);
            println!("Session cleared.");
        }
    }

    tracker.persist(&mut session);
    save_session(&cli.session, &session).await?;
    client.close();
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use celeste_agent::{BackendKind, LlmBackend, StreamAccumulator, StreamChunk, TokenUsage};
    use celeste_core::{CelesteResult, SkillDefinition, ToolCall};

    /// Answers every request with the same summary text.
    struct FixedSummary;

    #[async_trait]
    impl LlmBackend for FixedSummary {
        async fn send_stream(
            &self,
            _cancel: &CancellationToken,
            _messages: &[ChatMessage],
            _tools: &[SkillDefinition],
            callback: &mut (dyn FnMut(StreamChunk) + Send),
        ) -> CelesteResult<ChatCompletionResult> {
            let mut acc = StreamAccumulator::new();
            callback(acc.delta("They talked about the stars."));
            let (chunk, result) = acc.finish();
            callback(chunk);
            Ok(result)
        }

        fn set_system_prompt(&mut self, _prompt: String) {}

        fn kind(&self) -> BackendKind {
            BackendKind::OpenAi
        }
    }

    fn session_with_user_turn() -> Session {
        let mut session = Session::new().with_model("gpt-4o");
        session.add_message_with_tokens(ChatMessage::user("read my chart"), 0, 0);
        session
    }

    #[test]
    fn test_blank_reply_is_not_saved() {
        let mut session = session_with_user_turn();
        let mut tracker = ContextTracker::for_session(&session, "gpt-4o", None);
        let result = ChatCompletionResult {
            finish_reason: "SAFETY".into(),
            usage: Some(TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 0,
                total_tokens: 12,
            }),
            ..ChatCompletionResult::default()
        };

        assert!(!record_reply(&mut session, &mut tracker, result));
        assert_eq!(session.message_count(), 1);
        assert!(ChatMessage::validate_sequence(&session.messages).is_ok());
        assert_eq!(session.usage_metrics.as_ref().unwrap().total_input_tokens, 12);
        assert_eq!(tracker.current_tokens, 12);
    }

    #[test]
    fn test_reply_with_only_tool_calls_is_saved() {
        let mut session = session_with_user_turn();
        let mut tracker = ContextTracker::for_session(&session, "gpt-4o", None);
        let result = ChatCompletionResult {
            tool_calls: vec![ToolCall::new("call_1", "tarot", "{}")],
            finish_reason: "tool_calls".into(),
            ..ChatCompletionResult::default()
        };

        assert!(record_reply(&mut session, &mut tracker, result));
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.messages[1].tool_calls[0].name, "tarot");
    }

    #[tokio::test]
    async fn test_compact_uses_tracker_count_for_legacy_session() {
        let mut session = Session::new().with_model("gpt-4o");
        for i in 0..40 {
            let text = format!("turn {i}: {}", "z".repeat(400));
            let msg = if i % 2 == 0 {
                ChatMessage::user(text)
            } else {
                ChatMessage::assistant(text)
            };
            session.add_message(msg);
        }
        assert_eq!(session.token_count, 0);
        assert!(session.context.is_none());

        let mut tracker = ContextTracker::for_session(&session, "gpt-4o", Some(4_000));
        assert!(tracker.current_tokens > calculate_target_tokens(tracker.max_tokens));

        let client = LlmClient::from_backend(
            Box::new(FixedSummary),
            ClientConfig::new("gpt-4o", "sk-test"),
        );
        compact(&client, &CancellationToken::new(), &mut session, &mut tracker).await;

        assert!(session.message_count() < 40);
        assert!(session.messages.iter().any(ChatMessage::is_summary));
        assert_eq!(tracker.compaction_count, 1);
    }
}
