//! `nuvra`: operator CLI for the CRM backend.
//!
//! Every command runs against the database and config under `~/.nuvra`
//! (or `NUVRA_HOME`). Failures print the Portuguese status-line message and
//! exit non-zero; `RUST_LOG=debug` shows the underlying error.

use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;

use nuvra_lib::config::Theme;
use nuvra_lib::db::{ActivityFilter, ConversationFilter, NotificationQuery};
use nuvra_lib::reports::{self, DEFAULT_REPORT_DAYS, MAX_REPORT_DAYS};
use nuvra_lib::services;
use nuvra_lib::state::AppContext;
use nuvra_lib::sync::SyncError;
use nuvra_lib::timeline::merge_timeline;
use nuvra_lib::{CrmError, ErrorReport};

#[derive(Parser)]
#[command(name = "nuvra", about = "Nuvra CRM backend", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Google Calendar configuration and connection state
    Status {
        #[arg(long)]
        user: Option<String>,
    },
    /// Connect Google Calendar through the browser
    Connect {
        #[arg(long)]
        user: String,
    },
    /// Turn calendar sync off; activities keep their event links
    Disconnect {
        #[arg(long)]
        user: String,
    },
    /// Import external events and export unlinked activities
    Sync {
        #[arg(long)]
        user: String,
    },
    /// Calendars visible to the connected account
    Calendars {
        #[arg(long)]
        user: String,
    },
    /// Sync against another calendar
    UseCalendar {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: String,
    },
    /// Agenda of activities and external events
    Timeline {
        #[arg(long)]
        user: String,
    },
    /// Issue a bearer token for the function server
    Session {
        #[arg(long)]
        user: String,
    },
    /// List notifications, newest first
    Notifications {
        #[arg(long)]
        user: String,
        #[arg(long)]
        unread: bool,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Emit reminder and overdue alerts for pending activities
    Alerts {
        #[arg(long)]
        user: String,
        /// How far ahead a reminder is sent
        #[arg(
            long,
            default_value = "60",
            value_parser = clap::value_parser!(i64).range(0..=services::activities::MAX_LEAD_MINUTES)
        )]
        lead_minutes: i64,
    },
    /// Delete expired notifications
    Cleanup,
    /// Pipeline overview for the last N days
    Report {
        #[arg(long)]
        user: String,
        #[arg(
            long,
            default_value_t = DEFAULT_REPORT_DAYS,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_REPORT_DAYS))
        )]
        days: u32,
    },
    /// Chat inbox
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },
    /// Application settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    SetTheme { theme: String },
    SetLanguage { language: String },
    SetTimezone { timezone: String },
}

#[derive(Subcommand)]
enum ChatAction {
    /// Conversations, most recent message first
    Conversations {
        #[arg(long)]
        user: String,
        #[arg(long)]
        search: Option<String>,
    },
    /// Messages of one conversation, oldest first
    Messages {
        #[arg(long)]
        user: String,
        #[arg(long)]
        conversation: String,
    },
    /// Reply in a conversation
    Send {
        #[arg(long)]
        user: String,
        #[arg(long)]
        conversation: String,
        #[arg(long, default_value = "Nuvra")]
        sender: String,
        content: String,
    },
    /// Mark every message of a conversation read
    Read {
        #[arg(long)]
        user: String,
        #[arg(long)]
        conversation: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let report = ErrorReport::from(&err);
            log::debug!("{}", report.message);
            eprintln!("{}", report.user_message);
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CrmError> {
    let text =
        serde_json::to_string_pretty(value).map_err(|e| CrmError::Storage(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

async fn run(command: Command) -> Result<(), CrmError> {
    let ctx = AppContext::init()?;

    match command {
        Command::Status { user } => {
            let config = ctx.config.snapshot();
            match user {
                Some(user) => print_json(&ctx.calendar.status(&user)?)?,
                None => print_json(&config.google.status())?,
            }
        }
        Command::Connect { user } => {
            let row = ctx.calendar.connect_interactive(&user).await?;
            println!("Google Calendar conectado ({}).", row.calendar_id);
        }
        Command::Disconnect { user } => {
            ctx.calendar.disconnect(&user)?;
            println!("Google Calendar desconectado.");
        }
        Command::Sync { user } => {
            let summary = ctx.calendar.sync_events(&user).await?;
            print_json(&summary)?;
        }
        Command::Calendars { user } => {
            print_json(&ctx.calendar.list_calendars(&user).await?)?;
        }
        Command::UseCalendar { user, id } => {
            ctx.calendar.change_calendar(&user, &id)?;
            println!("Agenda alterada para {}.", id);
        }
        Command::Timeline { user } => {
            let activities = ctx
                .db
                .lock()
                .list_activities(&user, &ActivityFilter::default())?;
            let events = match ctx.calendar.import_external_events(&user).await {
                Ok(events) => events,
                Err(SyncError::NotConnected) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            let settings = ctx.calendar.settings();
            let entries = merge_timeline(
                &activities,
                &events,
                settings.timezone,
                settings.default_duration_minutes,
            );
            print_json(&entries)?;
        }
        Command::Session { user } => {
            let token = ctx.db.lock().create_session(&user)?;
            println!("{}", token);
        }
        Command::Notifications { user, unread, limit } => {
            let page = ctx.notifications.list(
                &user,
                &NotificationQuery {
                    limit: Some(limit),
                    unread_only: unread,
                    ..Default::default()
                },
            )?;
            print_json(&page)?;
        }
        Command::Alerts { user, lead_minutes } => {
            let now = Utc::now()
                .with_timezone(&ctx.calendar.settings().timezone)
                .naive_local();
            let summary = services::activities::scan_activity_alerts(
                &ctx.db,
                &ctx.notifications,
                &user,
                now,
                chrono::Duration::minutes(lead_minutes),
            )?;
            println!(
                "{} lembretes, {} atrasadas",
                summary.reminders, summary.overdue
            );
        }
        Command::Cleanup => {
            let removed = ctx.notifications.cleanup_expired()?;
            println!("{} notificações expiradas removidas.", removed);
        }
        Command::Report { user, days } => {
            let report = reports::overview(&ctx.db.lock(), &user, days, Utc::now())?;
            print_json(&report)?;
        }
        Command::Chat { action } => chat_command(&ctx, action).await?,
        Command::Config { action } => config_command(&ctx, action)?,
    }
    Ok(())
}

async fn chat_command(ctx: &AppContext, action: ChatAction) -> Result<(), CrmError> {
    match action {
        ChatAction::Conversations { user, search } => {
            let filter = ConversationFilter {
                search,
                ..Default::default()
            };
            let conversations = ctx.db.lock().list_conversations(&user, &filter)?;
            print_json(&conversations)?;
        }
        ChatAction::Messages { user, conversation } => {
            let messages = ctx.db.lock().list_chat_messages(&user, &conversation)?;
            print_json(&messages)?;
        }
        ChatAction::Send {
            user,
            conversation,
            sender,
            content,
        } => {
            let sent = services::chat::send_message(
                &ctx.db,
                &ctx.integrations,
                &user,
                &conversation,
                &sender,
                &content,
            )
            .await?;
            print_json(&sent)?;
        }
        ChatAction::Read { user, conversation } => {
            let marked = ctx.db.lock().mark_conversation_read(&user, &conversation)?;
            println!("{} mensagens marcadas como lidas.", marked);
        }
    }
    Ok(())
}

fn config_command(ctx: &AppContext, action: ConfigAction) -> Result<(), CrmError> {
    let updated = match action {
        ConfigAction::Show => ctx.config.snapshot(),
        ConfigAction::SetTheme { theme } => {
            let theme = match theme.as_str() {
                "light" => Theme::Light,
                "dark" => Theme::Dark,
                other => {
                    return Err(CrmError::Validation(format!(
                        "Unknown theme: {}",
                        other
                    )))
                }
            };
            ctx.config.update(|c| c.settings.theme = theme)?
        }
        ConfigAction::SetLanguage { language } => {
            ctx.config.update(|c| c.settings.language = language)?
        }
        ConfigAction::SetTimezone { timezone } => {
            ctx.config.update(|c| c.settings.timezone = timezone)?
        }
    };
    print_json(&updated.settings)
}
