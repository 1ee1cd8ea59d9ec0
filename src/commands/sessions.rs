use crate::cli::SessionCommand;
use crate::config::Config;
use crate::error::Result;
use crate::session::{open_durable_store, Role, SessionStore, StoreSettings};
use colored::Colorize;
use prettytable::{format, Table};

/// Handle session inspection commands
///
/// Opens the configured durable store directly, so it must not be run
/// while a runtime holds the same store open.
pub async fn handle_sessions(config: &Config, command: SessionCommand) -> Result<()> {
    let durable = open_durable_store(&config.session)?;
    let stored = durable.list_ids()?.len();
    let store = SessionStore::open(durable, StoreSettings::from(&config.session))?;

    match command {
        SessionCommand::List => {
            let summaries = store.summaries().await;
            if summaries.is_empty() {
                println!("{}", "No stored sessions.".yellow());
                return Ok(());
            }

            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
            table.add_row(prettytable::row![
                "ID".bold(),
                "Surface".bold(),
                "User".bold(),
                "Messages".bold(),
                "Last Activity".bold()
            ]);

            for summary in summaries {
                let messages = store
                    .snapshot(&summary.id)
                    .await
                    .map(|session| session.messages.len().to_string())
                    .unwrap_or_else(|_| "-".to_string());
                table.add_row(prettytable::row![
                    summary.id.cyan(),
                    summary.key.surface_id,
                    summary.key.user_id,
                    messages,
                    summary.last_activity_at.format("%Y-%m-%d %H:%M").to_string()
                ]);
            }

            println!("\nSessions:");
            table.printstd();
            println!();
        }
        SessionCommand::Show { id } => {
            let session = store.snapshot(&id).await?;
            println!(
                "{} {} ({}:{})",
                "Session".bold(),
                session.id.cyan(),
                session.surface_id,
                session.user_id
            );
            println!(
                "created {}, last activity {}\n",
                session.created_at.format("%Y-%m-%d %H:%M"),
                session.last_activity_at.format("%Y-%m-%d %H:%M")
            );
            for message in &session.messages {
                let label = match message.role {
                    Role::User => "user".green(),
                    Role::Assistant => "assistant".blue(),
                    Role::System => "system".yellow(),
                    Role::ToolResult => format!(
                        "result:{}",
                        message.capability.as_deref().unwrap_or("?")
                    )
                    .magenta(),
                };
                println!(
                    "[{}] {}: {}",
                    message.timestamp.format("%H:%M:%S"),
                    label,
                    message.content
                );
            }
        }
        SessionCommand::Sweep => {
            store.expire_sweep().await?;
            let removed = stored.saturating_sub(store.len().await);
            println!(
                "{}",
                format!("Removed {} expired session(s)", removed).green()
            );
        }
    }

    Ok(())
}
