use crate::engine::ChatEngine;
use crate::schema::{Message, User};
use colored::*;
use tokio::sync::mpsc;

/// Command dispatcher for the `chatsync` binary.
///
/// `args` are the positional arguments left after flag parsing.
pub async fn run(engine: &ChatEngine, args: &[String]) -> anyhow::Result<()> {
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "user" => {
            if args.len() < 3 {
                eprintln!("{}", "Usage: chatsync user <id> <name> [avatar]".yellow());
                return Ok(());
            }
            let user = User {
                id: args[1].clone(),
                name: args[2].clone(),
                avatar: args.get(3).cloned().unwrap_or_default(),
            };
            engine.put_user(&user)?;
            println!("{} Saved {} ({})", "✓".green(), user.name.cyan(), user.id);
        }
        "users" => {
            let except = args.get(1).map(|s| s.as_str()).unwrap_or("");
            let query = args.get(2..).map(|rest| rest.join(" ")).unwrap_or_default();
            let users = engine.search_users(except, &query)?;
            if users.is_empty() {
                println!("{}", "No users".dimmed());
            }
            for u in users {
                println!("  {}  {}", u.id.cyan(), u.name);
            }
        }
        "room" => {
            if args.len() < 3 {
                eprintln!("{}", "Usage: chatsync room <self_id> <other_id>".yellow());
                return Ok(());
            }
            let room = engine.get_or_create_room(&args[1], &args[2])?;
            println!("{}", room.id);
        }
        "rooms" => {
            if args.len() < 2 {
                eprintln!("{}", "Usage: chatsync rooms <user_id> [search]".yellow());
                return Ok(());
            }
            let query = args[2..].join(" ");
            let rows = engine.conversations(&args[1], &query)?;
            if rows.is_empty() {
                println!("{}", "No conversations".dimmed());
            }
            for row in rows {
                let marker = if row.unread { "●".bright_blue() } else { " ".normal() };
                println!(
                    "{} {}  {}  {}",
                    marker,
                    row.peer_name.bold(),
                    format_time(row.last_activity_at).dimmed(),
                    row.last_preview
                );
                println!("    {}", row.room_id.dimmed());
            }
        }
        "send" => {
            if args.len() < 4 {
                eprintln!("{}", "Usage: chatsync send <room_id> <sender_id> <message>".yellow());
                return Ok(());
            }
            let text = args[3..].join(" ");
            let client_id = uuid::Uuid::new_v4().to_string();
            match engine.append(&args[1], &args[2], &text, Some(&client_id)) {
                Ok(message) => println!("{} Sent message {}", "✓".green(), message.id),
                Err(e) => {
                    // Echo the text back so nothing typed is lost
                    eprintln!("{} {}", "✗".red().bold(), e);
                    eprintln!("  Not sent: {}", text.yellow());
                    if e.is_retryable() {
                        eprintln!("  Retry the same command to resend.");
                    }
                }
            }
        }
        "history" => {
            if args.len() < 2 {
                eprintln!("{}", "Usage: chatsync history <room_id>".yellow());
                return Ok(());
            }
            for message in engine.list_messages(&args[1])? {
                print_message(&message);
            }
        }
        "seen" => {
            if args.len() < 3 {
                eprintln!("{}", "Usage: chatsync seen <room_id> <user_id>".yellow());
                return Ok(());
            }
            engine.mark_seen(&args[1], &args[2])?;
            println!("{} Marked seen", "✓".green());
        }
        "clear" => {
            if args.len() < 2 {
                eprintln!("{}", "Usage: chatsync clear <room_id>".yellow());
                return Ok(());
            }
            let removed = engine.clear(&args[1])?;
            println!("{} Removed {} messages", "✓".green(), removed);
        }
        "watch" => {
            if args.len() < 2 {
                eprintln!("{}", "Usage: chatsync watch <room_id>".yellow());
                return Ok(());
            }
            watch(engine, &args[1]).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage();
        }
    }

    Ok(())
}

/// Print a room's messages as they arrive until Ctrl+C or an upstream failure
async fn watch(engine: &ChatEngine, room_id: &str) -> anyhow::Result<()> {
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();

    let subscription = engine.subscribe(
        room_id,
        move |message| {
            let _ = msg_tx.send(message);
        },
        move |err| {
            let _ = err_tx.send(err);
        },
    )?;
    println!("{} Watching {} (Ctrl+C to stop)", "⚡".bright_cyan(), room_id.cyan());

    loop {
        tokio::select! {
            Some(message) = msg_rx.recv() => print_message(&message),
            Some(err) = err_rx.recv() => {
                eprintln!("{} Connection lost: {}", "✗".red().bold(), err);
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.unsubscribe(subscription);
    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "{} {}: {}",
        format_time(message.created_at).dimmed(),
        message.sender_id.cyan(),
        message.text
    );
}

fn format_time(epoch_millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn print_usage() {
    println!("{}", "💬 chatsync".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  chatsync [--data-dir <path>] <command> [args]");
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <id> <name> [avatar]       Save a user profile", "user".cyan());
    println!("  {} [except_id] [search]      List users", "users".cyan());
    println!("  {} <self> <other>             Open or create a 1:1 room", "room".cyan());
    println!("  {} <user> [search]           List a user's conversations", "rooms".cyan());
    println!("  {} <room> <sender> <text>     Send a message", "send".cyan());
    println!("  {} <room>                  Print a room's messages", "history".cyan());
    println!("  {} <room> <user>              Mark a room as seen", "seen".cyan());
    println!("  {} <room>                    Delete a room's messages", "clear".cyan());
    println!("  {} <room>                    Follow a room live", "watch".cyan());
}
