/// A parsed stdin command.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Send { destination: String, body: String },
    Subscribe(String),
    Unsubscribe(String),
    Status,
    Help,
    Quit,
    Empty,
}

/// Parse one input line.
pub fn parse(line: &str) -> Result<Command, String> {
    let parts: Vec<&str> = line.trim().splitn(3, ' ').collect();
    if parts[0].is_empty() {
        return Ok(Command::Empty);
    }

    match parts[0] {
        "quit" | "exit" | "q" => Ok(Command::Quit),
        "send" => {
            if parts.len() < 3 {
                return Err("Usage: send <destination> <message>".to_string());
            }
            Ok(Command::Send {
                destination: parts[1].to_string(),
                body: parts[2].to_string(),
            })
        }
        "sub" | "subscribe" => match parts.get(1) {
            Some(dest) => Ok(Command::Subscribe(dest.to_string())),
            None => Err("Usage: sub <destination>".to_string()),
        },
        "unsub" | "unsubscribe" => match parts.get(1) {
            Some(dest) => Ok(Command::Unsubscribe(dest.to_string())),
            None => Err("Usage: unsub <destination>".to_string()),
        },
        "status" => Ok(Command::Status),
        "help" | "?" => Ok(Command::Help),
        other => Err(format!(
            "Unknown command: {}. Type 'help' for commands.",
            other
        )),
    }
}

/// Print help text
pub fn print_help() {
    println!("Commands:");
    println!("  send <destination> <message>  - Send a message");
    println!("  sub <destination>             - Subscribe to a destination");
    println!("  unsub <destination>           - Drop a subscription");
    println!("  status                        - Show connection state and subscriptions");
    println!("  quit                          - Exit");
}
