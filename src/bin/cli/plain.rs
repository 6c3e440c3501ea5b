use chrono::Local;
use resilient_stomp::{
    AckMode, Client, ClientConfig, ConnectionState, Frame, HeartbeatConfig, Subscription,
    parse_heartbeat_header,
};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tokio::sync::mpsc;

use super::args::Cli;
use super::commands::{self, Command};
use super::describe_error;

/// Build the client configuration from command-line flags.
pub fn client_config(cli: &Cli) -> ClientConfig {
    let heartbeat = match parse_heartbeat_header(&cli.heartbeat) {
        (0, 0) => HeartbeatConfig::disabled(),
        (cx, cy) => HeartbeatConfig::new(cx, cy),
    };
    ClientConfig::default()
        .with_heartbeat(heartbeat)
        .with_reconnect_max_attempts(cli.max_attempts)
        .with_reconnect_timeout(Duration::from_millis(cli.retry_ms))
        .with_error_handler(|message, body| {
            eprintln!("\n[BROKER ERROR] {}", message);
            if !body.is_empty() {
                eprintln!("  {}", String::from_utf8_lossy(body));
            }
            prompt();
        })
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

/// Run the interactive CLI until `quit`, EOF on stdin, or a permanent failure.
pub async fn run(cli: &Cli) -> Result<(), (String, u8)> {
    let client = Client::tcp(cli.address.clone(), client_config(cli));
    let mut subs: HashMap<String, Subscription> = HashMap::new();

    for dest in &cli.subscribe {
        let sub = subscribe(&client, dest, cli.ack)
            .await
            .map_err(|e| describe_error(&e, &cli.address))?;
        subs.insert(dest.clone(), sub);
    }

    println!("Connecting to {}...", cli.address);
    client
        .connect(cli.login.as_deref(), cli.passcode.as_deref())
        .await
        .map_err(|e| describe_error(&e, &cli.address))?;
    println!("Connected.");
    for dest in subs.keys() {
        println!("Subscribed to: {}", dest);
    }

    watch_state(&client);

    // Channel to receive user commands from stdin reader
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if cmd_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!();
    commands::print_help();
    println!();

    loop {
        prompt();
        let line = tokio::select! {
            line = cmd_rx.recv() => match line {
                Some(l) => l,
                None => break,
            },
            res = client.closed() => {
                return res.map_err(|e| describe_error(&e, &cli.address));
            }
        };

        let command = match commands::parse(&line) {
            Ok(c) => c,
            Err(msg) => {
                eprintln!("{}", msg);
                continue;
            }
        };

        match command {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => commands::print_help(),
            Command::Status => {
                println!("State: {:?}", client.state());
                for sub in client.subscriptions().await {
                    println!("  [{}] {} ({})", sub.id(), sub.destination(), sub.ack());
                }
            }
            Command::Send { destination, body } => {
                if let Err(e) = client.send(&destination, body).await {
                    eprintln!("Send error: {}", e);
                }
            }
            Command::Subscribe(dest) => {
                if subs.contains_key(&dest) {
                    eprintln!("Already subscribed to {}", dest);
                    continue;
                }
                match subscribe(&client, &dest, cli.ack).await {
                    Ok(sub) => {
                        println!("Subscribed to: {}", dest);
                        subs.insert(dest, sub);
                    }
                    Err(e) => eprintln!("Failed to subscribe to '{}': {}", dest, e),
                }
            }
            Command::Unsubscribe(dest) => match subs.remove(&dest) {
                Some(sub) => match client.unsubscribe(&sub).await {
                    Ok(()) => println!("Unsubscribed from: {}", dest),
                    Err(e) => eprintln!("Failed to unsubscribe from '{}': {}", dest, e),
                },
                None => eprintln!("Not subscribed to {}", dest),
            },
        }
    }

    println!("Disconnecting...");
    client.close().await;
    Ok(())
}

async fn subscribe(
    client: &Client,
    dest: &str,
    ack: AckMode,
) -> resilient_stomp::Result<Subscription> {
    let label = dest.to_string();
    client
        .subscribe_with(dest, ack, move |frame| {
            print_message(&label, &frame);
            async { true }
        })
        .await
}

/// Report connection drops and recoveries as they happen.
fn watch_state(client: &Client) {
    let mut changes = client.state_changes();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let state = *changes.borrow_and_update();
            match state {
                ConnectionState::Connecting => eprintln!("\n[reconnecting...]"),
                ConnectionState::Connected => eprintln!("\n[reconnected]"),
                ConnectionState::Disconnected => continue,
            }
            prompt();
        }
    });
}

fn print_message(dest: &str, frame: &Frame) {
    println!(
        "\n[{}] [{}] MESSAGE received:",
        Local::now().format("%H:%M:%S%.3f"),
        dest
    );
    for (k, v) in &frame.headers {
        println!("  {}: {}", k, v);
    }
    if !frame.body.is_empty() {
        match std::str::from_utf8(&frame.body) {
            Ok(s) => println!("  Body: {}", s),
            Err(_) => println!("  Body: ({} bytes, binary)", frame.body.len()),
        }
    }
    prompt();
}
