use clap::Parser;
use resilient_stomp::AckMode;

#[derive(Parser)]
#[command(name = "stomp")]
#[command(version)]
#[command(about = "Interactive STOMP client with automatic reconnect")]
pub struct Cli {
    /// STOMP broker address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:61613")]
    pub address: String,

    /// Login username
    #[arg(short, long)]
    pub login: Option<String>,

    /// Passcode
    #[arg(short, long)]
    pub passcode: Option<String>,

    /// Heartbeat settings (client-send,client-receive in ms; "0,0" disables)
    #[arg(long, default_value = "10000,10000")]
    pub heartbeat: String,

    /// Destinations to subscribe to (can be specified multiple times)
    #[arg(short, long)]
    pub subscribe: Vec<String>,

    /// Ack mode for subscriptions: auto, client or client-individual
    #[arg(long, default_value = "auto")]
    pub ack: AckMode,

    /// Retries before giving up; negative retries forever
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub max_attempts: i64,

    /// Initial delay between connection attempts, in ms
    #[arg(long, default_value_t = 1000)]
    pub retry_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeatable_subscriptions_and_ack_mode() {
        let cli = Cli::parse_from([
            "stomp",
            "-s",
            "/queue/a",
            "--subscribe",
            "/topic/b",
            "--ack",
            "client-individual",
            "--max-attempts",
            "3",
        ]);
        assert_eq!(cli.subscribe, vec!["/queue/a", "/topic/b"]);
        assert_eq!(cli.ack, AckMode::ClientIndividual);
        assert_eq!(cli.max_attempts, 3);
        assert_eq!(cli.login, None);
    }

    #[test]
    fn negative_attempts_are_accepted() {
        let cli = Cli::parse_from(["stomp", "--max-attempts", "-1"]);
        assert_eq!(cli.max_attempts, -1);
    }
}
