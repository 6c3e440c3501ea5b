pub mod args;
pub mod commands;
pub mod plain;

use resilient_stomp::StompError;

/// Exit codes for different error conditions
pub mod exit_codes {
    /// Successful execution
    pub const SUCCESS: u8 = 0;
    /// Network/connection error, including exhausted retries
    pub const NETWORK_ERROR: u8 = 1;
    /// The broker rejected the CONNECT (usually bad credentials)
    pub const AUTH_ERROR: u8 = 2;
    /// Protocol error (e.g., unexpected server response)
    pub const PROTOCOL_ERROR: u8 = 3;
}

/// User-facing message and exit code for a client error.
pub fn describe_error(err: &StompError, address: &str) -> (String, u8) {
    match err {
        StompError::Io(io_err) => {
            let message = match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    format!("Connection refused: {}", address)
                }
                std::io::ErrorKind::TimedOut => format!("Connection timed out: {}", address),
                _ => format!("Connection failed: {}", io_err),
            };
            (message, exit_codes::NETWORK_ERROR)
        }
        StompError::ExceededRetryCount { attempts } => (
            format!("Could not reach {} after {} retries", address, attempts),
            exit_codes::NETWORK_ERROR,
        ),
        StompError::ConnectTimeout(after) => (
            format!("No CONNECTED from {} within {:?}", address, after),
            exit_codes::NETWORK_ERROR,
        ),
        StompError::Disconnected | StompError::Closed => {
            (err.to_string(), exit_codes::NETWORK_ERROR)
        }
        StompError::ServerRejected(server_err) => (
            format!("Authentication failed: {}", server_err),
            exit_codes::AUTH_ERROR,
        ),
        StompError::Protocol(msg) => (
            format!("Protocol error: {}", msg),
            exit_codes::PROTOCOL_ERROR,
        ),
    }
}
