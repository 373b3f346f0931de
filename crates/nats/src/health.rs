//! NATS health checks.

use tracing::{debug, warn};

use crate::connection::ConnectionManager;

/// Check the connection, restoring it if it was lost.
pub async fn check_connection(connection: &ConnectionManager) -> bool {
    if connection.is_connected() {
        debug!(connection = %connection.connection_info_for_log(), "NATS connection healthy");
        return true;
    }

    let restored = connection.reconnect().await;
    if !restored {
        warn!(connection = %connection.connection_info_for_log(), "NATS connection unavailable");
    }
    restored
}

/// Whether `subject` is a valid subscription subject: non-empty tokens
/// separated by dots, no whitespace, `>` only as the last token.
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return false;
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    tokens.iter().enumerate().all(|(i, token)| {
        !token.is_empty()
            && (*token != ">" || i == tokens.len() - 1)
            && (token.len() == 1 || !token.contains(['*', '>']))
    })
}

/// Returns the subjects that cannot be subscribed to.
pub fn verify_subjects(subjects: &[String]) -> Vec<String> {
    subjects
        .iter()
        .filter(|s| !is_valid_subject(s))
        .cloned()
        .collect()
}
