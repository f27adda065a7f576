pub mod check_result;
pub mod log_entry;
pub mod task;

/// Messages that are published with a per-message routing key, so that consumers downstream
/// can partition (and de-duplicate) by it.
pub trait KeyedMessage {
    fn routing_key(&self) -> String;
}
