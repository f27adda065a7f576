pub use handle::{ConfigureRabbit, RabbitHandle};

pub mod ack;
pub mod confirm;
mod handle;
pub mod receive;
pub mod send;
