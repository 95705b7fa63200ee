pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod pubsub;

pub use client::Client;
pub use command::{Command, ToArg};
pub use connection::{ConnectOptions, Connection};
pub use error::{Error, Result};
pub use frame::Reply;
pub use pipeline::Pipeline;
pub use pubsub::{Event, PubSubSession};
