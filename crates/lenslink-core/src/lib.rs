pub mod codec;
pub mod config;
pub mod errors;
pub mod framer;
pub mod types;

pub use config::{DisplayConfig, ProtocolConfig};
pub use errors::{ConfigError, TransportError};
pub use framer::{MonospaceMeasurer, Page, TextFramer, TextMeasurer, WidthTableMeasurer};
pub use types::*;
