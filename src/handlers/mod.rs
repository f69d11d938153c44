//! Built-in command handlers.

mod custom_command;
mod price;

pub use custom_command::{CustomCommand, CustomCommandError, CustomCommands, CustomResponse};
pub use price::{MemoryPointsLedger, PointsError, PointsLedger, PriceGate, POINTS_RESOURCE};
