//! # tuya-dp
//!
//! Adapter for the Tuya manufacturer cluster (0xEF00). Turns the datapoint
//! byte stream of a device into named, typed capability updates and turns
//! application intents into acknowledged datapoint commands.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuya_dp::{ConverterRegistry, DpDevice, OutboundCommand, SchemaCatalog, Transport};
//!
//! struct Radio;
//!
//! impl Transport for Radio {
//!     async fn transmit(&self, cmd: OutboundCommand) -> Result<(), tuya_dp::CommandError> {
//!         let _payload = cmd.to_cluster_payload(); // hand to the Zigbee stack
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> tuya_dp::Result<()> {
//! let catalog = SchemaCatalog::builtin(&ConverterRegistry::builtin())?;
//! let schema = catalog.require("_TZE200_wfxuhoea")?;
//! let feeder = DpDevice::builder("feeder-1", Radio, schema).build();
//! feeder.set("manual_feed", 2).await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod schema;
pub mod store;
pub mod timesync;
pub mod transaction;

pub use catalog::SchemaCatalog;
pub use config::AdapterConfig;
pub use convert::{Bitmap, Converter, ConverterRegistry, EnumValue, Scale, TypedValue};
pub use device::{
    Delivery, DeviceBuilder, DeviceEvent, DpDevice, InboundPayload, OutboundCommand, Transport,
};
pub use dispatch::{CapabilityUpdate, Dispatcher};
pub use error::{
    CommandError, ConvertError, DecodeError, Result, SchemaError, StoreError, TuyaDpError,
};
pub use health::HealthWarning;
pub use manager::{Manager, ManagerEvent};
pub use protocol::{ClusterCommand, DatapointFrame, DpType, FrameReader};
pub use schema::{DeviceDpSchema, DeviceDpSchemaEntry, Multiplicity};
pub use store::{CapabilityStore, MemoryStore};
pub use transaction::{AckMode, TransactionManager};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
