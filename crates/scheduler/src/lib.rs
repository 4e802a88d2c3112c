pub mod gateways;
pub mod listeners;
pub mod machine;
pub mod router;
pub mod supervisor;

pub use gateways::{
    MetadataAdapter, SchemaRegistry, TransformationExecutor, VersionCheck, ViewMetadata,
};
pub use listeners::{BusEvent, ListenerBus};
pub use machine::{Action, Event, ResultingState, StepContext};
pub use router::{Router, RouterError};
pub use supervisor::{CommandForView, Requester, ViewCommand, ViewEvent};
