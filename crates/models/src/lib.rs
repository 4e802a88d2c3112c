mod config;
mod id;
mod mode;
mod names;
mod state;
mod status;
mod view;

pub use config::Config;
pub use id::ClientId;
pub use mode::MaterializeMode;
pub use names::{TableName, ViewPath};
pub use state::{Listener, ViewState};
pub use status::StatusSnapshot;
pub use view::{Catalog, View};
