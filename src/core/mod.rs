pub mod error;
pub mod settings;
pub mod source;
pub mod state;

pub use settings::*;
pub use source::*;
