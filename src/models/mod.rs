pub mod record;
pub mod run;

pub use record::*;
pub use run::*;
