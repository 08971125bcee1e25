pub mod arm;
pub mod constraint;
pub mod data;
pub mod errors;
pub mod optimization;
pub mod parameter;
pub mod pareto;
pub mod search_space;

pub use arm::*;
pub use constraint::*;
pub use data::*;
pub use errors::*;
pub use optimization::*;
pub use parameter::*;
pub use search_space::*;
