pub mod item;
pub mod processing;
pub mod rule;
pub mod setting;
pub mod source;
pub mod worker;

pub use item::*;
pub use processing::*;
pub use rule::*;
pub use setting::*;
pub use source::*;
pub use worker::*;
