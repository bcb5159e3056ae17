pub mod codec;
pub mod store;

pub use self::codec::*;
pub use self::store::*;
