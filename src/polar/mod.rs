pub mod numerics;
pub mod ridh;
pub mod traits;

pub use ridh::{PolarFlags, PolarFlagsBuilder, RIDHPolar};
pub use traits::PolarAPI;
